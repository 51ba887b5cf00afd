use super::{json_pretty, store_err, EXIT_SUCCESS};
use chrono::{DateTime, SecondsFormat};
use pkgbucket_store::Database;

fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis).map_or_else(
        || "-".to_owned(),
        |t| t.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

pub async fn list(db: &Database, json: bool) -> Result<u8, String> {
    let names = db.names().await.map_err(store_err)?;
    if json {
        println!("{}", json_pretty(&names)?);
    } else if names.is_empty() {
        println!("no packages found");
    } else {
        for name in &names {
            println!("{name}");
        }
    }
    Ok(EXIT_SUCCESS)
}

pub async fn add(db: &Database, name: &str) -> Result<u8, String> {
    db.add(name).await.map_err(store_err)?;
    println!("added '{name}'");
    Ok(EXIT_SUCCESS)
}

pub async fn remove(db: &Database, name: &str, purge: bool) -> Result<u8, String> {
    db.remove(name).await.map_err(store_err)?;
    if purge {
        db.package(name)
            .remove_package()
            .await
            .map_err(store_err)?;
        println!("removed '{name}' and its stored files");
    } else {
        println!("removed '{name}'");
    }
    Ok(EXIT_SUCCESS)
}

pub async fn search(db: &Database, json: bool) -> Result<u8, String> {
    let found = db.search().await.map_err(store_err)?;
    if json {
        println!("{}", json_pretty(&found)?);
    } else if found.is_empty() {
        println!("no packages found");
    } else {
        println!("{:<32} {:<24} PATH", "NAME", "MODIFIED");
        for info in &found {
            println!(
                "{:<32} {:<24} {}",
                info.name,
                format_millis(info.time),
                info.path
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub async fn extensions(db: &Database, json: bool) -> Result<u8, String> {
    let manifests = db.all_extension_manifests().await.map_err(store_err)?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = manifests.into_iter().collect();
        println!("{}", json_pretty(&map)?);
    } else if manifests.is_empty() {
        println!("no extension manifests found");
    } else {
        for (name, manifest) in &manifests {
            println!("{name}: {manifest}");
        }
    }
    Ok(EXIT_SUCCESS)
}

pub async fn secret_get(db: &Database) -> Result<u8, String> {
    let secret = db.secret().await.map_err(store_err)?;
    println!("{secret}");
    Ok(EXIT_SUCCESS)
}

pub async fn secret_set(db: &Database, value: &str) -> Result<u8, String> {
    db.set_secret(value).await.map_err(store_err)?;
    println!("secret updated");
    Ok(EXIT_SUCCESS)
}
