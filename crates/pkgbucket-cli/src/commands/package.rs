use super::{json_pretty, store_err, EXIT_SUCCESS};
use pkgbucket_store::{CompanionFile, Database};

pub async fn show(db: &Database, name: &str) -> Result<u8, String> {
    let doc = db
        .package(name)
        .read_package()
        .await
        .map_err(store_err)?;
    println!("{}", json_pretty(&doc)?);
    Ok(EXIT_SUCCESS)
}

pub async fn companion(db: &Database, name: &str, file: CompanionFile) -> Result<u8, String> {
    let text = db.companion_text(name, file).await.map_err(store_err)?;
    println!("{text}");
    Ok(EXIT_SUCCESS)
}

pub async fn delete(db: &Database, name: &str, file: Option<&str>) -> Result<u8, String> {
    let pkg = db.package(name);
    match file {
        Some(file) => {
            pkg.delete_file(file).await.map_err(store_err)?;
            println!("deleted {}", pkg.key(file));
        }
        None => {
            pkg.remove_package().await.map_err(store_err)?;
            println!("deleted everything under {}", pkg.path());
        }
    }
    Ok(EXIT_SUCCESS)
}
