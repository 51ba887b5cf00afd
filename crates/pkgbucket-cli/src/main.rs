mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use pkgbucket_store::{CompanionFile, Database};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pkgbucket",
    version,
    about = "Package registry storage in an S3 bucket"
)]
struct Cli {
    /// Path to the store configuration file (TOML).
    #[arg(long, short, default_value = "pkgbucket.toml", global = true)]
    config: PathBuf,

    /// Bucket name (overrides config file and AWS_BUCKET).
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Companion {
    Composer,
    Extension,
}

impl From<Companion> for CompanionFile {
    fn from(c: Companion) -> Self {
        match c {
            Companion::Composer => CompanionFile::Composer,
            Companion::Extension => CompanionFile::Extension,
        }
    }
}

#[derive(Debug, Subcommand)]
enum SecretCommand {
    /// Print the server secret.
    Get,
    /// Replace the server secret.
    Set { value: String },
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List catalogued package names.
    List,
    /// Add a package name to the catalog.
    Add { name: String },
    /// Remove a package name from the catalog.
    Remove {
        name: String,
        /// Also delete every stored object of the package.
        #[arg(long, default_value_t = false)]
        purge: bool,
    },
    /// Print a package's metadata document.
    Show { name: String },
    /// Upload a tarball for a package and register the package.
    Publish {
        name: String,
        /// Local tarball to upload.
        tarball: PathBuf,
        /// Object name to store it under (defaults to the local file name).
        #[arg(long)]
        file: Option<String>,
        /// Metadata document to create for the package, if it has none.
        #[arg(long)]
        metadata: Option<PathBuf>,
    },
    /// Download a tarball, falling back to the public registry.
    Fetch {
        name: String,
        file: String,
        /// Write to this path instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print a mirrored companion file of a package.
    Companion {
        name: String,
        #[arg(value_enum)]
        kind: Companion,
    },
    /// Print every package's extension.json.
    Extensions,
    /// List catalogued packages with metadata and their modification time.
    Search,
    /// Read or replace the server secret.
    Secret {
        #[command(subcommand)]
        action: SecretCommand,
    },
    /// Delete one file of a package, or the whole package.
    Delete {
        name: String,
        /// File to delete. Without it every object of the package is removed.
        file: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let result = runtime.block_on(run(cli));
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("store error") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<u8, String> {
    let config = commands::load_config(&cli.config, cli.bucket.as_deref())?;
    let db = Database::connect(config)
        .await
        .map_err(commands::store_err)?;
    let json = cli.json;

    match cli.command {
        Commands::List => commands::catalog::list(&db, json).await,
        Commands::Add { name } => commands::catalog::add(&db, &name).await,
        Commands::Remove { name, purge } => commands::catalog::remove(&db, &name, purge).await,
        Commands::Show { name } => commands::package::show(&db, &name).await,
        Commands::Publish {
            name,
            tarball,
            file,
            metadata,
        } => {
            commands::tarball::publish(
                &db,
                &name,
                &tarball,
                file.as_deref(),
                metadata.as_deref(),
                json,
            )
            .await
        }
        Commands::Fetch { name, file, output } => {
            commands::tarball::fetch(&db, &name, &file, output.as_deref()).await
        }
        Commands::Companion { name, kind } => {
            commands::package::companion(&db, &name, kind.into()).await
        }
        Commands::Extensions => commands::catalog::extensions(&db, json).await,
        Commands::Search => commands::catalog::search(&db, json).await,
        Commands::Secret { action } => match action {
            SecretCommand::Get => commands::catalog::secret_get(&db).await,
            SecretCommand::Set { value } => commands::catalog::secret_set(&db, &value).await,
        },
        Commands::Delete { name, file } => {
            commands::package::delete(&db, &name, file.as_deref()).await
        }
    }
}
