use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use merkledb::{Database, DbConfig, LocalFsStorage, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "merkledb-cli")]
#[command(about = "Inspect and drive a merkledb database directory", long_about = None)]
struct Args {
    /// Database root directory
    #[arg(long, default_value = "./data")]
    data_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert a JSON document (read from stdin) into a collection.
    Insert { collection: String },
    /// Fetch a record by id from a collection and print it as JSON.
    Fetch { collection: String, id: String },
    /// List every collection name known to the database.
    ListCollections,
    /// Print the current database Merkle root hash, in hex.
    RootHash,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "merkledb=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let storage = Arc::new(LocalFsStorage::new(PathBuf::from(&args.data_dir)));
    let mut config = DbConfig::default();
    config.root_path = PathBuf::from(&args.data_dir);
    let db = Database::open(storage, config).await?;

    match args.command {
        Command::Insert { collection } => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let json: serde_json::Value = serde_json::from_str(&input)?;
            let fields: BTreeMap<String, Value> = match Value::from(json) {
                Value::Object(map) => map,
                _ => anyhow::bail!("input document must be a JSON object"),
            };
            let timestamp = chrono::Utc::now().timestamp_millis();
            let coll = db.collection(&collection).await?;
            let record = coll.insert_one(fields, timestamp).await?;
            db.root_hash().await?;
            println!("inserted {}", record.id);
        }
        Command::Fetch { collection, id } => {
            let coll = db.collection(&collection).await?;
            match coll.get_one(&id).await? {
                Some(record) => {
                    let json: serde_json::Value = Value::Object(record.fields).into();
                    println!("{}", serde_json::to_string_pretty(&json)?);
                }
                None => println!("not found"),
            }
        }
        Command::ListCollections => {
            for name in db.collections().await? {
                println!("{name}");
            }
        }
        Command::RootHash => {
            let root = db.root_hash().await?;
            println!("{}", hex::encode(root));
        }
    }

    db.close().await?;
    Ok(())
}
