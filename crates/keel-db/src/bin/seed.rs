//! # Seed Data Generator
//!
//! Populates an `ods` database with the sample asset hierarchy.
//!
//! ## Usage
//! ```bash
//! # Seed ./data/ods.db with the sample rows plus 10,000 bulk entities
//! cargo run -p keel-db --features fixtures --bin seed
//!
//! # Custom amount and directory
//! cargo run -p keel-db --features fixtures --bin seed -- --count 50000 --db ./data
//! ```
//!
//! ## Generated Rows
//! - 9 asset hierarchy levels
//! - 2 funds (`Unknown`, `Fund1`)
//! - 7 entities and 5 bridges between them
//! - `--count` extra entities written through `bulk_insert`

use std::env;
use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use keel_db::fixtures::{
    bridges, entities, funds, levels, AssetHierarchyLevel, BridgeAssetHierarchy, DimEntity,
    DimFund, OdsSchema,
};
use keel_db::{Database, DbConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 10_000;
    let mut data_dir = String::from("./data");
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(10_000);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = args[i + 1].clone();
                    i += 1;
                }
            }
            "--config" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("keel Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>      Bulk entities to generate (default: 10000)");
                println!("  -d, --db <DIR>       Directory holding ods.db (default: ./data)");
                println!("      --config <PATH>  TOML config; its connection string wins over --db");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let config = match config_path {
        Some(path) => DbConfig::load(Some(&path))?,
        None => {
            std::fs::create_dir_all(&data_dir)?;
            DbConfig::new(format!("Data Source={};Database=ods;", data_dir))
        }
    };

    println!("🌱 keel Seed Data Generator");
    println!("===========================");
    println!("Connection: {}", config.connection_string);
    println!("Entities:   {}", count);
    println!();

    let db = Database::<OdsSchema>::new(config)?;
    if !db.health_check().await {
        return Err("database is not reachable".into());
    }
    println!("✓ Connected to database");

    let uow = db.unit_of_work();
    let (total, applied) = uow.schema_status().await?;
    println!("✓ Schema applied ({}/{})", applied, total);

    // Re-running would duplicate the generated-key rows
    let existing = uow.repository::<DimFund>()?.query().count(None).await?;
    if existing > 0 {
        println!("⚠ Database already has {} funds", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        uow.dispose().await;
        return Ok(());
    }

    let start = std::time::Instant::now();

    uow.repository::<AssetHierarchyLevel>()?.insert_many(levels())?;
    uow.repository::<DimFund>()?.insert_many(funds())?;
    uow.repository::<DimEntity>()?.insert_many(entities())?;
    uow.repository::<BridgeAssetHierarchy>()?.insert_many(bridges())?;
    let rows = uow.save_changes().await?;
    println!("✓ Saved {} sample rows", rows);

    let generated: Vec<DimEntity> = (0..count)
        .map(|n| DimEntity::new(1_000 + n as i64, "Generated"))
        .collect();
    let inserted = uow.repository::<DimEntity>()?.bulk_insert(&generated).await?;

    let elapsed = start.elapsed();
    info!(uow_id = %uow.id(), rows = inserted, "Bulk insert finished");
    println!();
    println!("✓ Bulk inserted {} entities in {:?}", inserted, elapsed);
    println!(
        "  Rate: {:.0} rows/second",
        (rows + inserted) as f64 / elapsed.as_secs_f64()
    );

    let diagnostics = uow.context().diagnostics();
    println!(
        "  Round trips: {} reads, {} writes",
        diagnostics.reads, diagnostics.writes
    );

    uow.dispose().await;

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keel=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
