use env_logger::Builder;
use log::{info, LevelFilter};
use std::path::PathBuf;

use logtree::{Durability, Environment, EnvironmentConfig, TxnConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    Builder::new().filter_level(LevelFilter::Info).init();

    info!("logtree demo");

    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("logtree_demo"));
    let config = EnvironmentConfig::default().with_max_file_size(256 * 1024);

    let env = Environment::open(&dir, config)?;
    if let Some(report) = env.recovery_report() {
        info!("Recovered existing environment:\n{}", report);
    }
    let db = env.open_database("demo")?;

    for i in 0..1000u32 {
        let key = format!("key{:04}", i);
        env.put(None, &db, key.as_bytes(), &i.to_le_bytes())?;
    }

    // Move a value between two keys atomically
    let txn = env.begin_txn(TxnConfig::new().with_durability(Durability::WriteNoSync))?;
    let from = env.get(Some(&txn), &db, b"key0001")?.unwrap_or_default();
    env.put(Some(&txn), &db, b"key0002", &from)?;
    env.delete(Some(&txn), &db, b"key0001")?;
    txn.commit_with(Durability::Sync)?;

    for i in (0..1000u32).filter(|i| i % 4 != 0) {
        env.delete(None, &db, format!("key{:04}", i).as_bytes())?;
    }
    let removed = env.compress()?;
    info!("Compressor removed {} slots", removed);

    env.checkpoint(true)?;
    let cleaned = env.clean_log()?;
    info!(
        "Cleaner cleaned files {:?} and migrated {} records",
        cleaned.files_cleaned, cleaned.lns_migrated
    );
    env.checkpoint(true)?;

    let remaining = env.scan(&db, ..)?.count();
    info!("{} records remain", remaining);

    let report = env.verify_log()?;
    info!("Verified {} entries in {} files", report.entries_checked, report.files_checked);
    println!("{}", env.stats());

    env.close()?;
    Ok(())
}
