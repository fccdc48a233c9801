use logtree::{
    common::{EnvironmentConfig, Result},
    Durability, Environment, TxnConfig,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn key(i: u32) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

fn log_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".ltl"))
        .map(|entry| entry.metadata().unwrap().len())
        .sum()
}

#[test]
fn test_crash_recovery_keeps_committed_and_drops_uncommitted() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons()
        .with_max_file_size(64 * 1024)
        .with_node_max_entries(32);

    {
        let env = Environment::open(dir.path(), config.clone())?;
        let db = env.open_database("numbers")?;
        for i in 1..=1000 {
            env.put(None, &db, &key(i), &value(i))?;
        }

        let txn = env.begin_txn(TxnConfig::new())?;
        for i in 2000..2010 {
            env.put(Some(&txn), &db, &key(i), b"uncommitted")?;
        }
        env.put(Some(&txn), &db, &key(5), b"uncommitted")?;
        env.sync()?;
        env.abnormal_close();
        drop(txn);
    }

    let env = Environment::open(dir.path(), config)?;
    let report = env.recovery_report().expect("existing log is recovered");
    assert_eq!(report.txns_incomplete, 1);
    assert_eq!(report.lns_undone, 11);

    let db = env.open_database("numbers")?;
    for i in 1..=1000 {
        assert_eq!(env.get(None, &db, &key(i))?, Some(value(i)), "key {}", i);
    }
    for i in 2000..2010 {
        assert_eq!(env.get(None, &db, &key(i))?, None);
    }
    assert_eq!(env.scan(&db, ..)?.count(), 1000);
    Ok(())
}

#[test]
fn test_checkpoint_during_open_transaction_then_crash() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons().with_node_max_entries(16);

    {
        let env = Environment::open(dir.path(), config.clone())?;
        let db = env.open_database("t")?;
        for i in 0..100 {
            env.put(None, &db, &key(i), &value(i))?;
        }

        let txn = env.begin_txn(TxnConfig::new())?;
        env.put(Some(&txn), &db, &key(10), b"uncommitted")?;
        env.put(Some(&txn), &db, &key(500), b"uncommitted")?;
        env.checkpoint(true)?;
        env.put(Some(&txn), &db, &key(20), b"uncommitted")?;
        env.checkpoint(true)?;
        env.sync()?;
        env.abnormal_close();
        drop(txn);
    }

    let env = Environment::open(dir.path(), config)?;
    let report = env.recovery_report().expect("existing log is recovered");
    assert_eq!(report.txns_incomplete, 1);
    assert_eq!(report.lns_undone, 3);

    let db = env.open_database("t")?;
    assert_eq!(env.get(None, &db, &key(10))?, Some(value(10)));
    assert_eq!(env.get(None, &db, &key(20))?, Some(value(20)));
    assert_eq!(env.get(None, &db, &key(500))?, None);
    assert_eq!(env.scan(&db, ..)?.count(), 100);
    Ok(())
}

#[test]
fn test_repeated_checkpoints_with_scattered_updates() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons()
        .with_node_max_entries(32)
        .with_durability(Durability::NoSync);

    let mut expected: Vec<Vec<u8>> = (0..500).map(value).collect();
    {
        let env = Environment::open(dir.path(), config.clone())?;
        let db = env.open_database("scattered")?;
        for i in 0..500 {
            env.put(None, &db, &key(i), &expected[i as usize])?;
        }
        env.checkpoint(true)?;

        for round in 0..6u32 {
            for i in (round..500).step_by(97) {
                let data = format!("round-{}-{}", round, i).into_bytes();
                env.put(None, &db, &key(i), &data)?;
                expected[i as usize] = data;
            }
            env.checkpoint(true)?;
        }
        assert!(env.stats().tree.deltas_logged >= 2);
        env.close()?;
    }

    let env = Environment::open(dir.path(), config)?;
    let db = env.open_database("scattered")?;
    let all: Vec<_> = env.scan(&db, ..)?.collect::<Result<_>>()?;
    assert_eq!(all.len(), 500);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(k, &key(i as u32));
        assert_eq!(v, &expected[i], "key {}", i);
    }
    Ok(())
}

#[test]
fn test_recovery_is_repeatable() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons().with_node_max_entries(16);

    {
        let env = Environment::open(dir.path(), config.clone())?;
        let db = env.open_database("t")?;
        for i in 0..300 {
            env.put(None, &db, &key(i), &value(i))?;
        }
        for i in (0..300).step_by(3) {
            env.delete(None, &db, &key(i))?;
        }
        env.abnormal_close();
    }

    // Crash again straight after recovery, then once more cleanly
    Environment::open(dir.path(), config.clone())?.abnormal_close();
    {
        let env = Environment::open(dir.path(), config.clone())?;
        env.close()?;
    }

    let env = Environment::open(dir.path(), config)?;
    let report = env.recovery_report().expect("existing log is recovered");
    assert!(report.checkpoint_lsn.is_some());
    assert_eq!(report.lns_redone, 0);

    let db = env.open_database("t")?;
    for i in 0..300 {
        let expected = if i % 3 == 0 { None } else { Some(value(i)) };
        assert_eq!(env.get(None, &db, &key(i))?, expected, "key {}", i);
    }
    Ok(())
}

#[test]
fn test_cleaner_shrinks_log_after_mass_delete() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons()
        .with_max_file_size(64 * 1024)
        .with_durability(Durability::NoSync);

    let env = Environment::open(dir.path(), config.clone())?;
    let db = env.open_database("bulk")?;
    for i in 0..10_000 {
        env.put(None, &db, &key(i), &value(i))?;
    }
    for i in 0..9_000 {
        assert!(env.delete(None, &db, &key(i))?);
    }
    assert!(env.compress()? >= 9_000);
    env.checkpoint(true)?;

    let before = log_size(dir.path());
    let report = env.clean_log()?;
    assert!(!report.files_cleaned.is_empty());
    assert!(report.entries_obsolete > 0);

    let checkpoint = env.checkpoint(true)?.expect("forced checkpoint runs");
    assert!(!checkpoint.files_deleted.is_empty());
    let after = log_size(dir.path());
    assert!(after < before, "log grew from {} to {}", before, after);

    for i in 9_000..10_000 {
        assert_eq!(env.get(None, &db, &key(i))?, Some(value(i)), "key {}", i);
    }
    assert_eq!(env.get(None, &db, &key(10))?, None);
    env.close()?;

    // Everything still recovers from the cleaned log
    let env = Environment::open(dir.path(), config)?;
    let db = env.open_database("bulk")?;
    assert_eq!(env.scan(&db, ..)?.count(), 1_000);
    for i in (9_000..10_000).step_by(7) {
        assert_eq!(env.get(None, &db, &key(i))?, Some(value(i)));
    }
    env.verify_log()?;
    Ok(())
}

#[test]
fn test_evicted_data_is_still_readable() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let budget = 64 * 1024;
    let config = EnvironmentConfig::without_daemons()
        .with_cache_size(budget)
        .with_node_max_entries(32)
        .with_durability(Durability::NoSync);

    let env = Environment::open(dir.path(), config)?;
    let db = env.open_database("big")?;
    for i in 0..5_000 {
        env.put(None, &db, &key(i), &[b'x'; 100])?;
    }

    env.evict()?;
    let stats = env.stats();
    assert!(stats.cache.memory_usage <= budget, "{} bytes resident", stats.cache.memory_usage);
    assert!(stats.evictor.nodes_evicted > 0);

    for i in (0..5_000).step_by(11) {
        assert_eq!(env.get(None, &db, &key(i))?, Some(vec![b'x'; 100]));
    }
    assert_eq!(env.scan(&db, key(100)..key(200))?.count(), 100);
    Ok(())
}

#[test]
fn test_compressor_removes_empty_bins() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons()
        .with_node_max_entries(8)
        .with_durability(Durability::NoSync);

    let env = Environment::open(dir.path(), config)?;
    let db = env.open_database("sparse")?;
    for i in 0..200 {
        env.put(None, &db, &key(i), &value(i))?;
    }
    for i in 0..200 {
        if i % 50 != 0 {
            env.delete(None, &db, &key(i))?;
        }
    }

    let removed = env.compress()?;
    assert_eq!(removed, 196);
    let stats = env.stats();
    assert!(stats.compressor.bins_removed > 0);
    assert_eq!(stats.compressor.pending, 0);

    let remaining: Vec<_> = env.scan(&db, ..)?.map(|item| item.map(|(k, _)| k)).collect::<Result<_>>()?;
    assert_eq!(remaining, vec![key(0), key(50), key(100), key(150)]);

    // Keys can come back into compressed ranges
    env.put(None, &db, &key(75), b"back")?;
    assert_eq!(env.get(None, &db, &key(75))?, Some(b"back".to_vec()));
    Ok(())
}

#[test]
fn test_daemons_work_in_background() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::default()
        .with_daemon_interval(Duration::from_millis(20))
        .with_checkpoint_bytes_interval(32 * 1024)
        .with_cache_size(32 * 1024)
        .with_durability(Durability::NoSync);

    let env = Environment::open(dir.path(), config)?;
    let db = env.open_database("busy")?;
    for i in 0..2_000 {
        env.put(None, &db, &key(i), &value(i))?;
    }
    for i in 0..1_000 {
        env.delete(None, &db, &key(i))?;
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = env.stats();
        if stats.checkpointer.checkpoints > 1 && stats.evictor.runs > 0 && stats.compressor.pending == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "daemons made no progress:\n{}", stats);
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(env.get(None, &db, &key(1_500))?, Some(value(1_500)));
    env.close()?;
    Ok(())
}
