use logtree::{
    common::{EnvironmentConfig, Result},
    log_mod::LogEntry,
    Environment, Lsn, TxnConfig,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Result<Environment> {
    let _ = env_logger::builder().is_test(true).try_init();
    Environment::open(dir.path(), EnvironmentConfig::without_daemons().with_node_max_entries(16))
}

#[test]
fn test_put_get_delete() -> Result<()> {
    let dir = TempDir::new()?;
    let env = open(&dir)?;
    let db = env.open_database("fruit")?;

    env.put(None, &db, b"apple", b"red")?;
    env.put(None, &db, b"banana", b"yellow")?;
    env.put(None, &db, b"apple", b"green")?;
    assert_eq!(env.get(None, &db, b"apple")?, Some(b"green".to_vec()));
    assert_eq!(env.get(None, &db, b"cherry")?, None);

    assert!(env.delete(None, &db, b"banana")?);
    assert_eq!(env.get(None, &db, b"banana")?, None);
    assert!(env.is_valid());
    Ok(())
}

#[test]
fn test_databases_are_separate_and_persist() -> Result<()> {
    let dir = TempDir::new()?;
    let (first_id, second_id) = {
        let env = open(&dir)?;
        let first = env.open_database("first")?;
        let second = env.open_database("second")?;
        assert_ne!(first.id(), second.id());

        env.put(None, &first, b"k", b"1")?;
        env.put(None, &second, b"k", b"2")?;
        let ids = (first.id(), second.id());
        env.close()?;
        ids
    };

    let env = open(&dir)?;
    assert_eq!(env.database_names(), vec!["first".to_string(), "second".to_string()]);
    let first = env.existing_database("first")?;
    let second = env.existing_database("second")?;
    assert_eq!((first.id(), second.id()), (first_id, second_id));
    assert_eq!(env.get(None, &first, b"k")?, Some(b"1".to_vec()));
    assert_eq!(env.get(None, &second, b"k")?, Some(b"2".to_vec()));

    // A new database never reuses an id
    let third = env.open_database("third")?;
    assert!(third.id() > second_id);
    Ok(())
}

#[test]
fn test_scan_in_key_order() -> Result<()> {
    let dir = TempDir::new()?;
    let env = open(&dir)?;
    let db = env.open_database("ordered")?;
    for i in (0..100u32).rev() {
        env.put(None, &db, &i.to_be_bytes(), &(i * 2).to_be_bytes())?;
    }

    let all: Vec<_> = env.scan(&db, ..)?.collect::<Result<_>>()?;
    assert_eq!(all.len(), 100);
    assert!(all.windows(2).all(|pair| pair[0].0 < pair[1].0));

    let tail: Vec<_> = env
        .scan(&db, 95u32.to_be_bytes().to_vec()..)?
        .collect::<Result<_>>()?;
    assert_eq!(tail.len(), 5);
    assert_eq!(tail[0], (95u32.to_be_bytes().to_vec(), 190u32.to_be_bytes().to_vec()));
    Ok(())
}

#[test]
fn test_log_stream_and_verification() -> Result<()> {
    let dir = TempDir::new()?;
    let env = open(&dir)?;
    let db = env.open_database("stream")?;
    let start = env.end_of_log();

    let txn = env.begin_txn(TxnConfig::new())?;
    env.put(Some(&txn), &db, b"a", b"1")?;
    env.put(Some(&txn), &db, b"b", b"2")?;
    let commit_lsn = txn.commit()?.expect("writes were logged");

    let entries: Vec<(Lsn, LogEntry)> = env
        .log_entries(start)?
        .map(|item| item.map(|item| (item.lsn, item.entry)))
        .collect::<Result<_>>()?;
    let keys: Vec<_> = entries
        .iter()
        .filter_map(|(_, entry)| match entry {
            LogEntry::Ln(ln) => Some(ln.key.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    assert!(entries
        .iter()
        .any(|(lsn, entry)| *lsn == commit_lsn && matches!(entry, LogEntry::TxnCommit(_))));

    let report = env.verify_log()?;
    assert_eq!(report.files_checked, 1);
    assert!(report.entries_checked as usize >= entries.len());
    Ok(())
}

#[test]
fn test_stats_report_every_subsystem() -> Result<()> {
    let dir = TempDir::new()?;
    let env = open(&dir)?;
    let db = env.open_database("stats")?;
    for i in 0..50u32 {
        env.put(None, &db, &i.to_be_bytes(), b"v")?;
    }
    env.checkpoint(true)?;

    let stats = env.stats();
    assert_eq!(stats.databases, 1);
    assert_eq!(stats.checkpointer.checkpoints, 2);
    assert!(stats.tree.splits > 0);
    assert!(stats.log.appends > 50);

    let text = stats.to_string();
    for section in ["Checkpointer", "Cleaner", "Evictor", "Compressor"] {
        assert!(text.contains(section), "missing {} in\n{}", section, text);
    }
    Ok(())
}
