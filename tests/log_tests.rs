use logtree::{
    cleaner::UtilizationTracker,
    common::{EnvironmentConfig, Lsn, Result},
    log_mod::{verify_log, FlushPolicy, LogEntry, LogManager, LogReader},
    storage::FileManager,
    Environment, LogTreeError,
};
use proptest::prelude::*;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_log(dir: &Path, config: &EnvironmentConfig) -> Result<(Arc<FileManager>, LogManager)> {
    let files = Arc::new(FileManager::open(dir)?);
    let log = LogManager::open(
        files.clone(),
        config,
        Arc::new(UtilizationTracker::new()),
        None,
        Uuid::new_v4(),
    )?;
    Ok((files, log))
}

fn log_file_path(dir: &Path, file: u32) -> std::path::PathBuf {
    dir.join(format!("{:08x}.ltl", file))
}

#[test]
fn test_lsns_increase_across_rotation() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons().with_max_file_size(4096);
    let (files, log) = open_log(dir.path(), &config)?;

    let mut lsns = Vec::new();
    for i in 0..400 {
        lsns.push(log.append(&LogEntry::trace(format!("entry {}", i)), FlushPolicy::None)?);
    }
    log.flush()?;

    assert!(lsns.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(files.list_files()?.len() > 3);
    assert!(log.stats().file_rotations > 0);

    for (i, lsn) in lsns.iter().enumerate().step_by(17) {
        match log.read(*lsn)? {
            LogEntry::Trace(trace) => assert_eq!(trace.message, format!("entry {}", i)),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    let scanned: Vec<Lsn> = LogReader::new(&files, lsns[0], None)?
        .map(|item| item.map(|item| item.lsn))
        .collect::<Result<_>>()?;
    // Scans also see the header at the start of every later file
    assert!(lsns.iter().all(|lsn| scanned.contains(lsn)));
    Ok(())
}

#[test]
fn test_group_commit_from_many_threads() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let (_files, log) = open_log(dir.path(), &EnvironmentConfig::without_daemons())?;
    let log = Arc::new(log);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let log = log.clone();
            std::thread::spawn(move || -> Result<Vec<Lsn>> {
                (0..25)
                    .map(|i| log.append(&LogEntry::trace(format!("{}-{}", t, i)), FlushPolicy::Sync))
                    .collect()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("appender panicked")?);
    }
    assert_eq!(all.len(), 200);
    assert!(all.iter().all(|lsn| log.is_synced(*lsn)));

    let stats = log.stats();
    assert_eq!(stats.fsync_requests, 200);
    assert!(stats.fsyncs <= stats.fsync_requests);
    Ok(())
}

#[test]
fn test_torn_tail_is_truncated_on_open() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons();
    {
        let env = Environment::open(dir.path(), config.clone())?;
        let db = env.open_database("t")?;
        for i in 0..20u32 {
            env.put(None, &db, &i.to_be_bytes(), b"value")?;
        }
        env.close()?;
    }

    let mut file = OpenOptions::new().append(true).open(log_file_path(dir.path(), 0))?;
    file.write_all(&[0xab; 23])?;
    drop(file);

    let env = Environment::open(dir.path(), config)?;
    let report = env.recovery_report().expect("existing log is recovered");
    assert!(report.truncated_at.is_some());
    let db = env.open_database("t")?;
    for i in 0..20u32 {
        assert_eq!(env.get(None, &db, &i.to_be_bytes())?, Some(b"value".to_vec()));
    }
    env.verify_log()?;
    Ok(())
}

#[test]
fn test_corruption_in_earlier_file_is_fatal() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons().with_max_file_size(4096);
    {
        let env = Environment::open(dir.path(), config.clone())?;
        let db = env.open_database("t")?;
        for i in 0..300u32 {
            env.put(None, &db, &i.to_be_bytes(), &[7u8; 24])?;
        }
        env.abnormal_close();
    }

    let files = FileManager::open(dir.path())?;
    assert!(files.list_files()?.len() >= 3);
    let middle = (files.file_size(1)? / 2) as u32;
    let byte = files.read_at(1, middle, 1)?[0];
    files.write_at(1, middle, &[byte ^ 0x5a])?;
    files.sync(1)?;

    assert!(matches!(
        verify_log(&files),
        Err(LogTreeError::Checksum { .. } | LogTreeError::Corruption { .. })
    ));
    files.close_all();

    match Environment::open(dir.path(), config) {
        Err(e) => assert!(e.is_fatal(), "unexpected error {}", e),
        Ok(_) => panic!("open succeeded over a corrupt log file"),
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_lsn_order_matches_file_then_offset(a in any::<(u32, u32)>(), b in any::<(u32, u32)>()) {
        let (x, y) = (Lsn::new(a.0, a.1), Lsn::new(b.0, b.1));
        prop_assert_eq!(x.cmp(&y), a.cmp(&b));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_entries_never_span_files(sizes in prop::collection::vec(1usize..1500, 1..40)) {
        let dir = TempDir::new().unwrap();
        let config = EnvironmentConfig::without_daemons().with_max_file_size(4096);
        let (_files, log) = open_log(dir.path(), &config).unwrap();

        let mut previous = None;
        for size in sizes {
            let lsn = log.append(&LogEntry::trace("x".repeat(size)), FlushPolicy::None).unwrap();
            let (_, entry_size) = log.read_with_size(lsn).unwrap();
            prop_assert!(lsn.offset as u64 + entry_size as u64 <= 4096);
            if let Some(previous) = previous {
                prop_assert!(lsn > previous);
            }
            previous = Some(lsn);
        }
    }
}
