use logtree::{
    cleaner::UtilizationTracker,
    common::{EnvironmentConfig, Result},
    log_mod::{FlushPolicy, LogEntry, LogManager},
    storage::FileManager,
};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn open_log(dir: &TempDir, config: &EnvironmentConfig) -> Result<(Arc<FileManager>, LogManager)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let files = Arc::new(FileManager::open(dir.path())?);
    let log = LogManager::open(
        files.clone(),
        config,
        Arc::new(UtilizationTracker::new()),
        None,
        Uuid::new_v4(),
    )?;
    Ok((files, log))
}

fn trace_message(entry: LogEntry) -> String {
    match entry {
        LogEntry::Trace(trace) => trace.message,
        other => panic!("expected a trace entry, found {:?}", other),
    }
}

#[test]
fn test_recent_entries_are_read_from_buffers() -> Result<()> {
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons().with_log_buffers(3, 1024);
    let (_files, log) = open_log(&dir, &config)?;

    let first = log.append(&LogEntry::trace("first"), FlushPolicy::None)?;
    let hits = log.stats().buffers.buffer_hits;
    assert_eq!(trace_message(log.read(first)?), "first");
    assert_eq!(log.stats().buffers.buffer_hits, hits + 1);

    // Push the first entry out of every resident buffer
    for i in 0..200 {
        log.append(&LogEntry::trace(format!("filler {:04}", i)), FlushPolicy::None)?;
    }
    let misses = log.stats().buffers.buffer_misses;
    assert_eq!(trace_message(log.read(first)?), "first");

    let stats = log.stats().buffers;
    assert_eq!(stats.buffer_misses, misses + 1);
    assert!(stats.buffers_written > 0);
    Ok(())
}

#[test]
fn test_oversized_entry_uses_temporary_buffer() -> Result<()> {
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons().with_log_buffers(2, 1024);
    let (_files, log) = open_log(&dir, &config)?;

    let big = "y".repeat(5000);
    let lsn = log.append(&LogEntry::trace(big.clone()), FlushPolicy::Write)?;
    let after = log.append(&LogEntry::trace("after"), FlushPolicy::None)?;

    assert_eq!(log.stats().buffers.temporary_buffers, 1);
    assert_eq!(trace_message(log.read(lsn)?), big);
    assert_eq!(trace_message(log.read(after)?), "after");
    Ok(())
}

#[test]
fn test_discarded_buffers_never_reach_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let (files, log) = open_log(&dir, &EnvironmentConfig::without_daemons())?;
    let durable = log.append(&LogEntry::trace("durable"), FlushPolicy::Write)?;
    let written = files.file_size(0)?;

    log.append(&LogEntry::trace("lost"), FlushPolicy::None)?;
    log.discard_buffers();

    assert_eq!(files.file_size(0)?, written);
    assert_eq!(trace_message(log.read(durable)?), "durable");
    Ok(())
}
