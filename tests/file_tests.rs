use logtree::{
    common::{EnvironmentConfig, Result},
    log_mod::truncate_log,
    storage::{EnvFiles, File, FileManager, FileMode, PosixFile},
    Environment,
};
use tempfile::TempDir;

#[test]
fn test_file_resize() -> Result<()> {
    let dir = TempDir::new()?;
    let mut file = PosixFile::new(&dir.path().join("blocks"), FileMode::WRITE)?;

    // Initial size should be zero
    assert_eq!(file.size()?, 0);

    file.resize(100)?;
    assert_eq!(file.size()?, 100);

    let test_data = b"test data";
    file.write_block(test_data, 50)?;
    assert_eq!(file.read_block(50, test_data.len())?, test_data);

    file.resize(10)?;
    assert_eq!(file.size()?, 10);
    Ok(())
}

#[test]
fn test_environment_directory_layout() -> Result<()> {
    let dir = TempDir::new()?;
    let env_path = dir.path().join("nested").join("env");
    let layout = EnvFiles::new(&env_path)?;
    assert!(env_path.is_dir());

    assert_eq!(EnvFiles::log_file_name(0x1f), "0000001f.ltl");
    assert_eq!(EnvFiles::parse_log_file_name("0000001f.ltl"), Some(0x1f));
    assert_eq!(EnvFiles::parse_log_file_name("0000001f.tmp"), None);

    std::fs::write(layout.get_log_file_path(2), [0u8; 30])?;
    std::fs::write(layout.get_log_file_path(0), [0u8; 12])?;
    std::fs::write(env_path.join("notes.txt"), b"ignored")?;
    assert_eq!(layout.list_log_files()?, vec![0, 2]);
    assert_eq!(layout.total_log_size()?, 42);
    Ok(())
}

#[test]
fn test_file_manager_counts_io() -> Result<()> {
    let dir = TempDir::new()?;
    let files = FileManager::open(dir.path())?;
    files.write_at(0, 0, b"0123456789")?;
    files.write_at(1, 4, b"abc")?;
    files.sync(1)?;

    assert_eq!(files.read_at(0, 2, 3)?, b"234".to_vec());
    assert_eq!(files.file_size(1)?, 7);
    files.delete_file(0)?;
    assert!(!files.exists(0));

    let stats = files.stats();
    assert_eq!(stats.writes, 2);
    assert_eq!(stats.bytes_written, 13);
    assert_eq!(stats.fsyncs, 1);
    assert_eq!(stats.files_deleted, 1);
    Ok(())
}

#[test]
fn test_truncated_log_recovers_to_cut() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new()?;
    let config = EnvironmentConfig::without_daemons();

    let cut = {
        let env = Environment::open(dir.path(), config.clone())?;
        let db = env.open_database("t")?;
        for i in 0..10u8 {
            env.put(None, &db, &[i], b"kept")?;
        }
        let cut = env.end_of_log();
        for i in 10..20u8 {
            env.put(None, &db, &[i], b"cut")?;
        }
        env.close()?;
        cut
    };

    truncate_log(dir.path(), cut)?;

    let env = Environment::open(dir.path(), config)?;
    let db = env.open_database("t")?;
    for i in 0..10u8 {
        assert_eq!(env.get(None, &db, &[i])?, Some(b"kept".to_vec()));
    }
    for i in 10..20u8 {
        assert_eq!(env.get(None, &db, &[i])?, None);
    }
    Ok(())
}
