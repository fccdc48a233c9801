use std::fs;
use std::path::{Path, PathBuf};

use crate::common::config::LOG_FILE_SUFFIX;
use crate::common::Result;

/// Layout of an environment directory: one flat directory of numbered log
/// files named `NNNNNNNN.ltl` in hex.
#[derive(Debug, Clone)]
pub struct EnvFiles {
    env_directory: PathBuf,
}

impl EnvFiles {
    pub fn new(env_path: &Path) -> Result<Self> {
        let env_directory = env_path.to_path_buf();

        // Create the directory if it doesn't exist
        fs::create_dir_all(&env_directory)?;

        Ok(Self { env_directory })
    }

    pub fn directory(&self) -> &Path {
        &self.env_directory
    }

    pub fn log_file_name(file_number: u32) -> String {
        format!("{:08x}.{}", file_number, LOG_FILE_SUFFIX)
    }

    pub fn get_log_file_path(&self, file_number: u32) -> PathBuf {
        self.env_directory.join(Self::log_file_name(file_number))
    }

    /// Parses a log file name back into its number.
    pub fn parse_log_file_name(name: &str) -> Option<u32> {
        let (stem, suffix) = name.split_once('.')?;
        if suffix != LOG_FILE_SUFFIX || stem.len() != 8 {
            return None;
        }
        u32::from_str_radix(stem, 16).ok()
    }

    /// Numbers of every log file in the directory, ascending.
    pub fn list_log_files(&self) -> Result<Vec<u32>> {
        let mut numbers = Vec::new();
        for entry in fs::read_dir(&self.env_directory)? {
            let entry = entry?;
            if let Some(number) = entry.file_name().to_str().and_then(Self::parse_log_file_name) {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Sum of the sizes of every log file.
    pub fn total_log_size(&self) -> Result<u64> {
        let mut total = 0;
        for number in self.list_log_files()? {
            total += fs::metadata(self.get_log_file_path(number))?.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(EnvFiles::log_file_name(0), "00000000.ltl");
        assert_eq!(EnvFiles::log_file_name(0x1a), "0000001a.ltl");
        assert_eq!(EnvFiles::parse_log_file_name("0000001a.ltl"), Some(0x1a));
        assert_eq!(EnvFiles::parse_log_file_name("0000001a.log"), None);
        assert_eq!(EnvFiles::parse_log_file_name("1a.ltl"), None);
    }

    #[test]
    fn test_lists_sorted_numbers_only() {
        let dir = tempfile::tempdir().unwrap();
        let files = EnvFiles::new(dir.path()).unwrap();
        for number in [3u32, 1, 2] {
            fs::write(files.get_log_file_path(number), b"x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(files.list_log_files().unwrap(), vec![1, 2, 3]);
        assert_eq!(files.total_log_size().unwrap(), 3);
    }
}
