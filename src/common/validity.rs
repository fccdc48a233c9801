use log::error;
use parking_lot::Mutex;

use super::{LogTreeError, Result};

/// Records whether the environment has hit a failure it cannot recover from
/// in-process. Once invalid, every public operation fails.
#[derive(Debug, Default)]
pub struct EnvValidity {
    reason: Mutex<Option<String>>,
}

impl EnvValidity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&self, reason: impl Into<String>) {
        let mut current = self.reason.lock();
        if current.is_none() {
            let reason = reason.into();
            error!("Environment invalidated: {}", reason);
            *current = Some(reason);
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn check(&self) -> Result<()> {
        match self.reason.lock().as_ref() {
            Some(reason) => Err(LogTreeError::EnvironmentInvalid(reason.clone())),
            None => Ok(()),
        }
    }

    /// Passes `result` through, invalidating the environment first if it
    /// carries a fatal error.
    pub fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.invalidate(e.to_string());
            }
        }
        result
    }
}
