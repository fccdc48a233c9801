use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use super::{EnvValidity, Result};

/// Work a daemon thread performs every time it wakes up.
pub trait BackgroundTask: Send + Sync + 'static {
    /// Task name for logging and the thread name
    fn name(&self) -> &'static str;

    /// Run one pass of the task
    fn run_once(&self) -> Result<()>;
}

#[derive(Default)]
struct DaemonSignal {
    shutdown: bool,
    wakeup: bool,
}

struct DaemonShared {
    signal: Mutex<DaemonSignal>,
    cond: Condvar,
}

/// A std thread that runs a `BackgroundTask` every `interval` or whenever it
/// is woken, until shut down.
pub struct DaemonThread {
    name: &'static str,
    shared: Arc<DaemonShared>,
    handle: Option<JoinHandle<()>>,
}

impl DaemonThread {
    pub fn spawn<T: BackgroundTask>(
        task: Arc<T>,
        interval: Duration,
        validity: Arc<EnvValidity>,
    ) -> Result<Self> {
        let name = task.name();
        let shared = Arc::new(DaemonShared {
            signal: Mutex::new(DaemonSignal::default()),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("logtree-{}", name))
            .spawn(move || Self::run(task, interval, thread_shared, validity))?;

        debug!("Started {} daemon", name);
        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    fn run<T: BackgroundTask>(
        task: Arc<T>,
        interval: Duration,
        shared: Arc<DaemonShared>,
        validity: Arc<EnvValidity>,
    ) {
        let mut runs = 0u64;
        loop {
            {
                let mut signal = shared.signal.lock();
                if !signal.shutdown && !signal.wakeup {
                    shared.cond.wait_for(&mut signal, interval);
                }
                if signal.shutdown {
                    break;
                }
                signal.wakeup = false;
            }

            if validity.is_invalid() {
                continue;
            }

            runs += 1;
            if let Err(e) = task.run_once() {
                error!("{} daemon run {} failed: {}", task.name(), runs, e);
                if e.is_fatal() {
                    validity.invalidate(format!("{} daemon: {}", task.name(), e));
                }
            }
        }
        info!("{} daemon shutting down after {} runs", task.name(), runs);
    }

    /// Asks the daemon to run as soon as possible.
    pub fn wakeup(&self) {
        let mut signal = self.shared.signal.lock();
        signal.wakeup = true;
        self.shared.cond.notify_one();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the thread and waits for its current run to finish.
    pub fn shutdown(&mut self) {
        {
            let mut signal = self.shared.signal.lock();
            signal.shutdown = true;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} daemon panicked", self.name);
            }
        }
    }
}

impl Drop for DaemonThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct CountingTask {
        counter: Arc<AtomicUsize>,
    }

    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run_once(&self) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_runs_on_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(CountingTask {
            counter: counter.clone(),
        });
        let mut daemon =
            DaemonThread::spawn(task, Duration::from_millis(10), Arc::new(EnvValidity::new())).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        daemon.shutdown();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_wakeup_runs_promptly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(CountingTask {
            counter: counter.clone(),
        });
        let mut daemon =
            DaemonThread::spawn(task, Duration::from_secs(60), Arc::new(EnvValidity::new())).unwrap();

        daemon.wakeup();
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let start = Instant::now();
        daemon.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
