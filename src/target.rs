use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::errors::BenchError;

/// Lock entry the target creates inside its profile while it is running.
pub const DEFAULT_READY_LOCK: &str = "SingletonLock";

/// Control surface of the application under test.
pub trait TargetControl {
    /// Short name used in logs, errors and trace file names.
    fn name(&self) -> &str;

    /// Starts one instance bound to `profile_dir`.
    fn launch(&mut self, profile_dir: &Path, extra_args: &[String]) -> Result<(), BenchError>;

    /// Whether an instance is running and responsive in `profile_dir`.
    fn is_ready(&mut self, profile_dir: &Path) -> bool;

    /// Exit status of the launched process, once it has exited.
    fn exit_status(&mut self) -> Result<Option<String>, BenchError>;

    /// Stops the instance running in `profile_dir`. A no-op when nothing runs.
    fn shut_down(&mut self, profile_dir: &Path) -> Result<(), BenchError>;
}

/// A target started as a child process, ready once its profile lock appears.
#[derive(Debug)]
pub struct ProcessTarget {
    name: String,
    exe: PathBuf,
    extra_args: Vec<String>,
    launch_wrapper: Vec<String>,
    ready_lock: String,
    shutdown_timeout: Duration,
    child: Option<Child>,
}

impl ProcessTarget {
    pub fn new(exe: &Path) -> Self {
        let name = exe
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        ProcessTarget {
            name,
            exe: exe.to_path_buf(),
            extra_args: Vec::new(),
            launch_wrapper: Vec::new(),
            ready_lock: DEFAULT_READY_LOCK.to_string(),
            shutdown_timeout: Duration::from_secs(30),
            child: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Command prefix placed before the executable, e.g. a cold-start snapshot helper.
    pub fn with_launch_wrapper(mut self, wrapper: Vec<String>) -> Self {
        self.launch_wrapper = wrapper;
        self
    }

    pub fn with_ready_lock(mut self, lock: &str) -> Self {
        self.ready_lock = lock.to_string();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// The full command line for one launch, wrapper first.
    pub fn command_line(&self, profile_dir: &Path, extra_args: &[String]) -> Vec<String> {
        let mut line = self.launch_wrapper.clone();
        line.push(self.exe.display().to_string());
        line.push(format!("--user-data-dir={}", profile_dir.display()));
        line.extend(self.extra_args.iter().cloned());
        line.extend(extra_args.iter().cloned());
        line
    }

    fn lock_path(&self, profile_dir: &Path) -> PathBuf {
        profile_dir.join(&self.ready_lock)
    }

    fn signal(pid: u32, signal: &str) {
        let status = Command::new("kill")
            .arg(format!("-{signal}"))
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            debug!(pid, signal, error = %e, "kill failed");
        }
    }

    fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<bool, std::io::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if child.try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl TargetControl for ProcessTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&mut self, profile_dir: &Path, extra_args: &[String]) -> Result<(), BenchError> {
        let line = self.command_line(profile_dir, extra_args);
        info!(command = ?line, "launching target");

        let Some((program, args)) = line.split_first() else {
            return Err(BenchError::Configuration("empty target command line".to_string()));
        };
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| BenchError::Launch {
                program: PathBuf::from(program),
                source,
            })?;
        self.child = Some(child);
        Ok(())
    }

    fn is_ready(&mut self, profile_dir: &Path) -> bool {
        fs::symlink_metadata(self.lock_path(profile_dir)).is_ok()
    }

    fn exit_status(&mut self) -> Result<Option<String>, BenchError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.try_wait().map_err(|e| BenchError::io(&self.exe, e))?;
        Ok(status.map(|s| s.to_string()))
    }

    fn shut_down(&mut self, profile_dir: &Path) -> Result<(), BenchError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        info!(profile = %profile_dir.display(), "shutting down {}", self.name);

        let already_exited = child
            .try_wait()
            .map_err(|e| BenchError::io(&self.exe, e))?
            .is_some();
        if !already_exited {
            Self::signal(child.id(), "TERM");
            let exited = Self::wait_for_exit(&mut child, self.shutdown_timeout)
                .map_err(|e| BenchError::io(&self.exe, e))?;
            if !exited {
                warn!(
                    pid = child.id(),
                    "{} ignored TERM for {:?}, killing it", self.name, self.shutdown_timeout
                );
                child.kill().map_err(|e| BenchError::io(&self.exe, e))?;
                child.wait().map_err(|e| BenchError::io(&self.exe, e))?;
            }
        }

        // A lock left behind by an unclean exit would make the next launch look ready at once.
        let lock = self.lock_path(profile_dir);
        if fs::symlink_metadata(&lock).is_ok() {
            debug!(lock = %lock.display(), "removing stale profile lock");
            fs::remove_file(&lock).map_err(|e| BenchError::io(&lock, e))?;
        }
        Ok(())
    }
}

/// Polling cadence and ceiling while waiting for the target to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyTiming {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadyTiming {
    fn default() -> Self {
        ReadyTiming {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Polls until the target is ready, it exits, or the timeout passes.
pub fn wait_until_ready<T: TargetControl + ?Sized>(
    target: &mut T,
    profile_dir: &Path,
    timing: ReadyTiming,
) -> Result<(), BenchError> {
    debug!("waiting until {} is running", target.name());
    let started = Instant::now();
    loop {
        if target.is_ready(profile_dir) {
            debug!("found running instance of {}", target.name());
            return Ok(());
        }
        if let Some(status) = target.exit_status()? {
            return Err(BenchError::EarlyTermination {
                target: target.name().to_string(),
                status,
            });
        }
        if started.elapsed() >= timing.timeout {
            return Err(BenchError::IterationTimeout {
                target: target.name().to_string(),
                waited_secs: timing.timeout.as_secs(),
            });
        }
        thread::sleep(timing.poll_interval);
    }
}
