use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::errors::BenchError;

/// How long a freshly started service must stay alive before it counts as up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub checks: u32,
    pub interval: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Liveness {
            checks: 5,
            interval: Duration::from_secs(1),
        }
    }
}

/// Command line of a long-lived side process controlled by `start`/`stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCommand {
    pub name: String,
    pub program: PathBuf,
    pub start_args: Vec<String>,
}

impl ServiceCommand {
    /// `<program> start --trace-dir=<dir> [--verbose] [extra...]`
    pub fn logging(
        name: &str,
        program: &Path,
        trace_dir: &Path,
        verbose: bool,
        extra: &[String],
    ) -> Self {
        let mut start_args = vec![
            "start".to_string(),
            format!("--trace-dir={}", trace_dir.display()),
        ];
        if verbose {
            start_args.push("--verbose".to_string());
        }
        start_args.extend(extra.iter().cloned());
        ServiceCommand {
            name: name.to_string(),
            program: program.to_path_buf(),
            start_args,
        }
    }

    fn working_dir(&self) -> Option<&Path> {
        self.program
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// A running service process whose stdout and stderr go to a log file.
///
/// Dropping a handle leaves the process running. Only [`ServiceHandle::stop`]
/// shuts it down, through the service's own `stop` command.
#[derive(Debug)]
pub struct ServiceHandle {
    command: ServiceCommand,
    child: Child,
    log_path: PathBuf,
}

impl ServiceHandle {
    pub fn start(
        command: ServiceCommand,
        log_path: &Path,
        liveness: Liveness,
    ) -> Result<Self, BenchError> {
        info!(service = %command.name, "starting service");
        let log_file = File::create(log_path).map_err(|e| BenchError::io(log_path, e))?;
        let stderr_file = log_file
            .try_clone()
            .map_err(|e| BenchError::io(log_path, e))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.start_args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file));
        if let Some(dir) = command.working_dir() {
            cmd.current_dir(dir);
        }
        debug!(program = %command.program.display(), args = ?command.start_args, "spawning service");

        let mut child = cmd.spawn().map_err(|source| BenchError::Launch {
            program: command.program.clone(),
            source,
        })?;

        for _ in 0..liveness.checks {
            thread::sleep(liveness.interval);
            let status = child
                .try_wait()
                .map_err(|e| BenchError::io(&command.program, e))?;
            if let Some(status) = status {
                let log = read_log(log_path);
                dump_log(&log, LogLevel::Error);
                return Err(BenchError::ServiceStart {
                    service: command.name,
                    detail: status.to_string(),
                    log,
                });
            }
        }

        Ok(ServiceHandle {
            command,
            child,
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.command.name
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Asks the service to shut down and waits for it to exit.
    pub fn stop(mut self) -> Result<(), BenchError> {
        info!(service = %self.command.name, "stopping service");

        let mut cmd = Command::new(&self.command.program);
        cmd.arg("stop");
        if let Some(dir) = self.command.working_dir() {
            cmd.current_dir(dir);
        }
        let status = cmd.status().map_err(|source| BenchError::Launch {
            program: self.command.program.clone(),
            source,
        })?;
        if !status.success() {
            let pid = self.child.id();
            warn!(
                service = %self.command.name,
                pid,
                "stop command failed; service process left running"
            );
            return Err(BenchError::ServiceStop {
                service: self.command.name,
                detail: format!("stop command {status}, pid {pid} left running"),
                log: read_log(&self.log_path),
            });
        }

        let exit = self
            .child
            .wait()
            .map_err(|e| BenchError::io(&self.command.program, e))?;
        let log = read_log(&self.log_path);
        if !exit.success() {
            return Err(BenchError::ServiceStop {
                service: self.command.name,
                detail: exit.to_string(),
                log,
            });
        }
        dump_log(&log, LogLevel::Info);
        Ok(())
    }
}

/// Holds at most one running service of a kind.
#[derive(Debug)]
pub struct ServiceSlot {
    kind: String,
    handle: Option<ServiceHandle>,
}

impl ServiceSlot {
    pub fn new(kind: &str) -> Self {
        ServiceSlot {
            kind: kind.to_string(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(
        &mut self,
        command: ServiceCommand,
        log_path: &Path,
        liveness: Liveness,
    ) -> Result<(), BenchError> {
        if self.handle.is_some() {
            return Err(BenchError::ServiceAlreadyRunning {
                service: self.kind.clone(),
            });
        }
        self.handle = Some(ServiceHandle::start(command, log_path, liveness)?);
        Ok(())
    }

    /// Stops the service if one was started. A slot that was never started is left alone.
    pub fn stop_if_running(&mut self) -> Result<(), BenchError> {
        match self.handle.take() {
            Some(handle) => handle.stop(),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy)]
enum LogLevel {
    Info,
    Error,
}

fn read_log(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn dump_log(log: &str, level: LogLevel) {
    for line in log.lines() {
        let line = line.trim();
        match level {
            LogLevel::Info => info!("-- {line}"),
            LogLevel::Error => error!("-- {line}"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use std::os::unix::fs::PermissionsExt;

    fn quick() -> Liveness {
        Liveness {
            checks: 3,
            interval: Duration::from_millis(50),
        }
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A service that runs until `<program> stop` drops a marker file.
    fn well_behaved(dir: &Path) -> PathBuf {
        let marker = dir.join("stop-requested");
        script(
            dir,
            "svc",
            &format!(
                r#"case "$1" in
  start)
    echo "service up $2"
    while [ ! -f "{m}" ]; do sleep 0.05; done
    echo "flushed"
    exit 0 ;;
  stop)
    touch "{m}"
    exit 0 ;;
esac"#,
                m = marker.display()
            ),
        )
    }

    #[test]
    fn logging_command_line() {
        let cmd = ServiceCommand::logging(
            "trace",
            Path::new("/opt/svc"),
            Path::new("/tmp/run"),
            true,
            &["--extra".to_string()],
        );
        assert_eq!(
            cmd.start_args,
            vec!["start", "--trace-dir=/tmp/run", "--verbose", "--extra"]
        );
    }

    #[test]
    fn start_and_stop_cleanly() {
        let tmp = TempDir::new().unwrap();
        let program = well_behaved(tmp.path());
        let log = tmp.path().join("svc.log");
        let cmd = ServiceCommand::logging("trace", &program, tmp.path(), false, &[]);

        let handle = ServiceHandle::start(cmd, &log, quick()).unwrap();
        assert_eq!(handle.name(), "trace");
        handle.stop().unwrap();

        let captured = fs::read_to_string(&log).unwrap();
        assert!(captured.contains("service up"));
        assert!(captured.contains("flushed"));
    }

    #[test]
    fn early_exit_fails_start_with_log() {
        let tmp = TempDir::new().unwrap();
        let program = script(tmp.path(), "svc", "echo 'cannot bind rpc endpoint' >&2\nexit 3");
        let cmd = ServiceCommand::logging("trace", &program, tmp.path(), false, &[]);

        let err = ServiceHandle::start(cmd, &tmp.path().join("svc.log"), quick()).unwrap_err();
        match err {
            BenchError::ServiceStart { service, log, .. } => {
                assert_eq!(service, "trace");
                assert!(log.contains("cannot bind rpc endpoint"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failing_stop_command_surfaces_log() {
        let tmp = TempDir::new().unwrap();
        let program = script(
            tmp.path(),
            "svc",
            r#"case "$1" in
  start) echo "running"; sleep 5 ;;
  stop) exit 2 ;;
esac"#,
        );
        let cmd = ServiceCommand::logging("trace", &program, tmp.path(), false, &[]);
        let handle = ServiceHandle::start(cmd, &tmp.path().join("svc.log"), quick()).unwrap();

        let err = handle.stop().unwrap_err();
        match err {
            BenchError::ServiceStop { detail, log, .. } => {
                assert!(detail.contains("stop command"));
                assert!(detail.contains("left running"));
                assert!(log.contains("running"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failing_stop_names_the_surviving_pid() {
        let tmp = TempDir::new().unwrap();
        let program = script(
            tmp.path(),
            "svc",
            r#"case "$1" in
  start) exec sleep 5 ;;
  stop) exit 2 ;;
esac"#,
        );
        let cmd = ServiceCommand::logging("trace", &program, tmp.path(), false, &[]);
        let handle = ServiceHandle::start(cmd, &tmp.path().join("svc.log"), quick()).unwrap();

        let err = handle.stop().unwrap_err();
        let detail = match err {
            BenchError::ServiceStop { detail, .. } => detail,
            other => panic!("unexpected error: {other}"),
        };
        let pid: u32 = detail
            .rsplit("pid ")
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|p| p.parse().ok())
            .unwrap();

        let alive = Command::new("kill").arg("-0").arg(pid.to_string()).status().unwrap();
        assert!(alive.success());
        Command::new("kill").arg(pid.to_string()).status().unwrap();
    }

    #[test]
    fn non_zero_service_exit_fails_stop() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("stop-requested");
        let program = script(
            tmp.path(),
            "svc",
            &format!(
                r#"case "$1" in
  start) while [ ! -f "{m}" ]; do sleep 0.05; done; echo "trace truncated"; exit 4 ;;
  stop) touch "{m}" ;;
esac"#,
                m = marker.display()
            ),
        );
        let cmd = ServiceCommand::logging("trace", &program, tmp.path(), false, &[]);
        let handle = ServiceHandle::start(cmd, &tmp.path().join("svc.log"), quick()).unwrap();

        let err = handle.stop().unwrap_err();
        assert!(err.to_string().contains("-- trace truncated"));
    }

    #[test]
    fn slot_rejects_second_start() {
        let tmp = TempDir::new().unwrap();
        let program = well_behaved(tmp.path());
        let cmd = ServiceCommand::logging("trace", &program, tmp.path(), false, &[]);

        let mut slot = ServiceSlot::new("trace");
        slot.start(cmd.clone(), &tmp.path().join("a.log"), quick())
            .unwrap();
        let err = slot
            .start(cmd, &tmp.path().join("b.log"), quick())
            .unwrap_err();
        assert!(matches!(err, BenchError::ServiceAlreadyRunning { .. }));

        slot.stop_if_running().unwrap();
        assert!(!slot.is_running());
    }

    #[test]
    fn stopping_idle_slot_is_noop() {
        let mut slot = ServiceSlot::new("trace");
        slot.stop_if_running().unwrap();
    }
}
