//! Worker process lifecycle management.
//!
//! Spawns the worker binary as a child process bound to a given IPC base
//! path, and kills or restarts it. A fatal engine error makes the worker exit;
//! the supervisor owning this manager decides when to restart it.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{info, warn};
use thiserror::Error;

/// Name of the worker binary built by this package.
pub const WORKER_BINARY: &str = "mq-engine-worker";

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("cannot locate worker executable: {0}")]
    Locate(std::io::Error),
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
}

/// How to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Arguments placed before `--ipc-path`.
    pub args: Vec<String>,
    pub ipc_path: String,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, ipc_path: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ipc_path: ipc_path.into(),
        }
    }

    /// The worker binary installed next to the current executable.
    pub fn sibling(ipc_path: impl Into<String>) -> Result<Self, SpawnError> {
        let exe = std::env::current_exe().map_err(SpawnError::Locate)?;
        let program = exe
            .with_file_name(WORKER_BINARY)
            .with_extension(std::env::consts::EXE_EXTENSION);
        Ok(Self::new(program, ipc_path))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn spawn(&self) -> Result<Child, SpawnError> {
        info!(
            "Spawning worker: {} {} --ipc-path {}",
            self.program.display(),
            self.args.join(" "),
            self.ipc_path
        );
        Command::new(&self.program)
            .args(&self.args)
            .arg("--ipc-path")
            .arg(&self.ipc_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit()) // Worker logs go to parent's stderr
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

/// Manages the worker child process lifecycle.
pub struct ProcessManager {
    child: Mutex<Option<Child>>,
    command: WorkerCommand,
    restart_count: AtomicU32,
}

impl ProcessManager {
    /// Spawn a new worker process.
    pub fn spawn(command: WorkerCommand) -> Result<Self, SpawnError> {
        let child = command.spawn()?;
        Ok(Self {
            child: Mutex::new(Some(child)),
            command,
            restart_count: AtomicU32::new(0),
        })
    }

    pub fn ipc_path(&self) -> &str {
        &self.command.ipc_path
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().as_ref().map(Child::id)
    }

    /// Whether the child is still running. Reaps it if it has exited.
    pub fn is_alive(&self) -> bool {
        let mut guard = self.lock();
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("Worker process exited: {status}");
                *guard = None;
                false
            }
            Err(e) => {
                warn!("Cannot query worker process status: {e}");
                false
            }
        }
    }

    /// Kill the worker process immediately. OS reclaims all memory.
    pub fn kill(&self) {
        let mut guard = self.lock();
        if let Some(ref mut child) = *guard {
            info!("Killing worker process (pid={})", child.id());
            if let Err(e) = child.kill() {
                warn!("Kill failed, worker probably already exited: {e}");
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap worker process: {e}");
            }
        }
        *guard = None;
    }

    /// Restart the worker process (after kill or crash).
    pub fn restart(&self) -> Result<(), SpawnError> {
        self.kill();

        let child = self.command.spawn()?;
        *self.lock() = Some(child);
        let restarts = self.restart_count.fetch_add(1, Ordering::Relaxed) + 1;

        info!("Worker restarted (restart #{restarts})");
        Ok(())
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// `sh -c 'sleep 30' --ipc-path <path>`: extra arguments become `$0`, `$1`.
    fn sleeper() -> WorkerCommand {
        WorkerCommand::new("/bin/sh", "/tmp/mq-engine-test")
            .arg("-c")
            .arg("sleep 30")
    }

    #[test]
    fn test_spawn_kill_and_restart() {
        let manager = ProcessManager::spawn(sleeper()).unwrap();
        assert!(manager.is_alive());
        let first_pid = manager.pid().unwrap();

        manager.restart().unwrap();
        assert!(manager.is_alive());
        assert_eq!(manager.restart_count(), 1);
        assert_ne!(manager.pid().unwrap(), first_pid);

        manager.kill();
        assert!(!manager.is_alive());
        assert_eq!(manager.pid(), None);
    }

    #[test]
    fn test_exited_worker_is_reported_dead() {
        let command = WorkerCommand::new("/bin/sh", "/tmp/mq-engine-test")
            .arg("-c")
            .arg("exit 3");
        let manager = ProcessManager::spawn(command).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while manager.is_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!manager.is_alive());
    }

    #[test]
    fn test_missing_program_is_a_spawn_error() {
        let err = ProcessManager::spawn(WorkerCommand::new("/nonexistent/worker", "/tmp/x"))
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::Spawn { .. }));
    }
}
