//! Process supervision seam
//!
//! The control plane decides *when* a plugin instance should exist; an
//! external supervisor owns the fork/exec/reap mechanics. The seam is two
//! traits: [`ProcessSupervisor`] creates processes from [`SpawnArgs`], and
//! the returned [`ProcessHandle`] is how the runner later kills them.

use async_trait::async_trait;
use mittari_core::ControlError;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Everything needed to start one plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnArgs {
    /// Plugin executable
    pub path: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl SpawnArgs {
    /// Spawn the binary at `path` with no arguments or environment
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append a command-line argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A running plugin process, as far as the control plane cares.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS process id (0 for in-process fakes)
    fn pid(&self) -> u32;

    /// Terminate the process. Idempotent.
    async fn kill(&self) -> Result<(), ControlError>;
}

impl std::fmt::Debug for dyn ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProcessHandle(pid={})", self.pid())
    }
}

/// Creates plugin processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start one instance. The handle stays valid until `kill`.
    async fn spawn(&self, args: &SpawnArgs) -> Result<Arc<dyn ProcessHandle>, ControlError>;
}

/// Supervisor that execs the plugin binary directly via `tokio::process`.
#[derive(Debug, Default)]
pub struct ExecSupervisor;

struct ExecHandle {
    pid: u32,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

#[async_trait]
impl ProcessHandle for ExecHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn kill(&self) -> Result<(), ControlError> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            child.kill().await.map_err(|e| ControlError::Transport {
                message: format!("kill pid {}: {e}", self.pid),
            })?;
            debug!(pid = self.pid, "plugin process killed");
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for ExecSupervisor {
    async fn spawn(&self, args: &SpawnArgs) -> Result<Arc<dyn ProcessHandle>, ControlError> {
        let mut cmd = tokio::process::Command::new(&args.path);
        cmd.args(&args.args)
            .envs(args.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ControlError::SpawnFailed {
            key: args.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or(0);
        debug!(path = %args.path.display(), pid, "plugin process spawned");

        Ok(Arc::new(ExecHandle {
            pid,
            child: tokio::sync::Mutex::new(Some(child)),
        }))
    }
}

/// Supervisor for in-process plugins: hands out inert handles and never
/// touches the OS. Pairs with the loopback RPC factory in tests and
/// single-binary deployments.
#[derive(Debug, Default)]
pub struct NullSupervisor {
    next_pid: AtomicU32,
}

/// Handle from [`NullSupervisor`]; records whether it was killed.
#[derive(Debug)]
pub struct NullHandle {
    pid: u32,
    killed: AtomicBool,
}

impl NullHandle {
    /// True once `kill` has been called
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProcessHandle for NullHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn kill(&self) -> Result<(), ControlError> {
        self.killed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for NullSupervisor {
    async fn spawn(&self, _args: &SpawnArgs) -> Result<Arc<dyn ProcessHandle>, ControlError> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(NullHandle {
            pid,
            killed: AtomicBool::new(false),
        }))
    }
}
