use crate::model::{ProcessRole, ProcessSpec};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn {role} process `{program}`: {source}")]
    Spawn {
        role: ProcessRole,
        program: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    /// Exit code a shell would report for the same failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Spawn { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => 127,
                io::ErrorKind::PermissionDenied => 126,
                _ => 1,
            },
        }
    }
}

/// A spawned collaborator process.
pub struct ManagedChild {
    pub role: ProcessRole,
    child: Child,
    pid: Option<u32>,
}

impl ManagedChild {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Non-blocking check whether the process already exited.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// SIGTERM, then SIGKILL once `grace` runs out. Returns the final status when reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_exit_status() {
            return Some(status);
        }
        send_sigterm(&self.child, self.role);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(role = %self.role, error = %e, "failed to reap process");
                None
            }
            Err(_) => {
                warn!(role = %self.role, grace_ms = grace.as_millis() as u64, "grace period expired, killing");
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        }
    }
}

/// Spawn a process described by `spec`, inheriting stdio so its output reaches the container log.
pub fn spawn(spec: &ProcessSpec) -> Result<ManagedChild, LaunchError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(match spec.role {
            // The API runs detached from the controlling terminal.
            ProcessRole::Api => Stdio::null(),
            ProcessRole::Ui => Stdio::inherit(),
        })
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        role: spec.role,
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!(role = %spec.role, ?pid, command = %spec.command_line(), "spawned");
    Ok(ManagedChild {
        role: spec.role,
        child,
        pid,
    })
}

/// Map an exit status to a shell-style exit code (`128 + signal` for signalled processes).
pub fn exit_code_from_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

#[cfg(unix)]
fn send_sigterm(child: &Child, role: ProcessRole) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(%role, error = %e, "failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child, role: ProcessRole) {
    debug!(%role, "no SIGTERM on this platform, waiting for grace period before kill");
}
