use std::{
    io,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::engine::{error::SpawnError, models::Invocation, sandbox::bounded::StreamRole};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const INHERITED_ENV: &[&str] = &["PATH", "LANG"];
const SIGNAL_EXIT_BASE: i32 = 128;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Ended because [`ProcessHandle::kill`] was requested.
    Killed,
}

impl ExitState {
    /// Shell-style exit code: the real code, or `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        match *self {
            Self::Exited { code: Some(code), .. } => Some(code),
            Self::Exited {
                code: None,
                signal: Some(signal),
            } => Some(SIGNAL_EXIT_BASE + signal),
            _ => None,
        }
    }

    fn is_signalled(&self) -> bool {
        matches!(self, Self::Exited { signal: Some(_), .. })
    }
}

/// Shared kill state. A kill request signals the process group at once;
/// `wait` stays the only reaper.
struct KillState {
    pid: Option<u32>,
    token: CancellationToken,
    reaped: AtomicBool,
}

impl KillState {
    fn request(&self) {
        let first = !self.token.is_cancelled();
        self.token.cancel();
        // A reaped pid may already belong to another process.
        if first && !self.reaped.load(Ordering::Acquire) {
            #[cfg(unix)]
            {
                if let Some(pid) = self.pid {
                    signal_group(pid);
                }
            }
        }
    }
}

/// Cloneable kill request that can be handed to other tasks.
#[derive(Clone)]
pub struct KillSwitch(Arc<KillState>);

impl KillSwitch {
    pub fn kill(&self) {
        self.0.request();
    }
}

/// Owns one child process and its standard streams until it is reaped.
pub struct ProcessHandle {
    child: Child,
    executable: PathBuf,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    kill: Arc<KillState>,
    exit: Option<ExitState>,
}

impl ProcessHandle {
    /// Spawns the child with all three streams piped.
    ///
    /// On unix the child leads its own process group so that a kill reaches
    /// anything it forked. The environment is rebuilt from an allow-list plus
    /// the invocation's own variables.
    pub fn start(invocation: &Invocation) -> Result<Self, SpawnError> {
        if let Some(dir) = &invocation.working_dir {
            if !dir.is_dir() {
                return Err(SpawnError::WorkingDirectory(dir.clone()));
            }
        }

        let mut cmd = Command::new(&invocation.executable);
        cmd.args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();
        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        if std::env::var_os("PATH").is_none() {
            cmd.env("PATH", DEFAULT_PATH);
        }
        cmd.envs(&invocation.env);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|err| SpawnError::from_io(invocation.executable.clone(), err))?;
        let pid = child.id();
        tracing::debug!(?pid, executable = %invocation.executable.display(), "spawned child");

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            executable: invocation.executable.clone(),
            kill: Arc::new(KillState {
                pid,
                token: CancellationToken::new(),
                reaped: AtomicBool::new(false),
            }),
            exit: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.kill.pid
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    /// Hands out stdin, stdout and stderr. Fails if any of them was already
    /// taken or never captured.
    pub fn take_pipes(&mut self) -> Result<(ChildStdin, ChildStdout, ChildStderr), SpawnError> {
        let stdin = self.stdin.take().ok_or(SpawnError::MissingPipe {
            role: StreamRole::Stdin,
        })?;
        let stdout = self.stdout.take().ok_or(SpawnError::MissingPipe {
            role: StreamRole::Stdout,
        })?;
        let stderr = self.stderr.take().ok_or(SpawnError::MissingPipe {
            role: StreamRole::Stderr,
        })?;
        Ok((stdin, stdout, stderr))
    }

    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch(self.kill.clone())
    }

    /// Requests forcible termination and signals the process group right
    /// away. Repeated calls, or calls after the process was reaped, do
    /// nothing.
    pub fn kill(&self) {
        self.kill.request();
    }

    /// Waits for the process to exit or to be killed.
    ///
    /// A natural exit that races with a kill request is reported as the exit.
    /// Once resolved, later calls return the same state.
    pub async fn wait(&mut self) -> io::Result<ExitState> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let exit = tokio::select! {
            biased;
            status = self.child.wait() => {
                let exit = exit_state(status?);
                if self.kill.token.is_cancelled() && exit.is_signalled() {
                    ExitState::Killed
                } else {
                    exit
                }
            }
            _ = self.kill.token.cancelled() => {
                self.terminate();
                self.child.wait().await?;
                ExitState::Killed
            }
        };

        self.kill.reaped.store(true, Ordering::Release);
        self.exit = Some(exit);
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        tracing::debug!(pid = ?self.kill.pid, ?exit, "child reaped");
        Ok(exit)
    }

    /// Kills whatever is left in the child's process group, such as
    /// background jobs still holding the output pipes after the child exited.
    pub fn kill_group(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.kill.pid {
                signal_group(pid);
            }
        }
    }

    fn terminate(&mut self) {
        self.kill_group();
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(pid = ?self.kill.pid, error = %err, "start_kill on child failed");
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg takes no pointers; a stale group id only yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::trace!(pgid, error = %io::Error::last_os_error(), "killpg returned an error");
    }
}

fn exit_state(status: std::process::ExitStatus) -> ExitState {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitState::Exited {
        code: status.code(),
        signal,
    }
}
