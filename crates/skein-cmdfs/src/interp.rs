//! Running command scripts.
//!
//! An [`Interp`] turns a [`Job`] into a running [`Child`]. The default,
//! [`ShellInterp`], runs the script with `/bin/sh -c` in its own process
//! group so that signals reach everything the script started.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use skein_core::{Receiver, Sender, StreamError};
use skein_proto::{read_bytes, write_bytes};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::CmdFsConfig;
use crate::error::FsError;

/// Final status of a command: `Ok` on success, else the exit error.
pub type Status = Result<(), StreamError>;

/// Everything needed to start a command.
#[derive(Debug)]
pub struct Job {
    /// Script text
    pub script: String,
    /// Environment variables
    pub vars: BTreeMap<String, String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Standard input; none means no input at all
    pub stdin: Option<Receiver<Bytes>>,
    /// Standard output, closed when the command's output ends
    pub stdout: Sender<Bytes>,
    /// Standard error, closed when the command's error output ends
    pub stderr: Sender<Bytes>,
}

/// Starts commands.
#[async_trait]
pub trait Interp: Send + Sync {
    /// Starts `job`, returning once the command is running.
    async fn spawn(&self, job: Job) -> Result<Child, FsError>;
}

/// Handle to a started command.
#[derive(Debug, Clone)]
pub struct Child {
    pid: Option<u32>,
    done: watch::Receiver<Option<Status>>,
}

impl Child {
    /// Creates a handle. `done` is set once the command has exited and its
    /// output queues are closed. Without a pid, signals are ignored.
    pub fn new(pid: Option<u32>, done: watch::Receiver<Option<Status>>) -> Self {
        Self { pid, done }
    }

    /// Process (and process group) id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the final status if the command is done.
    pub fn try_status(&self) -> Option<Status> {
        self.done.borrow().clone()
    }

    /// Waits for the command to finish.
    pub async fn wait(&self) -> Status {
        let mut done = self.done.clone();
        let status = match done.wait_for(Option::is_some).await {
            Ok(s) => s.clone(),
            Err(_) => None,
        };
        status.unwrap_or_else(|| Err(StreamError::new("command lost")))
    }

    /// Sends `sig` to the command's process group. Posting to a command
    /// that already exited is not an error.
    pub fn signal(&self, sig: Signal) -> Result<(), FsError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|_| FsError::Bug(format!("pid {}", pid)))?;
        trace!(pid, signal = sig.as_str(), "posting signal");
        match killpg(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(FsError::Io(e.into())),
        }
    }
}

/// Signal names accepted by a command's `sig` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    /// Kill right away
    Kill,
    /// Quit
    Quit,
    /// Interrupt
    Intr,
    /// Ask for a stack dump
    Stack,
    /// Terminate, then kill after a grace period, and flag for restart
    Restart,
}

impl Sig {
    /// Host signal posted for this name.
    pub fn signal(self) -> Signal {
        match self {
            Sig::Kill => Signal::SIGKILL,
            Sig::Quit => Signal::SIGQUIT,
            Sig::Intr => Signal::SIGINT,
            Sig::Stack => Signal::SIGUSR1,
            Sig::Restart => Signal::SIGTERM,
        }
    }
}

impl FromStr for Sig {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "kill" => Ok(Sig::Kill),
            "quit" => Ok(Sig::Quit),
            "intr" => Ok(Sig::Intr),
            "stack" => Ok(Sig::Stack),
            "restart" => Ok(Sig::Restart),
            _ => Err(()),
        }
    }
}

/// Runs scripts with a host shell.
#[derive(Debug, Clone)]
pub struct ShellInterp {
    shell: String,
    args: Vec<String>,
}

impl ShellInterp {
    /// Creates an interpreter running `shell args... script`.
    pub fn new(shell: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            shell: shell.into(),
            args,
        }
    }

    /// Creates the interpreter named by the configuration.
    pub fn from_config(config: &CmdFsConfig) -> Self {
        Self::new(config.shell.clone(), config.shell_args.clone())
    }
}

impl Default for ShellInterp {
    fn default() -> Self {
        Self::from_config(&CmdFsConfig::default())
    }
}

#[async_trait]
impl Interp for ShellInterp {
    async fn spawn(&self, job: Job) -> Result<Child, FsError> {
        let Job {
            script,
            vars,
            cwd,
            stdin,
            stdout,
            stderr,
        } = job;

        let mut cmd = Command::new(&self.shell);
        cmd.args(&self.args)
            .arg(&script)
            .env_clear()
            .envs(&vars)
            .current_dir(&cwd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(pid, script = %script, cwd = %cwd.display(), "spawned");

        if let (Some(mut rx), Some(mut w)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = write_bytes(&mut w, &mut rx).await {
                    debug!(pid, error = %e, "stdin copy stopped");
                }
            });
        }
        let out = child.stdout.take().map(|r| tokio::spawn(pump(r, stdout)));
        let err = child.stderr.take().map(|r| tokio::spawn(pump(r, stderr)));

        let (done_tx, done_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(st) => exit_status(st),
                Err(e) => Err(StreamError::from(e)),
            };
            for task in [out, err].into_iter().flatten() {
                let _ = task.await;
            }
            debug!(pid, status = ?status, "exited");
            let _ = done_tx.send(Some(status));
        });

        Ok(Child::new(pid, done_rx))
    }
}

/// Copies a child's output into a queue, closing it at the end.
async fn pump<R>(mut r: R, tx: Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let res = read_bytes(&mut r, &tx).await;
    tx.close_with(res.err().map(StreamError::from));
}

/// Renders a process exit status.
fn exit_status(st: ExitStatus) -> Status {
    if st.success() {
        return Ok(());
    }
    if let Some(code) = st.code() {
        return Err(StreamError::new(format!("exit status {}", code)));
    }
    let name = st
        .signal()
        .and_then(|s| Signal::try_from(s).ok())
        .map(|s| s.as_str())
        .unwrap_or("unknown");
    Err(StreamError::new(format!("signal {}", name)))
}
