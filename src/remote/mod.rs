//! Remote command execution.
//!
//! [`RemoteExec`] is the seam between the allocation logic and the transport.
//! [`SshExec`] implements it on top of the system `ssh` client, so host
//! aliases, jump hosts and keys from the user's SSH config all apply.

#[cfg(test)]
pub(crate) mod fake;

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;
use wait_timeout::ChildExt;

/// Default connect timeout passed to `ssh`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive interval for the long-lived session (seconds)
const SESSION_ALIVE_INTERVAL: u32 = 60;

/// Exit information of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, or `None` if the process was killed by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Captured result of a one-shot remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ProcessExit,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit.success()
    }
}

/// How a long-lived remote command is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Output streams are piped back to the caller
    Piped,
    /// The command gets a pseudo-terminal and inherits the local terminal
    Terminal,
}

/// Control over a spawned local process.
pub trait ProcessHandle: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Wait up to `timeout` for the process to exit.
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ProcessExit>>;

    /// Block until the process exits.
    fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Ask the process to stop (SIGTERM on Unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to stop.
    fn kill(&mut self) -> io::Result<()>;
}

/// A spawned remote command: its process handle and output streams.
pub struct RemoteProcess {
    pub handle: Box<dyn ProcessHandle>,
    /// Stdout and stderr in piped mode; empty in terminal mode
    pub streams: Vec<Box<dyn Read + Send>>,
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("pid", &self.handle.id())
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// Execute commands on a remote host.
pub trait RemoteExec {
    /// Start `command` on `target` and return immediately.
    fn spawn(&self, target: &str, command: &str, mode: SpawnMode) -> io::Result<RemoteProcess>;

    /// Run `command` on `target` to completion, giving up after `timeout`.
    ///
    /// A timeout is reported as [`io::ErrorKind::TimedOut`].
    fn exec_sync(&self, target: &str, command: &str, timeout: Duration) -> io::Result<RemoteOutput>;

    /// Whether the transport can be used at all on this machine.
    fn is_available(&self) -> bool {
        true
    }
}

/// [`RemoteExec`] over the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshExec {
    connect_timeout: Duration,
    options: Vec<String>,
}

impl Default for SshExec {
    fn default() -> Self {
        Self::new()
    }
}

impl SshExec {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            options: Vec::new(),
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add an extra `-o Key=Value` option.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    fn command(&self, target: &str, remote_command: &str, tty: bool) -> Command {
        self.command_with(target, remote_command, tty, &[])
    }

    fn command_with(&self, target: &str, remote_command: &str, tty: bool, extra: &[String]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"]);
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        for option in self.options.iter().chain(extra) {
            cmd.arg("-o").arg(option);
        }
        cmd.arg(if tty { "-t" } else { "-T" });
        cmd.arg("--").arg(target).arg(remote_command);
        cmd
    }
}

impl RemoteExec for SshExec {
    fn is_available(&self) -> bool {
        crate::sys::ssh_available()
    }

    fn spawn(&self, target: &str, command: &str, mode: SpawnMode) -> io::Result<RemoteProcess> {
        debug!(target, command, ?mode, "spawning remote command");

        match mode {
            SpawnMode::Piped => {
                let keep_alive = [format!("ServerAliveInterval={}", SESSION_ALIVE_INTERVAL)];
                let mut cmd = self.command_with(target, command, false, &keep_alive);
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                // Keep terminal Ctrl-C away from ssh; the session decides
                // how to tear it down.
                #[cfg(unix)]
                {
                    use std::os::unix::process::CommandExt;
                    cmd.process_group(0);
                }
                let mut child = cmd.spawn()?;

                let mut streams: Vec<Box<dyn Read + Send>> = Vec::new();
                if let Some(stdout) = child.stdout.take() {
                    streams.push(Box::new(stdout));
                }
                if let Some(stderr) = child.stderr.take() {
                    streams.push(Box::new(stderr));
                }
                Ok(RemoteProcess {
                    handle: Box::new(ChildHandle { child }),
                    streams,
                })
            }
            SpawnMode::Terminal => {
                let child = self
                    .command(target, command, true)
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .spawn()?;
                Ok(RemoteProcess {
                    handle: Box::new(ChildHandle { child }),
                    streams: Vec::new(),
                })
            }
        }
    }

    fn exec_sync(&self, target: &str, command: &str, timeout: Duration) -> io::Result<RemoteOutput> {
        debug!(target, command, timeout_secs = timeout.as_secs(), "running remote command");

        run_bounded(self.command(target, command, false), target, timeout)
    }
}

/// Run `cmd` to completion with piped output, killing it after `timeout`.
///
/// Both pipes are drained on their own threads while waiting, so a chatty
/// command cannot block on a full pipe buffer.
fn run_bounded(mut cmd: Command, target: &str, timeout: Duration) -> io::Result<RemoteOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response from {} within {}s", target, timeout.as_secs()),
            ));
        }
    };

    Ok(RemoteOutput {
        stdout: collect(stdout)?,
        stderr: collect(stderr)?,
        exit: status.into(),
    })
}

fn drain(stream: Option<impl Read + Send + 'static>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || read_lossy(stream))
}

fn collect(reader: JoinHandle<io::Result<String>>) -> io::Result<String> {
    reader
        .join()
        .map_err(|_| io::Error::other("output reader thread panicked"))?
}

fn read_lossy(stream: Option<impl Read>) -> io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf)?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// [`ProcessHandle`] for a local `ssh` child process.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ProcessExit>> {
        Ok(ChildExt::wait_timeout(&mut self.child, timeout)?.map(ProcessExit::from))
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        Ok(self.child.wait()?.into())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}
