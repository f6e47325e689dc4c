//! Driving a remote allocation from request to release.
//!
//! An [`AllocationSession`] owns one remote `salloc` process. Its stdout and
//! stderr are forwarded line by line over a channel by reader threads; all
//! parsing and every state transition happens on the thread that owns the
//! session. Cancellation is a [`CancelToken`] polled at each wait.

use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::command::{SchedulerCommand, first_host};
use super::parser::{AllocationParser, ParseEvent};
use super::{AllocationRequest, AllocationState, CancelToken, JobId};
use crate::errors;
use crate::remote::{ProcessExit, ProcessHandle, RemoteExec, SpawnMode};
use crate::{Error, Result};

/// Timeout for the out-of-band node lookup
pub const NODE_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for the remote job cancellation
pub const REMOTE_CANCEL_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period before SIGKILL after SIGTERM
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often waits wake up to check for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reason recorded when the output stream closes before the ready marker.
pub const INCOMPLETE_REASON: &str = "allocation did not complete";

/// Result of the remote half of a teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCancel {
    /// No job id was known, so there was nothing to cancel
    NotNeeded,
    Cancelled,
    /// The cancel call failed; the job may still be running
    Failed { job_id: JobId, detail: String },
}

/// What a cancellation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    pub job_id: Option<JobId>,
    pub remote: RemoteCancel,
}

/// How a ready session finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The remote process exited on its own (usually the wall-clock limit)
    Exited(ProcessExit),
    Cancelled(CancelReport),
}

type Display<'a> = Box<dyn FnMut(&str) + 'a>;

/// A live foreground allocation.
pub struct AllocationSession<'a, E: RemoteExec + ?Sized> {
    exec: &'a E,
    target: String,
    state: AllocationState,
    parser: AllocationParser,
    process: Option<Box<dyn ProcessHandle>>,
    lines: Receiver<String>,
    cancel: CancelToken,
    remote_cancelled: bool,
    cancel_report: Option<CancelReport>,
    grace: Duration,
    display: Display<'a>,
}

impl<'a, E: RemoteExec + ?Sized> AllocationSession<'a, E> {
    /// Start the foreground allocation on `target`.
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the remote command cannot be started.
    pub fn start(exec: &'a E, target: &str, request: &AllocationRequest, cancel: CancelToken) -> Result<Self> {
        let command = SchedulerCommand::foreground(request).build();
        info!(
            target,
            partition = %request.partition,
            time = %request.time_limit,
            cpus = request.cpus,
            memory = %request.memory,
            gpus = ?request.gpu_count(),
            "requesting allocation"
        );

        let process = exec
            .spawn(target, &command, SpawnMode::Piped)
            .map_err(|e| Error::Transport(format!("ssh {}: {}", target, e)))?;

        Ok(Self {
            exec,
            target: target.to_string(),
            state: AllocationState::Requesting,
            parser: AllocationParser::new(),
            process: Some(process.handle),
            lines: forward_lines(process.streams),
            cancel,
            remote_cancelled: false,
            cancel_report: None,
            grace: SHUTDOWN_GRACE,
            display: Box::new(|line| eprintln!("{}", line)),
        })
    }

    /// Override the SIGTERM grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Send non-marker output lines to `display` instead of stderr.
    pub fn with_display(mut self, display: impl FnMut(&str) + 'a) -> Self {
        self.display = Box::new(display);
        self
    }

    /// Current state.
    pub fn state(&self) -> &AllocationState {
        &self.state
    }

    /// Head node the session runs through.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Consume output until the allocation is ready, fails or is cancelled.
    pub fn wait_ready(&mut self) -> &AllocationState {
        while !self.state.is_settled() {
            if self.cancel.is_cancelled() {
                self.cancel();
                break;
            }
            match self.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => self.handle_line(&line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.stream_ended(),
            }
        }
        &self.state
    }

    /// Block until the remote process exits or cancellation is requested.
    ///
    /// Output is still shown but no longer parsed.
    pub fn block_until_exit(&mut self) -> Result<SessionEnd> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(SessionEnd::Cancelled(self.cancel()));
            }

            self.drain_output();

            let handle = self
                .process
                .as_mut()
                .ok_or_else(|| Error::Other("allocation session has no running process".to_string()))?;
            if let Some(exit) = handle.wait_timeout(POLL_INTERVAL)? {
                self.process = None;
                self.drain_output();
                info!(code = ?exit.code, "allocation session ended");
                return Ok(SessionEnd::Exited(exit));
            }
        }
    }

    /// Cancel the job and tear down the local process.
    ///
    /// The remote cancel is attempted first; its failure is reported as a
    /// warning and never stops the local teardown. Calling this again is a
    /// no-op for steps that already ran.
    pub fn cancel(&mut self) -> CancelReport {
        let report = self.teardown();
        if !matches!(self.state, AllocationState::Failed(_)) {
            self.state = AllocationState::Cancelled(report.job_id.clone());
        }
        self.cancel_report = Some(report.clone());
        report
    }

    /// Report of the most recent [`AllocationSession::cancel`], if any.
    pub fn cancel_report(&self) -> Option<&CancelReport> {
        self.cancel_report.as_ref()
    }

    fn handle_line(&mut self, line: &str) {
        match self.parser.feed(line) {
            ParseEvent::Passthrough => (self.display)(line),
            ParseEvent::JobSubmitted(job_id) => {
                info!(%job_id, "job submitted");
                self.state = AllocationState::JobSubmitted(job_id);
            }
            ParseEvent::NodeAssigned { job_id, node } => self.node_assigned(job_id, node),
            ParseEvent::NodeMissing(job_id) => self.resolve_node(&job_id),
            ParseEvent::ReadyWithoutNode(job_id) => {
                self.fail(format!(
                    "job {} became ready but its compute node could not be determined",
                    job_id
                ));
            }
            ParseEvent::Ready { job_id, node } => {
                info!(%job_id, %node, "allocation ready");
                self.state = AllocationState::Ready(job_id, node);
            }
        }
    }

    fn node_assigned(&mut self, job_id: JobId, node: String) {
        info!(%job_id, %node, "node assigned");
        self.state = AllocationState::NodeAssigned(job_id, node);
    }

    /// Ask the scheduler for the node of `job_id` outside the main stream.
    fn resolve_node(&mut self, job_id: &JobId) {
        let command = SchedulerCommand::node_query(job_id).build();
        debug!(%job_id, "node marker was empty, querying scheduler");

        match self.exec.exec_sync(&self.target, &command, NODE_QUERY_TIMEOUT) {
            Ok(output) if output.success() => match first_host(&output.stdout) {
                Some(node) => {
                    if let Some(ParseEvent::NodeAssigned { job_id, node }) = self.parser.resolve_node(&node) {
                        self.node_assigned(job_id, node);
                    }
                }
                None => warn!(%job_id, "scheduler has not reported a node for the job yet"),
            },
            Ok(output) => warn!(
                %job_id,
                code = ?output.exit.code,
                stderr = %output.stderr.trim(),
                "node query failed"
            ),
            Err(e) => warn!(%job_id, error = %e, "node query failed"),
        }
    }

    fn stream_ended(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel();
            return;
        }

        let exit = self
            .process
            .as_mut()
            .and_then(|handle| handle.wait_timeout(self.grace).ok().flatten());
        warn!(code = ?exit.map(|e| e.code), "allocation output ended early");
        self.terminate_local();
        self.state = AllocationState::Failed(INCOMPLETE_REASON.to_string());
    }

    fn fail(&mut self, reason: String) {
        warn!(%reason, "allocation failed");
        self.teardown();
        self.state = AllocationState::Failed(reason);
    }

    /// Remote cancel (best effort), then local terminate.
    fn teardown(&mut self) -> CancelReport {
        let job_id = self.parser.job_id().or(self.state.job_id()).cloned();
        let remote = match &job_id {
            Some(_) if self.remote_cancelled => RemoteCancel::Cancelled,
            Some(job_id) => self.cancel_remote(job_id),
            None => RemoteCancel::NotNeeded,
        };
        self.terminate_local();
        CancelReport { job_id, remote }
    }

    fn cancel_remote(&mut self, job_id: &JobId) -> RemoteCancel {
        let command = SchedulerCommand::cancel(job_id).build();
        info!(%job_id, target = %self.target, "cancelling job");

        let detail = match self.exec.exec_sync(&self.target, &command, REMOTE_CANCEL_TIMEOUT) {
            Ok(output) if output.success() => {
                self.remote_cancelled = true;
                return RemoteCancel::Cancelled;
            }
            Ok(output) => format!(
                "scancel exited with {}: {}",
                output.exit.code.map_or("a signal".to_string(), |c| format!("code {}", c)),
                output.stderr.trim()
            ),
            Err(e) => e.to_string(),
        };

        warn!(%job_id, %detail, "remote cancel failed");
        eprintln!("{}", errors::remote_cancel_failed(&self.target, job_id, &detail));
        RemoteCancel::Failed {
            job_id: job_id.clone(),
            detail,
        }
    }

    /// Stop the local ssh process: SIGTERM, grace period, then SIGKILL.
    fn terminate_local(&mut self) {
        let Some(mut handle) = self.process.take() else {
            return;
        };
        if let Ok(Some(_)) = handle.wait_timeout(Duration::ZERO) {
            return;
        }

        if let Err(e) = handle.terminate() {
            warn!(error = %e, "failed to signal local ssh process");
        }
        match handle.wait_timeout(self.grace) {
            Ok(Some(exit)) => debug!(code = ?exit.code, "local ssh process stopped"),
            _ => {
                warn!(grace_secs = self.grace.as_secs(), "ssh did not exit in time, killing it");
                if let Err(e) = handle.kill() {
                    warn!(error = %e, "failed to kill local ssh process");
                }
                let _ = handle.wait_timeout(self.grace);
            }
        }
    }

    fn drain_output(&mut self) {
        while let Ok(line) = self.lines.try_recv() {
            (self.display)(&line);
        }
    }
}

impl<E: RemoteExec + ?Sized> Drop for AllocationSession<'_, E> {
    fn drop(&mut self) {
        self.terminate_local();
    }
}

/// Forward every line of every stream into one channel.
///
/// The receiver disconnects once all streams reach EOF.
fn forward_lines(streams: Vec<Box<dyn Read + Send>>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    for stream in streams {
        let tx = tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stream);
            for raw in reader.split(b'\n').map_while(std::result::Result::ok) {
                let line = String::from_utf8_lossy(&raw);
                if tx.send(line.trim_end_matches('\r').to_string()).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

/// Run an interactive shell on a compute node, attached to this terminal.
///
/// The exit status is returned as-is; a non-zero status is logged but is not
/// an error.
pub fn run_interactive<E: RemoteExec + ?Sized>(
    exec: &E,
    target: &str,
    request: &AllocationRequest,
) -> Result<ProcessExit> {
    let command = SchedulerCommand::interactive(request).build();
    info!(target, partition = %request.partition, "starting interactive session");

    let mut process = exec
        .spawn(target, &command, SpawnMode::Terminal)
        .map_err(|e| Error::Transport(format!("ssh {}: {}", target, e)))?;
    let exit = process.handle.wait()?;
    if !exit.success() {
        warn!(code = ?exit.code, "interactive session exited with non-zero status");
    }
    Ok(exit)
}
