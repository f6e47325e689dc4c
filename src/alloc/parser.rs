//! Line-at-a-time state machine over `salloc` output.
//!
//! The parser has no side effects: it consumes one line and reports what the
//! line meant. Follow-up actions (querying the scheduler for a missing node,
//! writing the SSH config) belong to the caller.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::JobId;
use super::command::READY_MARKER;

/// `JOB_ID:<id>` from the probe, or salloc's own allocation messages.
static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:JOB_ID:\s*(\d+(?:[_+]\d+)?)\b|(?:Pending|Granted) job allocation (\d+))")
        .expect("job id regex is valid")
});

/// `COMPUTE_NODE:<name>`; the name may be empty.
static NODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"COMPUTE_NODE:[ \t]*(\S*)").expect("node regex is valid"));

/// Where the parser is in the allocation handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    AwaitingJobId,
    AwaitingNode { job_id: JobId },
    AwaitingReady { job_id: JobId, node: String },
    /// Ready marker seen; further lines are not inspected
    Done { job_id: JobId, node: String },
}

/// Meaning of one consumed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// Not a marker (or not one expected now); show it to the user
    Passthrough,
    JobSubmitted(JobId),
    NodeAssigned { job_id: JobId, node: String },
    /// Node marker with an empty value; the caller should ask the scheduler
    NodeMissing(JobId),
    /// Ready marker while the node is still unknown
    ReadyWithoutNode(JobId),
    Ready { job_id: JobId, node: String },
}

/// Incremental parser for the allocation handshake.
#[derive(Debug, Clone)]
pub struct AllocationParser {
    phase: Phase,
}

impl Default for AllocationParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingJobId,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Job id, once seen.
    pub fn job_id(&self) -> Option<&JobId> {
        match &self.phase {
            Phase::AwaitingJobId => None,
            Phase::AwaitingNode { job_id }
            | Phase::AwaitingReady { job_id, .. }
            | Phase::Done { job_id, .. } => Some(job_id),
        }
    }

    /// Whether the ready marker has been consumed.
    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done { .. })
    }

    /// Consume one output line.
    pub fn feed(&mut self, line: &str) -> ParseEvent {
        let event = match &self.phase {
            Phase::AwaitingJobId => match parse_job_id(line) {
                Some(job_id) => {
                    self.phase = Phase::AwaitingNode {
                        job_id: job_id.clone(),
                    };
                    ParseEvent::JobSubmitted(job_id)
                }
                None => ParseEvent::Passthrough,
            },
            Phase::AwaitingNode { job_id } => {
                let job_id = job_id.clone();
                if let Some(node) = parse_node(line) {
                    if node.is_empty() {
                        ParseEvent::NodeMissing(job_id)
                    } else {
                        self.assign(job_id, node)
                    }
                } else if is_ready(line) {
                    ParseEvent::ReadyWithoutNode(job_id)
                } else {
                    ParseEvent::Passthrough
                }
            }
            Phase::AwaitingReady { job_id, node } => {
                if is_ready(line) {
                    let (job_id, node) = (job_id.clone(), node.clone());
                    self.phase = Phase::Done {
                        job_id: job_id.clone(),
                        node: node.clone(),
                    };
                    ParseEvent::Ready { job_id, node }
                } else {
                    ParseEvent::Passthrough
                }
            }
            Phase::Done { .. } => ParseEvent::Passthrough,
        };

        if event != ParseEvent::Passthrough {
            debug!(?event, phase = ?self.phase, "allocation output");
        }
        event
    }

    /// Supply a node name learned outside the stream.
    ///
    /// Only meaningful while awaiting the node; returns `None` otherwise or if
    /// `node` is empty.
    pub fn resolve_node(&mut self, node: &str) -> Option<ParseEvent> {
        let node = node.trim();
        match &self.phase {
            Phase::AwaitingNode { job_id } if !node.is_empty() => {
                let job_id = job_id.clone();
                Some(self.assign(job_id, node.to_string()))
            }
            _ => None,
        }
    }

    fn assign(&mut self, job_id: JobId, node: String) -> ParseEvent {
        self.phase = Phase::AwaitingReady {
            job_id: job_id.clone(),
            node: node.clone(),
        };
        ParseEvent::NodeAssigned { job_id, node }
    }
}

fn parse_job_id(line: &str) -> Option<JobId> {
    let caps = JOB_ID_RE.captures(line)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| JobId::new(m.as_str()))
}

fn parse_node(line: &str) -> Option<String> {
    NODE_RE
        .captures(line)
        .map(|caps| caps.get(1).map_or("", |m| m.as_str()).to_string())
}

fn is_ready(line: &str) -> bool {
    line.trim() == READY_MARKER
}
