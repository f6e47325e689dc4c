//! Scheduler allocation: request parameters, command construction, the
//! streaming output parser and the session that drives them.

pub mod cancel;
pub mod command;
pub mod parser;
pub mod session;

pub use cancel::CancelToken;
pub use command::SchedulerCommand;
pub use parser::{AllocationParser, ParseEvent, Phase};
pub use session::{AllocationSession, CancelReport, RemoteCancel, SessionEnd, run_interactive};

use std::fmt;

/// Scheduler job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How the remote session is run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// Long-lived allocation kept open so SSH can tunnel to the node
    #[default]
    Foreground,
    /// Shell on the compute node attached to the local terminal
    Interactive,
}

/// Resource request handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub partition: String,
    /// Wall-clock limit in scheduler syntax (`HH:MM:SS`, `D-HH:MM:SS`, minutes)
    pub time_limit: String,
    pub cpus: u32,
    /// Memory quantity, e.g. `16G`
    pub memory: String,
    /// Explicitly requested GPU count
    pub gpus: Option<u32>,
    pub mode: SessionMode,
    pub job_name: String,
}

impl AllocationRequest {
    /// GPUs to request.
    ///
    /// An explicit non-zero count always wins. Otherwise GPU-capable
    /// partitions get one GPU and everything else gets none.
    pub fn gpu_count(&self) -> Option<u32> {
        match self.gpus {
            Some(0) => None,
            Some(n) => Some(n),
            None if is_gpu_partition(&self.partition) => Some(1),
            None => None,
        }
    }
}

/// Whether a partition name looks GPU-capable.
pub fn is_gpu_partition(partition: &str) -> bool {
    partition.to_ascii_lowercase().contains("gpu")
}

/// Externally visible state of one allocation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationState {
    Requesting,
    JobSubmitted(JobId),
    NodeAssigned(JobId, String),
    Ready(JobId, String),
    Failed(String),
    /// Cancelled by the user; the job id is absent if none was issued yet
    Cancelled(Option<JobId>),
}

impl AllocationState {
    /// Job id, once the scheduler has issued one.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            AllocationState::JobSubmitted(id)
            | AllocationState::NodeAssigned(id, _)
            | AllocationState::Ready(id, _) => Some(id),
            AllocationState::Cancelled(id) => id.as_ref(),
            AllocationState::Requesting | AllocationState::Failed(_) => None,
        }
    }

    /// Assigned node name, if known.
    pub fn node(&self) -> Option<&str> {
        match self {
            AllocationState::NodeAssigned(_, node) | AllocationState::Ready(_, node) => Some(node),
            _ => None,
        }
    }

    /// True for `Ready`, `Failed` and `Cancelled`.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            AllocationState::Ready(..) | AllocationState::Failed(_) | AllocationState::Cancelled(_)
        )
    }

    /// Short machine-readable name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            AllocationState::Requesting => "requesting",
            AllocationState::JobSubmitted(_) => "job_submitted",
            AllocationState::NodeAssigned(..) => "node_assigned",
            AllocationState::Ready(..) => "ready",
            AllocationState::Failed(_) => "failed",
            AllocationState::Cancelled(_) => "cancelled",
        }
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationState::Requesting => write!(f, "requesting allocation"),
            AllocationState::JobSubmitted(id) => write!(f, "job {} submitted", id),
            AllocationState::NodeAssigned(id, node) => write!(f, "job {} assigned to {}", id, node),
            AllocationState::Ready(id, node) => write!(f, "job {} ready on {}", id, node),
            AllocationState::Failed(reason) => write!(f, "failed: {}", reason),
            AllocationState::Cancelled(Some(id)) => write!(f, "job {} cancelled", id),
            AllocationState::Cancelled(None) => write!(f, "cancelled before submission"),
        }
    }
}
