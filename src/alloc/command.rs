//! Scheduler command generation.
//!
//! This module provides a builder for the shell command lines sent to the
//! cluster head node. It does not execute anything; the strings are handed to
//! a [`crate::remote::RemoteExec`], which passes them to the remote shell.

use std::borrow::Cow;

use super::{AllocationRequest, JobId};

/// Marker printed by the probe before the job id.
pub const JOB_ID_MARKER: &str = "JOB_ID:";

/// Marker printed by the probe before the node name.
pub const NODE_MARKER: &str = "COMPUTE_NODE:";

/// Marker printed by the probe once the allocation is usable.
pub const READY_MARKER: &str = "ALLOCATION_READY";

/// Script run inside the allocation to report its identity.
///
/// `sleep infinity` keeps the allocation alive until the wall-clock limit or
/// until the session is cancelled.
const PROBE_SCRIPT: &str = concat!(
    "echo \"JOB_ID:$SLURM_JOB_ID\"; ",
    "echo \"COMPUTE_NODE:$(scontrol show hostnames \"$SLURM_JOB_NODELIST\" 2>/dev/null | head -n 1)\"; ",
    "echo ALLOCATION_READY; ",
    "exec sleep infinity"
);

/// Builder for scheduler command strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerCommand {
    args: Vec<String>,
}

impl SchedulerCommand {
    /// Create a new builder for `program`.
    fn new(program: &str) -> Self {
        Self {
            args: vec![program.to_string()],
        }
    }

    /// Add a flag to the command.
    fn flag(mut self, flag: &str) -> Self {
        self.args.push(flag.to_string());
        self
    }

    /// Add a short flag with a separate value.
    fn flag_with_value(mut self, flag: &str, value: &str) -> Self {
        self.args.push(flag.to_string());
        self.args.push(shell_quote(value).into_owned());
        self
    }

    /// Add a `--name=value` option.
    fn option(mut self, name: &str, value: &str) -> Self {
        self.args.push(format!("--{}={}", name, shell_quote(value)));
        self
    }

    /// Add a positional argument.
    fn arg(mut self, arg: &str) -> Self {
        self.args.push(shell_quote(arg).into_owned());
        self
    }

    /// Build the final command string.
    pub fn build(self) -> String {
        self.args.join(" ")
    }

    /// Program name (first word).
    pub fn program(&self) -> &str {
        &self.args[0]
    }

    /// Resource flags shared by `salloc` and `srun`.
    fn resources(self, request: &AllocationRequest) -> Self {
        let mut cmd = self
            .option("partition", &request.partition)
            .option("time", &request.time_limit)
            .option("cpus-per-task", &request.cpus.to_string())
            .option("mem", &request.memory);
        if let Some(gpus) = request.gpu_count() {
            cmd = cmd.option("gres", &format!("gpu:{}", gpus));
        }
        cmd.option("job-name", &request.job_name)
    }

    /// Long-lived allocation that prints the probe markers.
    ///
    /// # Example
    /// ```
    /// use nodelink::alloc::{AllocationRequest, SchedulerCommand, SessionMode};
    /// let request = AllocationRequest {
    ///     partition: "cpu".into(),
    ///     time_limit: "01:00:00".into(),
    ///     cpus: 2,
    ///     memory: "8G".into(),
    ///     gpus: None,
    ///     mode: SessionMode::Foreground,
    ///     job_name: "nodelink".into(),
    /// };
    /// let cmd = SchedulerCommand::foreground(&request).build();
    /// assert!(cmd.starts_with("salloc --partition=cpu --time=01:00:00 --cpus-per-task=2 --mem=8G --job-name=nodelink bash -c "));
    /// ```
    pub fn foreground(request: &AllocationRequest) -> Self {
        Self::new("salloc")
            .resources(request)
            .arg("bash")
            .flag("-c")
            .arg(PROBE_SCRIPT)
    }

    /// Login shell on the compute node with a pseudo-terminal.
    pub fn interactive(request: &AllocationRequest) -> Self {
        Self::new("srun")
            .resources(request)
            .flag("--pty")
            .arg("bash")
            .flag("-l")
    }

    /// Query the node list of a job without a header.
    ///
    /// # Example
    /// ```
    /// use nodelink::alloc::{JobId, SchedulerCommand};
    /// let cmd = SchedulerCommand::node_query(&JobId::from("123"));
    /// assert_eq!(cmd.build(), "squeue -h -j 123 -o %N");
    /// ```
    pub fn node_query(job_id: &JobId) -> Self {
        Self::new("squeue")
            .flag("-h")
            .flag_with_value("-j", job_id.as_str())
            .flag_with_value("-o", "%N")
    }

    /// Cancel a job.
    pub fn cancel(job_id: &JobId) -> Self {
        Self::new("scancel").arg(job_id.as_str())
    }
}

/// Quote `value` for a POSIX shell if it contains anything but safe characters.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-+=:,./@%".contains(c));
    if safe {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', "'\\''")))
    }
}

/// First host of a scheduler node list.
///
/// Handles plain names (`node07`), comma lists (`node07,node08`) and
/// compressed ranges (`node[07-08,11]`). Returns `None` for empty output.
pub fn first_host(node_list: &str) -> Option<String> {
    let list = node_list
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && *l != "(null)")?;

    let mut depth = 0usize;
    let mut end = list.len();
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    let first = &list[..end];

    match first.find('[') {
        None => Some(first.to_string()),
        Some(open) => {
            let prefix = &first[..open];
            let inner = first[open + 1..].trim_end_matches(']');
            let start = inner.split(',').next()?.split('-').next()?;
            if start.is_empty() {
                None
            } else {
                Some(format!("{}{}", prefix, start))
            }
        }
    }
}
