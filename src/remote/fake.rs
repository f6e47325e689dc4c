//! Scripted [`RemoteExec`] for unit tests.
//!
//! `ScriptedExec` replays a fixed list of output lines from `spawn` and answers
//! `exec_sync` calls from a responder closure. Every call is appended to a
//! shared log so tests can assert on ordering.

use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{ProcessExit, ProcessHandle, RemoteExec, RemoteOutput, RemoteProcess, SpawnMode};

type Responder = Box<dyn Fn(&str) -> io::Result<RemoteOutput> + Send + Sync>;

/// What the spawned fake process does once its output is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterOutput {
    /// Exit with this code, closing the stream
    Exit(i32),
    /// Keep running until terminated or killed
    KeepRunning,
    /// Keep running and ignore SIGTERM
    IgnoreTerm,
}

#[derive(Debug, Default)]
struct ProcState {
    exit: Option<ProcessExit>,
}

pub struct ScriptedExec {
    lines: Vec<String>,
    after: AfterOutput,
    spawn_error: bool,
    responder: Responder,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExec {
    pub fn new(lines: &[&str], after: AfterOutput) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            after,
            spawn_error: false,
            responder: Box::new(|_| Ok(output("", 0))),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make `spawn` fail as if ssh could not be started.
    pub fn failing_spawn() -> Self {
        let mut exec = Self::new(&[], AfterOutput::Exit(0));
        exec.spawn_error = true;
        exec
    }

    /// Answer `exec_sync` calls with `responder`.
    pub fn respond(mut self, responder: impl Fn(&str) -> io::Result<RemoteOutput> + Send + Sync + 'static) -> Self {
        self.responder = Box::new(responder);
        self
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Recorded `exec_sync` commands starting with `program`.
    pub fn sync_calls(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("sync:").map(str::to_string))
            .filter(|c| c.starts_with(program))
            .collect()
    }
}

/// Build a `RemoteOutput` with the given stdout and exit code.
pub fn output(stdout: &str, code: i32) -> RemoteOutput {
    RemoteOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit: ProcessExit { code: Some(code) },
    }
}

impl RemoteExec for ScriptedExec {
    fn spawn(&self, target: &str, command: &str, mode: SpawnMode) -> io::Result<RemoteProcess> {
        self.log
            .lock()
            .unwrap()
            .push(format!("spawn:{}:{:?}:{}", target, mode, command));
        if self.spawn_error {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ssh: not found"));
        }

        let state = Arc::new(Mutex::new(ProcState::default()));
        if let AfterOutput::Exit(code) = self.after {
            state.lock().unwrap().exit = Some(ProcessExit { code: Some(code) });
        }

        let mut data = self.lines.join("\n");
        if !data.is_empty() {
            data.push('\n');
        }
        let stream = FakeStream {
            data: Cursor::new(data.into_bytes()),
            state: Arc::clone(&state),
        };
        let streams: Vec<Box<dyn Read + Send>> = match mode {
            SpawnMode::Piped => vec![Box::new(stream)],
            SpawnMode::Terminal => Vec::new(),
        };

        Ok(RemoteProcess {
            handle: Box::new(FakeHandle {
                state,
                ignore_term: self.after == AfterOutput::IgnoreTerm,
                log: Arc::clone(&self.log),
            }),
            streams,
        })
    }

    fn exec_sync(&self, _target: &str, command: &str, _timeout: Duration) -> io::Result<RemoteOutput> {
        self.log.lock().unwrap().push(format!("sync:{}", command));
        (self.responder)(command)
    }
}

/// Yields the scripted bytes, then blocks until the process has exited.
struct FakeStream {
    data: Cursor<Vec<u8>>,
    state: Arc<Mutex<ProcState>>,
}

impl Read for FakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        loop {
            if self.state.lock().unwrap().exit.is_some() {
                return Ok(0);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

struct FakeHandle {
    state: Arc<Mutex<ProcState>>,
    ignore_term: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ProcessExit>> {
        if let Some(exit) = self.state.lock().unwrap().exit {
            return Ok(Some(exit));
        }
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Ok(self.state.lock().unwrap().exit)
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        loop {
            if let Some(exit) = self.wait_timeout(Duration::from_millis(2))? {
                return Ok(exit);
            }
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.log.lock().unwrap().push("terminate".to_string());
        if !self.ignore_term {
            let mut state = self.state.lock().unwrap();
            state.exit.get_or_insert(ProcessExit { code: None });
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.log.lock().unwrap().push("kill".to_string());
        self.state
            .lock()
            .unwrap()
            .exit
            .get_or_insert(ProcessExit { code: None });
        Ok(())
    }
}
