//! Shared test fixtures: a scriptable fake communicator and a ready-made
//! execution context around it.

use crate::context::ExecContext;
use crate::network::{Communicator, ExecHandle, TransportError};
use crate::output::{OutputSink, VecSink};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded operation on the fake communicator, in call order.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Connect,
    Disconnect,
    Start(String),
    Upload(String, Vec<u8>),
    UploadExecutable(String, Vec<u8>),
}

/// What a started command should do: which bytes to emit on each stream and
/// how the wait should end.
pub struct CommandScript {
    stdout_chunks: Vec<Vec<u8>>,
    stderr_chunks: Vec<Vec<u8>>,
    result: Result<i32, String>,
}

impl CommandScript {
    /// No output, exit status 0.
    pub fn ok() -> Self {
        CommandScript {
            stdout_chunks: vec![],
            stderr_chunks: vec![],
            result: Ok(0),
        }
    }

    /// No output, the given exit status.
    pub fn exit(status: i32) -> Self {
        CommandScript {
            result: Ok(status),
            ..Self::ok()
        }
    }

    /// The wait fails at the transport level.
    pub fn transport_error(message: &str) -> Self {
        CommandScript {
            result: Err(message.to_string()),
            ..Self::ok()
        }
    }

    pub fn with_stdout(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdout_chunks.push(bytes.into());
        self
    }

    pub fn with_stderr(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stderr_chunks.push(bytes.into());
        self
    }

    /// Emits stdout in exactly these chunks, one write call each, to
    /// exercise line reassembly across chunk boundaries.
    pub fn with_stdout_chunks(mut self, chunks: Vec<Vec<u8>>) -> Self {
        self.stdout_chunks = chunks;
        self
    }
}

type Responder = Box<dyn Fn(&str) -> CommandScript + Send + Sync>;

/// A fake [Communicator] that records every operation and answers started
/// commands from a caller-supplied responder.
pub struct FakeCommunicator {
    timeout: Duration,
    remaining_refusals: Mutex<u32>,
    ops: Mutex<Vec<Op>>,
    responder: Responder,
}

impl FakeCommunicator {
    /// Connects on the first try; every command succeeds with no output.
    pub fn new() -> Self {
        Self::with_responder(|_| CommandScript::ok())
    }

    pub fn with_responder(
        responder: impl Fn(&str) -> CommandScript + Send + Sync + 'static,
    ) -> Self {
        FakeCommunicator {
            timeout: Duration::from_secs(1),
            remaining_refusals: Mutex::new(0),
            ops: Mutex::new(vec![]),
            responder: Box::new(responder),
        }
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refusing_connections(self, count: u32) -> Self {
        *self.remaining_refusals.lock().unwrap() = count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A copy of all recorded operations, in call order.
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    /// The commands started so far, in call order.
    pub fn commands(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Start(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

impl Communicator for FakeCommunicator {
    fn connect(&self, _output: &dyn OutputSink) -> Result<(), TransportError> {
        self.record(Op::Connect);

        let mut remaining = self.remaining_refusals.lock().unwrap();
        if *remaining > 0 {
            *remaining = remaining.saturating_sub(1);
            return Err(TransportError::new("connection refused"));
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.record(Op::Disconnect);
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn start(
        &self,
        command: &str,
        mut stdout: Box<dyn Write + Send>,
        mut stderr: Box<dyn Write + Send>,
    ) -> Result<Box<dyn ExecHandle + '_>, TransportError> {
        self.record(Op::Start(command.to_string()));

        let script = (self.responder)(command);
        for chunk in &script.stdout_chunks {
            let _ = stdout.write_all(chunk);
        }
        for chunk in &script.stderr_chunks {
            let _ = stderr.write_all(chunk);
        }

        // Dropping the writers here closes the runner's byte channels, as the
        // Communicator contract requires once the command completes.
        Ok(Box::new(FakeHandle {
            result: script.result,
        }))
    }

    fn upload(&self, path: &str, content: &[u8]) -> Result<(), TransportError> {
        self.record(Op::Upload(path.to_string(), content.to_vec()));
        Ok(())
    }

    fn upload_executable(&self, path: &str, content: &[u8]) -> Result<(), TransportError> {
        self.record(Op::UploadExecutable(path.to_string(), content.to_vec()));
        Ok(())
    }
}

struct FakeHandle {
    result: Result<i32, String>,
}

impl ExecHandle for FakeHandle {
    fn wait(&mut self) -> Result<i32, TransportError> {
        self.result.clone().map_err(TransportError::new)
    }
}

/// A fake communicator, both output sinks, and a context wired to them.
pub struct Harness {
    pub communicator: Arc<FakeCommunicator>,
    pub user_output: Arc<VecSink>,
    pub exec_output: Arc<VecSink>,
    pub context: ExecContext,
}

/// A harness with default settings: no sudo, cache enabled.
pub fn harness() -> Harness {
    harness_from(FakeCommunicator::new(), false)
}

pub fn harness_from(communicator: FakeCommunicator, use_sudo: bool) -> Harness {
    let communicator = Arc::new(communicator);
    let user_output = Arc::new(VecSink::new());
    let exec_output = Arc::new(VecSink::new());

    let context = ExecContext::builder()
        .communicator(communicator.clone())
        .user_output(user_output.clone())
        .exec_output(exec_output.clone())
        .use_sudo(use_sudo)
        .cache_enabled(true)
        .build();

    Harness {
        communicator,
        user_output,
        exec_output,
        context,
    }
}
