//! Runs shell commands against the communicator.
//!
//! A single [exec] call starts the command, then drains its stdout and stderr
//! concurrently: the communicator writes raw bytes into two channel-backed
//! pipes, and one drain thread per stream turns those bytes into complete
//! lines and forwards them to the output sink as they arrive. Both drains are
//! joined before the call returns, so no line is lost or left unflushed.
//!
//! Lines keep their order within each stream; stdout and stderr lines may
//! interleave with each other in sink-arrival order. The concurrency stays
//! inside this module: callers see a synchronous call.

use crate::action::{Action, Checker};
use crate::context::ExecContext;
use crate::network::TransportError;
use crate::output::{NullSink, OutputSink};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::io::{self, Write};
use std::thread;
use thiserror::Error;

/// Privilege-escalation prefix applied when the context enables sudo.
const SUDO_PREFIX: &str = "sudo ";

/// A failed command execution.
///
/// [Exit] means the command ran and returned a non-zero status; [Transport]
/// means the channel could not run it at all. Callers that react differently
/// to the two cases match on the variant.
///
/// [Exit]: ExecError::Exit
/// [Transport]: ExecError::Transport
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command exited with status {status}: {command}")]
    Exit { command: String, status: i32 },

    #[error("failed to run command: {command}")]
    Transport {
        command: String,
        #[source]
        source: TransportError,
    },
}

/// Quotes a string for safe interpolation into a shell command.
///
/// # Panics
///
/// Panics if the string contains a NUL byte, which cannot be represented in a
/// shell word and indicates a bug in the calling code.
pub(crate) fn quote(s: &str) -> String {
    shlex::try_quote(s)
        .expect("shell arguments must not contain NUL bytes")
        .into_owned()
}

/// Write half of a byte-chunk pipe feeding a drain thread.
struct ChannelWriter {
    sender: Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A closed drain means the command is already being torn down;
        // discard quietly rather than failing the communicator's copy loop.
        let _ = self.sender.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads byte chunks off `receiver` and forwards each complete line to `sink`
/// as it arrives. Once the channel closes, flushes any unterminated trailing
/// bytes as a final line.
fn drain_lines(receiver: Receiver<Vec<u8>>, sink: &dyn OutputSink) {
    let mut buffer: Vec<u8> = Vec::new();
    for chunk in receiver {
        buffer.extend_from_slice(&chunk);
        while let Some(newline) = buffer.iter().position(|&byte| byte == b'\n') {
            let rest = buffer.split_off(newline + 1);
            buffer.pop();
            if buffer.last() == Some(&b'\r') {
                buffer.pop();
            }
            sink.line(&String::from_utf8_lossy(&buffer));
            buffer = rest;
        }
    }
    if !buffer.is_empty() {
        sink.line(&String::from_utf8_lossy(&buffer));
    }
}

/// Applies the context's privilege-escalation policy to a command.
pub(crate) fn full_command(ctx: &ExecContext, command: &str) -> String {
    if ctx.use_sudo() {
        format!("{SUDO_PREFIX}{command}")
    } else {
        command.to_string()
    }
}

/// Runs one command on the context's communicator, streaming complete output
/// lines to `sink`.
pub(crate) fn exec(
    ctx: &ExecContext,
    command: &str,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    let command = full_command(ctx, command);

    let (stdout_tx, stdout_rx) = unbounded::<Vec<u8>>();
    let (stderr_tx, stderr_rx) = unbounded::<Vec<u8>>();

    thread::scope(|scope| {
        let stdout_drain = scope.spawn(|| drain_lines(stdout_rx, sink));
        let stderr_drain = scope.spawn(|| drain_lines(stderr_rx, sink));

        let wait_result = (|| {
            let mut handle = ctx.communicator().start(
                &command,
                Box::new(ChannelWriter { sender: stdout_tx }),
                Box::new(ChannelWriter { sender: stderr_tx }),
            )?;
            handle.wait()
        })();

        // By now the communicator has dropped both writers (either the
        // command completed or start failed), so the drains run dry. Join
        // them before reporting the result: every line already produced must
        // reach the sink, even when the command failed.
        stdout_drain.join().expect("stdout drain panicked");
        stderr_drain.join().expect("stderr drain panicked");

        match wait_result {
            Ok(0) => Ok(()),
            Ok(status) => Err(ExecError::Exit {
                command: command.clone(),
                status,
            }),
            Err(source) => Err(ExecError::Transport {
                command: command.clone(),
                source,
            }),
        }
    })
}

/// Runs each command in order, echoing it to the exec output and streaming
/// its output to the user output. The first failure aborts the remaining
/// commands in the batch.
pub fn run(ctx: &ExecContext, commands: &[String]) -> Result<(), ExecError> {
    for command in commands {
        ctx.exec_output()
            .line(&format!("running: {}", full_command(ctx, command)));
        exec(ctx, command, ctx.user_output())?;
    }
    Ok(())
}

/// Action that runs a batch of shell commands in order.
pub struct Run {
    commands: Vec<String>,
}

impl Run {
    pub fn new<S: Into<String>>(commands: Vec<S>) -> Self {
        Run {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }
}

impl Action for Run {
    fn apply(&self, ctx: &mut ExecContext) -> anyhow::Result<()> {
        run(ctx, &self.commands)?;
        Ok(())
    }
}

/// Checker that runs a command and reports whether it exited successfully.
///
/// The command's output is intercepted and discarded rather than shown to the
/// operator. A non-zero exit is a normal negative result; a transport failure
/// is an error.
pub struct CommandSucceeds {
    command: String,
}

impl CommandSucceeds {
    pub fn new(command: impl Into<String>) -> Self {
        CommandSucceeds {
            command: command.into(),
        }
    }
}

impl Checker for CommandSucceeds {
    fn check(&self, ctx: &mut ExecContext) -> anyhow::Result<bool> {
        match exec(ctx, &self.command, &NullSink) {
            Ok(()) => Ok(true),
            Err(ExecError::Exit { .. }) => Ok(false),
            Err(error @ ExecError::Transport { .. }) => Err(error.into()),
        }
    }
}

/// Checker for the existence of a remote directory.
pub fn dir_exists(path: &str) -> CommandSucceeds {
    CommandSucceeds::new(format!("test -d {}", quote(path)))
}

/// Checker for the existence of a remote file.
pub fn file_exists(path: &str) -> CommandSucceeds {
    CommandSucceeds::new(format!("test -f {}", quote(path)))
}

/// Checker for whether a systemd unit is active.
pub fn service_active(name: &str) -> CommandSucceeds {
    CommandSucceeds::new(format!("systemctl is-active --quiet {}", quote(name)))
}
