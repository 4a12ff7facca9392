//! The public API for remote channels. Does not contain a transport
//! implementation.
//!
//! The engine talks to a managed node through a [Communicator]: an abstract
//! capability that can start a remote command, upload file content, and
//! report a connection timeout. The reference implementation (see
//! [crate::reference]) runs over SSH, but anything that ultimately yields a
//! shell session and a way to place bytes on the node can implement this
//! trait.
//!
//! # Transport errors vs command failures
//!
//! A [TransportError] means the channel could not carry out an operation at
//! all (connection lost, upload rejected). A command that runs and exits
//! non-zero is *not* a transport error; [ExecHandle::wait] reports it as an
//! ordinary exit status, and the command runner turns it into a distinct
//! error type. Callers that pattern-match on "command ran but failed" versus
//! "could not run command" rely on this separation.

use crate::output::OutputSink;
use anyhow::bail;
use crossbeam::channel::{after, Receiver};
use crossbeam::select;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A failure of the channel itself: the operation could not be carried out.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
        }
    }
}

/// A handle to a remote command started via [Communicator::start].
pub trait ExecHandle {
    /// Blocks until the remote command finishes and returns its exit status.
    ///
    /// A non-zero status is a successful wait: the command ran and failed.
    /// [Err] means the transport could not run or observe the command.
    fn wait(&mut self) -> Result<i32, TransportError>;
}

/// An abstract remote-execution and file-transfer capability.
///
/// All methods take `&self`; implementations use interior mutability for
/// their connection state. This allows the context to share the communicator
/// with a background watcher that disconnects it on cancellation (see
/// [connect_with_retry]).
pub trait Communicator: Send + Sync {
    /// Attempts to open the connection, reporting progress on `output`.
    fn connect(&self, output: &dyn OutputSink) -> Result<(), TransportError>;

    /// Closes the connection. Safe to call on an unconnected communicator.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// The overall deadline this communicator allows for establishing a
    /// connection.
    fn timeout(&self) -> Duration;

    /// Starts `command` on the remote node.
    ///
    /// The communicator writes the command's raw stdout and stderr bytes into
    /// `stdout` and `stderr` as they arrive and must drop both writers once
    /// the command completes; the command runner's drain tasks treat a closed
    /// writer as end of stream.
    fn start(
        &self,
        command: &str,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Result<Box<dyn ExecHandle + '_>, TransportError>;

    /// Places `content` at `path` on the remote node, as the session user.
    fn upload(&self, path: &str, content: &[u8]) -> Result<(), TransportError>;

    /// As [upload], but the resulting file is executable.
    ///
    /// [upload]: Communicator::upload
    fn upload_executable(&self, path: &str, content: &[u8]) -> Result<(), TransportError>;
}

/// Time to wait between connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Establishes the connection, retrying on failure until the communicator's
/// own timeout elapses.
///
/// On failure, waits [RETRY_INTERVAL] before the next attempt; a `cancel`
/// signal received during the wait aborts immediately. On success, spawns a
/// background watcher that disconnects the communicator when `cancel` fires.
/// Dropping the sender without firing stops the watcher quietly.
pub fn connect_with_retry(
    communicator: &Arc<dyn Communicator>,
    output: &dyn OutputSink,
    cancel: Receiver<()>,
) -> anyhow::Result<()> {
    connect_with_interval(communicator, output, cancel, RETRY_INTERVAL)
}

fn connect_with_interval(
    communicator: &Arc<dyn Communicator>,
    output: &dyn OutputSink,
    cancel: Receiver<()>,
    interval: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + communicator.timeout();
    loop {
        match communicator.connect(output) {
            Ok(()) => break,
            Err(error) => {
                output.line(&format!("connection attempt failed: {error}"));
                if Instant::now() + interval >= deadline {
                    bail!("timed out waiting for a connection: {error}");
                }
                select! {
                    recv(cancel) -> _ => bail!("connection canceled"),
                    recv(after(interval)) -> _ => {}
                }
            }
        }
    }

    let watched = Arc::clone(communicator);
    thread::spawn(move || {
        if cancel.recv().is_ok() {
            let _ = watched.disconnect();
        }
    });

    Ok(())
}
