//! Contains a basic communicator implementation based on the [openssh] crate.

use crate::network::{Communicator, ExecHandle, TransportError};
use crate::output::OutputSink;
use crate::run::quote;
use openssh::{KnownHosts, Stdio};
use std::io::Write;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::runtime::Runtime;

/// Default overall deadline for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// A [Communicator] over an OpenSSH connection. For production use.
///
/// Commands run through a multiplexed session; uploads run out-of-band
/// through the local `scp` program that comes with OpenSSH, staged via a
/// local temporary file.
pub struct SshCommunicator {
    destination: String,
    timeout: Duration,

    /// The Tokio runtime. We need this so we can run async tasks using
    /// [block_on].
    ///
    /// [block_on]: Runtime::block_on
    runtime: Runtime,

    /// The active session, once [Communicator::connect] has succeeded.
    session: Mutex<Option<Arc<openssh::Session>>>,
}

impl SshCommunicator {
    /// Constructs a new value of this type. Does not open a connection.
    pub fn new(destination: impl Into<String>) -> Self {
        // Tokio doesn't document when `build()` fails or why. For now, simply
        // unwrap it; if errors crop up and need addressing, we'll revisit
        // this code.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        SshCommunicator {
            destination: destination.into(),
            timeout: CONNECT_TIMEOUT,
            runtime,
            session: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the active session.
    ///
    /// # Panics
    ///
    /// Panics if [Communicator::connect] has not succeeded yet, as this
    /// indicates a bug in the calling code.
    fn session(&self) -> Arc<openssh::Session> {
        match self.session.lock().unwrap().as_ref() {
            Some(session) => Arc::clone(session),
            None => panic!("You must call connect() before using the communicator"),
        }
    }

    /// Runs `command` on the remote host, discarding output, and returns its
    /// exit status.
    fn remote_status(&self, command: &str) -> Result<i32, TransportError> {
        let session = self.session();
        self.runtime.block_on(async {
            let status = session
                .command("sh")
                .arg("-c")
                .arg(command)
                .status()
                .await
                .map_err(|error| TransportError::new(error.to_string()))?;
            Ok(status.code().unwrap_or(-1))
        })
    }

    /// Stages `content` in a local temporary file and copies it to `path` on
    /// the remote host with `scp`.
    fn scp_upload(&self, path: &str, content: &[u8]) -> Result<(), TransportError> {
        // Fail early (and loudly) if nobody connected yet.
        let _ = self.session();

        let mut staging = tempfile::NamedTempFile::new()
            .map_err(|error| TransportError::new(format!("failed to stage upload: {error}")))?;
        staging
            .write_all(content)
            .and_then(|()| staging.flush())
            .map_err(|error| TransportError::new(format!("failed to stage upload: {error}")))?;

        let destination = format!("{}:{}", self.destination, path);
        let output = Command::new("scp")
            .arg(staging.path())
            .arg(&destination)
            .output()
            .map_err(|error| TransportError::new(format!("failed to run scp: {error}")))?;

        if !output.status.success() {
            return Err(TransportError::new(format!(
                "scp to {destination} failed: {}",
                String::from_utf8_lossy(&output.stderr),
            )));
        }
        Ok(())
    }
}

impl Communicator for SshCommunicator {
    fn connect(&self, output: &dyn OutputSink) -> Result<(), TransportError> {
        let mut guard = self.session.lock().unwrap();

        // The caller isn't supposed to connect an already-open communicator.
        // Since it indicates a bug in the calling code, we panic.
        if guard.is_some() {
            panic!("Tried to connect an already-connected communicator");
        }

        output.line(&format!("connecting to {}", self.destination));

        let session = self
            .runtime
            .block_on(openssh::Session::connect_mux(
                &self.destination,
                KnownHosts::Add,
            ))
            .map_err(|error| TransportError::new(error.to_string()))?;

        *guard = Some(Arc::new(session));
        output.line(&format!("connected to {}", self.destination));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        // Dropping the session closes the connection.
        let _ = self.session.lock().unwrap().take();
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn start(
        &self,
        command: &str,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Result<Box<dyn ExecHandle + '_>, TransportError> {
        Ok(Box::new(SshExecHandle {
            runtime: &self.runtime,
            session: self.session(),
            command: command.to_string(),
            sinks: Some((stdout, stderr)),
        }))
    }

    fn upload(&self, path: &str, content: &[u8]) -> Result<(), TransportError> {
        self.scp_upload(path, content)
    }

    fn upload_executable(&self, path: &str, content: &[u8]) -> Result<(), TransportError> {
        self.scp_upload(path, content)?;

        let status = self.remote_status(&format!("chmod +x {}", quote(path)))?;
        if status != 0 {
            return Err(TransportError::new(format!(
                "chmod +x {path} exited with status {status}",
            )));
        }
        Ok(())
    }
}

struct SshExecHandle<'a> {
    runtime: &'a Runtime,
    session: Arc<openssh::Session>,
    command: String,
    sinks: Option<(Box<dyn Write + Send>, Box<dyn Write + Send>)>,
}

impl ExecHandle for SshExecHandle<'_> {
    fn wait(&mut self) -> Result<i32, TransportError> {
        // The sinks are dropped at the end of this call, completed or not,
        // which closes the runner's drain channels.
        let (mut stdout_sink, mut stderr_sink) =
            self.sinks.take().expect("wait() may only be called once");

        self.runtime.block_on(async {
            let mut child = self
                .session
                .command("sh")
                .arg("-c")
                .arg(&self.command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .await
                .map_err(|error| TransportError::new(error.to_string()))?;

            let mut remote_stdout = child.stdout().take().expect("stdout was piped");
            let mut remote_stderr = child.stderr().take().expect("stderr was piped");

            // Copy both streams as bytes arrive; each copy owns its half of
            // the output, so the two make progress independently.
            let copy_stdout = async {
                let mut buffer = [0u8; 4096];
                loop {
                    match remote_stdout.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = stdout_sink.write_all(&buffer[..n]);
                        }
                    }
                }
            };
            let copy_stderr = async {
                let mut buffer = [0u8; 4096];
                loop {
                    match remote_stderr.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = stderr_sink.write_all(&buffer[..n]);
                        }
                    }
                }
            };
            tokio::join!(copy_stdout, copy_stderr);

            let status = child
                .wait()
                .await
                .map_err(|error| TransportError::new(error.to_string()))?;

            // A command killed by a signal has no exit code; report it as a
            // generic failure status.
            Ok(status.code().unwrap_or(-1))
        })
    }
}
