//! Line-oriented output sinks.
//!
//! Everything the engine shows the operator flows through [OutputSink]: one
//! call per complete line of text. Sinks must tolerate concurrent callers,
//! because the command runner drains a command's stdout and stderr from two
//! threads at once and forwards lines from both into a single sink.

use std::io::Write;
use std::sync::Mutex;

/// A destination for line-oriented output.
///
/// Implementations receive each line without its trailing newline and decide
/// what to do with it: print it, record it, or discard it. A single [line]
/// call always carries one whole line, so implementations never see partial
/// lines and never need to reassemble them.
///
/// [line]: OutputSink::line
pub trait OutputSink: Send + Sync {
    /// Accepts one line of text, invoked many times.
    fn line(&self, line: &str);
}

impl<S: OutputSink> OutputSink for std::sync::Arc<S> {
    fn line(&self, line: &str) {
        self.as_ref().line(line);
    }
}

/// Writes each line, newline-terminated, to the wrapped writer.
///
/// The writer sits behind a [Mutex] so that the command runner's paired
/// stream-drain threads can share one sink without interleaving lines.
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn line(&self, line: &str) {
        let mut writer = self.writer.lock().unwrap();

        // Output is a side channel, independent of the success or failure of
        // the work producing it; a closed pipe must not fail the run.
        let _ = writeln!(writer, "{line}");
    }
}

/// Discards every line.
///
/// Used by checkers that probe remote state with a command whose chatter
/// should never reach the operator.
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _line: &str) {}
}

/// Accumulates lines in memory, in arrival order.
#[derive(Default)]
pub struct VecSink {
    lines: Mutex<Vec<String>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all lines received so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Returns whether any received line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains(needle))
    }
}

impl OutputSink for VecSink {
    fn line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}
