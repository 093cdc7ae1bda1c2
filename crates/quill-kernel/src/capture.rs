//! Output capture objects injected into the namespace per execution.

use std::sync::mpsc::Sender;
use std::sync::Mutex;

use pyo3::prelude::*;

use quill_core::ipc::protocol::KernelMessage;
use quill_core::{CellId, MimeType, Output};

use crate::display::py_to_json;

/// Replacement for `sys.stdout` during a cell execution.
///
/// Line-buffered: each complete line streams out as its own `Stdout`
/// message; whatever is left in the buffer at end of cell is flushed by
/// [`StdoutCapture::flush_remaining`].
#[pyclass]
pub struct StdoutCapture {
    cell: CellId,
    tx: Sender<KernelMessage>,
    buffer: Mutex<String>,
}

impl StdoutCapture {
    pub fn new(cell: CellId, tx: Sender<KernelMessage>) -> Self {
        Self { cell, tx, buffer: Mutex::new(String::new()) }
    }

    fn send_text(&self, text: String) {
        let _ = self.tx.send(KernelMessage::Stdout { id: self.cell.clone(), text });
    }

    /// Flush a trailing partial line at end of cell.
    pub fn flush_remaining(&self) {
        let Ok(mut buffer) = self.buffer.lock() else {
            return;
        };
        if !buffer.is_empty() {
            let text = std::mem::take(&mut *buffer);
            self.send_text(text);
        }
    }
}

#[pymethods]
impl StdoutCapture {
    fn write(&self, text: &str) -> usize {
        let Ok(mut buffer) = self.buffer.lock() else {
            return text.len();
        };
        buffer.push_str(text);
        while let Some(end) = buffer.find('\n') {
            let line: String = buffer.drain(..=end).collect();
            self.send_text(line);
        }
        text.len()
    }

    fn flush(&self) {}

    fn isatty(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        true
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }
}

/// The object the visualization hooks call to append an output.
#[pyclass]
pub struct OutputSink {
    cell: CellId,
    tx: Sender<KernelMessage>,
}

impl OutputSink {
    pub fn new(cell: CellId, tx: Sender<KernelMessage>) -> Self {
        Self { cell, tx }
    }

    /// Rust-side emission, used for the trailing-expression value.
    pub fn emit_output(&self, output: Output) {
        let _ = self.tx.send(KernelMessage::Output { id: self.cell.clone(), output });
    }
}

#[pymethods]
impl OutputSink {
    #[pyo3(signature = (mime, data, metadata=None))]
    fn emit(
        &self,
        py: Python<'_>,
        mime: &str,
        data: Bound<'_, PyAny>,
        metadata: Option<Bound<'_, PyAny>>,
    ) {
        let mime = MimeType::parse(mime).unwrap_or(MimeType::TextPlain);
        let data = py_to_json(py, &data);
        let metadata = metadata.map(|m| py_to_json(py, &m));
        self.emit_output(Output { mime, data, metadata });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn capture() -> (StdoutCapture, mpsc::Receiver<KernelMessage>) {
        let (tx, rx) = mpsc::channel();
        (StdoutCapture::new(CellId::new("c1"), tx), rx)
    }

    fn lines(rx: &mpsc::Receiver<KernelMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let KernelMessage::Stdout { text, .. } = message {
                out.push(text);
            }
        }
        out
    }

    #[test]
    fn test_complete_lines_stream_immediately() {
        let (capture, rx) = capture();
        capture.write("a\nb\n");
        assert_eq!(lines(&rx), vec!["a\n", "b\n"]);
    }

    #[test]
    fn test_partial_line_buffers_until_newline() {
        let (capture, rx) = capture();
        capture.write("hel");
        assert!(lines(&rx).is_empty());
        capture.write("lo\nrest");
        assert_eq!(lines(&rx), vec!["hello\n"]);
        capture.flush_remaining();
        assert_eq!(lines(&rx), vec!["rest"]);
    }

    #[test]
    fn test_flush_remaining_is_idempotent() {
        let (capture, rx) = capture();
        capture.write("x\n");
        capture.flush_remaining();
        capture.flush_remaining();
        assert_eq!(lines(&rx), vec!["x\n"]);
    }
}
