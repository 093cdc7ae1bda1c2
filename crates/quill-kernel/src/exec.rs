//! Python cell execution.
//!
//! Semantics: the source is split on its last statement. If that statement
//! is an expression, everything before it runs via `exec` and the trailing
//! expression via `eval`, with its value (when not `None`) converted by the
//! MIME dispatcher. Compilation uses a `Cell[<position>]` filename so
//! tracebacks name cells by their visible index. Before user code runs, a
//! prelude swaps `sys.stdout` for the line-buffered capture and re-patches
//! the visualization `.show()` entry points, so libraries imported a moment
//! earlier are covered too.

use std::ffi::CString;
use std::sync::mpsc::Sender;

use pyo3::exceptions::PySyntaxError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use quill_core::ipc::protocol::KernelMessage;
use quill_core::CellId;

use crate::capture::{OutputSink, StdoutCapture};
use crate::display;

/// Installed at the start of every execution; see `prelude.py`.
const PRELUDE: &str = include_str!("prelude.py");

/// Restores the real stdout after a cell finishes (or fails).
const EPILOGUE: &str = r#"
import sys as __quill_sys__
if "__quill_saved_stdout__" in globals():
    __quill_sys__.stdout = __quill_saved_stdout__
"#;

/// Run one Python cell against the shared namespace.
///
/// Returns `Err` with human-readable error text when the cell fails; the
/// namespace keeps whatever the cell managed to do before failing.
pub fn execute_python(
    py: Python<'_>,
    namespace: &Bound<'_, PyDict>,
    source: &str,
    position: usize,
    cell: &CellId,
    tx: &Sender<KernelMessage>,
) -> Result<(), String> {
    let stdout = Bound::new(py, StdoutCapture::new(cell.clone(), tx.clone()))
        .map_err(|e| format_traceback(py, &e))?;
    let sink = Bound::new(py, OutputSink::new(cell.clone(), tx.clone()))
        .map_err(|e| format_traceback(py, &e))?;
    namespace
        .set_item("__quill_stdout__", &stdout)
        .and_then(|()| namespace.set_item("__quill_sink__", &sink))
        .map_err(|e| format_traceback(py, &e))?;

    run_snippet(py, namespace, PRELUDE).map_err(|e| format_traceback(py, &e))?;

    let outcome = run_cell(py, namespace, source, position, &sink);

    // Restore stdout and flush a trailing partial line in every path.
    if let Err(e) = run_snippet(py, namespace, EPILOGUE) {
        tracing::warn!(error = %e, "failed to restore stdout");
    }
    stdout.borrow().flush_remaining();

    outcome
}

fn run_cell(
    py: Python<'_>,
    namespace: &Bound<'_, PyDict>,
    source: &str,
    position: usize,
    sink: &Bound<'_, OutputSink>,
) -> Result<(), String> {
    let filename = format!("Cell[{position}]");
    let internal = |e: PyErr| format_traceback(py, &e);

    let ast = py.import("ast").map_err(internal)?;
    let module = ast
        .call_method1("parse", (source, filename.as_str()))
        .map_err(|e| format_error(py, &e))?;
    let body = module.getattr("body").map_err(internal)?;
    let body_len = body.len().map_err(internal)?;
    if body_len == 0 {
        return Ok(());
    }

    let builtins = py.import("builtins").map_err(internal)?;
    let compile = builtins.getattr("compile").map_err(internal)?;
    let exec = builtins.getattr("exec").map_err(internal)?;
    let eval = builtins.getattr("eval").map_err(internal)?;

    // Split off a trailing expression, if there is one.
    let last = body.get_item(body_len - 1).map_err(internal)?;
    let expr_stmt_cls = ast.getattr("Expr").map_err(internal)?;
    let eval_code = if last.is_instance(&expr_stmt_cls).map_err(internal)? {
        body.del_item(body_len - 1).map_err(internal)?;
        let expression = ast
            .call_method1("Expression", (last.getattr("value").map_err(internal)?,))
            .map_err(internal)?;
        Some(
            compile
                .call1((expression, filename.as_str(), "eval"))
                .map_err(|e| format_error(py, &e))?,
        )
    } else {
        None
    };

    let exec_code = compile
        .call1((&module, filename.as_str(), "exec"))
        .map_err(|e| format_error(py, &e))?;
    exec.call1((exec_code, namespace))
        .map_err(|e| format_error(py, &e))?;

    if let Some(code) = eval_code {
        let value = eval
            .call1((code, namespace))
            .map_err(|e| format_error(py, &e))?;
        match display::dispatch(py, &value) {
            Ok(Some(output)) => sink.borrow().emit_output(output),
            Ok(None) => {}
            Err(e) => return Err(format_error(py, &e)),
        }
    }
    Ok(())
}

fn run_snippet(py: Python<'_>, namespace: &Bound<'_, PyDict>, code: &str) -> PyResult<()> {
    let code = CString::new(code)
        .map_err(|e| PyErr::new::<pyo3::exceptions::PyValueError, _>(e.to_string()))?;
    py.run(code.as_c_str(), Some(namespace), Some(namespace))
}

/// Format a cell failure for the user: syntax errors get the
/// `SyntaxError on line N` shape with a caret, everything else a full
/// traceback whose frames carry the cell filename.
pub fn format_error(py: Python<'_>, err: &PyErr) -> String {
    if err.is_instance_of::<PySyntaxError>(py) {
        format_syntax_error(py, err)
    } else {
        format_traceback(py, err)
    }
}

fn format_syntax_error(py: Python<'_>, err: &PyErr) -> String {
    let value = err.value(py);
    let msg = attr_or::<String>(value, "msg").unwrap_or_else(|| err.to_string());
    let lineno = attr_or::<usize>(value, "lineno");
    let offset = attr_or::<usize>(value, "offset");
    let text = attr_or::<String>(value, "text");

    let mut out = match lineno {
        Some(line) => format!("SyntaxError on line {line}: {msg}"),
        None => format!("SyntaxError: {msg}"),
    };
    if let Some(text) = text {
        let line = text.trim_end_matches('\n');
        out.push_str("\n    ");
        out.push_str(line);
        if let Some(offset) = offset.filter(|o| *o > 0) {
            out.push('\n');
            out.push_str(&" ".repeat(4 + offset - 1));
            out.push('^');
        }
    }
    out
}

fn format_traceback(py: Python<'_>, err: &PyErr) -> String {
    let formatted = py
        .import("traceback")
        .and_then(|tb| tb.call_method1("format_exception", (err.value(py),)))
        .and_then(|lines| lines.extract::<Vec<String>>());
    match formatted {
        Ok(lines) => lines.concat(),
        Err(_) => err.to_string(),
    }
}

fn attr_or<'py, T: FromPyObject<'py>>(value: &Bound<'py, PyAny>, name: &str) -> Option<T> {
    value.getattr(name).ok()?.extract::<Option<T>>().ok()?
}
