//! The MIME dispatcher: map a Python value to a tagged output.
//!
//! Checks run in a fixed order (matplotlib figure, plotly figure, altair
//! chart, pandas DataFrame) before falling back to `str(value)`. Library
//! classes are looked up through `sys.modules` only, so dispatching never
//! imports anything as a side effect.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use serde_json::Value;

use quill_core::{MimeType, Output};

/// Convert a trailing-expression value into an output. `None` produces
/// nothing.
pub fn dispatch(py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<Option<Output>> {
    if value.is_none() {
        return Ok(None);
    }

    if let Some(figure_cls) = loaded_attr(py, "matplotlib.figure", "Figure") {
        if value.is_instance(&figure_cls)? {
            return figure_png(py, value).map(Some);
        }
    }

    if let Some(base_figure) = loaded_attr(py, "plotly.basedatatypes", "BaseFigure") {
        if value.is_instance(&base_figure)? {
            let text: String = value.call_method0("to_json")?.extract()?;
            return Ok(Some(Output::new(MimeType::PlotlyJson, parse_or_wrap(text))));
        }
    }

    if let Some(chart_mixin) = loaded_attr(py, "altair", "TopLevelMixin") {
        if value.is_instance(&chart_mixin)? {
            let text: String = value.call_method0("to_json")?.extract()?;
            return Ok(Some(Output::new(MimeType::VegaLite, parse_or_wrap(text))));
        }
    }

    if let Some(dataframe_cls) = loaded_attr(py, "pandas", "DataFrame") {
        if value.is_instance(&dataframe_cls)? {
            return table_output(py, value).map(Some);
        }
    }

    let text = value.str()?.to_string_lossy().into_owned();
    Ok(Some(Output::text(text)))
}

/// Render every open matplotlib figure path: one figure to base64 PNG.
fn figure_png(py: Python<'_>, figure: &Bound<'_, PyAny>) -> PyResult<Output> {
    let io = py.import("io")?;
    let buffer = io.call_method0("BytesIO")?;

    let kwargs = PyDict::new(py);
    kwargs.set_item("format", "png")?;
    kwargs.set_item("bbox_inches", "tight")?;
    figure.call_method("savefig", (&buffer,), Some(&kwargs))?;

    let bytes: Vec<u8> = buffer.call_method0("getvalue")?.extract()?;
    Ok(Output::new(MimeType::ImagePng, Value::String(BASE64.encode(bytes))))
}

/// Convert a DataFrame into `{type: "table", columns, rows}`.
fn table_output(py: Python<'_>, dataframe: &Bound<'_, PyAny>) -> PyResult<Output> {
    let kwargs = PyDict::new(py);
    kwargs.set_item("orient", "split")?;
    let text: String = dataframe.call_method("to_json", (), Some(&kwargs))?.extract()?;

    let split: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    let columns = split.get("columns").cloned().unwrap_or(Value::Array(Vec::new()));
    let rows = split.get("data").cloned().unwrap_or(Value::Array(Vec::new()));
    Ok(Output::new(
        MimeType::Json,
        serde_json::json!({ "type": "table", "columns": columns, "rows": rows }),
    ))
}

/// Look up `module.attr` via `sys.modules`, without importing.
pub fn loaded_attr<'py>(py: Python<'py>, module: &str, attr: &str) -> Option<Bound<'py, PyAny>> {
    let modules = py.import("sys").ok()?.getattr("modules").ok()?;
    modules.get_item(module).ok()?.getattr(attr).ok()
}

/// Best-effort Python → JSON conversion via the `json` module; values that
/// refuse to serialize fall back to their `str()` form.
pub fn py_to_json(py: Python<'_>, value: &Bound<'_, PyAny>) -> Value {
    let dumped = py
        .import("json")
        .and_then(|json| json.call_method1("dumps", (value,)))
        .and_then(|text| text.extract::<String>());
    match dumped {
        Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        Err(_) => Value::String(
            value
                .str()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
    }
}

fn parse_or_wrap(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}
