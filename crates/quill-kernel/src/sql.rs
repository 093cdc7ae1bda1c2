//! SQL cell execution.
//!
//! `{name}` templates are rewritten into positional `$N` placeholders and
//! the corresponding namespace values bound as query parameters. A missing
//! variable or an unset connection string fails before any database
//! contact. Each query runs on its own short-lived connection.

use std::error::Error as StdError;
use std::sync::mpsc::Sender;

use bytes::BytesMut;
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::Row;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyFloat, PyInt};
use serde_json::Value;

use quill_core::analyze::parameterize;
use quill_core::ipc::protocol::KernelMessage;
use quill_core::{CellId, MimeType, Output};

/// Run one SQL cell against the configured database.
pub fn execute_sql(
    _py: Python<'_>,
    namespace: &Bound<'_, pyo3::types::PyDict>,
    source: &str,
    connection_string: Option<&str>,
    cell: &CellId,
    tx: &Sender<KernelMessage>,
) -> Result<(), String> {
    let Some(connection_string) = connection_string else {
        return Err("database not configured".to_string());
    };

    let (query, names) = parameterize(source);

    // Resolve every template variable before touching the database.
    let mut params = Vec::with_capacity(names.len());
    for name in &names {
        let value = namespace
            .get_item(name)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Variable '{name}' not found in namespace"))?;
        params.push(SqlValue::from_py(&value)?);
    }

    let mut client = postgres::Client::connect(connection_string, postgres::NoTls)
        .map_err(|e| e.to_string())?;
    let param_refs: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
    let rows = client.query(&query, &param_refs).map_err(|e| e.to_string())?;

    if rows.is_empty() {
        let _ = tx.send(KernelMessage::Stdout {
            id: cell.clone(),
            text: "Query returned 0 rows\n".to_string(),
        });
        return Ok(());
    }

    let columns: Vec<Value> = rows[0]
        .columns()
        .iter()
        .map(|column| Value::String(column.name().to_string()))
        .collect();
    let data: Vec<Value> = rows
        .iter()
        .map(|row| {
            let values: Vec<Value> = row
                .columns()
                .iter()
                .enumerate()
                .map(|(index, column)| cell_value(row, index, column.type_()))
                .collect();
            Value::Array(values)
        })
        .collect();

    let _ = tx.send(KernelMessage::Output {
        id: cell.clone(),
        output: Output::new(
            MimeType::Json,
            serde_json::json!({ "type": "table", "columns": columns, "rows": data }),
        ),
    });
    Ok(())
}

/// A namespace value bridged into a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Bridge a Python value. Unsupported types fall back to their string
    /// form, which matches what users expect from a templated query.
    pub fn from_py(value: &Bound<'_, PyAny>) -> Result<Self, String> {
        if value.is_none() {
            return Ok(Self::Null);
        }
        // bool first: a Python bool is also an int.
        if let Ok(b) = value.downcast::<PyBool>() {
            return Ok(Self::Bool(b.is_true()));
        }
        if value.is_instance_of::<PyInt>() {
            if let Ok(i) = value.extract::<i64>() {
                return Ok(Self::Int(i));
            }
        }
        if value.is_instance_of::<PyFloat>() {
            return value.extract::<f64>().map(Self::Float).map_err(|e| e.to_string());
        }
        if let Ok(s) = value.extract::<String>() {
            return Ok(Self::Text(s));
        }
        value
            .str()
            .map(|s| Self::Text(s.to_string_lossy().into_owned()))
            .map_err(|e| e.to_string())
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(b) => b.to_sql(ty, out),
            Self::Int(i) => {
                // Match the width the statement expects.
                if *ty == Type::INT2 {
                    (*i as i16).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (*i as i32).to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*i as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Self::Float(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            Self::Text(s) => s.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Convert one result cell to JSON by column type. Types outside the
/// supported set degrade to text, then to null.
fn cell_value(row: &Row, index: usize, ty: &Type) -> Value {
    if *ty == Type::BOOL {
        return opt(row.try_get::<_, Option<bool>>(index)).map(Value::Bool).unwrap_or(Value::Null);
    }
    if *ty == Type::INT2 {
        return opt(row.try_get::<_, Option<i16>>(index))
            .map(|v| Value::Number((v as i64).into()))
            .unwrap_or(Value::Null);
    }
    if *ty == Type::INT4 {
        return opt(row.try_get::<_, Option<i32>>(index))
            .map(|v| Value::Number((v as i64).into()))
            .unwrap_or(Value::Null);
    }
    if *ty == Type::INT8 {
        return opt(row.try_get::<_, Option<i64>>(index))
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null);
    }
    if *ty == Type::FLOAT4 {
        return opt(row.try_get::<_, Option<f32>>(index))
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if *ty == Type::FLOAT8 {
        return opt(row.try_get::<_, Option<f64>>(index))
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if *ty == Type::JSON || *ty == Type::JSONB {
        return opt(row.try_get::<_, Option<Value>>(index)).unwrap_or(Value::Null);
    }
    opt(row.try_get::<_, Option<String>>(index))
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn opt<T>(result: Result<Option<T>, postgres::Error>) -> Option<T> {
    result.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a Python runtime"]
    fn test_from_py_scalar_types() {
        Python::with_gil(|py| {
            let ns = pyo3::types::PyDict::new(py);
            py.run(c"a = 42; b = 1.5; c = 'hi'; d = True; e = None", Some(&ns), Some(&ns))
                .unwrap();

            let get = |name: &str| ns.get_item(name).unwrap().unwrap();
            assert_eq!(SqlValue::from_py(&get("a")).unwrap(), SqlValue::Int(42));
            assert_eq!(SqlValue::from_py(&get("b")).unwrap(), SqlValue::Float(1.5));
            assert_eq!(SqlValue::from_py(&get("c")).unwrap(), SqlValue::Text("hi".to_string()));
            assert_eq!(SqlValue::from_py(&get("d")).unwrap(), SqlValue::Bool(true));
            assert_eq!(SqlValue::from_py(&get("e")).unwrap(), SqlValue::Null);
        });
    }

    #[test]
    #[ignore = "requires a Python runtime"]
    fn test_missing_variable_fails_before_db_contact() {
        Python::with_gil(|py| {
            let ns = pyo3::types::PyDict::new(py);
            let (tx, _rx) = std::sync::mpsc::channel();
            let result = execute_sql(
                py,
                &ns,
                "SELECT * FROM t WHERE id = {missing}",
                Some("postgres://unused"),
                &CellId::new("c1"),
                &tx,
            );
            assert_eq!(
                result.unwrap_err(),
                "Variable 'missing' not found in namespace"
            );
        });
    }

    #[test]
    #[ignore = "requires a Python runtime"]
    fn test_unconfigured_database_fails_fast() {
        Python::with_gil(|py| {
            let ns = pyo3::types::PyDict::new(py);
            let (tx, _rx) = std::sync::mpsc::channel();
            let result = execute_sql(py, &ns, "SELECT 1", None, &CellId::new("c1"), &tx);
            assert_eq!(result.unwrap_err(), "database not configured");
        });
    }
}
