//! Test support: a scripted in-process kernel.
//!
//! `MockKernel` implements the coordinator's transport seam and simulates
//! just enough cell semantics for scheduler tests: integer assignments,
//! addition, division, and `print`. Every request is recorded so tests can
//! assert on the protocol traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use quill_core::ipc::{KernelLink, KernelMessage, KernelRequest};
use quill_core::{CellId, CellKind, ExecStatus};

pub type RequestLog = Arc<Mutex<Vec<KernelRequest>>>;

pub struct MockKernel {
    requests: RequestLog,
    cells: HashMap<CellId, (String, CellKind)>,
    namespace: HashMap<String, i64>,
    queue: VecDeque<KernelMessage>,
    db_error: Option<String>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            cells: HashMap::new(),
            namespace: HashMap::new(),
            queue: VecDeque::new(),
            db_error: None,
        }
    }

    /// Make every `SetDatabaseConfig` fail with `message`.
    pub fn with_db_error(mut self, message: &str) -> Self {
        self.db_error = Some(message.to_string());
        self
    }

    pub fn request_log(&self) -> RequestLog {
        Arc::clone(&self.requests)
    }

    fn execute(&mut self, id: &CellId) {
        self.queue.push_back(KernelMessage::Status { id: id.clone(), running: true });

        let Some((source, _kind)) = self.cells.get(id).cloned() else {
            self.queue.push_back(KernelMessage::Result {
                id: id.clone(),
                status: ExecStatus::Error,
                error: Some("cell is not registered".to_string()),
            });
            return;
        };

        let mut error = None;
        for line in source.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if let Err(e) = self.step(id, line) {
                error = Some(e);
                break;
            }
        }

        let (status, error) = match error {
            None => (ExecStatus::Success, None),
            Some(e) => (ExecStatus::Error, Some(e)),
        };
        self.queue.push_back(KernelMessage::Result { id: id.clone(), status, error });
    }

    fn step(&mut self, id: &CellId, line: &str) -> Result<(), String> {
        if let Some(name) = line.strip_prefix("print(").and_then(|rest| rest.strip_suffix(')')) {
            let value = self.lookup(name.trim())?;
            self.queue.push_back(KernelMessage::Stdout {
                id: id.clone(),
                text: format!("{value}\n"),
            });
            return Ok(());
        }

        let (target, expr) = line
            .split_once('=')
            .ok_or_else(|| format!("SyntaxError on line 1: invalid syntax: {line}"))?;
        let value = self.eval(expr.trim())?;
        self.namespace.insert(target.trim().to_string(), value);
        Ok(())
    }

    fn eval(&self, expr: &str) -> Result<i64, String> {
        if let Some((a, b)) = expr.split_once('/') {
            let (a, b) = (self.atom(a.trim())?, self.atom(b.trim())?);
            if b == 0 {
                return Err(
                    "Traceback (most recent call last):\n  Cell[0], line 1\nZeroDivisionError: division by zero"
                        .to_string(),
                );
            }
            return Ok(a / b);
        }
        if let Some((a, b)) = expr.split_once('+') {
            return Ok(self.atom(a.trim())? + self.atom(b.trim())?);
        }
        self.atom(expr)
    }

    fn atom(&self, token: &str) -> Result<i64, String> {
        token.parse::<i64>().or_else(|_| self.lookup(token))
    }

    fn lookup(&self, name: &str) -> Result<i64, String> {
        self.namespace
            .get(name)
            .copied()
            .ok_or_else(|| format!("NameError: name '{name}' is not defined"))
    }
}

impl KernelLink for MockKernel {
    async fn send(&mut self, request: KernelRequest) -> quill_core::Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        match request {
            KernelRequest::RegisterCell { id, source, kind, .. } => {
                self.cells.insert(id, (source, kind));
            }
            KernelRequest::RemoveCell { id, purge } => {
                self.cells.remove(&id);
                for symbol in purge {
                    self.namespace.remove(&symbol);
                }
            }
            KernelRequest::Execute { id } => self.execute(&id),
            KernelRequest::SetDatabaseConfig { .. } => {
                let message = match &self.db_error {
                    Some(error) => KernelMessage::ConfigResult {
                        status: ExecStatus::Error,
                        error: Some(error.clone()),
                    },
                    None => KernelMessage::ConfigResult { status: ExecStatus::Success, error: None },
                };
                self.queue.push_back(message);
            }
            KernelRequest::Shutdown => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<KernelMessage> {
        self.queue.pop_front()
    }
}
