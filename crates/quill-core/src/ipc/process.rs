//! Kernel process management.
//!
//! [`KernelProcess`] spawns the `quill-kernel` binary and exposes the two
//! ordered channels the protocol requires: requests go down the child's
//! stdin, and a background reader task drains response frames from its
//! stdout into an in-process queue so the coordinator's event loop never
//! blocks on kernel I/O. Killing the process can never corrupt the
//! coordinator; a dead kernel surfaces as a closed queue.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::protocol::{read_frame, write_frame, KernelMessage, KernelRequest};

/// The transport seam between the coordinator and a kernel.
///
/// Production uses [`KernelProcess`]; tests drive the coordinator with a
/// scripted implementation. Both preserve per-channel message ordering.
pub trait KernelLink: Send {
    /// Send one request down the ordered request channel.
    fn send(&mut self, request: KernelRequest) -> impl Future<Output = Result<()>> + Send;

    /// Receive the next kernel message. `None` means the kernel is gone,
    /// which the coordinator treats as fatal for the session.
    fn recv(&mut self) -> impl Future<Output = Option<KernelMessage>> + Send;
}

/// Handle to a spawned kernel process.
pub struct KernelProcess {
    child: Child,
    stdin: ChildStdin,
    messages: mpsc::UnboundedReceiver<KernelMessage>,
}

impl KernelProcess {
    /// Spawn a new kernel process.
    ///
    /// Looks for the `quill-kernel` binary in the following order:
    /// 1. `QUILL_KERNEL_PATH` environment variable
    /// 2. Same directory as the current executable
    /// 3. System PATH
    /// 4. The development `target/{debug,release}` tree
    pub fn spawn() -> Result<Self> {
        let kernel_path = Self::find_kernel_binary()?;

        let mut child = Command::new(&kernel_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // kernel logs go to our stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "failed to spawn kernel process '{}': {e}",
                    kernel_path.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("failed to get kernel stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("failed to get kernel stdout".to_string()))?;

        let (tx, messages) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_frame::<_, KernelMessage>(&mut reader).await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "kernel output channel closed");
                        break;
                    }
                }
            }
        });

        Ok(Self { child, stdin, messages })
    }

    fn find_kernel_binary() -> Result<PathBuf> {
        let binary_name = if cfg!(windows) { "quill-kernel.exe" } else { "quill-kernel" };

        if let Ok(path) = std::env::var("QUILL_KERNEL_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let candidate = exe_dir.join(binary_name);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }

        if let Ok(path) = which::which(binary_name) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let candidate = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(binary_name);
                if candidate.exists() {
                    return Ok(candidate.canonicalize().unwrap_or(candidate));
                }
            }
        }

        Err(Error::Ipc(
            "could not find quill-kernel binary; set QUILL_KERNEL_PATH or ensure it is in PATH"
                .to_string(),
        ))
    }

    /// Whether the kernel process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the kernel to exit and wait for it.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = write_frame(&mut self.stdin, &KernelRequest::Shutdown).await;
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::Ipc(format!("failed to wait for kernel: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Ipc(format!("kernel exited with status: {status}")))
        }
    }
}

impl KernelLink for KernelProcess {
    async fn send(&mut self, request: KernelRequest) -> Result<()> {
        write_frame(&mut self.stdin, &request).await
    }

    async fn recv(&mut self) -> Option<KernelMessage> {
        self.messages.recv().await
    }
}
