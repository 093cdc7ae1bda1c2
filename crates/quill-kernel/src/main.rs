//! Kernel process entry point.
//!
//! The kernel owns the shared Python namespace and the SQL connection. It
//! reads length-prefixed requests from stdin and streams messages back over
//! stdout, one cell executing at a time. Stdout is the IPC channel, so all
//! logging goes to stderr; user `print` output never reaches the real
//! stdout either (it is captured per execution).

mod capture;
mod display;
mod exec;
mod kernel;
mod sql;

use std::io;
use std::sync::mpsc;
use std::thread;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use quill_core::ipc::protocol::{read_message, write_message, KernelRequest};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    // All outbound messages funnel through one channel into a dedicated
    // writer thread, which keeps frames ordered and un-interleaved.
    let (tx, rx) = mpsc::channel();
    let writer = thread::spawn(move || {
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        while let Ok(message) = rx.recv() {
            if write_message(&mut stdout, &message).is_err() {
                break;
            }
        }
    });

    let mut kernel = kernel::Kernel::new(tx)?;
    tracing::info!("kernel ready");

    let stdin = io::stdin();
    let mut stdin = stdin.lock();
    loop {
        match read_message::<_, KernelRequest>(&mut stdin) {
            Ok(KernelRequest::Shutdown) => {
                tracing::info!("shutting down");
                break;
            }
            Ok(request) => kernel.handle(request),
            Err(e) => {
                // Parent went away; exit quietly.
                tracing::debug!(error = %e, "request channel closed");
                break;
            }
        }
    }

    drop(kernel);
    let _ = writer.join();
    Ok(())
}
