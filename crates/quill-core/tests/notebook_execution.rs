//! End-to-end execution against a real kernel process.
//!
//! These tests spawn the `quill-kernel` binary and need a Python runtime
//! on the host. Build it first (`cargo build -p quill-kernel`) and run with
//! `cargo test -- --ignored`.

use quill_core::ipc::KernelProcess;
use quill_core::storage::MemoryStorage;
use quill_core::{CellKind, CellStatus, Coordinator, MimeType, Notebook};

async fn coordinator() -> Coordinator<MemoryStorage, KernelProcess> {
    let kernel = KernelProcess::spawn().expect("spawn quill-kernel");
    Coordinator::bind(Notebook::new("u1", "e2e"), MemoryStorage::new(), kernel)
        .await
        .expect("bind")
}

#[tokio::test]
#[ignore = "requires the quill-kernel binary and a Python runtime"]
async fn test_python_cascade_end_to_end() {
    let coordinator = coordinator().await;

    let a = coordinator.create_cell(CellKind::Python, None).await.unwrap();
    coordinator.update_cell(&a, "x = 5".to_string()).await.unwrap();
    let b = coordinator.create_cell(CellKind::Python, None).await.unwrap();
    coordinator.update_cell(&b, "y = x + 1\nprint(y)".to_string()).await.unwrap();

    coordinator.run_cell(&a).await.unwrap();

    let snapshot = coordinator.snapshot().await;
    let b_cell = snapshot.cells.iter().find(|cell| cell.id == b).unwrap();
    assert_eq!(b_cell.status, CellStatus::Success);
    assert_eq!(b_cell.stdout, "6\n");
}

#[tokio::test]
#[ignore = "requires the quill-kernel binary and a Python runtime"]
async fn test_trailing_expression_becomes_output() {
    let coordinator = coordinator().await;

    let a = coordinator.create_cell(CellKind::Python, None).await.unwrap();
    coordinator.update_cell(&a, "2 + 3".to_string()).await.unwrap();
    coordinator.run_cell(&a).await.unwrap();

    let snapshot = coordinator.snapshot().await;
    let cell = &snapshot.cells[0];
    assert_eq!(cell.outputs.len(), 1);
    assert_eq!(cell.outputs[0].mime, MimeType::TextPlain);
    assert_eq!(cell.outputs[0].data, serde_json::json!("5"));
}

#[tokio::test]
#[ignore = "requires the quill-kernel binary and a Python runtime"]
async fn test_runtime_error_is_contained() {
    let coordinator = coordinator().await;

    let a = coordinator.create_cell(CellKind::Python, None).await.unwrap();
    coordinator.update_cell(&a, "x = 1/0".to_string()).await.unwrap();
    let b = coordinator.create_cell(CellKind::Python, None).await.unwrap();
    coordinator.update_cell(&b, "ok = 1".to_string()).await.unwrap();

    coordinator.run_cell(&a).await.unwrap();

    let snapshot = coordinator.snapshot().await;
    let a_cell = snapshot.cells.iter().find(|cell| cell.id == a).unwrap();
    assert_eq!(a_cell.status, CellStatus::Error);
    assert!(a_cell.error.as_deref().unwrap().contains("ZeroDivisionError"));

    // The kernel survives; an unrelated cell still runs.
    coordinator.run_cell(&b).await.unwrap();
    let snapshot = coordinator.snapshot().await;
    let b_cell = snapshot.cells.iter().find(|cell| cell.id == b).unwrap();
    assert_eq!(b_cell.status, CellStatus::Success);
}

#[tokio::test]
#[ignore = "requires the quill-kernel binary and a Python runtime"]
async fn test_syntax_error_names_line() {
    let coordinator = coordinator().await;

    let a = coordinator.create_cell(CellKind::Python, None).await.unwrap();
    coordinator.update_cell(&a, "x = = 5".to_string()).await.unwrap();
    coordinator.run_cell(&a).await.unwrap();

    let snapshot = coordinator.snapshot().await;
    let cell = &snapshot.cells[0];
    assert_eq!(cell.status, CellStatus::Error);
    assert!(cell.error.as_deref().unwrap().starts_with("SyntaxError on line 1"));
}

#[tokio::test]
#[ignore = "requires the quill-kernel binary and a Python runtime with matplotlib"]
async fn test_plt_show_is_captured_as_png() {
    let coordinator = coordinator().await;

    let a = coordinator.create_cell(CellKind::Python, None).await.unwrap();
    coordinator
        .update_cell(
            &a,
            "import matplotlib.pyplot as plt\nplt.plot([1, 2, 3])\nplt.show()".to_string(),
        )
        .await
        .unwrap();
    coordinator.run_cell(&a).await.unwrap();

    let snapshot = coordinator.snapshot().await;
    let cell = &snapshot.cells[0];
    assert_eq!(cell.status, CellStatus::Success);
    assert_eq!(cell.outputs.len(), 1, "exactly one captured figure");
    assert_eq!(cell.outputs[0].mime, MimeType::ImagePng);
    // Base64 PNG payload, not a file path or a window handle.
    assert!(cell.outputs[0].data.as_str().unwrap().len() > 100);
}

#[tokio::test]
#[ignore = "requires the quill-kernel binary and a Python runtime"]
async fn test_sql_without_config_fails_fast() {
    let coordinator = coordinator().await;

    let a = coordinator.create_cell(CellKind::Sql, None).await.unwrap();
    coordinator
        .update_cell(&a, "SELECT * FROM users WHERE id = {user_id}".to_string())
        .await
        .unwrap();
    coordinator.run_cell(&a).await.unwrap();

    let snapshot = coordinator.snapshot().await;
    let cell = &snapshot.cells[0];
    assert_eq!(cell.status, CellStatus::Error);
    assert!(cell.error.as_deref().unwrap().contains("database not configured"));
}
