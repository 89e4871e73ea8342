//! Shared helpers: an in-process mock fork node speaking the JSON-RPC
//! wire contract, and an inert launcher so no real anvil binary is
//! needed.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Once};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use forkbench::orchestrator::fork_manager::{LaunchHandle, LaunchRequest, NodeLauncher};
use forkbench::{AppError, Result};
use serde_json::{json, Value};

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Mutable state of the mock node, inspectable from tests.
#[derive(Debug, Default)]
pub struct NodeState {
    /// Value served by `eth_blockNumber`.
    pub block_number: u64,
    /// Counter backing `evm_snapshot` tokens.
    pub snapshot_counter: u64,
    /// Snapshot ids passed to `evm_revert`, in order.
    pub reverted: Vec<String>,
    /// Blobs passed to `anvil_loadState`, in order.
    pub loaded_state: Vec<String>,
    /// Blob served by `anvil_dumpState`.
    pub dump_payload: String,
}

/// A running mock fork node bound to an ephemeral port.
pub struct MockNode {
    pub url: String,
    pub state: Arc<Mutex<NodeState>>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub async fn spawn_mock_node(initial_block: u64) -> MockNode {
    init_tracing();
    let state = Arc::new(Mutex::new(NodeState {
        block_number: initial_block,
        dump_payload: "0xfeedfacecafe".into(),
        ..NodeState::default()
    }));

    let app = Router::new()
        .route("/", post(handle_rpc))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock node");
    let addr = listener.local_addr().expect("local addr");

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock node");
    });

    MockNode {
        url: format!("http://{addr}/"),
        state,
        server,
    }
}

async fn handle_rpc(
    State(state): State<Arc<Mutex<NodeState>>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let method = body["method"].as_str().unwrap_or_default();
    let mut node = state.lock().expect("node state lock");

    let result = match method {
        "eth_blockNumber" => json!(format!("0x{:x}", node.block_number)),
        "evm_snapshot" => {
            node.snapshot_counter += 1;
            json!(format!("0x{:x}", node.snapshot_counter))
        }
        "evm_revert" => {
            let id = body["params"][0].as_str().unwrap_or_default().to_owned();
            node.reverted.push(id);
            json!(true)
        }
        "anvil_dumpState" => json!(node.dump_payload.clone()),
        "anvil_loadState" => {
            let blob = body["params"][0].as_str().unwrap_or_default().to_owned();
            node.loaded_state.push(blob);
            json!(true)
        }
        "anvil_reset" => json!(true),
        _ => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32601, "message": format!("method {method} not found") },
            }));
        }
    };

    Json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
}

/// Launcher that spawns an inert child process and points the manager at
/// a mock node instead of a real fork binary.
pub struct FakeLauncher {
    pub rpc_url: String,
}

impl NodeLauncher for FakeLauncher {
    fn launch(
        &self,
        _request: &LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LaunchHandle>> + Send + '_>> {
        let rpc_url = self.rpc_url.clone();
        Box::pin(async move {
            let child = tokio::process::Command::new("sleep")
                .arg("300")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| AppError::Spawn(format!("failed to spawn sleeper: {err}")))?;
            Ok(LaunchHandle { child, rpc_url })
        })
    }
}
