//! Fork process lifecycle: spawn, readiness, tracking, termination.
//!
//! One manager serves all sessions in the process; each session owns at
//! most one live fork at a time. Spawned processes carry
//! `kill_on_drop(true)` so nothing outlives the host. A registry document
//! shared across sessions lets a restarted host reconcile processes that
//! survived it.

use std::collections::HashMap;
use std::future::Future;
use std::net::TcpListener;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, info_span, warn};

use crate::config::ForkConfig;
use crate::models::fork::Fork;
use crate::persistence::{load_doc, save_doc, StateStore};
use crate::rpc::RpcClient;
use crate::{AppError, Result};

/// Registry document shared across sessions.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryDoc {
    forks: Vec<Fork>,
}

const REGISTRY_KEY: &str = "forks/registry";

/// Explicit lifecycle of a fork process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkState {
    /// Process launched, readiness not yet confirmed.
    Spawning,
    /// Readiness probe succeeded.
    Ready,
    /// Registered and serving the session.
    Running,
    /// Graceful termination in progress.
    Terminating,
    /// Process confirmed gone.
    Dead,
}

/// What the launcher needs to start one fork process.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Fork node binary.
    pub binary: String,
    /// Extra arguments appended after the standard ones.
    pub extra_args: Vec<String>,
    /// Upstream JSON-RPC endpoint to replay.
    pub upstream_url: String,
    /// Optional pin block.
    pub block_number: Option<u64>,
    /// Local port the node must listen on.
    pub port: u16,
}

/// A launched fork process, not yet confirmed ready.
pub struct LaunchHandle {
    /// The child process; `kill_on_drop(true)` is set.
    pub child: Child,
    /// JSON-RPC endpoint the process will serve.
    pub rpc_url: String,
}

/// Seam between the manager and the OS process launch, so tests can
/// substitute an inert child.
pub trait NodeLauncher: Send + Sync {
    /// Launch one fork process for the given request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the OS spawn fails.
    fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LaunchHandle>> + Send + '_>>;
}

/// Production launcher: builds the anvil-style command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnvilLauncher;

impl NodeLauncher for AnvilLauncher {
    fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LaunchHandle>> + Send + '_>> {
        let request = request.clone();
        Box::pin(async move {
            let mut cmd = Command::new(&request.binary);
            cmd.arg("--port")
                .arg(request.port.to_string())
                .arg("--fork-url")
                .arg(&request.upstream_url);
            if let Some(block) = request.block_number {
                cmd.arg("--fork-block-number").arg(block.to_string());
            }
            cmd.args(&request.extra_args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let child = cmd
                .spawn()
                .map_err(|err| AppError::Spawn(format!("failed to spawn fork node: {err}")))?;

            Ok(LaunchHandle {
                child,
                rpc_url: format!("http://127.0.0.1:{}", request.port),
            })
        })
    }
}

/// Inputs for [`ForkManager::fork`].
#[derive(Debug, Clone)]
pub struct ForkSpec {
    /// Session the fork belongs to.
    pub session_id: String,
    /// Named upstream network.
    pub network: String,
    /// Chain id of the upstream network.
    pub chain_id: u64,
    /// Upstream JSON-RPC endpoint to replay.
    pub upstream_url: String,
    /// Optional pin block; `None` forks at the upstream head.
    pub block_number: Option<u64>,
}

struct ForkEntry {
    fork: Fork,
    state: ForkState,
}

/// Spawns, tracks, and kills the external fork process per session.
pub struct ForkManager {
    config: ForkConfig,
    store: Arc<dyn StateStore>,
    launcher: Box<dyn NodeLauncher>,
    forks: HashMap<String, ForkEntry>,
    children: HashMap<String, Child>,
}

impl ForkManager {
    /// Create a manager with the production anvil launcher.
    #[must_use]
    pub fn new(config: ForkConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            launcher: Box::new(AnvilLauncher),
            forks: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// Replace the launcher (tests inject an inert one).
    #[must_use]
    pub fn with_launcher(mut self, launcher: Box<dyn NodeLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Reconcile the persisted registry against live OS processes.
    ///
    /// Each entry must pass a pid liveness check and then an RPC probe;
    /// entries failing either are dropped silently.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if rewriting the registry fails.
    pub async fn init(&mut self) -> Result<()> {
        let span = info_span!("fork_registry_init");
        let _guard = span.enter();

        let Some(doc) = load_doc::<RegistryDoc>(self.store.as_ref(), REGISTRY_KEY) else {
            return Ok(());
        };

        for fork in doc.forks {
            if !pid_alive(fork.pid) {
                debug!(fork_id = fork.id, pid = fork.pid, "dropping dead registry entry");
                continue;
            }
            let rpc = RpcClient::new(&fork.rpc_url);
            if rpc.block_number().await.is_err() {
                debug!(
                    fork_id = fork.id,
                    rpc_url = fork.rpc_url,
                    "dropping unresponsive registry entry"
                );
                continue;
            }
            debug!(fork_id = fork.id, pid = fork.pid, "reconciled live fork");
            self.forks.insert(
                fork.id.clone(),
                ForkEntry {
                    fork,
                    state: ForkState::Running,
                },
            );
        }

        self.persist_registry()
    }

    /// First unused port in the configured range.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when the range is exhausted.
    fn allocate_port(&self) -> Result<u16> {
        for port in self.config.port_range_start..=self.config.port_range_end {
            let taken = self.forks.values().any(|entry| entry.fork.port == port);
            if taken {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(AppError::Spawn(format!(
            "no free port in {}..={}",
            self.config.port_range_start, self.config.port_range_end
        )))
    }

    /// Spawn a fork process and wait for it to become responsive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if no port is free, the OS spawn fails,
    /// or the node never answers its readiness probe (the process is
    /// killed before the error is returned).
    pub async fn fork(&mut self, spec: ForkSpec) -> Result<Fork> {
        let span = info_span!("fork", session_id = spec.session_id, network = spec.network);
        let _guard = span.enter();

        let port = self.allocate_port()?;
        let request = LaunchRequest {
            binary: self.config.binary.clone(),
            extra_args: self.config.extra_args.clone(),
            upstream_url: spec.upstream_url.clone(),
            block_number: spec.block_number,
            port,
        };

        let mut handle = self.launcher.launch(&request).await?;
        let pid = handle.child.id().unwrap_or(0);
        info!(pid, port, "fork process launched, waiting for readiness");

        // Tracked from the moment the process exists: the entry holds the
        // pin block until the readiness probe reports the actual one, and
        // is only persisted to the registry once the fork is ready.
        let rpc_url = handle.rpc_url.clone();
        let fork = Fork::new(
            spec.session_id,
            spec.network,
            spec.chain_id,
            spec.block_number.unwrap_or(0),
            port,
            pid,
            handle.rpc_url,
        );
        let id = fork.id.clone();
        self.children.insert(id.clone(), handle.child);
        self.forks.insert(
            id.clone(),
            ForkEntry {
                fork,
                state: ForkState::Spawning,
            },
        );

        let block_number = match self.wait_for_ready(&rpc_url).await {
            Ok(block) => block,
            Err(err) => {
                if let Some(mut child) = self.children.remove(&id) {
                    child.kill().await.ok();
                }
                self.forks.remove(&id);
                return Err(err);
            }
        };

        let fork = {
            // The entry was inserted above; it cannot be gone.
            let Some(entry) = self.forks.get_mut(&id) else {
                return Err(AppError::Spawn(format!("fork {id} vanished during spawn")));
            };
            entry.fork.block_number = block_number;
            entry.state = ForkState::Ready;
            entry.fork.clone()
        };
        info!(fork_id = id, pid, block_number, "fork ready");

        self.persist_registry()?;
        if let Some(entry) = self.forks.get_mut(&id) {
            entry.state = ForkState::Running;
        }
        Ok(fork)
    }

    /// Poll the node's own RPC endpoint until it answers, bounded by the
    /// configured attempt count and interval. Returns the block number
    /// reported by the successful probe.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when every attempt fails.
    pub async fn wait_for_ready(&self, rpc_url: &str) -> Result<u64> {
        let rpc = RpcClient::new(rpc_url);
        let interval = Duration::from_millis(self.config.ready_interval_ms);
        let mut last_err = String::new();

        for attempt in 1..=self.config.ready_attempts {
            match rpc.block_number().await {
                Ok(block) => return Ok(block),
                Err(err) => {
                    last_err = err.to_string();
                    debug!(attempt, rpc_url, "fork not ready yet");
                }
            }
            tokio::time::sleep(interval).await;
        }

        Err(AppError::Spawn(format!(
            "fork at {rpc_url} never became ready after {} attempts: {last_err}",
            self.config.ready_attempts
        )))
    }

    /// Terminate one fork: graceful signal, bounded grace wait, forced
    /// kill. The registry entry is removed (releasing the port) whether or
    /// not the process went down cleanly.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown fork id, or
    /// `AppError::Storage` if rewriting the registry fails.
    pub async fn kill(&mut self, id: &str) -> Result<()> {
        let Some(entry) = self.forks.get_mut(id) else {
            return Err(AppError::NotFound(format!("fork {id} not found")));
        };
        entry.state = ForkState::Terminating;
        let pid = entry.fork.pid;

        let grace = Duration::from_millis(self.config.grace_period_ms);
        if let Some(mut child) = self.children.remove(id) {
            terminate_child(id, pid, &mut child, grace).await;
        } else {
            terminate_detached(id, pid, grace).await;
        }

        self.forks.remove(id);
        info!(fork_id = id, pid, "fork terminated");
        self.persist_registry()
    }

    /// Kill every fork belonging to a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if rewriting the registry fails.
    pub async fn kill_session(&mut self, session_id: &str) -> Result<()> {
        let ids: Vec<String> = self
            .forks
            .values()
            .filter(|entry| entry.fork.session_id == session_id)
            .map(|entry| entry.fork.id.clone())
            .collect();
        for id in ids {
            self.kill(&id).await?;
        }
        Ok(())
    }

    /// Kill every tracked fork.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if rewriting the registry fails.
    pub async fn kill_all(&mut self) -> Result<()> {
        let ids: Vec<String> = self.forks.keys().cloned().collect();
        for id in ids {
            self.kill(&id).await?;
        }
        Ok(())
    }

    /// Look up a tracked fork by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Fork> {
        self.forks.get(id).map(|entry| &entry.fork)
    }

    /// Lifecycle state of a fork; anything no longer tracked is dead.
    #[must_use]
    pub fn state(&self, id: &str) -> ForkState {
        self.forks
            .get(id)
            .map_or(ForkState::Dead, |entry| entry.state)
    }

    /// All tracked forks.
    #[must_use]
    pub fn list(&self) -> Vec<&Fork> {
        self.forks.values().map(|entry| &entry.fork).collect()
    }

    /// Fork coordinates as plain key/value pairs for injection into
    /// downstream processes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown fork id.
    pub fn export_env(&self, id: &str) -> Result<HashMap<String, String>> {
        let fork = self
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("fork {id} not found")))?;
        let mut env = HashMap::new();
        env.insert("FORKBENCH_RPC_URL".to_owned(), fork.rpc_url.clone());
        env.insert("FORKBENCH_CHAIN_ID".to_owned(), fork.chain_id.to_string());
        env.insert(
            "FORKBENCH_BLOCK_NUMBER".to_owned(),
            fork.block_number.to_string(),
        );
        env.insert("FORKBENCH_FORK_ID".to_owned(), fork.id.clone());
        Ok(env)
    }

    fn persist_registry(&self) -> Result<()> {
        let doc = RegistryDoc {
            forks: self
                .forks
                .values()
                .map(|entry| entry.fork.clone())
                .collect(),
        };
        save_doc(self.store.as_ref(), REGISTRY_KEY, &doc)
    }
}

/// Graceful-then-forced termination for a child we spawned ourselves.
async fn terminate_child(fork_id: &str, pid: u32, child: &mut Child, grace: Duration) {
    signal_term(pid);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(exit)) => {
            debug!(fork_id, ?exit, "fork exited within grace period");
        }
        Ok(Err(err)) => {
            warn!(fork_id, %err, "error waiting for fork process");
        }
        Err(_) => {
            warn!(fork_id, "fork did not exit within grace period, forcing kill");
            if let Err(err) = child.kill().await {
                warn!(fork_id, %err, "failed to force-kill fork process");
            }
        }
    }
}

/// Graceful-then-forced termination for a reconciled process we did not
/// spawn in this host instance.
async fn terminate_detached(fork_id: &str, pid: u32, grace: Duration) {
    signal_term(pid);
    let poll = Duration::from_millis(100);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(poll).await;
    }
    warn!(fork_id, pid, "detached fork survived grace period, forcing kill");
    signal_kill(pid);
}

// pid 0 would address our own process group; treat it as already gone.

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    i32::try_from(pid).is_ok_and(|raw| raw > 0 && kill(Pid::from_raw(raw), None).is_ok())
}

#[cfg(unix)]
fn signal_term(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Ok(raw) = i32::try_from(pid) {
        if raw > 0 {
            kill(Pid::from_raw(raw), Signal::SIGTERM).ok();
        }
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Ok(raw) = i32::try_from(pid) {
        if raw > 0 {
            kill(Pid::from_raw(raw), Signal::SIGKILL).ok();
        }
    }
}

// Without unix signals the grace phase is skipped; `Child::kill` is the
// only termination path and detached pids cannot be probed.
#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn signal_term(_pid: u32) {}

#[cfg(not(unix))]
fn signal_kill(_pid: u32) {}
