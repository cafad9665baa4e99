//! Continuation transport.
//!
//! A drain that runs out of invocation budget with work left asks for a fresh
//! invocation by emitting a [`ContinuationRequest`]. Sinks decide how that request
//! travels. In a deployment it is an HTTP call that becomes its own request
//! ([`HttpContinuationSink`]); an embedded queue can use a channel drained by a
//! [`ContinuationWorker`] instead, and tests record requests. Receivers must be
//! idempotent; a duplicate request only causes an empty drain.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use drainq_core::OwnerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationRequest {
    pub owner: OwnerId,
    /// Number of continuations already chained before this one.
    pub chain_depth: u32,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContinuationError {
    #[error("continuation channel closed")]
    Closed,

    #[error("continuation transport failed: {0}")]
    Transport(String),
}

/// Where continuation requests go.
#[async_trait::async_trait]
pub trait ContinuationSink: Send + Sync + 'static {
    async fn emit(&self, request: ContinuationRequest) -> Result<(), ContinuationError>;
}

/// Whatever runs a continuation once it arrives.
#[async_trait::async_trait]
pub trait ContinuationHandler: Send + Sync + 'static {
    async fn handle(&self, request: ContinuationRequest);
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<Vec<ContinuationRequest>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ContinuationRequest> {
        self.inner.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ContinuationSink for RecordingSink {
    async fn emit(&self, request: ContinuationRequest) -> Result<(), ContinuationError> {
        self.inner.lock().unwrap().push(request);
        Ok(())
    }
}

/// Sends requests to an in-process [`ContinuationWorker`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ContinuationRequest>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ContinuationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl ContinuationSink for ChannelSink {
    async fn emit(&self, request: ContinuationRequest) -> Result<(), ContinuationError> {
        self.tx.send(request).map_err(|_| ContinuationError::Closed)
    }
}

/// Starts a fresh invocation by posting the request to `{base}/drain`.
///
/// The receiver runs the drain inside its own request, so the sender only waits for
/// the hand-off: once the request is written, an acknowledgement that does not arrive
/// within `ack_timeout` still counts as delivered. Failing to connect does not.
#[derive(Debug, Clone)]
pub struct HttpContinuationSink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpContinuationSink {
    pub fn new(base_url: &str, ack_timeout: Duration) -> Result<Self, ContinuationError> {
        let http = reqwest::Client::builder()
            .connect_timeout(ack_timeout)
            .timeout(ack_timeout)
            .build()
            .map_err(|e| ContinuationError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/drain", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl ContinuationSink for HttpContinuationSink {
    async fn emit(&self, request: ContinuationRequest) -> Result<(), ContinuationError> {
        let response = match self.http.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() && !e.is_connect() => {
                debug!(owner = %request.owner, chain_depth = request.chain_depth, "continuation still draining; not waiting");
                return Ok(());
            }
            Err(e) => return Err(ContinuationError::Transport(e.to_string())),
        };

        if !response.status().is_success() {
            return Err(ContinuationError::Transport(format!(
                "continuation endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Handle to control and join a running continuation worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop accepting requests and abort in-flight drains. Claims they held are
    /// picked up by the reclaimer once the liveness window passes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

/// Runs continuation requests from a [`ChannelSink`].
///
/// At most one drain per owner is in flight. Requests for an owner that is already
/// draining are coalesced into a single rerun once the current drain finishes.
#[derive(Debug)]
pub struct ContinuationWorker;

impl ContinuationWorker {
    pub fn spawn(
        name: &'static str,
        rx: mpsc::UnboundedReceiver<ContinuationRequest>,
        handler: Arc<dyn ContinuationHandler>,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(worker_loop(name, rx, shutdown_rx, handler));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<ContinuationRequest>,
    mut shutdown_rx: oneshot::Receiver<()>,
    handler: Arc<dyn ContinuationHandler>,
) {
    info!(worker = name, "continuation worker started");

    let mut running: JoinSet<OwnerId> = JoinSet::new();
    let mut in_flight: HashSet<OwnerId> = HashSet::new();
    // Latest request per owner that arrived while that owner was draining.
    let mut dirty: HashMap<OwnerId, ContinuationRequest> = HashMap::new();
    let mut open = true;

    let launch = |running: &mut JoinSet<OwnerId>, request: ContinuationRequest| {
        let handler = handler.clone();
        running.spawn(async move {
            let owner = request.owner.clone();
            // Run on its own task so a panic still hands the owner back.
            let mut drain = AbortOnDrop(tokio::spawn(async move { handler.handle(request).await }));
            if let Err(e) = (&mut drain.0).await {
                warn!(worker = name, owner = %owner, error = %e, "continuation drain failed");
            }
            owner
        });
    };

    loop {
        if !open && running.is_empty() {
            break;
        }

        tokio::select! {
            _ = &mut shutdown_rx => {
                info!(worker = name, in_flight = running.len(), "continuation worker shutting down");
                running.shutdown().await;
                return;
            }
            received = rx.recv(), if open => match received {
                Some(request) => {
                    if in_flight.contains(&request.owner) {
                        debug!(worker = name, owner = %request.owner, "coalescing continuation");
                        dirty.insert(request.owner.clone(), request);
                    } else {
                        in_flight.insert(request.owner.clone());
                        launch(&mut running, request);
                    }
                }
                None => open = false,
            },
            Some(finished) = running.join_next(), if !running.is_empty() => {
                let owner = match finished {
                    Ok(owner) => owner,
                    Err(e) => {
                        warn!(worker = name, error = %e, "continuation task cancelled");
                        continue;
                    }
                };
                match dirty.remove(&owner) {
                    Some(rerun) => launch(&mut running, rerun),
                    None => {
                        in_flight.remove(&owner);
                    }
                }
            }
        }
    }

    info!(worker = name, "continuation worker stopped");
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
