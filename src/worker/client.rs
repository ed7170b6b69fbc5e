use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::protocol::{WorkerAction, WorkerReply, WorkerRequest};
use super::runtime;
use crate::error::{DataviserError, Result};

/// Nesting limit for script expressions, both at top level and inside functions.
/// rhai's own default is much lower in debug builds than in release builds.
pub const DEFAULT_MAX_EXPR_DEPTH: usize = 128;

/// Dispatched once at spawn so the first real script does not pay engine warm-up.
pub const WARM_UP_SCRIPT: &str = "let __warm_up = [1, 2, 3].map(|x| x * 2); ()";

type Processes = Arc<DashMap<u64, oneshot::Sender<Result<Value, String>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Operation budget per script; 0 is unbounded.
    pub max_operations: u64,
    /// Expression nesting limit; 0 is unbounded.
    pub max_expr_depth: usize,
    /// Bounded wait for each reply; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_operations: 50_000_000,
            max_expr_depth: DEFAULT_MAX_EXPR_DEPTH,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Client side of the worker protocol. Requests get increasing ids starting at 1; each
/// reply resolves and removes exactly the matching entry.
///
/// The worker executes whatever it is sent, in arrival order. Keeping scripts from
/// interleaving is the pipeline's job.
pub struct InterpreterClient {
    requests: std_mpsc::Sender<WorkerRequest>,
    processes: Processes,
    next_id: AtomicU64,
    crashed: Arc<AtomicBool>,
    timeout: Option<Duration>,
    reader: JoinHandle<()>,
}

/// Frees the process slot however the waiting future ends.
struct ProcessGuard<'a> {
    processes: &'a Processes,
    id: u64,
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        self.processes.remove(&self.id);
    }
}

impl InterpreterClient {
    /// Start the worker thread and queue the warm-up script.
    pub fn spawn(options: WorkerOptions) -> Result<Arc<Self>> {
        let (request_tx, request_rx) = std_mpsc::channel::<WorkerRequest>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<WorkerReply>();

        let WorkerOptions {
            max_operations,
            max_expr_depth,
            ..
        } = options;
        thread::Builder::new()
            .name("interpreter".into())
            .spawn(move || runtime::serve(request_rx, reply_tx, max_operations, max_expr_depth))
            .map_err(|e| DataviserError::Interpreter(format!("cannot start worker thread: {e}")))?;

        let client = Self::attach(request_tx, reply_rx, options.timeout);
        let warm = client.submit(WorkerAction::ProcessDispatch {
            script: WARM_UP_SCRIPT.to_string(),
        });
        tokio::spawn(async move {
            match warm.await {
                Ok(_) => debug!("interpreter warmed up"),
                Err(e) => warn!("interpreter warm-up failed: {e}"),
            }
        });
        Ok(client)
    }

    fn attach(
        requests: std_mpsc::Sender<WorkerRequest>,
        mut replies: mpsc::UnboundedReceiver<WorkerReply>,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        let processes: Processes = Arc::new(DashMap::new());
        let crashed = Arc::new(AtomicBool::new(false));

        let reader = {
            let processes = Arc::clone(&processes);
            let crashed = Arc::clone(&crashed);
            tokio::spawn(async move {
                while let Some(reply) = replies.recv().await {
                    match processes.remove(&reply.id) {
                        Some((_, tx)) => {
                            let _ = tx.send(reply.into_result());
                        }
                        None => trace!(id = reply.id, "dropping reply for unknown process"),
                    }
                }
                // the thread is gone: every waiter sees its sender dropped
                crashed.store(true, Ordering::SeqCst);
                error!(pending = processes.len(), "interpreter worker exited");
                processes.clear();
            })
        };

        Arc::new(Self {
            requests,
            processes,
            next_id: AtomicU64::new(1),
            crashed,
            timeout,
            reader,
        })
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.processes.len()
    }

    /// Run `script`; resolves with the script's last expression as JSON.
    pub async fn dispatch_script(&self, script: &str) -> Result<Value> {
        self.submit(WorkerAction::ProcessDispatch {
            script: script.to_string(),
        })
        .await
    }

    /// Bind globals in the interpreter. Resolves once the values are converted and visible.
    pub async fn set_context(&self, context: Map<String, Value>) -> Result<()> {
        self.submit(WorkerAction::ContextSet { context }).await.map(|_| ())
    }

    /// Post the request now; the returned future waits for its reply.
    fn submit(&self, action: WorkerAction) -> impl Future<Output = Result<Value>> + Send + use<> {
        let posted = self.post(action);
        let processes = Arc::clone(&self.processes);
        let timeout = self.timeout;
        async move {
            let (id, rx) = posted?;
            let _guard = ProcessGuard { processes: &processes, id };
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                    warn!(id, "interpreter request timed out");
                    DataviserError::Timeout {
                        id,
                        ms: limit.as_millis() as u64,
                    }
                })?,
                None => rx.await,
            };
            match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(DataviserError::Interpreter(message)),
                Err(_) => Err(DataviserError::WorkerCrashed),
            }
        }
    }

    fn post(&self, action: WorkerAction) -> Result<(u64, oneshot::Receiver<Result<Value, String>>)> {
        if self.is_crashed() {
            return Err(DataviserError::WorkerCrashed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.processes.insert(id, tx);
        trace!(id, action = action.name(), "posting to worker");
        if self.requests.send(WorkerRequest { id, action }).is_err() {
            self.processes.remove(&id);
            self.crashed.store(true, Ordering::SeqCst);
            return Err(DataviserError::WorkerCrashed);
        }
        Ok((id, rx))
    }
}

impl Drop for InterpreterClient {
    fn drop(&mut self) {
        // dropping `requests` ends the thread
        self.reader.abort();
    }
}
