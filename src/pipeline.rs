//! The one ordered task chain every interpreter interaction goes through.
//!
//! Tasks are appended to a single-consumer queue at call time and run strictly one
//! after another. The runner first bootstraps the interpreter (catalogue fetch plus the
//! bootstrap scripts, run directly rather than through the queue) and only then starts
//! draining it, so tasks submitted during bootstrap simply wait.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dataviser_ipc::bridge::CatalogueProvider;
use dataviser_ipc::message::ScriptCatalogue;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::error::{DataviserError, Result};
use crate::logger::PipelineTelemetry;
use crate::script::{check_identifier, extraction_script, parse_extraction};
use crate::worker::InterpreterClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    Ready,
    Failed(String),
}

/// What a running task may do with the interpreter.
#[derive(Clone)]
pub struct TaskContext {
    worker: Arc<InterpreterClient>,
    catalogue: Arc<ScriptCatalogue>,
}

impl TaskContext {
    pub fn catalogue(&self) -> &ScriptCatalogue {
        &self.catalogue
    }

    /// Bind interpreter globals. Every name must be a valid identifier.
    pub async fn set_context(&self, bindings: Map<String, Value>) -> Result<()> {
        for name in bindings.keys() {
            check_identifier(name)?;
        }
        self.worker.set_context(bindings).await
    }

    pub async fn run_script(&self, source: &str) -> Result<Value> {
        self.worker.dispatch_script(source).await
    }

    /// Run a script from the catalogue by name.
    pub async fn run_named(&self, name: &str) -> Result<Value> {
        let source = self
            .catalogue
            .get(name)
            .ok_or_else(|| DataviserError::UnknownScript(name.to_string()))?;
        trace!(script = name, "running catalogue script");
        self.worker.dispatch_script(source).await
    }

    /// Context, then script, then optionally a catalogue script.
    pub async fn transform(&self, bindings: Map<String, Value>, source: &str, named: Option<&str>) -> Result<Value> {
        self.set_context(bindings).await?;
        let mut out = self.run_script(source).await?;
        if let Some(name) = named {
            out = self.run_named(name).await?;
        }
        Ok(out)
    }

    /// Read interpreter globals back as JSON.
    pub async fn extract(&self, names: &[&str]) -> Result<Map<String, Value>> {
        let script = extraction_script(names)?;
        let output = self.run_script(&script).await?;
        parse_extraction(&output)
    }
}

trait Job: Send {
    fn name(&self) -> &str;
    fn run(self: Box<Self>, ctx: TaskContext, telemetry: Arc<PipelineTelemetry>) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, error: DataviserError);
}

type TaskFn<T> = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<T>> + Send>;

struct TaskJob<T> {
    name: String,
    task: TaskFn<T>,
    reply: oneshot::Sender<Result<T>>,
}

impl<T: Send + 'static> Job for TaskJob<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, ctx: TaskContext, telemetry: Arc<PipelineTelemetry>) -> BoxFuture<'static, ()> {
        let TaskJob { name, task, reply } = *self;
        Box::pin(async move {
            // building the future happens inside the guard too
            let guarded = AssertUnwindSafe(async move { task(ctx).await }).catch_unwind();
            let result = telemetry
                .instrument_task(&name, async move {
                    guarded
                        .await
                        .unwrap_or_else(|panic| Err(DataviserError::TaskPanicked(panic_message(panic.as_ref()))))
                })
                .await;
            if reply.send(result).is_err() {
                debug!(task = %name, "task caller went away");
            }
        })
    }

    fn reject(self: Box<Self>, error: DataviserError) {
        let _ = self.reply.send(Err(error));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct Pipeline {
    jobs: mpsc::UnboundedSender<Box<dyn Job>>,
    phase: Arc<watch::Sender<Phase>>,
    runner: JoinHandle<()>,
}

impl Pipeline {
    /// Start the runner. Bootstrap begins immediately in the background.
    pub fn start(
        worker: Arc<InterpreterClient>,
        catalogue: Arc<dyn CatalogueProvider>,
        bootstrap: Vec<String>,
        telemetry: Arc<PipelineTelemetry>,
    ) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Box<dyn Job>>();
        let (phase, _) = watch::channel(Phase::Bootstrapping);
        let phase = Arc::new(phase);
        let runner = tokio::spawn(drive(
            jobs_rx,
            Arc::clone(&phase),
            worker,
            catalogue,
            bootstrap,
            telemetry,
        ));
        Arc::new(Self {
            jobs: jobs_tx,
            phase,
            runner,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase.borrow().clone()
    }

    /// Wait for bootstrap to finish.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.phase.subscribe();
        let phase = rx
            .wait_for(|p| *p != Phase::Bootstrapping)
            .await
            .map_err(|_| DataviserError::PipelineClosed)?
            .clone();
        match phase {
            Phase::Failed(message) => Err(DataviserError::Bootstrap(message)),
            _ => Ok(()),
        }
    }

    /// Append `task` to the chain now and return a future for its result. The append
    /// happens before this returns, so call order is execution order.
    pub fn submit<T, F, Fut>(&self, name: &str, task: F) -> impl Future<Output = Result<T>> + Send + use<T, F, Fut>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: Box<dyn Job> = Box::new(TaskJob {
            name: name.to_string(),
            task: Box::new(move |ctx| task(ctx).boxed()),
            reply,
        });
        let queued = self.jobs.send(job).map_err(|_| DataviserError::PipelineClosed);
        async move {
            queued?;
            rx.await.map_err(|_| DataviserError::PipelineClosed)?
        }
    }

    /// Append `task` and wait for it.
    pub async fn enqueue<T, F, Fut>(&self, name: &str, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(name, task).await
    }

    /// Resolves once everything submitted before this call has run.
    pub async fn flush(&self) -> Result<()> {
        self.enqueue("flush", |_| async { Ok(()) }).await
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

async fn drive(
    mut jobs: mpsc::UnboundedReceiver<Box<dyn Job>>,
    phase: Arc<watch::Sender<Phase>>,
    worker: Arc<InterpreterClient>,
    catalogue: Arc<dyn CatalogueProvider>,
    bootstrap: Vec<String>,
    telemetry: Arc<PipelineTelemetry>,
) {
    let ctx = match boot(worker, catalogue.as_ref(), &bootstrap).await {
        Ok(ctx) => {
            info!(scripts = ctx.catalogue.len(), "pipeline ready");
            phase.send_replace(Phase::Ready);
            ctx
        }
        Err(e) => {
            let message = e.to_string();
            error!("pipeline bootstrap failed: {message}");
            phase.send_replace(Phase::Failed(message.clone()));
            while let Some(job) = jobs.recv().await {
                job.reject(DataviserError::Bootstrap(message.clone()));
            }
            return;
        }
    };

    while let Some(job) = jobs.recv().await {
        trace!(task = job.name(), "task started");
        job.run(ctx.clone(), Arc::clone(&telemetry)).await;
    }
    debug!("pipeline stopped");
}

async fn boot(worker: Arc<InterpreterClient>, catalogue: &dyn CatalogueProvider, bootstrap: &[String]) -> Result<TaskContext> {
    let scripts = catalogue.scripts().await?;
    let ctx = TaskContext {
        worker,
        catalogue: Arc::new(scripts),
    };
    for name in bootstrap {
        ctx.run_named(name)
            .await
            .map_err(|e| DataviserError::Bootstrap(format!("`{name}`: {e}")))?;
        debug!(script = %name, "bootstrap script done");
    }
    Ok(ctx)
}
