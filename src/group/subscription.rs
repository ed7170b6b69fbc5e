use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::{Orientation, StalenessChecker};
use crate::dataframe::{DataStore, Dataframe, GroupUpdate, ListenerId};
use crate::error::{DataviserError, Result};
use crate::pipeline::{Pipeline, TaskContext};
use crate::script::{OUTPUT_SCRIPT, aggregation_fragment, filter_fragment, globals};
use crate::worker::SUM_LABEL;

pub const DEFAULT_GROUP: &str = "_";

/// What a consumer wants derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupParams {
    pub group: String,
    /// Frames to include; empty means all.
    pub ids: Vec<String>,
    pub exclude: Vec<String>,
    pub rows: Vec<String>,
    pub cols: Vec<String>,
    /// Metadata field to allowed values; frames with other values are dropped.
    pub meta: BTreeMap<String, Vec<Value>>,
    pub orient: Orientation,
}

impl Default for GroupParams {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            ids: Vec::new(),
            exclude: Vec::new(),
            rows: Vec::new(),
            cols: Vec::new(),
            meta: BTreeMap::new(),
            orient: Orientation::None,
        }
    }
}

impl GroupParams {
    pub fn named(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    fn bindings(&self) -> Map<String, Value> {
        Map::from_iter([
            (globals::IDS.to_string(), json!(self.ids)),
            (globals::EXCLUDE.to_string(), json!(self.exclude)),
            (globals::ROWS.to_string(), json!(self.rows)),
            (globals::COLS.to_string(), json!(self.cols)),
            (globals::META_FILTER.to_string(), json!(self.meta)),
        ])
    }
}

/// A derivation that failed; the group keeps its previous contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFailure {
    pub group: String,
    pub message: String,
}

/// State shared between a subscription handle and its listener task.
struct Derivation {
    params: GroupParams,
    filter_script: String,
    aggregation_script: String,
    checker: Mutex<StalenessChecker>,
    /// Held across the liveness check and the ingest, so nothing lands after unsubscribe.
    alive: Mutex<bool>,
    runs: AtomicU64,
}

impl Derivation {
    fn new(params: GroupParams) -> Self {
        Self {
            filter_script: filter_fragment(!params.meta.is_empty()),
            aggregation_script: aggregation_fragment(params.orient),
            params,
            checker: Mutex::new(StalenessChecker::new()),
            alive: Mutex::new(true),
            runs: AtomicU64::new(0),
        }
    }

    fn is_alive(&self) -> bool {
        *self.alive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the derivation dead. True only for the call that did it.
    fn kill(&self) -> bool {
        let mut alive = self.alive.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *alive, false)
    }

    /// If the dataset moved since the last check, append one derivation to the pipeline.
    fn update(
        self: &Arc<Self>,
        pipeline: &Pipeline,
        store: &Arc<DataStore>,
    ) -> Option<impl Future<Output = Result<u64>> + Send + use<>> {
        if !self.is_alive() {
            return None;
        }
        let version = store.dataset_version();
        let stale = self
            .checker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(version);
        if !stale {
            trace!(group = %self.params.group, version, "group is up to date");
            return None;
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        let me = Arc::clone(self);
        let store = Arc::clone(store);
        Some(pipeline.submit(&format!("derive {}", self.params.group), move |ctx| async move {
            me.derive(ctx, &store).await
        }))
    }

    async fn derive(&self, ctx: TaskContext, store: &DataStore) -> Result<u64> {
        let group = &self.params.group;
        ctx.set_context(self.params.bindings()).await?;
        ctx.run_script(&self.filter_script).await?;
        ctx.run_script(&self.aggregation_script).await?;
        ctx.run_named(OUTPUT_SCRIPT).await?;
        let extracted = ctx.extract(&[globals::OUT]).await?;
        let (frames, meta) = parse_output(extracted)?;
        let members = frames.keys().filter(|id| *id != SUM_LABEL).cloned().collect();

        let alive = self.alive.lock().unwrap_or_else(PoisonError::into_inner);
        if !*alive {
            debug!(group = %group, "subscription ended; derivation discarded");
            return Ok(store.group_version(group));
        }
        Ok(store.ingest_group(
            group,
            GroupUpdate {
                frames,
                meta,
                members,
                params: self.params.clone(),
            },
        ))
    }
}

type Derived = (BTreeMap<String, Dataframe>, BTreeMap<String, Map<String, Value>>);

/// `OUT = {id: {df, meta}}` into frames and metadata. Nothing is ingested unless
/// every entry parses.
fn parse_output(mut extracted: Map<String, Value>) -> Result<Derived> {
    let out = match extracted.remove(globals::OUT) {
        Some(Value::Object(out)) => out,
        other => {
            return Err(DataviserError::Extraction(format!(
                "OUT is not an object: {}",
                other.unwrap_or(Value::Null)
            )));
        }
    };
    let mut frames = BTreeMap::new();
    let mut meta = BTreeMap::new();
    for (id, entry) in out {
        let frame = entry
            .get("df")
            .ok_or_else(|| DataviserError::Extraction(format!("`{id}` has no frame")))?;
        frames.insert(id.clone(), Dataframe::from_json(frame)?);
        if let Some(Value::Object(m)) = entry.get("meta") {
            meta.insert(id, m.clone());
        }
    }
    Ok((frames, meta))
}

pub struct GroupManager {
    pipeline: Arc<Pipeline>,
    store: Arc<DataStore>,
    failures: broadcast::Sender<GroupFailure>,
}

impl GroupManager {
    pub fn new(pipeline: Arc<Pipeline>, store: Arc<DataStore>) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            pipeline,
            store,
            failures,
        }
    }

    /// Failed derivations, for whatever surfaces errors to the user.
    pub fn failures(&self) -> broadcast::Receiver<GroupFailure> {
        self.failures.subscribe()
    }

    /// Start deriving `params.group`. The first derivation is appended to the pipeline
    /// before this returns; later ones follow dataset changes.
    pub fn subscribe(&self, params: GroupParams) -> Subscription {
        self.store.ensure_group(&params.group);
        info!(group = %params.group, orient = %params.orient, "group subscribed");
        let derivation = Arc::new(Derivation::new(params));
        let (listener, mut events) = self.store.listen();

        if let Some(first) = derivation.update(&self.pipeline, &self.store) {
            let failures = self.failures.clone();
            let group = derivation.params.group.clone();
            tokio::spawn(async move { report(&failures, &group, first.await) });
        }

        let task = {
            let derivation = Arc::clone(&derivation);
            let pipeline = Arc::clone(&self.pipeline);
            let store = Arc::clone(&self.store);
            let failures = self.failures.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if !derivation.is_alive() {
                        break;
                    }
                    trace!(?event, "store changed");
                    if let Some(pending) = derivation.update(&pipeline, &store) {
                        report(&failures, &derivation.params.group, pending.await);
                    }
                }
            })
        };

        Subscription {
            derivation,
            store: Arc::clone(&self.store),
            listener,
            task,
        }
    }
}

fn report(failures: &broadcast::Sender<GroupFailure>, group: &str, result: Result<u64>) {
    match result {
        Ok(version) => debug!(group, version, "group derived"),
        Err(e) => {
            error!(group, "group derivation failed: {e}");
            let _ = failures.send(GroupFailure {
                group: group.to_string(),
                message: e.to_string(),
            });
        }
    }
}

/// Handle for one subscribed consumer. Dropping it unsubscribes.
pub struct Subscription {
    derivation: Arc<Derivation>,
    store: Arc<DataStore>,
    listener: ListenerId,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn group(&self) -> &str {
        &self.derivation.params.group
    }

    pub fn params(&self) -> &GroupParams {
        &self.derivation.params
    }

    /// Derivations appended so far, the initial one included.
    pub fn derivations(&self) -> u64 {
        self.derivation.runs.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.derivation.is_alive()
    }

    /// Stop listening. A derivation already queued still runs but no longer writes
    /// to the group.
    pub fn unsubscribe(&self) {
        if self.derivation.kill() {
            self.store.unlisten(self.listener);
            self.task.abort();
            debug!(group = %self.group(), "group unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataframe::FrameSet;
    use crate::logger::PipelineTelemetry;
    use crate::script::{BOOTSTRAP_SCRIPTS, builtin_catalogue};
    use crate::worker::{InterpreterClient, WorkerOptions};
    use dataviser_ipc::message::ScriptCatalogue;
    use std::time::Duration;

    fn manager_with(catalogue: ScriptCatalogue) -> (GroupManager, Arc<Pipeline>, Arc<DataStore>) {
        let worker = InterpreterClient::spawn(WorkerOptions::default()).unwrap();
        let pipeline = Pipeline::start(
            worker,
            Arc::new(catalogue),
            BOOTSTRAP_SCRIPTS.iter().map(|s| s.to_string()).collect(),
            Arc::new(PipelineTelemetry::new()),
        );
        let store = Arc::new(DataStore::new());
        (GroupManager::new(Arc::clone(&pipeline), Arc::clone(&store)), pipeline, store)
    }

    /// Load `frames` the way ingestion does: into the interpreter, then the store.
    async fn load(pipeline: &Pipeline, store: &Arc<DataStore>, frames: Value) {
        let mut set = FrameSet::default();
        for (id, frame) in frames.as_object().unwrap() {
            set.insert(id.clone(), Dataframe::from_json(frame).unwrap(), Map::from_iter([("kind".to_string(), json!(id))]));
        }
        let store = Arc::clone(store);
        pipeline
            .enqueue("load", move |ctx| async move {
                let (dfs, meta) = set.to_context();
                ctx.set_context(Map::from_iter([("dfs".to_string(), dfs), ("dfs_meta".to_string(), meta)]))
                    .await?;
                ctx.run_named("df_preprocess").await?;
                store.set_store(set);
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn wait_for_version(store: &DataStore, group: &str, version: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.group_version(group) < version {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn subscribe_derives_immediately() {
        let (groups, pipeline, store) = manager_with(builtin_catalogue());
        load(&pipeline, &store, json!({"a": {"A": {"r1": 2, "r2": 3}}, "b": {"A": {"r1": 5}}})).await;

        let sub = groups.subscribe(GroupParams {
            rows: vec!["r1".into()],
            ..GroupParams::named("g")
        });
        assert_eq!(sub.derivations(), 1);
        pipeline.flush().await.unwrap();

        let group = store.group("g").unwrap();
        assert_eq!(group.version, 1);
        assert_eq!(group.members, ["a", "b"]);
        assert_eq!(group.params.as_ref(), Some(sub.params()));
        assert_eq!(group.params.unwrap().rows, ["r1"]);
        assert_eq!(group.frames["sum"].get("A", "r1"), Some(7.0));
        assert_eq!(group.frames["a"].get("A", "r2"), None);
    }

    #[tokio::test]
    async fn dataset_change_rederives_exactly_once() {
        let (groups, pipeline, store) = manager_with(builtin_catalogue());
        let sub = groups.subscribe(GroupParams {
            rows: vec!["r1".into()],
            ..GroupParams::named("g")
        });
        pipeline.flush().await.unwrap();
        assert_eq!(store.group_version("g"), 1);

        load(&pipeline, &store, json!({"a": {"A": {"r1": 1}}})).await;
        wait_for_version(&store, "g", 2).await;
        // let any further notifications settle
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.flush().await.unwrap();

        assert_eq!(sub.derivations(), 2);
        assert_eq!(store.group_version("g"), 2);
        assert_eq!(store.group("g").unwrap().frames["a"].get("A", "r1"), Some(1.0));
    }

    #[tokio::test]
    async fn orientation_and_selection() {
        let (groups, pipeline, store) = manager_with(builtin_catalogue());
        load(&pipeline, &store, json!({"a": {"A": {"r1": 2, "r2": 3}, "B": {"r1": 5}}, "b": {"A": {"r1": 1}}})).await;

        let _rows = groups.subscribe(GroupParams {
            orient: Orientation::Row,
            exclude: vec!["b".into()],
            ..GroupParams::named("rows")
        });
        let _cols = groups.subscribe(GroupParams {
            orient: Orientation::Col,
            ids: vec!["a".into()],
            meta: BTreeMap::from([("kind".to_string(), vec![json!("a")])]),
            ..GroupParams::named("cols")
        });
        pipeline.flush().await.unwrap();

        let rows = store.group("rows").unwrap();
        assert_eq!(rows.members, ["a"]);
        assert_eq!(rows.frames["a"].to_json(), json!({"sum": {"r1": 7.0, "r2": 3.0}}));
        let cols = store.group("cols").unwrap();
        assert_eq!(cols.frames["sum"].to_json(), json!({"A": {"sum": 5.0}, "B": {"sum": 5.0}}));
    }

    #[tokio::test]
    async fn unsubscribed_derivations_do_not_write() {
        let (groups, pipeline, store) = manager_with(builtin_catalogue());
        let sub = groups.subscribe(GroupParams::named("g"));
        pipeline.flush().await.unwrap();
        assert_eq!(store.group_version("g"), 1);

        // hold the chain so the next derivation queues behind this task
        let blocker = pipeline.submit("hold", |_| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(())
        });
        let mut set = FrameSet::default();
        set.insert("a", Dataframe::default(), Map::new());
        store.set_store(set);
        tokio::time::timeout(Duration::from_secs(2), async {
            while sub.derivations() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        sub.unsubscribe();
        assert!(!sub.is_active());
        blocker.await.unwrap();
        pipeline.flush().await.unwrap();
        assert_eq!(store.group_version("g"), 1);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn nothing_lands_after_unsubscribe_returns() {
        let (groups, pipeline, store) = manager_with(builtin_catalogue());
        let sub = groups.subscribe(GroupParams::named("g"));
        pipeline.flush().await.unwrap();

        // keep the dataset moving while unsubscribing
        let churn = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..50 {
                    let mut set = FrameSet::default();
                    set.insert(format!("f{i}"), Dataframe::default(), Map::new());
                    store.set_store(set);
                    tokio::task::yield_now().await;
                }
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while sub.derivations() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        sub.unsubscribe();
        let frozen = store.group_version("g");

        churn.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.flush().await.unwrap();
        assert_eq!(store.group_version("g"), frozen);
    }

    #[tokio::test]
    async fn failed_derivation_keeps_previous_group() {
        let mut catalogue = builtin_catalogue();
        catalogue.remove(OUTPUT_SCRIPT);
        let (groups, pipeline, store) = manager_with(catalogue);
        let mut failures = groups.failures();

        let _sub = groups.subscribe(GroupParams::named("g"));
        let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.group, "g");
        assert!(failure.message.contains(OUTPUT_SCRIPT), "{}", failure.message);
        pipeline.flush().await.unwrap();
        assert_eq!(store.group_version("g"), 0);
    }
}
