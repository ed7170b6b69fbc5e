//! The consumer-facing surface: one handle wiring the host relay, the interpreter worker,
//! the pipeline, the data store and the group manager together.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dataviser_ipc::bridge::BridgeClient;
use dataviser_ipc::host::HostHandler;
use dataviser_ipc::message::{FileRef, LoadOptions};
use dataviser_ipc::{Bus, CorrelationChannel, Relay};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::dataframe::{DataStore, Dataframe, FrameSet, parse::parse_loaded};
use crate::error::{DataviserError, Result};
use crate::group::{FilterRegistry, GroupFailure, GroupManager, GroupParams, Subscription};
use crate::logger::PipelineTelemetry;
use crate::pipeline::{Pipeline, TaskContext};
use crate::script::{PREPROCESS_SCRIPT, globals};
use crate::worker::{InterpreterClient, WorkerOptions};

/// Bus identity of the privileged host.
pub const RELAY_ID: &str = "relay";

/// Where the privileged host runs.
pub enum HostConnection {
    InProcess(Arc<dyn HostHandler>),
    /// A child process serving envelopes on stdin/stdout (`dataviser host`).
    Process(Command),
}

pub struct Dataviser {
    bridge: BridgeClient,
    relay: Relay,
    worker: Arc<InterpreterClient>,
    pipeline: Arc<Pipeline>,
    store: Arc<DataStore>,
    groups: GroupManager,
    filters: DashMap<String, Arc<FilterRegistry>>,
}

impl Dataviser {
    /// Connect the host, start the worker and wait for the pipeline to bootstrap.
    pub async fn start(settings: &Settings, host: HostConnection) -> Result<Self> {
        let bus = Bus::new(settings.bus_capacity);
        let relay = match host {
            HostConnection::InProcess(handler) => Relay::in_process(bus.clone(), RELAY_ID, handler),
            HostConnection::Process(command) => Relay::spawn_process(bus.clone(), RELAY_ID, command)
                .map_err(|e| DataviserError::Bootstrap(format!("cannot start host process: {e}")))?,
        };
        let bridge = BridgeClient::new(CorrelationChannel::new(bus, RELAY_ID, settings.request_timeout));

        let worker = InterpreterClient::spawn(WorkerOptions {
            max_operations: settings.max_operations,
            max_expr_depth: settings.max_expr_depth,
            timeout: settings.script_timeout,
        })?;
        let pipeline = Pipeline::start(
            Arc::clone(&worker),
            Arc::new(bridge.clone()),
            settings.bootstrap.clone(),
            Arc::new(PipelineTelemetry::new()),
        );
        pipeline.ready().await?;

        let store = Arc::new(DataStore::new());
        let groups = GroupManager::new(Arc::clone(&pipeline), Arc::clone(&store));
        info!(relay = RELAY_ID, "dataviser started");
        Ok(Self {
            bridge,
            relay,
            worker,
            pipeline,
            store,
            groups,
            filters: DashMap::new(),
        })
    }

    /* ────────────────────────────────────────────────────────────────────────
     * Loading
     * ──────────────────────────────────────────────────────────────────────── */

    /// Ask the host for files, then load them. Returns the new frame ids.
    pub async fn pick_and_load_files(&self) -> Result<Vec<String>> {
        let picked = self.bridge.pick_files().await?;
        self.load_files(paths_of(picked)).await
    }

    pub async fn pick_and_load_directories(&self) -> Result<Vec<String>> {
        let picked = self.bridge.pick_directories().await?;
        self.load_files(paths_of(picked)).await
    }

    /// Read `paths` through the host and add them to the dataset. Nothing is installed
    /// unless every file parses.
    pub async fn load_files(&self, paths: Vec<String>) -> Result<Vec<String>> {
        let loaded = self.bridge.load_files(paths, LoadOptions::default()).await?;
        let mut parsed: Vec<(String, Dataframe, Map<String, Value>)> = Vec::with_capacity(loaded.len());
        for file in &loaded {
            let (frame, meta) = parse_loaded(file).inspect_err(|e| warn!(file = %file.filepath, "cannot parse: {e}"))?;
            parsed.push((Uuid::new_v4().to_string(), frame, meta));
        }
        let ids: Vec<String> = parsed.iter().map(|(id, ..)| id.clone()).collect();

        let store = Arc::clone(&self.store);
        let version = self
            .pipeline
            .enqueue("load files", move |ctx| async move {
                // extend whatever is current when the task runs, not when it was queued
                let mut next = (*store.current()).clone();
                for (id, frame, meta) in parsed {
                    next.insert(id, frame, meta);
                }
                push_dataset(&ctx, &next).await?;
                Ok(store.set_store(next))
            })
            .await?;
        info!(files = ids.len(), version, "files loaded");
        Ok(ids)
    }

    /// Restore the dataset that the last load replaced. Returns the new dataset version.
    pub async fn revert(&self) -> Result<u64> {
        let store = Arc::clone(&self.store);
        self.pipeline
            .enqueue("revert", move |ctx| async move {
                let previous = store.cached();
                push_dataset(&ctx, &previous).await?;
                Ok(store.revert())
            })
            .await
    }

    /* ────────────────────────────────────────────────────────────────────────
     * Groups
     * ──────────────────────────────────────────────────────────────────────── */

    pub fn subscribe_group(&self, params: GroupParams) -> Subscription {
        self.groups.subscribe(params)
    }

    /// `{frame id: {column: {row: value}}}` for `group`.
    pub fn get_group(&self, group: &str) -> Option<Value> {
        self.store.group(group).map(|snapshot| snapshot.to_json())
    }

    /// Metadata of every loaded frame.
    pub fn get_metadata(&self) -> BTreeMap<String, Map<String, Value>> {
        self.store.metadata()
    }

    pub fn group_version(&self, group: &str) -> u64 {
        self.store.group_version(group)
    }

    pub fn group_timestamp(&self, group: &str) -> Option<DateTime<Utc>> {
        self.store.group_timestamp(group)
    }

    pub fn group_matrix(&self, group: &str, frame_id: &str) -> Option<(Vec<String>, Vec<Vec<f64>>)> {
        self.store.group_matrix(group, frame_id)
    }

    pub fn failures(&self) -> broadcast::Receiver<GroupFailure> {
        self.groups.failures()
    }

    /// The filter registry of one visual, created on first use.
    pub fn filters(&self, context: &str) -> Arc<FilterRegistry> {
        Arc::clone(self.filters.entry(context.to_string()).or_default().value())
    }

    /* ────────────────────────────────────────────────────────────────────────
     * Plumbing
     * ──────────────────────────────────────────────────────────────────────── */

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn bridge(&self) -> &BridgeClient {
        &self.bridge
    }

    pub fn worker(&self) -> &Arc<InterpreterClient> {
        &self.worker
    }

    /// Tell the host to exit and stop relaying.
    pub async fn exit(self) {
        info!("exiting");
        self.bridge.exit_app();
        self.relay.shutdown().await;
    }
}

fn paths_of(files: Vec<FileRef>) -> Vec<String> {
    files.into_iter().map(|f| f.filepath).collect()
}

/// Make `frames` the interpreter's loaded dataset.
async fn push_dataset(ctx: &TaskContext, frames: &FrameSet) -> Result<()> {
    let (dfs, meta) = frames.to_context();
    ctx.set_context(Map::from_iter([
        (globals::FRAMES.to_string(), dfs),
        (globals::FRAMES_META.to_string(), meta),
    ]))
    .await?;
    ctx.run_named(PREPROCESS_SCRIPT).await?;
    Ok(())
}
