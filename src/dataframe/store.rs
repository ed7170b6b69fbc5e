//! The versioned data store. It holds two generations of the loaded dataset (the
//! current one and the one it replaced) plus the derived group tables, and tells
//! listeners about every change.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::ops::{AxisOrder, to_matrix};
use super::Dataframe;
use crate::group::GroupParams;

/// One generation of loaded frames, keyed by frame id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSet {
    pub frames: BTreeMap<String, Arc<Dataframe>>,
    pub meta: BTreeMap<String, Map<String, Value>>,
}

impl FrameSet {
    pub fn insert(&mut self, id: impl Into<String>, frame: Dataframe, meta: Map<String, Value>) {
        let id = id.into();
        self.frames.insert(id.clone(), Arc::new(frame));
        self.meta.insert(id, meta);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.frames.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// `({id: frame}, {id: meta})` as handed to the interpreter.
    pub fn to_context(&self) -> (Value, Value) {
        let frames = self
            .frames
            .iter()
            .map(|(id, frame)| (id.clone(), frame.to_json()))
            .collect::<Map<_, _>>();
        let meta = self
            .meta
            .iter()
            .map(|(id, meta)| (id.clone(), Value::Object(meta.clone())))
            .collect::<Map<_, _>>();
        (Value::Object(frames), Value::Object(meta))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    DatasetChanged { version: u64 },
    GroupUpdated { group: String, version: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The full contents of one derivation, installed as a unit.
#[derive(Debug, Clone, Default)]
pub struct GroupUpdate {
    pub frames: BTreeMap<String, Dataframe>,
    pub meta: BTreeMap<String, Map<String, Value>>,
    pub members: Vec<String>,
    /// Selection and orientation the contents were derived with.
    pub params: GroupParams,
}

/// Read-only view of a group table.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub name: String,
    pub frames: BTreeMap<String, Arc<Dataframe>>,
    pub meta: BTreeMap<String, Map<String, Value>>,
    pub members: Vec<String>,
    /// `None` until the first ingest.
    pub params: Option<GroupParams>,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl GroupSnapshot {
    /// The dataframe-shaped map `{frame id: {column: {row: value}}}`.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.frames
                .iter()
                .map(|(id, frame)| (id.clone(), frame.to_json()))
                .collect(),
        )
    }
}

#[derive(Debug, Default)]
struct GroupEntry {
    frames: BTreeMap<String, Arc<Dataframe>>,
    meta: BTreeMap<String, Map<String, Value>>,
    members: Vec<String>,
    params: Option<GroupParams>,
    version: u64,
    updated_at: Option<DateTime<Utc>>,
    order: AxisOrder,
}

struct Generations {
    current: Arc<FrameSet>,
    cache: Arc<FrameSet>,
}

pub struct DataStore {
    generations: RwLock<Generations>,
    version: AtomicU64,
    groups: DashMap<String, GroupEntry>,
    listeners: DashMap<u64, mpsc::UnboundedSender<StoreEvent>>,
    next_listener: AtomicU64,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            generations: RwLock::new(Generations {
                current: Arc::new(FrameSet::default()),
                cache: Arc::new(FrameSet::default()),
            }),
            version: AtomicU64::new(0),
            groups: DashMap::new(),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
        }
    }

    /* ────────────────────────────────────────────────────────────────────────
     * Dataset generations
     * ──────────────────────────────────────────────────────────────────────── */

    pub fn current(&self) -> Arc<FrameSet> {
        let generations = self.generations.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&generations.current)
    }

    /// The generation `revert` would restore.
    pub fn cached(&self) -> Arc<FrameSet> {
        let generations = self.generations.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&generations.cache)
    }

    pub fn dataset_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Move `current` into the cache slot and install `frames`. Returns the new version.
    pub fn set_store(&self, frames: FrameSet) -> u64 {
        {
            let mut generations = self.generations.write().unwrap_or_else(PoisonError::into_inner);
            let previous = std::mem::replace(&mut generations.current, Arc::new(frames));
            generations.cache = previous;
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(version, "dataset replaced");
        self.notify(StoreEvent::DatasetChanged { version });
        version
    }

    /// Swap the two generations back. Returns the new version.
    pub fn revert(&self) -> u64 {
        {
            let mut generations = self.generations.write().unwrap_or_else(PoisonError::into_inner);
            let Generations { current, cache } = &mut *generations;
            std::mem::swap(current, cache);
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(version, "dataset reverted");
        self.notify(StoreEvent::DatasetChanged { version });
        version
    }

    /// Metadata of every frame in the current generation.
    pub fn metadata(&self) -> BTreeMap<String, Map<String, Value>> {
        self.current().meta.clone()
    }

    /* ────────────────────────────────────────────────────────────────────────
     * Groups
     * ──────────────────────────────────────────────────────────────────────── */

    /// Create `group` if it does not exist yet.
    pub fn ensure_group(&self, group: &str) {
        self.groups.entry(group.to_string()).or_default();
    }

    /// Replace the contents of `group` wholesale and bump its version.
    pub fn ingest_group(&self, group: &str, update: GroupUpdate) -> u64 {
        let GroupUpdate {
            frames,
            meta,
            members,
            params,
        } = update;
        let version = {
            let mut entry = self.groups.entry(group.to_string()).or_default();
            for frame in frames.values() {
                entry.order.extend(AxisOrder::discover(frame).labels().iter().cloned());
            }
            entry.frames = frames.into_iter().map(|(id, f)| (id, Arc::new(f))).collect();
            entry.meta = meta;
            entry.members = members;
            entry.params = Some(params);
            entry.version += 1;
            entry.updated_at = Some(Utc::now());
            entry.version
        };
        debug!(group, version, "group updated");
        self.notify(StoreEvent::GroupUpdated {
            group: group.to_string(),
            version,
        });
        version
    }

    pub fn group(&self, group: &str) -> Option<GroupSnapshot> {
        self.groups.get(group).map(|entry| GroupSnapshot {
            name: group.to_string(),
            frames: entry.frames.clone(),
            meta: entry.meta.clone(),
            members: entry.members.clone(),
            params: entry.params.clone(),
            version: entry.version,
            updated_at: entry.updated_at,
        })
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// 0 for a group that has never been ingested.
    pub fn group_version(&self, group: &str) -> u64 {
        self.groups.get(group).map(|e| e.version).unwrap_or(0)
    }

    pub fn group_timestamp(&self, group: &str) -> Option<DateTime<Utc>> {
        self.groups.get(group).and_then(|e| e.updated_at)
    }

    /// The group's stable label order, append-only across updates.
    pub fn group_order(&self, group: &str) -> AxisOrder {
        self.groups.get(group).map(|e| e.order.clone()).unwrap_or_default()
    }

    /// Matrix of one frame of `group`, positioned by the group's label order.
    pub fn group_matrix(&self, group: &str, frame_id: &str) -> Option<(Vec<String>, Vec<Vec<f64>>)> {
        let entry = self.groups.get(group)?;
        let frame = entry.frames.get(frame_id)?;
        Some((entry.order.labels().to_vec(), to_matrix(frame, Some(&entry.order))))
    }

    /* ────────────────────────────────────────────────────────────────────────
     * Change notification
     * ──────────────────────────────────────────────────────────────────────── */

    pub fn listen(&self) -> (ListenerId, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, tx);
        (ListenerId(id), rx)
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id.0).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&self, event: StoreEvent) {
        self.listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}
