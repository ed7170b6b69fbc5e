//! Request/response matching over an untyped broadcast transport.
//!
//! Every actor sees every envelope on the [`Bus`]. A [`CorrelationChannel`] keeps one
//! pending slot per outstanding request, keyed by the envelope id, and resolves it when
//! a reply with the same id shows up. Replies nobody is waiting for are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::envelope::{Body, Envelope, Outcome};
use crate::error::BridgeError;

/// The shared, ordering-agnostic message transport.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Post an envelope to everyone listening. Nobody listening is not an error.
    pub fn post(&self, envelope: Envelope) {
        let _ = self.tx.send(envelope);
    }

    pub fn listen(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

type Pending = Arc<DashMap<String, oneshot::Sender<Outcome>>>;
type Subscribers = Arc<DashMap<u64, (String, Callback)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct CorrelationChannel {
    relay_id: String,
    bus: Bus,
    pending: Pending,
    subscribers: Subscribers,
    next_subscription: AtomicU64,
    timeout: Option<Duration>,
    listener: JoinHandle<()>,
}

/// Frees the pending slot however the waiting future ends (reply, timeout, or drop).
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl CorrelationChannel {
    /// Start listening on `bus`. Requests are addressed to `relay_id`; anything else
    /// addressed to `relay_id` is relay-bound traffic and never touches resolution.
    ///
    /// `timeout` bounds every `send`; `None` waits forever.
    pub fn new(bus: Bus, relay_id: impl Into<String>, timeout: Option<Duration>) -> Arc<Self> {
        let relay_id = relay_id.into();
        let pending: Pending = Arc::new(DashMap::new());
        let subscribers: Subscribers = Arc::new(DashMap::new());

        let mut rx = bus.listen();
        let listener = {
            let relay_id = relay_id.clone();
            let pending = Arc::clone(&pending);
            let subscribers = Arc::clone(&subscribers);
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(envelope) => route(&relay_id, &pending, &subscribers, envelope),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "correlation listener lagged; replies may have been lost");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                // dropping the senders wakes every waiter with `Closed`
                pending.clear();
            })
        };

        Arc::new(Self {
            relay_id,
            bus,
            pending,
            subscribers,
            next_subscription: AtomicU64::new(1),
            timeout,
            listener,
        })
    }

    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send `action(args)` on behalf of `source` and wait for the matching reply.
    pub async fn send(&self, source: &str, action: &str, args: Value) -> Result<Value, BridgeError> {
        let envelope = Envelope::request(source, &self.relay_id, action, args);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(envelope.id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: envelope.id.clone(),
        };
        debug!(id = %envelope.id, source, action, "bridge request");
        self.bus.post(envelope);

        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(BridgeError::Timeout {
                        action: action.to_string(),
                        ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        match received {
            Ok(Outcome::Result(value)) => Ok(value),
            Ok(Outcome::Error(failure)) => Err(BridgeError::from_failure(action, failure)),
            Err(_) => Err(BridgeError::Closed),
        }
    }

    /// Post `action(args)` without waiting for (or expecting) a reply.
    pub fn notify(&self, source: &str, action: &str, args: Value) {
        self.bus
            .post(Envelope::notify(source, &self.relay_id, action, args));
    }

    /// Invoke `callback` for every envelope addressed to `target`, independent of any
    /// pending request.
    pub fn subscribe<F>(&self, target: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .insert(id, (target.into(), Arc::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id.0).is_some()
    }
}

impl Drop for CorrelationChannel {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn route(relay_id: &str, pending: &Pending, subscribers: &Subscribers, envelope: Envelope) {
    if envelope.target == relay_id {
        return;
    }

    let callbacks: Vec<Callback> = subscribers
        .iter()
        .filter(|entry| entry.value().0 == envelope.target)
        .map(|entry| Arc::clone(&entry.value().1))
        .collect();
    for callback in callbacks {
        callback(&envelope);
    }

    if let Body::Reply { outcome } = envelope.body {
        match pending.remove(&envelope.id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => trace!(id = %envelope.id, "dropping reply with unknown id"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HostFailure, HostFailureKind};
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers every request addressed to "relay" with `{"echo": args}`.
    fn spawn_echo(bus: &Bus) -> JoinHandle<()> {
        let mut rx = bus.listen();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Ok(env) = rx.recv().await {
                if env.target != "relay" {
                    continue;
                }
                if let Body::Request { action, args } = &env.body {
                    let outcome = if action == "fail" {
                        Outcome::Error(HostFailure::io("disk on fire"))
                    } else {
                        Outcome::Result(json!({ "echo": args }))
                    };
                    bus.post(env.reply(outcome));
                }
            }
        })
    }

    #[tokio::test]
    async fn send_resolves_matching_reply() {
        let bus = Bus::new(64);
        let _echo = spawn_echo(&bus);
        let channel = CorrelationChannel::new(bus, "relay", Some(Duration::from_secs(2)));

        let v = channel.send("fs", "pick-files", json!([1])).await.unwrap();
        assert_eq!(v, json!({"echo": [1]}));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_match_by_id() {
        let bus = Bus::new(64);
        let _echo = spawn_echo(&bus);
        let channel = CorrelationChannel::new(bus, "relay", Some(Duration::from_secs(2)));

        let (a, b) = tokio::join!(
            channel.send("fs", "same-action", json!("a")),
            channel.send("fs", "same-action", json!("b")),
        );
        assert_eq!(a.unwrap(), json!({"echo": "a"}));
        assert_eq!(b.unwrap(), json!({"echo": "b"}));
    }

    #[tokio::test]
    async fn host_failures_keep_io_distinct() {
        let bus = Bus::new(64);
        let _echo = spawn_echo(&bus);
        let channel = CorrelationChannel::new(bus, "relay", Some(Duration::from_secs(2)));

        let err = channel.send("fs", "fail", Value::Null).await.unwrap_err();
        assert!(matches!(err, BridgeError::Io(ref m) if m == "disk on fire"));
    }

    #[tokio::test]
    async fn unknown_reply_id_is_dropped() {
        let bus = Bus::new(64);
        let channel = CorrelationChannel::new(bus.clone(), "relay", Some(Duration::from_secs(2)));
        let mut rx = bus.listen();

        let responder = tokio::spawn({
            let bus = bus.clone();
            async move {
                let req = loop {
                    let env = rx.recv().await.unwrap();
                    if env.target == "relay" {
                        break env;
                    }
                };
                // a stray reply first, then the real one
                let mut stray = req.reply(Outcome::Result(json!("stray")));
                stray.id = "nobody-asked".into();
                bus.post(stray);
                bus.post(req.reply(Outcome::Result(json!("real"))));
            }
        });

        let v = channel.send("fs", "pick-files", Value::Null).await.unwrap();
        responder.await.unwrap();
        assert_eq!(v, json!("real"));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn relay_bound_traffic_never_resolves() {
        let bus = Bus::new(64);
        let channel = CorrelationChannel::new(bus.clone(), "relay", Some(Duration::from_millis(150)));
        let mut rx = bus.listen();

        tokio::spawn({
            let bus = bus.clone();
            async move {
                while let Ok(env) = rx.recv().await {
                    if env.target == "relay" && !env.is_reply() {
                        // reply with the right id but addressed to the relay itself
                        let mut echo = env.reply(Outcome::Result(json!("echo")));
                        echo.target = "relay".into();
                        bus.post(echo);
                    }
                }
            }
        });

        let err = channel.send("fs", "pick-files", Value::Null).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { ref action, ms: 150 } if action == "pick-files"));
        assert_eq!(channel.pending_len(), 0, "timed out slot must be freed");
    }

    #[tokio::test]
    async fn subscribers_see_push_messages() {
        let bus = Bus::new(64);
        let channel = CorrelationChannel::new(bus.clone(), "relay", None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = channel.subscribe("ui", {
            let seen = Arc::clone(&seen);
            move |env: &Envelope| seen.lock().unwrap().push(env.action().map(str::to_string))
        });

        bus.post(Envelope::notify("relay-host", "ui", "progress", json!(50)));
        bus.post(Envelope::notify("relay-host", "other", "progress", json!(60)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![Some("progress".to_string())]);

        assert!(channel.unsubscribe(sub));
        bus.post(Envelope::notify("relay-host", "ui", "progress", json!(70)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn failure_kind_maps_to_error() {
        let err = BridgeError::from_failure("pick-files", HostFailure::new(HostFailureKind::Unsupported, "nope"));
        assert!(matches!(err, BridgeError::Host { .. }));
    }
}
