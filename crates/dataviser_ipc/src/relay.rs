//! Relays move relay-bound envelopes from the [`Bus`] to a [`HostHandler`] and put the
//! replies back on the bus. The handler either lives in this process or in a child
//! process speaking newline-delimited JSON envelopes over stdin/stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::correlation::Bus;
use crate::envelope::{Body, Envelope, Outcome};
use crate::host::HostHandler;
use crate::message::HostRequest;

/// How long `shutdown` waits for queued envelopes to drain and for a child host to exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct Relay {
    relay_id: String,
    /// The bus-facing task comes first.
    tasks: Vec<JoinHandle<()>>,
    child: Option<Child>,
    stop: CancellationToken,
}

impl Relay {
    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }

    /* ────────────────────────────────────────────────────────────────────────
     * 1)  Handler in this process
     * ──────────────────────────────────────────────────────────────────────── */
    pub fn in_process(bus: Bus, relay_id: impl Into<String>, handler: Arc<dyn HostHandler>) -> Self {
        let relay_id = relay_id.into();
        let stop = CancellationToken::new();
        let mut rx = bus.listen();
        let me = relay_id.clone();
        let stopped = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                // queued envelopes win over the stop signal
                let received = tokio::select! {
                    biased;
                    received = rx.recv() => received,
                    _ = stopped.cancelled() => break,
                };
                let envelope = match received {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay lagged behind the bus");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if envelope.target != me {
                    continue;
                }
                if matches!(envelope.body, Body::Notify { .. }) {
                    dispatch(handler.as_ref(), envelope).await;
                    continue;
                }
                let handler = Arc::clone(&handler);
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Some(reply) = dispatch(handler.as_ref(), envelope).await {
                        bus.post(reply);
                    }
                });
            }
        });
        Self {
            relay_id,
            tasks: vec![task],
            child: None,
            stop,
        }
    }

    /* ────────────────────────────────────────────────────────────────────────
     * 2)  Handler in a child process (see `serve_stdio`)
     * ──────────────────────────────────────────────────────────────────────── */
    pub fn spawn_process(bus: Bus, relay_id: impl Into<String>, mut command: Command) -> Result<Self> {
        let relay_id = relay_id.into();
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("host stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("host stdout unavailable"))?;
        let stop = CancellationToken::new();

        // bus → child.stdin
        let writer = {
            let mut rx = bus.listen();
            let me = relay_id.clone();
            let stopped = stop.clone();
            tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        received = rx.recv() => received,
                        _ = stopped.cancelled() => break,
                    };
                    let envelope = match received {
                        Ok(envelope) => envelope,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "host writer lagged behind the bus");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if envelope.target != me || envelope.is_reply() {
                        continue;
                    }
                    let line = match serde_json::to_string(&envelope) {
                        Ok(line) => line,
                        Err(e) => {
                            error!("cannot encode envelope {}: {e}", envelope.id);
                            continue;
                        }
                    };
                    if stdin.write_all(line.as_bytes()).await.is_err()
                        || stdin.write_all(b"\n").await.is_err()
                        || stdin.flush().await.is_err()
                    {
                        warn!("host process stdin closed");
                        break;
                    }
                }
            })
        };

        // child.stdout → bus
        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) => bus.post(envelope),
                        Err(e) => warn!("ignoring malformed line from host: {e}"),
                    }
                }
                warn!("host process closed its stdout");
            })
        };

        info!(relay = %relay_id, "host process started");
        Ok(Self {
            relay_id,
            tasks: vec![writer, reader],
            child: Some(child),
            stop,
        })
    }

    /// Deliver what is already on the bus, then stop relaying. A child host gets
    /// [`SHUTDOWN_GRACE`] to exit before it is killed.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        let mut tasks = std::mem::take(&mut self.tasks).into_iter();
        if let Some(bus_side) = tasks.next() {
            let abort = bus_side.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, bus_side).await.is_err() {
                abort.abort();
            }
        }
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "host process exited"),
                Ok(Err(e)) => warn!("could not wait for host process: {e}"),
                Err(_) => {
                    warn!("host process did not exit in time; killing it");
                    if let Err(e) = child.kill().await {
                        warn!("could not kill host process: {e}");
                    }
                }
            }
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Decode and run one relay-bound envelope. Requests produce a reply; notifications
/// and stray replies do not.
pub async fn dispatch(handler: &dyn HostHandler, envelope: Envelope) -> Option<Envelope> {
    match &envelope.body {
        Body::Request { action, args } => {
            let outcome = match HostRequest::from_parts(action, args.clone()) {
                Ok(request) => Outcome::from(handler.handle(request).await),
                Err(failure) => Outcome::Error(failure),
            };
            Some(envelope.reply(outcome))
        }
        Body::Notify { action, args } => {
            match HostRequest::from_parts(action, args.clone()) {
                Ok(request) => {
                    if let Err(e) = handler.handle(request).await {
                        warn!(action = %action, "notification failed: {e}");
                    }
                }
                Err(e) => warn!(action = %action, "bad notification: {e}"),
            }
            None
        }
        Body::Reply { .. } => None,
    }
}

/// Run `handler` as a host process: envelopes in on stdin, replies out on stdout.
/// Returns on EOF or once `shutdown` is cancelled.
pub async fn serve_stdio(handler: Arc<dyn HostHandler>, shutdown: CancellationToken) -> Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = out_rx.recv().await {
            let Ok(line) = serde_json::to_string(&envelope) else {
                continue;
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let envelope = match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("ignoring malformed request line: {e}");
                continue;
            }
        };
        let handler = Arc::clone(&handler);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = dispatch(handler.as_ref(), envelope).await {
                let _ = out_tx.send(reply);
            }
        });
    }

    // let in-flight replies (the exit acknowledgement included) drain
    drop(out_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(500), writer).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationChannel;
    use crate::error::{BridgeError, HostFailureKind};
    use crate::host::{FsHost, ScriptSource, Selection};
    use crate::message::ScriptCatalogue;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn host() -> Arc<FsHost> {
        let mut scripts = ScriptCatalogue::new();
        scripts.insert("df".into(), "let DFS = #{};".into());
        Arc::new(FsHost::new(
            Selection { files: vec!["/data/a.csv".into()], directories: vec![] },
            ScriptSource::Inline(scripts),
        ))
    }

    #[tokio::test]
    async fn in_process_relay_round_trip() {
        let bus = Bus::new(64);
        let _relay = Relay::in_process(bus.clone(), "relay", host());
        let channel = CorrelationChannel::new(bus, "relay", Some(Duration::from_secs(2)));

        let picked = channel.send("fs", "pick-files", Value::Null).await.unwrap();
        assert_eq!(picked, json!([{"filepath": "/data/a.csv", "filename": "a.csv"}]));

        let scripts = channel.send("py", "request-scripts", Value::Null).await.unwrap();
        assert_eq!(scripts["df"], "let DFS = #{};");
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_not_dropped() {
        let bus = Bus::new(64);
        let _relay = Relay::in_process(bus.clone(), "relay", host());
        let channel = CorrelationChannel::new(bus, "relay", Some(Duration::from_secs(2)));

        let err = channel.send("fs", "format-disk", Value::Null).await.unwrap_err();
        match err {
            BridgeError::Host { failure, .. } => assert_eq!(failure.kind, HostFailureKind::InvalidRequest),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let fs_host = host();
        let token = fs_host.shutdown_token();
        let envelope = Envelope::notify("ops", "relay", "exit-app", Value::Null);
        assert!(dispatch(fs_host.as_ref(), envelope).await.is_none());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_delivers_queued_notifications() {
        let fs_host = host();
        let token = fs_host.shutdown_token();
        let bus = Bus::new(64);
        let relay = Relay::in_process(bus.clone(), "relay", fs_host);
        let channel = CorrelationChannel::new(bus, "relay", None);

        channel.notify("ops", "exit-app", Value::Null);
        relay.shutdown().await;
        assert!(token.is_cancelled());
    }
}
