//! Phone-side bridge client.
//!
//! Each call gets a fresh correlation id and a pending entry holding the
//! reply channel. Responses are matched by id only, so any number of calls
//! can be in flight and replies may arrive in any order. A response whose
//! id has no pending entry (late, duplicate, forged) is dropped.

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::contact::Character;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    CharacterList, Diagnostics, Notification, NotificationLevel, RefId, Request, RequestKind,
    Response, SendReceipt, Variables,
};
use crate::transport::{Inbound, Origin, Outbound};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Only responses posted by this origin are accepted.
    pub host_origin: Origin,
    pub default_timeout: Duration,
}

impl ClientConfig {
    pub fn new(host_origin: Origin) -> Self {
        Self {
            host_origin,
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

struct PendingCall {
    kind: RequestKind,
    created_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

type PendingMap = Mutex<HashMap<RefId, PendingCall>>;

/// Removes the pending entry however the call ends: response, timeout,
/// transport failure, or the caller dropping the future.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: RefId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<RefId, PendingCall>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BridgeClient {
    config: ClientConfig,
    outbound: Arc<dyn Outbound>,
    next_id: AtomicU64,
    pending: PendingMap,
}

impl BridgeClient {
    pub fn new(config: ClientConfig, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            config,
            outbound,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Build a client and spawn the task that feeds it inbound frames.
    /// The client is closed when `inbound` ends.
    pub fn connect(
        config: ClientConfig,
        outbound: Arc<dyn Outbound>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Arc<Self> {
        let client = Arc::new(Self::new(config, outbound));
        tokio::spawn(Arc::clone(&client).run(inbound));
        client
    }

    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) {
        while let Some(msg) = inbound.recv().await {
            self.dispatch(msg);
        }
        info!("bridge inbound closed");
        self.close();
    }

    /// Issue a request and wait for its response or the deadline.
    pub async fn call(&self, kind: RequestKind, payload: Value, timeout: Duration) -> Result<Value> {
        if timeout.is_zero() {
            return Err(BridgeError::Validation("timeout must be positive".into()));
        }
        kind.validate_payload(&payload)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Request { id, kind, payload }.encode()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            debug_assert!(!pending.contains_key(&id));
            pending.insert(
                id,
                PendingCall {
                    kind,
                    created_at: Instant::now(),
                    reply: tx,
                },
            );
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        debug!(id, %kind, "sending request");
        // The deadline covers delivery too: a backed-up transport must not
        // hold the call past its timeout.
        let exchange = async {
            self.outbound.post(frame).await?;
            rx.await
                .unwrap_or_else(|_| Err(BridgeError::Transport("bridge client closed".into())))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(id, %kind, ?timeout, "request timed out");
                Err(BridgeError::Timeout { id, after: timeout })
            }
        }
    }

    /// Handle one inbound frame. Frames from other origins, frames that are
    /// not well-formed responses, and responses nobody is waiting for are
    /// dropped without affecting any pending call.
    pub fn dispatch(&self, msg: Inbound) {
        if msg.origin != self.config.host_origin {
            warn!(origin = %msg.origin, "dropping frame from untrusted origin");
            return;
        }
        let response = match Response::decode(&msg.frame) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "dropping malformed response");
                return;
            }
        };
        let Some(call) = lock(&self.pending).remove(&response.id) else {
            debug!(id = response.id, "dropping unmatched response");
            return;
        };
        debug!(
            id = response.id,
            kind = %call.kind,
            elapsed = ?call.created_at.elapsed(),
            ok = response.is_ok(),
            "response matched"
        );
        // The caller may have given up already; nothing to do then.
        let _ = call.reply.send(response.into_result());
    }

    /// Fail every pending call with a transport error.
    pub fn close(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (id, call) in drained {
            debug!(id, kind = %call.kind, "failing pending call on close");
            let _ = call
                .reply
                .send(Err(BridgeError::Transport("bridge closed".into())));
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    async fn call_typed<T: DeserializeOwned>(&self, kind: RequestKind, payload: Value) -> Result<T> {
        let value = self.call(kind, payload, self.config.default_timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    // ── Typed operations ──────────────────────────────────────────────

    pub async fn send_message(&self, text: &str, metadata: Map<String, Value>) -> Result<SendReceipt> {
        self.call_typed(
            RequestKind::SendMessage,
            json!({ "text": text, "metadata": metadata }),
        )
        .await
    }

    pub async fn characters(&self) -> Result<Vec<Character>> {
        let list: CharacterList = self.call_typed(RequestKind::GetCharacters, json!({})).await?;
        Ok(list.characters)
    }

    pub async fn variables(&self) -> Result<Value> {
        let vars: Variables = self.call_typed(RequestKind::GetVariables, json!({})).await?;
        Ok(vars.variables)
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        self.call_typed(RequestKind::Diagnostics, json!({})).await
    }

    /// Best effort: failures are logged locally and never returned.
    pub async fn notify(&self, message: &str, level: NotificationLevel) {
        let payload = Notification {
            message: message.to_string(),
            level,
        };
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "could not encode notification");
                return;
            }
        };
        if let Err(e) = self
            .call(RequestKind::ShowNotification, payload, self.config.default_timeout)
            .await
        {
            info!(error = %e, ?level, text = message, "host notification unavailable, shown locally");
        }
    }
}
