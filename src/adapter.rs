//! Host-side adapter: turns bridge requests into best-effort host actions.
//!
//! Every admitted request id gets exactly one response. Requests from an
//! untrusted origin, frames that are not requests, and replayed ids are
//! dropped before any work starts. Work runs on a blocking worker under a
//! processing limit so a stuck or panicking host action still ends in an
//! error response.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::contact::{default_roster, Character};
use crate::error::{BridgeError, Result};
use crate::host::{Capability, HostEnvironment};
use crate::protocol::{
    CharacterList, Delivery, Diagnostics, Notification, NotificationReceipt, RefId, Request,
    RequestKind, Response, SendMessage, SendReceipt, Variables,
};
use crate::strategy::{describe_failures, guarded, ChainOutcome, StrategyChain};
use crate::transport::{Inbound, Origin, Outbound};

pub const DEFAULT_PROCESSING_LIMIT: Duration = Duration::from_secs(8);
pub const DEFAULT_LEDGER_CAPACITY: usize = 1024;

/// Keys probed, in order, for a roster inside the host's chat variables.
const ROSTER_PATHS: [&[&str]; 4] = [
    &["stat_data", "角色"],
    &["stat_data", "characters"],
    &["角色"],
    &["characters"],
];

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Only requests posted by this origin are processed.
    pub trusted_origin: Origin,
    pub processing_limit: Duration,
    pub ledger_capacity: usize,
}

impl AdapterConfig {
    pub fn new(trusted_origin: Origin) -> Self {
        Self {
            trusted_origin,
            processing_limit: DEFAULT_PROCESSING_LIMIT,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

// ── Request ledger ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    InProgress,
    RespondedOk,
    RespondedError,
}

impl RequestState {
    fn is_terminal(self) -> bool {
        matches!(self, RequestState::RespondedOk | RequestState::RespondedError)
    }
}

/// Remembers the state of recent request ids, oldest evicted first.
struct Ledger {
    states: HashMap<RefId, RequestState>,
    order: VecDeque<RefId>,
    capacity: usize,
}

impl Ledger {
    fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a new id; false if it was seen before.
    fn admit(&mut self, id: RefId) -> bool {
        if self.states.contains_key(&id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            // Never forget a request that still owes a response.
            let Some(pos) = self
                .order
                .iter()
                .position(|old| self.states.get(old).is_some_and(|s| s.is_terminal()))
            else {
                break;
            };
            if let Some(old) = self.order.remove(pos) {
                self.states.remove(&old);
            }
        }
        self.states.insert(id, RequestState::Received);
        self.order.push_back(id);
        true
    }

    fn set(&mut self, id: RefId, state: RequestState) {
        if let Some(s) = self.states.get_mut(&id) {
            *s = state;
        }
    }

    fn in_flight(&self) -> usize {
        self.states.values().filter(|s| !s.is_terminal()).count()
    }
}

// ── Adapter ───────────────────────────────────────────────────────────

type SendChain = StrategyChain<HostEnvironment, SendMessage, ()>;
type CharacterChain = StrategyChain<HostEnvironment, (), Vec<Character>>;

pub struct HostAdapter {
    config: AdapterConfig,
    env: HostEnvironment,
    send_chain: SendChain,
    character_chain: CharacterChain,
    ledger: Mutex<Ledger>,
}

impl HostAdapter {
    pub fn new(config: AdapterConfig, env: HostEnvironment) -> Self {
        let ledger = Mutex::new(Ledger::new(config.ledger_capacity));
        Self {
            config,
            env,
            send_chain: default_send_chain(),
            character_chain: default_character_chain(),
            ledger,
        }
    }

    /// Add a character source after the structured host sources and before
    /// the built-in roster, e.g. a transcript heuristic for one host.
    pub fn with_character_source<F>(mut self, name: &'static str, source: F) -> Self
    where
        F: Fn(&HostEnvironment) -> std::result::Result<Vec<Character>, String> + Send + Sync + 'static,
    {
        self.character_chain
            .push(name, move |env: &HostEnvironment, _: &()| non_empty(source(env)?));
        self
    }

    pub fn send_strategies(&self) -> Vec<&'static str> {
        self.send_chain.names()
    }

    pub fn character_strategies(&self) -> Vec<&'static str> {
        self.character_chain.names()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve requests from `inbound` until it closes, then wait for the
    /// responses still being produced.
    pub async fn serve(self: Arc<Self>, outbound: Arc<dyn Outbound>, mut inbound: mpsc::Receiver<Inbound>) {
        info!(trusted = %self.config.trusted_origin, "host adapter serving");
        let mut tasks = JoinSet::new();
        while let Some(msg) = inbound.recv().await {
            while tasks.try_join_next().is_some() {}
            let Some(request) = self.admit(msg) else {
                continue;
            };
            let adapter = Arc::clone(&self);
            let outbound = Arc::clone(&outbound);
            tasks.spawn(async move {
                let id = request.id;
                let response = adapter.process(request).await;
                let frame = match response.encode() {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(id, error = %e, "could not encode response");
                        return;
                    }
                };
                if let Err(e) = outbound.post(frame).await {
                    warn!(id, error = %e, "could not deliver response");
                }
            });
        }
        info!(pending = tasks.len(), "host adapter inbound closed");
        while tasks.join_next().await.is_some() {}
    }

    /// Origin check, parse and replay check. `None` means drop silently.
    pub fn admit(&self, msg: Inbound) -> Option<Request> {
        if msg.origin != self.config.trusted_origin {
            warn!(origin = %msg.origin, "dropping request from untrusted origin");
            return None;
        }
        let request = match Request::decode(&msg.frame) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "dropping malformed request");
                return None;
            }
        };
        if !self.ledger().admit(request.id) {
            warn!(id = request.id, "dropping replayed request id");
            return None;
        }
        debug!(id = request.id, kind = %request.kind, "request received");
        Some(request)
    }

    /// Run an admitted request to its single terminal response.
    pub async fn process(self: &Arc<Self>, request: Request) -> Response {
        let id = request.id;
        let kind = request.kind;
        self.ledger().set(id, RequestState::InProgress);

        let adapter = Arc::clone(self);
        let work = tokio::task::spawn_blocking(move || adapter.handle(request));
        let response = match tokio::time::timeout(self.config.processing_limit, work).await {
            Ok(Ok(response)) => response,
            Ok(Err(join_err)) => {
                warn!(id, %kind, error = %join_err, "host action aborted");
                degraded(id, kind, "host action aborted".into())
            }
            Err(_) => {
                warn!(id, %kind, limit = ?self.config.processing_limit, "host action overran");
                degraded(
                    id,
                    kind,
                    format!("host action exceeded {}ms", self.config.processing_limit.as_millis()),
                )
            }
        };

        let state = if response.is_ok() {
            RequestState::RespondedOk
        } else {
            RequestState::RespondedError
        };
        self.ledger().set(id, state);
        debug!(id, %kind, ?state, "request finished");
        response
    }

    /// Perform one request synchronously.
    #[instrument(skip(self, request), fields(id = request.id, kind = %request.kind))]
    pub fn handle(&self, request: Request) -> Response {
        let id = request.id;
        let outcome = match request.kind {
            RequestKind::SendMessage => SendMessage::from_payload(&request.payload)
                .and_then(|msg| self.send_message(&msg))
                .map(|r| Response::ok(id, r)),
            RequestKind::GetCharacters => Ok(Response::ok(id, self.characters())),
            RequestKind::GetVariables => Ok(Response::ok(id, self.variables())),
            RequestKind::ShowNotification => Notification::from_payload(&request.payload)
                .map(|n| Response::ok(id, self.show_notification(&n))),
            RequestKind::Diagnostics => Ok(Response::ok(id, self.diagnostics())),
        };
        outcome.unwrap_or_else(|e| Response::failed(id, &e))
    }

    pub fn send_message(&self, msg: &SendMessage) -> Result<SendReceipt> {
        match self.send_chain.run(&self.env, msg) {
            ChainOutcome::Succeeded { strategy, .. } => {
                info!(method = strategy, "message delivered to host");
                Ok(SendReceipt {
                    method: strategy.to_string(),
                })
            }
            ChainOutcome::Exhausted { attempts } => {
                let cause = describe_failures(&attempts);
                warn!(%cause, "no send strategy succeeded");
                Err(BridgeError::ActionFailed(cause))
            }
        }
    }

    /// Never fails: falls back to the built-in roster.
    pub fn characters(&self) -> CharacterList {
        let characters = match self.character_chain.run(&self.env, &()) {
            ChainOutcome::Succeeded { strategy, value } => {
                debug!(source = strategy, count = value.len(), "characters loaded");
                value
            }
            ChainOutcome::Exhausted { attempts } => {
                warn!(cause = %describe_failures(&attempts), "using default roster");
                default_roster()
            }
        };
        CharacterList { characters }
    }

    /// Never fails: an unavailable helper yields an empty object.
    pub fn variables(&self) -> Variables {
        let variables = self
            .env
            .helper()
            .require()
            .and_then(|h| guarded(|| h.chat_variables()))
            .unwrap_or_else(|reason| {
                debug!(%reason, "chat variables unavailable");
                json!({})
            });
        Variables { variables }
    }

    /// Never fails: falls back to a local log line.
    pub fn show_notification(&self, n: &Notification) -> NotificationReceipt {
        let shown = self
            .env
            .helper()
            .require()
            .and_then(|h| guarded(|| h.notify(n.level, &n.message)));
        match shown {
            Ok(()) => NotificationReceipt {
                delivered: Delivery::Host,
            },
            Err(reason) => {
                info!(level = ?n.level, text = %n.message, %reason, "notification shown locally");
                NotificationReceipt {
                    delivered: Delivery::Local,
                }
            }
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let helper = self.env.helper();
        let host_version = match &helper {
            Capability::Available(h) => h.version(),
            Capability::Unavailable(_) => None,
        };
        Diagnostics {
            host_helper: helper.is_available(),
            composer: self.env.composer().is_available(),
            host_version,
            requests_in_flight: self.ledger().in_flight(),
        }
    }
}

/// The response for a request whose host action never finished. Kinds
/// with a total result fall back to it; the rest fail.
fn degraded(id: RefId, kind: RequestKind, cause: String) -> Response {
    match kind {
        RequestKind::GetCharacters => Response::ok(
            id,
            CharacterList {
                characters: default_roster(),
            },
        ),
        RequestKind::GetVariables => Response::ok(id, Variables { variables: json!({}) }),
        RequestKind::ShowNotification => Response::ok(
            id,
            NotificationReceipt {
                delivered: Delivery::Local,
            },
        ),
        RequestKind::SendMessage | RequestKind::Diagnostics => {
            Response::failed(id, &BridgeError::ActionFailed(cause))
        }
    }
}

// ── Default chains ────────────────────────────────────────────────────

fn default_send_chain() -> SendChain {
    StrategyChain::new()
        .then("host-api", |env: &HostEnvironment, msg: &SendMessage| {
            let helper = env.helper().require()?;
            let mut metadata = Map::new();
            metadata.insert("source".into(), json!("phone"));
            metadata.insert("type".into(), json!("sms"));
            metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
            metadata.extend(msg.metadata.clone());
            helper.create_chat_message(&msg.text, &metadata)?;
            // The message is in the chat either way; a missing reply is not a send failure.
            if let Err(reason) = helper.trigger_generation() {
                warn!(%reason, "could not trigger host reply");
            }
            Ok(())
        })
        .then("ui-input", |env: &HostEnvironment, msg: &SendMessage| {
            let composer = env.composer().require()?;
            composer.fill(&msg.text)?;
            composer.click_send()
        })
        .then("key-simulation", |env: &HostEnvironment, msg: &SendMessage| {
            let composer = env.composer().require()?;
            composer.fill(&msg.text)?;
            composer.press_enter()
        })
}

fn default_character_chain() -> CharacterChain {
    StrategyChain::new()
        .then("host-variables", |env: &HostEnvironment, _: &()| {
            let vars = env.helper().require()?.chat_variables()?;
            non_empty(roster_from_variables(&vars).ok_or("no roster in chat variables")?)
        })
        .then("host-roster", |env: &HostEnvironment, _: &()| {
            non_empty(env.helper().require()?.characters()?)
        })
}

fn non_empty(characters: Vec<Character>) -> std::result::Result<Vec<Character>, String> {
    if characters.is_empty() {
        Err("empty roster".into())
    } else {
        Ok(characters)
    }
}

/// Find and convert a roster stored in chat variables. Accepts either an
/// object keyed by name or an array of objects with a `name`/`名称` field.
pub fn roster_from_variables(vars: &Value) -> Option<Vec<Character>> {
    let roster = ROSTER_PATHS
        .iter()
        .find_map(|path| lookup(vars, path))
        .or_else(|| {
            vars.as_object()?
                .iter()
                .find(|(k, _)| k.contains("角色") || k.contains("character"))
                .map(|(_, v)| v)
        })?;

    let characters = match roster {
        Value::Object(entries) => entries
            .iter()
            .map(|(name, data)| Character::new(name.clone(), stats(data)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let name = item
                    .get("name")
                    .or_else(|| item.get("名称"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("角色{}", i + 1));
                Character::new(name, stats(item))
            })
            .collect(),
        _ => return None,
    };
    Some(characters)
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

/// Host stats with the three tracked scores always present.
fn stats(data: &Value) -> Map<String, Value> {
    let mut metadata = data.as_object().cloned().unwrap_or_default();
    for (key, alias) in [("好感度", "favor"), ("警戒度", "alertness"), ("服从度", "obedience")] {
        if !metadata.contains_key(key) {
            let v = data.get(alias).cloned().unwrap_or(json!(0));
            metadata.insert(key.into(), v);
        }
    }
    metadata
}
