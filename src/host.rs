//! Host-side capabilities.
//!
//! The host page may or may not expose a helper API, and may or may not have
//! a chat composer we can drive. Both are optional and probed on use: a
//! probe returns [`Capability::Available`] with the handle, or
//! [`Capability::Unavailable`] with the reason, and the strategy chains
//! consume that instead of checking for the handle themselves.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::contact::Character;
use crate::protocol::NotificationLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability<T> {
    Available(T),
    Unavailable(&'static str),
}

impl<T> Capability<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }

    /// The handle, or the unavailability reason as a strategy failure.
    pub fn require(self) -> Result<T, String> {
        match self {
            Capability::Available(handle) => Ok(handle),
            Capability::Unavailable(reason) => Err(reason.to_string()),
        }
    }
}

/// One line of the host chat transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub role: String,
    pub text: String,
}

/// The official host helper API.
pub trait HostHelper: Send + Sync {
    /// Whether the helper finished initialising.
    fn is_ready(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        None
    }

    fn create_chat_message(&self, text: &str, metadata: &Map<String, Value>) -> Result<(), String>;

    /// Ask the host to generate the next reply.
    fn trigger_generation(&self) -> Result<(), String>;

    fn chat_variables(&self) -> Result<Value, String>;

    /// Characters the host tracks itself, if it has such a list.
    fn characters(&self) -> Result<Vec<Character>, String> {
        Err("host helper has no character list".into())
    }

    fn recent_messages(&self, _count: usize) -> Result<Vec<ChatLine>, String> {
        Ok(Vec::new())
    }

    fn notify(&self, level: NotificationLevel, message: &str) -> Result<(), String>;
}

/// Generic manipulation of the host chat input box.
pub trait ChatComposer: Send + Sync {
    fn fill(&self, text: &str) -> Result<(), String>;

    fn click_send(&self) -> Result<(), String>;

    fn press_enter(&self) -> Result<(), String>;
}

#[derive(Clone, Default)]
pub struct HostEnvironment {
    helper: Option<Arc<dyn HostHelper>>,
    composer: Option<Arc<dyn ChatComposer>>,
}

impl HostEnvironment {
    /// An environment with no host surfaces at all.
    pub fn headless() -> Self {
        Self::default()
    }

    pub fn with_helper(mut self, helper: Arc<dyn HostHelper>) -> Self {
        self.helper = Some(helper);
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn ChatComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn helper(&self) -> Capability<&dyn HostHelper> {
        match &self.helper {
            None => Capability::Unavailable("host helper not present"),
            Some(h) if !h.is_ready() => Capability::Unavailable("host helper not ready"),
            Some(h) => Capability::Available(h.as_ref()),
        }
    }

    pub fn composer(&self) -> Capability<&dyn ChatComposer> {
        match &self.composer {
            None => Capability::Unavailable("chat composer not found"),
            Some(c) => Capability::Available(c.as_ref()),
        }
    }
}
