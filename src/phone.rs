//! Phone session: the SMS store plus the bridge to the host.
//!
//! Sending a text records it locally, then asks the host to post a prompt
//! that makes the character answer between reply markers. Host output is
//! fed back through [`Phone::ingest_host_reply`], which keeps only the
//! marked part.

use regex::Regex;
use serde_json::{json, Map};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument};

use crate::client::BridgeClient;
use crate::contact::Character;
use crate::error::{BridgeError, PhoneError, StoreError};
use crate::protocol::NotificationLevel;
use crate::sms::{Message, SmsStore};

pub const REPLY_START: &str = "[SMS REPLY START]";
pub const REPLY_END: &str = "[SMS REPLY END]";

fn reply_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[SMS REPLY START\](.*?)\[SMS REPLY END\]").expect("reply marker regex")
    })
}

/// The prompt posted to the host chat for an outgoing text.
pub fn sms_prompt(contact: &str, text: &str) -> String {
    format!(
        "(Text message to {contact}: \"{text}\")\n\
         \n\
         Reply as {contact}. Your reply is delivered to the user as a text message.\n\
         \n\
         {REPLY_START}\n\
         (write the text message here)\n\
         {REPLY_END}\n\
         \n\
         Keep your normal chat reply separate from the text message."
    )
}

/// The first marked reply in `text`, trimmed. Blank replies count as none.
pub fn extract_reply(text: &str) -> Option<&str> {
    reply_pattern()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

/// `text` with every marked reply block removed, for cleaning the host
/// transcript once the reply has been taken out.
pub fn strip_reply(text: &str) -> String {
    reply_pattern().replace_all(text, "").trim().to_string()
}

pub struct Phone {
    client: Arc<BridgeClient>,
    store: SmsStore,
}

impl Phone {
    pub fn new(client: Arc<BridgeClient>, store: SmsStore) -> Self {
        Self { client, store }
    }

    pub fn store(&self) -> &SmsStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SmsStore {
        &mut self.store
    }

    /// Record an outgoing text and hand the reply prompt to the host. If the
    /// host cannot be reached the text stays recorded and the error is
    /// returned.
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub async fn send_sms(&mut self, contact: &str, text: &str) -> Result<Message, PhoneError> {
        if text.trim().is_empty() {
            return Err(BridgeError::Validation("message text is empty".into()).into());
        }
        let message = self.store.add_message(contact, text, true)?;

        let mut metadata = Map::new();
        metadata.insert("contact".into(), json!(contact));
        metadata.insert("messageId".into(), json!(message.id));
        let receipt = self
            .client
            .send_message(&sms_prompt(contact, text), metadata)
            .await?;
        debug!(method = %receipt.method, "sms prompt delivered");
        Ok(message)
    }

    /// Record the marked reply in `host_output` as an unread message from
    /// `contact`. Output without a marked reply is ignored.
    pub fn ingest_host_reply(&mut self, contact: &str, host_output: &str) -> Result<Option<Message>, StoreError> {
        let Some(reply) = extract_reply(host_output) else {
            return Ok(None);
        };
        let message = self.store.add_message(contact, reply, false)?;
        info!(contact, unread = self.store.unread_count(contact), "sms reply received");
        Ok(Some(message))
    }

    /// Tell the host about unread texts. Best effort.
    pub async fn announce_unread(&self) {
        let unread = self.store.total_unread_count();
        if unread > 0 {
            self.client
                .notify(&format!("{unread} unread text message(s)"), NotificationLevel::Info)
                .await;
        }
    }

    pub async fn refresh_contacts(&self) -> Result<Vec<Character>, BridgeError> {
        self.client.characters().await
    }
}
