//! Contacts shown in the phone UI.
//!
//! The name is the only key. Phone number, presence and avatar are display
//! data derived deterministically from the name so that the same character
//! always looks the same across sessions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const AVATARS: [&str; 12] = [
    "👑", "❄️", "🐕", "👓", "🌸", "🎀", "🐱", "🦊", "🐰", "🦋", "✨", "⭐",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Busy,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub phone: String,
    pub status: PresenceStatus,
    pub avatar: String,
}

impl Contact {
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let digest = blake3::hash(name.as_bytes());
        let bytes = digest.as_bytes();
        let word = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]) % 10_000;

        let status = match bytes[4] % 4 {
            0 | 1 => PresenceStatus::Online,
            2 => PresenceStatus::Busy,
            _ => PresenceStatus::Offline,
        };
        let avatar = AVATARS[bytes[5] as usize % AVATARS.len()].to_string();

        Self {
            phone: format!("090-{:04}-{:04}", word(0), word(2)),
            status,
            avatar,
            name,
        }
    }
}

/// A contact as reported by the host, with whatever extra stats it keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    #[serde(flatten)]
    pub contact: Contact,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Character {
    pub fn new(name: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            contact: Contact::from_name(name),
            metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.contact.name
    }
}

/// Built-in roster used when the host exposes no characters at all.
pub fn default_roster() -> Vec<Character> {
    let entry = |name: &str, phone: &str, status, avatar: &str| {
        let mut metadata = Map::new();
        metadata.insert("好感度".into(), Value::from(0));
        metadata.insert("警戒度".into(), Value::from(0));
        Character {
            contact: Contact {
                name: name.into(),
                phone: phone.into(),
                status,
                avatar: avatar.into(),
            },
            metadata,
        }
    };
    vec![
        entry("西园寺爱丽莎", "090-1234-0001", PresenceStatus::Online, "👑"),
        entry("月咏深雪", "090-1234-0002", PresenceStatus::Online, "❄️"),
        entry("犬冢夏美", "090-1234-0003", PresenceStatus::Busy, "🐕"),
        entry("阿宅君", "090-1234-0004", PresenceStatus::Offline, "👓"),
    ]
}
