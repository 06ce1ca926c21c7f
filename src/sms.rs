//! Per-contact SMS log with read tracking and bounded retention.
//!
//! The whole store is one blob in [`LocalStorage`], rewritten after every
//! mutation. In-memory state is authoritative: if a write fails the change
//! stays visible and the next successful write carries it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::contact::Contact;
use crate::error::StoreError;
use crate::storage::LocalStorage;

/// Current snapshot (bincode).
pub const STORE_KEY: &str = "phone.sms.v2";
/// Previous single-blob format (JSON, same shape as an export).
pub const LEGACY_STORE_KEY: &str = "phone.sms";
/// Oldest format: one JSON array per contact.
pub const LEGACY_THREAD_PREFIX: &str = "sms_history_";

const SNAPSHOT_VERSION: u32 = 2;

pub const DEFAULT_RETENTION_CEILING: usize = 100;
pub const DEFAULT_RETENTION_FLOOR: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// A thread longer than this is trimmed...
    pub ceiling: usize,
    /// ...down to this many most recent messages.
    pub floor: usize,
}

impl RetentionPolicy {
    pub fn new(ceiling: usize, floor: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            floor: floor.min(ceiling),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_CEILING, DEFAULT_RETENTION_FLOOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub text: String,
    pub from_user: bool,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    fn new(text: &str, from_user: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.to_string(),
            from_user,
            timestamp,
            read: from_user,
        }
    }

    fn is_unread(&self) -> bool {
        !self.read && !self.from_user
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactThread {
    pub messages: Vec<Message>,
    pub unread_count: usize,
    pub last_updated: DateTime<Utc>,
}

impl ContactThread {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            messages: Vec::new(),
            unread_count: 0,
            last_updated: now,
        }
    }

    fn counted_unread(&self) -> usize {
        self.messages.iter().filter(|m| m.is_unread()).count()
    }

    /// Drop the oldest messages once the thread outgrows the ceiling.
    fn trim(&mut self, retention: RetentionPolicy) -> usize {
        if self.messages.len() <= retention.ceiling {
            return 0;
        }
        let excess = self.messages.len() - retention.floor;
        let dropped_unread = self.messages.drain(..excess).filter(Message::is_unread).count();
        self.unread_count = self.unread_count.saturating_sub(dropped_unread);
        excess
    }
}

/// One row of the contact list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub contact: Contact,
    pub unread_count: usize,
    pub last_updated: DateTime<Utc>,
    pub last_message: Option<String>,
}

type Threads = BTreeMap<String, ContactThread>;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    threads: &'a Threads,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    threads: Threads,
}

#[derive(Deserialize)]
struct LegacyEntry {
    content: String,
    #[serde(default)]
    time: Option<String>,
    #[serde(rename = "type")]
    direction: LegacyDirection,
}

#[derive(Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LegacyDirection {
    Sent,
    Received,
}

// ── Store ─────────────────────────────────────────────────────────────

pub struct SmsStore {
    storage: LocalStorage,
    threads: Threads,
    retention: RetentionPolicy,
}

impl SmsStore {
    /// Migrate any legacy data, then load the current snapshot. A snapshot
    /// that fails to decode or validate is logged and replaced by an empty
    /// store in memory; it is only overwritten by the next mutation.
    pub fn open(storage: LocalStorage, retention: RetentionPolicy) -> Result<Self, StoreError> {
        let migrated = migrate_legacy(&storage)?;
        if migrated > 0 {
            info!(messages = migrated, "migrated legacy sms data");
        }

        let threads = match storage.get(STORE_KEY)? {
            None => Threads::new(),
            Some(bytes) => match decode_snapshot(&bytes) {
                Ok(threads) => threads,
                Err(e) => {
                    warn!(error = %e, "stored sms snapshot is unreadable, starting empty");
                    Threads::new()
                }
            },
        };
        debug!(contacts = threads.len(), "sms store loaded");

        Ok(Self {
            storage,
            threads,
            retention,
        })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let bytes = encode_snapshot(&self.threads)?;
        self.storage.put(STORE_KEY, &bytes)
    }

    #[instrument(skip(self, text), fields(len = text.len()))]
    pub fn add_message(&mut self, contact: &str, text: &str, from_user: bool) -> Result<Message, StoreError> {
        if contact.trim().is_empty() {
            return Err(StoreError::Validation("contact name is empty".into()));
        }
        let now = Utc::now();
        let message = Message::new(text, from_user, now);

        let thread = self
            .threads
            .entry(contact.to_string())
            .or_insert_with(|| ContactThread::new(now));
        thread.messages.push(message.clone());
        if !from_user {
            thread.unread_count += 1;
        }
        thread.last_updated = now;
        let trimmed = thread.trim(self.retention);
        if trimmed > 0 {
            debug!(contact, trimmed, "thread trimmed");
        }

        self.persist()?;
        Ok(message)
    }

    /// Mark one message, or the whole thread, as read. Returns how many
    /// messages changed state.
    #[instrument(skip(self))]
    pub fn mark_as_read(&mut self, contact: &str, message_id: Option<Uuid>) -> Result<usize, StoreError> {
        let Some(thread) = self.threads.get_mut(contact) else {
            return Ok(0);
        };
        let had_unread = thread.unread_count;
        let changed = match message_id {
            Some(id) => match thread.messages.iter_mut().find(|m| m.id == id) {
                Some(m) if m.is_unread() => {
                    m.read = true;
                    thread.unread_count = thread.unread_count.saturating_sub(1);
                    1
                }
                _ => 0,
            },
            None => {
                let mut n = 0;
                for m in thread.messages.iter_mut().filter(|m| m.is_unread()) {
                    m.read = true;
                    n += 1;
                }
                thread.unread_count = 0;
                n
            }
        };
        if changed > 0 || had_unread != thread.unread_count {
            self.persist()?;
        }
        Ok(changed)
    }

    /// The most recent `limit` messages, oldest first.
    pub fn conversation(&self, contact: &str, limit: usize) -> Vec<Message> {
        self.threads
            .get(contact)
            .map(|t| {
                let start = t.messages.len().saturating_sub(limit);
                t.messages[start..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn thread(&self, contact: &str) -> Option<&ContactThread> {
        self.threads.get(contact)
    }

    pub fn unread_count(&self, contact: &str) -> usize {
        self.threads.get(contact).map_or(0, |t| t.unread_count)
    }

    pub fn total_unread_count(&self) -> usize {
        self.threads.values().map(|t| t.unread_count).sum()
    }

    /// Threads ordered by most recent activity.
    pub fn contacts(&self) -> Vec<ThreadSummary> {
        let mut rows: Vec<_> = self
            .threads
            .iter()
            .map(|(name, t)| ThreadSummary {
                contact: Contact::from_name(name.as_str()),
                unread_count: t.unread_count,
                last_updated: t.last_updated,
                last_message: t.messages.last().map(|m| m.text.clone()),
            })
            .collect();
        rows.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        rows
    }

    /// Empty one thread. Returns false if the contact has no thread.
    #[instrument(skip(self))]
    pub fn clear_conversation(&mut self, contact: &str) -> Result<bool, StoreError> {
        let Some(thread) = self.threads.get_mut(contact) else {
            return Ok(false);
        };
        thread.messages.clear();
        thread.unread_count = 0;
        self.persist()?;
        Ok(true)
    }

    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.threads.clear();
        self.persist()?;
        info!("sms store reset");
        Ok(())
    }

    /// Full store as JSON, suitable for [`SmsStore::import_all`].
    pub fn export_all(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.threads)?)
    }

    /// Replace the whole store with `data`. Invalid data leaves the current
    /// store untouched. Returns the number of contacts imported.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn import_all(&mut self, data: &str) -> Result<usize, StoreError> {
        let threads: Threads = serde_json::from_str(data)?;
        validate(&threads)?;
        let previous = std::mem::replace(&mut self.threads, threads);
        if let Err(e) = self.persist() {
            self.threads = previous;
            return Err(e);
        }
        info!(contacts = self.threads.len(), "sms store imported");
        Ok(self.threads.len())
    }
}

// ── Encoding ──────────────────────────────────────────────────────────

fn encode_snapshot(threads: &Threads) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(&SnapshotRef {
        version: SNAPSHOT_VERSION,
        threads,
    })?)
}

fn decode_snapshot(bytes: &[u8]) -> Result<Threads, StoreError> {
    let snapshot: Snapshot =
        bincode::deserialize(bytes).map_err(|e| StoreError::Validation(e.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StoreError::Validation(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    validate(&snapshot.threads)?;
    Ok(snapshot.threads)
}

/// Check the unread invariant and message id uniqueness.
fn validate(threads: &Threads) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for (name, thread) in threads {
        if name.trim().is_empty() {
            return Err(StoreError::Validation("empty contact name".into()));
        }
        let counted = thread.counted_unread();
        if thread.unread_count != counted {
            return Err(StoreError::Validation(format!(
                "{name}: unreadCount {} but {counted} unread messages",
                thread.unread_count
            )));
        }
        for m in &thread.messages {
            if !seen.insert(m.id) {
                return Err(StoreError::Validation(format!("duplicate message id {}", m.id)));
            }
        }
    }
    Ok(())
}

// ── Legacy migration ──────────────────────────────────────────────────

/// Fold legacy keys into the current snapshot and delete them in the same
/// transaction. Running it again finds nothing to do. Returns the number of
/// messages migrated. Nothing happens while the current snapshot is
/// unreadable; the first write after that replaces it and the legacy data
/// is folded in on the next open.
pub fn migrate_legacy(storage: &LocalStorage) -> Result<usize, StoreError> {
    let legacy_blob = storage.get(LEGACY_STORE_KEY)?;
    let per_contact = storage.keys_with_prefix(LEGACY_THREAD_PREFIX)?;
    if legacy_blob.is_none() && per_contact.is_empty() {
        return Ok(0);
    }

    // An unreadable snapshot is left alone, legacy keys included, so that
    // nothing is written before the first mutation.
    let mut threads = match storage.get(STORE_KEY)? {
        Some(bytes) => match decode_snapshot(&bytes) {
            Ok(threads) => threads,
            Err(e) => {
                warn!(error = %e, "current sms snapshot unreadable, legacy migration deferred");
                return Ok(0);
            }
        },
        None => Threads::new(),
    };
    let mut migrated = 0;
    let mut consumed = Vec::new();

    if let Some(bytes) = legacy_blob {
        match serde_json::from_slice::<Threads>(&bytes) {
            Ok(old) => {
                for (name, thread) in old {
                    migrated += prepend(&mut threads, &name, thread.messages);
                }
            }
            Err(e) => warn!(error = %e, "legacy sms blob unreadable, discarding"),
        }
        consumed.push(LEGACY_STORE_KEY.to_string());
    }

    for key in per_contact {
        let name = &key[LEGACY_THREAD_PREFIX.len()..];
        let entries = storage
            .get(&key)?
            .map(|bytes| serde_json::from_slice::<Vec<LegacyEntry>>(&bytes));
        match entries {
            Some(Ok(entries)) if !name.is_empty() => {
                let now = Utc::now();
                let messages = entries
                    .into_iter()
                    .map(|e| {
                        let ts = e
                            .time
                            .as_deref()
                            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                            .map_or(now, |t| t.with_timezone(&Utc));
                        Message::new(&e.content, e.direction == LegacyDirection::Sent, ts)
                    })
                    .collect();
                migrated += prepend(&mut threads, name, messages);
            }
            Some(Err(e)) => warn!(%key, error = %e, "legacy sms history unreadable, discarding"),
            _ => {}
        }
        consumed.push(key);
    }

    let bytes = encode_snapshot(&threads)?;
    storage.replace(STORE_KEY, &bytes, &consumed)?;
    Ok(migrated)
}

/// Put older messages in front of a thread, skipping ids it already has.
fn prepend(threads: &mut Threads, name: &str, older: Vec<Message>) -> usize {
    let now = Utc::now();
    let thread = threads
        .entry(name.to_string())
        .or_insert_with(|| ContactThread::new(now));
    let known: HashSet<Uuid> = thread.messages.iter().map(|m| m.id).collect();
    let older: Vec<Message> = older.into_iter().filter(|m| !known.contains(&m.id)).collect();
    let added = older.len();
    if let Some(last) = older.iter().map(|m| m.timestamp).max() {
        thread.last_updated = thread.last_updated.max(last);
    }
    thread.messages.splice(0..0, older);
    thread.unread_count = thread.counted_unread();
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SmsStore {
        let storage = LocalStorage::open(dir.path()).unwrap();
        SmsStore::open(storage, RetentionPolicy::default()).unwrap()
    }

    fn assert_invariant(store: &SmsStore) {
        for (name, thread) in &store.threads {
            assert_eq!(thread.unread_count, thread.counted_unread(), "thread {name}");
        }
    }

    #[test]
    fn test_add_creates_thread_and_counts_unread() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);

        let sent = store.add_message("Mika", "hey", true).unwrap();
        assert!(sent.read);
        let got = store.add_message("Mika", "hi!", false).unwrap();
        assert!(!got.read);
        store.add_message("Rin", "yo", false).unwrap();

        assert_eq!(store.unread_count("Mika"), 1);
        assert_eq!(store.total_unread_count(), 2);
        let convo = store.conversation("Mika", 10);
        assert_eq!(convo.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), vec!["hey", "hi!"]);
        assert_invariant(&store);
    }

    #[test]
    fn test_unread_invariant_over_mixed_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        for i in 0..37 {
            store.add_message("A", &format!("m{i}"), i % 3 == 0).unwrap();
            if i % 10 == 9 {
                let first_unread = store.conversation("A", 100).into_iter().find(|m| !m.read);
                if let Some(m) = first_unread {
                    store.mark_as_read("A", Some(m.id)).unwrap();
                }
            }
            assert_invariant(&store);
        }
    }

    #[test]
    fn test_mark_all_read_leaves_user_messages_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.add_message("Mika", "out", true).unwrap();
        store.add_message("Mika", "in 1", false).unwrap();
        store.add_message("Mika", "in 2", false).unwrap();

        assert_eq!(store.mark_as_read("Mika", None).unwrap(), 2);
        assert_eq!(store.unread_count("Mika"), 0);
        assert!(store.conversation("Mika", 10).iter().all(|m| m.read));
        assert_eq!(store.mark_as_read("Mika", None).unwrap(), 0);
        assert_eq!(store.mark_as_read("Nobody", None).unwrap(), 0);
    }

    #[test]
    fn test_mark_single_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let out = store.add_message("Mika", "out", true).unwrap();
        let a = store.add_message("Mika", "a", false).unwrap();
        store.add_message("Mika", "b", false).unwrap();

        assert_eq!(store.mark_as_read("Mika", Some(out.id)).unwrap(), 0);
        assert_eq!(store.mark_as_read("Mika", Some(a.id)).unwrap(), 1);
        assert_eq!(store.mark_as_read("Mika", Some(a.id)).unwrap(), 0);
        assert_eq!(store.mark_as_read("Mika", Some(Uuid::new_v4())).unwrap(), 0);
        assert_eq!(store.unread_count("Mika"), 1);
        assert_invariant(&store);
    }

    #[test]
    fn test_trim_keeps_most_recent_fifty_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        for i in 0..100 {
            store.add_message("Mika", &format!("m{i}"), false).unwrap();
        }
        assert_eq!(store.conversation("Mika", 1000).len(), 100);

        store.add_message("Mika", "m100", false).unwrap();
        let convo = store.conversation("Mika", 1000);
        assert_eq!(convo.len(), 50);
        let expected: Vec<String> = (51..=100).map(|i| format!("m{i}")).collect();
        assert_eq!(convo.iter().map(|m| m.text.clone()).collect::<Vec<_>>(), expected);
        assert_eq!(store.unread_count("Mika"), 50);
        assert_invariant(&store);
    }

    #[test]
    fn test_conversation_limit_and_missing_thread() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        for i in 0..5 {
            store.add_message("Mika", &format!("m{i}"), true).unwrap();
        }
        let last_two = store.conversation("Mika", 2);
        assert_eq!(last_two[0].text, "m3");
        assert_eq!(last_two[1].text, "m4");
        assert!(store.conversation("Nobody", 5).is_empty());
        assert!(store.conversation("Mika", 0).is_empty());
    }

    #[test]
    fn test_clear_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.add_message("Mika", "x", false).unwrap();
        assert!(store.clear_conversation("Mika").unwrap());
        assert!(store.conversation("Mika", 10).is_empty());
        assert_eq!(store.unread_count("Mika"), 0);
        assert!(store.thread("Mika").is_some());
        assert!(!store.clear_conversation("Nobody").unwrap());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let mut store = open_store(&dir);
            let a = store.add_message("Mika", "first", true).unwrap();
            let b = store.add_message("Mika", "second", false).unwrap();
            (a, b)
        };
        let store = open_store(&dir);
        assert_eq!(store.conversation("Mika", 10), vec![a, b]);
        assert_eq!(store.total_unread_count(), 1);
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.add_message("Mika", "out", true).unwrap();
        store.add_message("Mika", "in", false).unwrap();
        store.add_message("Rin", "in", false).unwrap();
        store.mark_as_read("Rin", None).unwrap();
        let exported = store.export_all().unwrap();
        let before = store.threads.clone();

        let other_dir = tempfile::tempdir().unwrap();
        let mut other = open_store(&other_dir);
        other.add_message("Stale", "gone after import", false).unwrap();
        assert_eq!(other.import_all(&exported).unwrap(), 2);
        assert_eq!(other.threads, before);
        assert!(other.thread("Stale").is_none());
        drop(other);

        let reopened = open_store(&other_dir);
        assert_eq!(reopened.threads, before);
    }

    #[test]
    fn test_export_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.add_message("Mika", "in", false).unwrap();
        let v: serde_json::Value = serde_json::from_str(&store.export_all().unwrap()).unwrap();
        assert_eq!(v["Mika"]["unreadCount"], 1);
        assert_eq!(v["Mika"]["messages"][0]["fromUser"], false);
        assert!(v["Mika"]["lastUpdated"].is_string());
    }

    #[test]
    fn test_bad_import_keeps_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.add_message("Mika", "keep me", false).unwrap();
        let before = store.threads.clone();

        assert!(matches!(store.import_all("{ not json"), Err(StoreError::Validation(_))));

        let inconsistent = r#"{ "X": { "messages": [], "unreadCount": 3, "lastUpdated": "2024-01-01T00:00:00Z" } }"#;
        assert!(matches!(store.import_all(inconsistent), Err(StoreError::Validation(_))));

        let id = Uuid::new_v4();
        let dup = format!(
            r#"{{ "X": {{ "messages": [
                {{ "id": "{id}", "text": "a", "fromUser": true, "timestamp": "2024-01-01T00:00:00Z", "read": true }},
                {{ "id": "{id}", "text": "b", "fromUser": true, "timestamp": "2024-01-01T00:00:01Z", "read": true }}
            ], "unreadCount": 0, "lastUpdated": "2024-01-01T00:00:01Z" }} }}"#
        );
        assert!(matches!(store.import_all(&dup), Err(StoreError::Validation(_))));

        assert_eq!(store.threads, before);
        drop(store);
        assert_eq!(open_store(&dir).threads, before);
    }

    #[test]
    fn test_corrupt_snapshot_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LocalStorage::open(dir.path()).unwrap();
            storage.put(STORE_KEY, b"\x07garbage").unwrap();
        }
        let mut store = open_store(&dir);
        assert_eq!(store.total_unread_count(), 0);
        store.add_message("Mika", "fresh", false).unwrap();
        drop(store);
        assert_eq!(open_store(&dir).unread_count("Mika"), 1);
    }

    #[test]
    fn test_contacts_sorted_by_recency() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.add_message("Old", "a", false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.add_message("New", "b", true).unwrap();
        let rows = store.contacts();
        assert_eq!(rows[0].contact.name, "New");
        assert_eq!(rows[0].last_message.as_deref(), Some("b"));
        assert_eq!(rows[1].unread_count, 1);
    }

    #[test]
    fn test_reset_and_empty_contact() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.add_message("Mika", "x", false).unwrap();
        store.reset().unwrap();
        assert_eq!(store.total_unread_count(), 0);
        assert!(store.add_message("  ", "x", true).is_err());
        drop(store);
        assert!(open_store(&dir).contacts().is_empty());
    }

    #[test]
    fn test_migration_is_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LocalStorage::open(dir.path()).unwrap();
            storage
                .put(
                    "sms_history_Mika",
                    br#"[{"content":"hello","time":"10:31","type":"sent"},
                         {"content":"hi back","time":"10:32","type":"received"}]"#,
                )
                .unwrap();
            let legacy_id = Uuid::new_v4();
            let blob = format!(
                r#"{{ "Rin": {{ "messages": [
                    {{ "id": "{legacy_id}", "text": "old", "fromUser": false, "timestamp": "2024-05-01T08:00:00Z", "read": false }}
                ], "unreadCount": 1, "lastUpdated": "2024-05-01T08:00:00Z" }} }}"#
            );
            storage.put(LEGACY_STORE_KEY, blob.as_bytes()).unwrap();
        }

        let store = open_store(&dir);
        let mika = store.conversation("Mika", 10);
        assert_eq!(mika.len(), 2);
        assert!(mika[0].from_user && mika[0].read);
        assert!(!mika[1].from_user && !mika[1].read);
        assert_eq!(store.unread_count("Rin"), 1);
        assert_eq!(store.total_unread_count(), 2);
        assert_invariant(&store);
        let first = store.threads.clone();
        drop(store);

        let storage = LocalStorage::open(dir.path()).unwrap();
        assert_eq!(migrate_legacy(&storage).unwrap(), 0);
        assert!(storage.get(LEGACY_STORE_KEY).unwrap().is_none());
        assert!(storage.keys_with_prefix(LEGACY_THREAD_PREFIX).unwrap().is_empty());
        drop(storage);

        assert_eq!(open_store(&dir).threads, first);
    }

    #[test]
    fn test_migration_merges_into_existing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let current = {
            let mut store = open_store(&dir);
            store.add_message("Mika", "newer", true).unwrap()
        };
        {
            let storage = LocalStorage::open(dir.path()).unwrap();
            storage
                .put(
                    "sms_history_Mika",
                    br#"[{"content":"older","time":"2024-01-01T00:00:00Z","type":"received"}]"#,
                )
                .unwrap();
        }
        let store = open_store(&dir);
        let convo = store.conversation("Mika", 10);
        assert_eq!(convo.len(), 2);
        assert_eq!(convo[0].text, "older");
        assert_eq!(convo[1], current);
        assert_eq!(store.unread_count("Mika"), 1);
    }

    #[test]
    fn test_migration_waits_for_unreadable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LocalStorage::open(dir.path()).unwrap();
            storage.put(STORE_KEY, b"\x07garbage").unwrap();
            storage
                .put("sms_history_Mika", br#"[{"content":"kept","type":"received"}]"#)
                .unwrap();
        }
        {
            let store = open_store(&dir);
            assert!(store.thread("Mika").is_none());
            let raw = store.storage.get(STORE_KEY).unwrap();
            assert_eq!(raw.as_deref(), Some(&b"\x07garbage"[..]));
            assert!(store.storage.get("sms_history_Mika").unwrap().is_some());
        }
        {
            let mut store = open_store(&dir);
            store.add_message("Rin", "hello", true).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.conversation("Mika", 10)[0].text, "kept");
        assert_eq!(store.unread_count("Mika"), 1);
        assert_eq!(store.conversation("Rin", 10).len(), 1);
    }
}
