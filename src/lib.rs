//! phone-bridge: request/response bridge between an in-page phone UI and
//! its host chat application, plus the phone's local SMS store.
//!
//! The phone side issues typed requests through [`BridgeClient`]; the host
//! side answers them with [`HostAdapter`], which falls back through ordered
//! strategies when a host capability is missing. [`SmsStore`] keeps
//! per-contact threads in a redb-backed local storage namespace.

pub mod adapter;
pub mod client;
pub mod contact;
pub mod error;
pub mod host;
pub mod phone;
pub mod protocol;
pub mod sms;
pub mod storage;
pub mod strategy;
pub mod transport;

pub use adapter::{AdapterConfig, HostAdapter};
pub use client::{BridgeClient, ClientConfig};
pub use contact::{Character, Contact};
pub use error::{BridgeError, ErrorKind, PhoneError, StoreError};
pub use host::HostEnvironment;
pub use phone::Phone;
pub use protocol::{Request, RequestKind, Response};
pub use sms::{Message, RetentionPolicy, SmsStore};
pub use storage::LocalStorage;
pub use transport::{channel_pair, Origin};
