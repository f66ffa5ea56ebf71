//! Alumni Chat Core Library
//!
//! Real-time message delivery and unread sync for the alumni chat feature.
//! Provides: transport, conversation store, reconciliation, unread tracking,
//! and the session facade screens subscribe to.

pub mod config;
pub mod error;
pub mod models;
pub mod network;
pub mod reconciler;
pub mod session;
pub mod storage;
pub mod store;
pub mod transport;
pub mod unread;

pub use config::*;
pub use error::*;
pub use models::*;
pub use network::{ApiClient, ChatApi, OutgoingMessage};
pub use reconciler::{LiveEvent, MessageReconciler, ReconcileOutcome};
pub use session::{ChatSession, Listener, ListenerId, PendingSend, UpdateFilter};
pub use storage::{LocalStorage, CURRENT_USER_KEY};
pub use store::{ConversationStore, UpsertOutcome};
pub use transport::{Backoff, ConnectionManager, EventHandler, Transport, TransportEvent};
pub use unread::{IncomingEffect, UnreadState, UnreadTracker};
