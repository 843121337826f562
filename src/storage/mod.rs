//! Config store: typed records, versioned migration and persistence.
//!
//! [`ConfigManager`] is the only writer. It persists through a
//! [`ConfigBackend`], either the SQLite [`Database`] or a [`MemoryBackend`].

mod backend;
mod manager;
mod migrate;
mod schema;
mod types;

pub use backend::{ConfigBackend, MemoryBackend, StoredConfig};
pub use manager::{new_record_key, ConfigManager, Record};
pub use migrate::{migrate, parse_legacy_document, parse_timestamp, CURRENT_CONFIG_VERSION};
pub use schema::Database;
pub use types::{
    ConfigPatch, ConfigSnapshot, CookieSet, EmailConfiguration, EmailMessage, EmailNotification,
    Feed, SaveError, Section, StorageError, Subscription, TriState, DEFAULT_UPDATE_INTERVAL,
    DUMMY_RSSFEED_KEY, USE_CLIENT_DEFAULT,
};
