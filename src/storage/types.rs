use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default feed polling interval in minutes.
pub const DEFAULT_UPDATE_INTERVAL: u32 = 120;

/// Reserved feed key used as a parking lot for subscriptions whose feed vanished.
pub const DUMMY_RSSFEED_KEY: &str = "9999";

/// `-2` in a numeric subscription limit means "use the torrent client's default".
pub const USE_CLIENT_DEFAULT: i64 = -2;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another instance of the daemon has locked the database
    #[error("Another instance of feedwatch appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Schema or config-version migration failed
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Stored JSON could not be (de)serialized into typed records
    #[error("Invalid stored config: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::InstanceLocked;
        }

        StorageError::Database(err)
    }
}

/// Rejected config-save requests. Raised synchronously to the caller, never dropped.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("Invalid config key: {0}")]
    UnknownSection(String),

    #[error("Config section '{0}' is not a keyed collection")]
    NotACollection(String),

    #[error("Key and value cannot both be None")]
    MissingKey,

    #[error("Deleting an item requires 'delete' to be true")]
    DeleteNotConfirmed,

    #[error("Invalid key - item with key {0} doesn't exist")]
    NoSuchEntry(String),

    #[error("Invalid record for '{section}': {reason}")]
    InvalidRecord { section: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ============================================================================
// Tri-state options
// ============================================================================

/// Per-subscription torrent option override.
///
/// Stored as the strings `"True"`, `"False"` and `"Default"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriState {
    #[serde(rename = "True")]
    Enabled,
    #[serde(rename = "False")]
    Disabled,
    #[default]
    #[serde(rename = "Default")]
    UseDefault,
}

impl TriState {
    /// Resolve against the torrent client's default.
    pub fn resolve(self, client_default: bool) -> bool {
        match self {
            TriState::Enabled => true,
            TriState::Disabled => false,
            TriState::UseDefault => client_default,
        }
    }

    /// `None` when the client default should apply.
    pub fn as_override(self) -> Option<bool> {
        match self {
            TriState::Enabled => Some(true),
            TriState::Disabled => Some(false),
            TriState::UseDefault => None,
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::Enabled
        } else {
            TriState::Disabled
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A configured RSS/Atom source polled on an interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Feed {
    pub key: String,
    pub name: String,
    pub url: String,
    /// Host derived from `url`, used for cookie selection
    pub site: String,
    pub active: bool,
    /// Last time the whole feed was polled (whole seconds)
    pub last_update: Option<DateTime<Utc>>,
    /// Polling interval in minutes
    pub update_interval: u32,
    pub update_on_startup: bool,
    /// Follow the feed's `<ttl>` hint when it differs from `update_interval`
    pub obey_ttl: bool,
    /// Empty means the daemon default user agent
    pub user_agent: String,
    pub prefer_magnet: bool,
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: String::new(),
            url: String::new(),
            site: String::new(),
            active: true,
            last_update: None,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            update_on_startup: false,
            obey_ttl: false,
            user_agent: String::new(),
            prefer_magnet: false,
        }
    }
}

impl Feed {
    /// The inactive placeholder feed orphaned subscriptions are moved to.
    pub fn dummy() -> Self {
        Self {
            key: DUMMY_RSSFEED_KEY.to_string(),
            name: "Dummy Feed (error in config was detected) Please reassign this subscription \
                   to the correct Feed and delete this RSS feed."
                .to_string(),
            active: false,
            ..Self::default()
        }
    }
}

/// Which torrent events send a given email message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailNotification {
    pub on_torrent_added: bool,
    pub on_torrent_completed: bool,
}

/// A named include/exclude filter bound to one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscription {
    pub key: String,
    pub name: String,
    /// Back-reference to the owning feed, resolved at use time
    pub rssfeed_key: String,
    pub regex_include: String,
    pub regex_include_ignorecase: bool,
    pub regex_exclude: String,
    pub regex_exclude_ignorecase: bool,
    pub active: bool,
    /// Watermark: timestamp of the newest item accepted so far
    pub last_match: Option<DateTime<Utc>>,
    pub ignore_timestamp: bool,
    /// Extra titles for interactive dry runs; never used by scheduled runs
    pub custom_text_lines: Vec<String>,
    /// Keyed by email message key
    pub email_notifications: BTreeMap<String, EmailNotification>,
    pub download_location: String,
    pub move_completed: String,
    pub label: String,
    pub max_download_speed: i64,
    pub max_upload_speed: i64,
    pub max_connections: i64,
    pub max_upload_slots: i64,
    pub add_torrents_in_paused_state: TriState,
    pub auto_managed: TriState,
    pub sequential_download: TriState,
    pub prioritize_first_last_pieces: TriState,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: String::new(),
            rssfeed_key: String::new(),
            regex_include: String::new(),
            regex_include_ignorecase: true,
            regex_exclude: String::new(),
            regex_exclude_ignorecase: true,
            active: true,
            last_match: None,
            ignore_timestamp: false,
            custom_text_lines: Vec::new(),
            email_notifications: BTreeMap::new(),
            download_location: String::new(),
            move_completed: String::new(),
            label: String::new(),
            max_download_speed: USE_CLIENT_DEFAULT,
            max_upload_speed: USE_CLIENT_DEFAULT,
            max_connections: USE_CLIENT_DEFAULT,
            max_upload_slots: USE_CLIENT_DEFAULT,
            add_torrents_in_paused_state: TriState::UseDefault,
            auto_managed: TriState::UseDefault,
            sequential_download: TriState::UseDefault,
            prioritize_first_last_pieces: TriState::UseDefault,
        }
    }
}

impl Subscription {
    /// True when nothing but the identifying keys differs from a fresh subscription.
    pub fn is_default_data(&self) -> bool {
        let fresh = Subscription {
            key: self.key.clone(),
            rssfeed_key: self.rssfeed_key.clone(),
            ..Subscription::default()
        };
        *self == fresh
    }
}

/// Cookies sent to every URL containing `site`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieSet {
    pub key: String,
    pub site: String,
    pub value: BTreeMap<String, String>,
    pub active: bool,
}

impl Default for CookieSet {
    fn default() -> Self {
        Self {
            key: String::new(),
            site: String::new(),
            value: BTreeMap::new(),
            active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailMessage {
    pub key: String,
    pub name: String,
    pub to_address: String,
    pub subject: String,
    pub message: String,
    pub active: bool,
}

impl Default for EmailMessage {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: String::new(),
            to_address: String::new(),
            subject: String::new(),
            message: String::new(),
            active: true,
        }
    }
}

/// Global SMTP settings shared by all email messages.
///
/// Custom Debug impl masks `smtp_password`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfiguration {
    pub send_email_on_torrent_events: bool,
    pub from_address: String,
    pub smtp_server: String,
    pub smtp_port: String,
    pub smtp_authentication: bool,
    pub smtp_username: String,
    pub smtp_password: String,
    pub default_email_to_address: String,
    pub default_email_subject: String,
    pub default_email_message: String,
}

impl Default for EmailConfiguration {
    fn default() -> Self {
        Self {
            send_email_on_torrent_events: false,
            from_address: String::new(),
            smtp_server: String::new(),
            smtp_port: String::new(),
            smtp_authentication: false,
            smtp_username: String::new(),
            smtp_password: String::new(),
            default_email_to_address: String::new(),
            default_email_subject: "[feedwatch]: RSS event ($subscription_title)".to_string(),
            default_email_message:
                "Hi\n\nThe following torrents have been added:\n$torrentlist\nRegards".to_string(),
        }
    }
}

impl fmt::Debug for EmailConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfiguration")
            .field("send_email_on_torrent_events", &self.send_email_on_torrent_events)
            .field("from_address", &self.from_address)
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_authentication", &self.smtp_authentication)
            .field("smtp_username", &self.smtp_username)
            .field(
                "smtp_password",
                &(!self.smtp_password.is_empty()).then_some("[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Whole-config snapshot
// ============================================================================

/// The complete persisted configuration: one map per record kind, keyed by record key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub rssfeeds: BTreeMap<String, Feed>,
    pub subscriptions: BTreeMap<String, Subscription>,
    pub cookies: BTreeMap<String, CookieSet>,
    pub email_messages: BTreeMap<String, EmailMessage>,
    pub email_configurations: EmailConfiguration,
}

impl ConfigSnapshot {
    /// Subscriptions bound to `feed_key`, in key order.
    pub fn subscriptions_for<'a>(
        &'a self,
        feed_key: &'a str,
    ) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.subscriptions
            .values()
            .filter(move |s| s.rssfeed_key == feed_key)
    }
}

/// Partial update for [`ConfigSnapshot`]: provided top-level sections replace the stored ones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub rssfeeds: Option<BTreeMap<String, Feed>>,
    pub subscriptions: Option<BTreeMap<String, Subscription>>,
    pub cookies: Option<BTreeMap<String, CookieSet>>,
    pub email_messages: Option<BTreeMap<String, EmailMessage>>,
    pub email_configurations: Option<EmailConfiguration>,
}

// ============================================================================
// Sections
// ============================================================================

/// Top-level keys of the stored config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    RssFeeds,
    Subscriptions,
    Cookies,
    EmailMessages,
    EmailConfigurations,
}

impl Section {
    pub const ALL: [Section; 5] = [
        Section::RssFeeds,
        Section::Subscriptions,
        Section::Cookies,
        Section::EmailMessages,
        Section::EmailConfigurations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Section::RssFeeds => "rssfeeds",
            Section::Subscriptions => "subscriptions",
            Section::Cookies => "cookies",
            Section::EmailMessages => "email_messages",
            Section::EmailConfigurations => "email_configurations",
        }
    }
}

impl FromStr for Section {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Section::ALL
            .into_iter()
            .find(|section| section.as_str() == s)
            .ok_or_else(|| SaveError::UnknownSection(s.to_string()))
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tristate_serializes_as_legacy_strings() {
        assert_eq!(serde_json::to_string(&TriState::Enabled).unwrap(), "\"True\"");
        assert_eq!(serde_json::to_string(&TriState::Disabled).unwrap(), "\"False\"");
        assert_eq!(serde_json::to_string(&TriState::UseDefault).unwrap(), "\"Default\"");
        let parsed: TriState = serde_json::from_str("\"Default\"").unwrap();
        assert_eq!(parsed, TriState::UseDefault);
    }

    #[test]
    fn test_tristate_resolve() {
        assert!(TriState::Enabled.resolve(false));
        assert!(!TriState::Disabled.resolve(true));
        assert!(TriState::UseDefault.resolve(true));
        assert_eq!(TriState::UseDefault.as_override(), None);
    }

    #[test]
    fn test_subscription_defaults() {
        let sub = Subscription::default();
        assert!(sub.active);
        assert!(sub.regex_include_ignorecase);
        assert_eq!(sub.max_connections, USE_CLIENT_DEFAULT);
        assert!(sub.last_match.is_none());
        assert!(sub.is_default_data());
    }

    #[test]
    fn test_is_default_data_ignores_keys_only() {
        let mut sub = Subscription {
            key: "3".into(),
            rssfeed_key: "7".into(),
            ..Subscription::default()
        };
        assert!(sub.is_default_data());
        sub.regex_include = "sparc64".into();
        assert!(!sub.is_default_data());
    }

    #[test]
    fn test_partial_record_uses_defaults() {
        let feed: Feed = serde_json::from_str(r#"{"key":"0","url":"http://x/rss"}"#).unwrap();
        assert_eq!(feed.update_interval, DEFAULT_UPDATE_INTERVAL);
        assert!(feed.active);
        assert!(!feed.obey_ttl);
    }

    #[test]
    fn test_section_from_str() {
        assert_eq!("rssfeeds".parse::<Section>().unwrap(), Section::RssFeeds);
        let err = "bogus".parse::<Section>().unwrap_err();
        assert!(matches!(err, SaveError::UnknownSection(_)));
    }

    #[test]
    fn test_debug_masks_smtp_password() {
        let conf = EmailConfiguration {
            smtp_password: "hunter2".into(),
            ..EmailConfiguration::default()
        };
        let debug_output = format!("{:?}", conf);
        assert!(!debug_output.contains("hunter2"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_dummy_feed_is_inactive() {
        let dummy = Feed::dummy();
        assert_eq!(dummy.key, DUMMY_RSSFEED_KEY);
        assert!(!dummy.active);
    }
}
