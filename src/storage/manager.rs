//! In-memory owner of the config, persisted through a [`ConfigBackend`].
//!
//! A `ConfigManager` lives on the scheduler's control loop; nothing else
//! mutates it. Every mutating call writes through to the backend.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::backend::{ConfigBackend, StoredConfig};
use super::migrate::{migrate, CURRENT_CONFIG_VERSION};
use super::types::{
    ConfigPatch, ConfigSnapshot, CookieSet, EmailConfiguration, EmailMessage, Feed, SaveError,
    Section, StorageError, Subscription, DUMMY_RSSFEED_KEY,
};
use crate::util::{site_from_url, validate_feed_url};

// ============================================================================
// Keyed records
// ============================================================================

/// A record stored in one of the keyed config sections.
pub trait Record: Serialize + DeserializeOwned + Clone + Default {
    const SECTION: Section;

    fn key(&self) -> &str;
    fn set_key(&mut self, key: String);
    fn collection(config: &ConfigSnapshot) -> &BTreeMap<String, Self>;
    fn collection_mut(config: &mut ConfigSnapshot) -> &mut BTreeMap<String, Self>;

    /// Reject records that cannot be stored.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Normalize derived fields before storing.
    fn prepare(&mut self) {}
}

macro_rules! impl_record {
    ($ty:ty, $section:expr, $field:ident) => {
        impl Record for $ty {
            const SECTION: Section = $section;

            fn key(&self) -> &str {
                &self.key
            }
            fn set_key(&mut self, key: String) {
                self.key = key;
            }
            fn collection(config: &ConfigSnapshot) -> &BTreeMap<String, Self> {
                &config.$field
            }
            fn collection_mut(config: &mut ConfigSnapshot) -> &mut BTreeMap<String, Self> {
                &mut config.$field
            }
        }
    };
}

impl Record for Feed {
    const SECTION: Section = Section::RssFeeds;

    fn key(&self) -> &str {
        &self.key
    }
    fn set_key(&mut self, key: String) {
        self.key = key;
    }
    fn collection(config: &ConfigSnapshot) -> &BTreeMap<String, Self> {
        &config.rssfeeds
    }
    fn collection_mut(config: &mut ConfigSnapshot) -> &mut BTreeMap<String, Self> {
        &mut config.rssfeeds
    }

    fn validate(&self) -> Result<(), String> {
        validate_feed_url(&self.url).map(drop).map_err(|e| e.to_string())
    }

    fn prepare(&mut self) {
        self.url = self.url.trim().to_string();
        if let Some(site) = site_from_url(&self.url) {
            self.site = site;
        }
    }
}

impl_record!(Subscription, Section::Subscriptions, subscriptions);
impl_record!(CookieSet, Section::Cookies, cookies);
impl_record!(EmailMessage, Section::EmailMessages, email_messages);

/// First unused integer key, as a string.
pub fn new_record_key<V>(records: &BTreeMap<String, V>) -> String {
    (0u64..)
        .map(|n| n.to_string())
        .find(|k| !records.contains_key(k))
        .unwrap_or_default()
}

// ============================================================================
// ConfigManager
// ============================================================================

pub struct ConfigManager {
    backend: Arc<dyn ConfigBackend>,
    config: ConfigSnapshot,
}

impl ConfigManager {
    /// Load, migrate and verify the stored config.
    ///
    /// An empty backend yields (and persists) the default config. Migration
    /// or reconciliation changes are saved back immediately.
    pub async fn load(backend: Arc<dyn ConfigBackend>) -> Result<Self, StorageError> {
        let Some(stored) = backend.load().await? else {
            tracing::info!("No stored config found, starting with defaults");
            let manager = Self {
                backend,
                config: ConfigSnapshot::default(),
            };
            manager.save().await?;
            return Ok(manager);
        };

        let (config, changed) = Self::decode(stored);
        let manager = Self { backend, config };
        if changed {
            manager.save().await?;
        }
        Ok(manager)
    }

    /// Replace the stored config with a legacy document at `version`.
    pub async fn import(
        backend: Arc<dyn ConfigBackend>,
        document: Map<String, Value>,
        version: u32,
    ) -> Result<Self, StorageError> {
        let (config, _) = Self::decode(StoredConfig {
            version,
            sections: document,
        });
        let manager = Self { backend, config };
        manager.save().await?;
        Ok(manager)
    }

    fn decode(stored: StoredConfig) -> (ConfigSnapshot, bool) {
        let StoredConfig {
            version,
            mut sections,
        } = stored;
        let mut changed = migrate(&mut sections, version);

        let mut config = ConfigSnapshot::default();
        changed |= decode_section(&sections, &mut config.rssfeeds);
        changed |= decode_section(&sections, &mut config.subscriptions);
        changed |= decode_section(&sections, &mut config.cookies);
        changed |= decode_section(&sections, &mut config.email_messages);
        if let Some(raw) = sections.get(Section::EmailConfigurations.as_str()) {
            let (conf, fixed) = lenient_record::<EmailConfiguration>("email_configurations", raw);
            config.email_configurations = conf;
            changed |= fixed;
        }

        changed |= reconcile(&mut config);
        (config, changed)
    }

    fn to_stored(&self) -> Result<StoredConfig, StorageError> {
        let sections = match serde_json::to_value(&self.config)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(StoredConfig {
            version: CURRENT_CONFIG_VERSION,
            sections,
        })
    }

    /// The current config. Callers needing to hand it off another task clone it.
    pub fn get_config(&self) -> &ConfigSnapshot {
        &self.config
    }

    pub async fn save(&self) -> Result<(), StorageError> {
        self.backend.save(&self.to_stored()?).await
    }

    /// Replace every top-level section present in `patch`, then save.
    pub async fn set_config(&mut self, patch: ConfigPatch) -> Result<(), StorageError> {
        if let Some(rssfeeds) = patch.rssfeeds {
            self.config.rssfeeds = rssfeeds;
        }
        if let Some(subscriptions) = patch.subscriptions {
            self.config.subscriptions = subscriptions;
        }
        if let Some(cookies) = patch.cookies {
            self.config.cookies = cookies;
        }
        if let Some(email_messages) = patch.email_messages {
            self.config.email_messages = email_messages;
        }
        if let Some(email_configurations) = patch.email_configurations {
            self.config.email_configurations = email_configurations;
        }
        reconcile(&mut self.config);
        self.save().await
    }

    pub fn feed(&self, key: &str) -> Option<&Feed> {
        self.config.rssfeeds.get(key)
    }

    pub fn subscription(&self, key: &str) -> Option<&Subscription> {
        self.config.subscriptions.get(key)
    }

    /// Mutate a feed in place. Caller is responsible for [`save`](Self::save).
    pub fn feed_mut(&mut self, key: &str) -> Option<&mut Feed> {
        self.config.rssfeeds.get_mut(key)
    }

    pub fn subscription_mut(&mut self, key: &str) -> Option<&mut Subscription> {
        self.config.subscriptions.get_mut(key)
    }

    /// Insert or replace a record. An empty `key` allocates a new one.
    pub async fn save_record<R: Record>(&mut self, mut record: R) -> Result<R, SaveError> {
        record.validate().map_err(|reason| SaveError::InvalidRecord {
            section: R::SECTION.to_string(),
            reason,
        })?;
        let collection = R::collection_mut(&mut self.config);
        if record.key().is_empty() {
            record.set_key(new_record_key(collection));
        }
        record.prepare();
        collection.insert(record.key().to_string(), record.clone());
        if R::SECTION == Section::Subscriptions {
            reconcile(&mut self.config);
        }
        self.save().await?;
        Ok(record)
    }

    /// Remove a record; deleting a feed re-homes or drops its subscriptions.
    pub async fn delete_record<R: Record>(&mut self, key: &str) -> Result<R, SaveError> {
        let removed = R::collection_mut(&mut self.config)
            .remove(key)
            .ok_or_else(|| SaveError::NoSuchEntry(key.to_string()))?;
        if R::SECTION == Section::RssFeeds {
            reconcile(&mut self.config);
        }
        self.save().await?;
        Ok(removed)
    }

    /// Untyped save entry point for external callers.
    ///
    /// * `data = None` deletes `key`, which requires `delete = true`.
    /// * `data` without a `key` member creates a new record.
    pub async fn generic_save(
        &mut self,
        section: &str,
        key: Option<&str>,
        data: Option<Value>,
        delete: bool,
    ) -> Result<&ConfigSnapshot, SaveError> {
        let section: Section = section.parse()?;
        let not_a_collection = || SaveError::NotACollection(section.to_string());

        match data {
            None => {
                let key = key.ok_or(SaveError::MissingKey)?;
                if !delete {
                    return Err(SaveError::DeleteNotConfirmed);
                }
                match section {
                    Section::RssFeeds => self.delete_record::<Feed>(key).await.map(drop)?,
                    Section::Subscriptions => {
                        self.delete_record::<Subscription>(key).await.map(drop)?
                    }
                    Section::Cookies => self.delete_record::<CookieSet>(key).await.map(drop)?,
                    Section::EmailMessages => {
                        self.delete_record::<EmailMessage>(key).await.map(drop)?
                    }
                    Section::EmailConfigurations => return Err(not_a_collection()),
                }
            }
            Some(value) => match section {
                Section::RssFeeds => self.save_value::<Feed>(value).await.map(drop)?,
                Section::Subscriptions => self.save_value::<Subscription>(value).await.map(drop)?,
                Section::Cookies => self.save_value::<CookieSet>(value).await.map(drop)?,
                Section::EmailMessages => self.save_value::<EmailMessage>(value).await.map(drop)?,
                Section::EmailConfigurations => return Err(not_a_collection()),
            },
        }
        Ok(&self.config)
    }

    async fn save_value<R: Record>(&mut self, value: Value) -> Result<R, SaveError> {
        if !value.is_object() {
            return Err(SaveError::InvalidRecord {
                section: R::SECTION.to_string(),
                reason: "data must be an object".to_string(),
            });
        }
        let record: R = serde_json::from_value(value).map_err(|e| SaveError::InvalidRecord {
            section: R::SECTION.to_string(),
            reason: e.to_string(),
        })?;
        self.save_record(record).await
    }
}

// ============================================================================
// Decoding and verification
// ============================================================================

fn decode_section<R: Record>(
    sections: &Map<String, Value>,
    target: &mut BTreeMap<String, R>,
) -> bool {
    let Some(raw) = sections.get(R::SECTION.as_str()) else {
        return false;
    };
    let Some(records) = raw.as_object() else {
        tracing::warn!(section = %R::SECTION, "Config section is not an object, discarding");
        return true;
    };

    let mut changed = false;
    for (key, raw_record) in records {
        if !raw_record.is_object() {
            tracing::warn!(section = %R::SECTION, key = %key, "Config entry is not an object, discarding");
            changed = true;
            continue;
        }
        let (record, fixed) = lenient_record::<R>(key, raw_record);
        changed |= fixed;
        target.insert(key.clone(), record);
    }
    changed
}

/// Deserialize a record, replacing any field of the wrong type with its default.
fn lenient_record<R: Serialize + DeserializeOwned + Default>(key: &str, raw: &Value) -> (R, bool) {
    if let Ok(record) = serde_json::from_value::<R>(raw.clone()) {
        return (record, false);
    }

    let Ok(Value::Object(mut merged)) = serde_json::to_value(R::default()) else {
        return (R::default(), true);
    };
    if let Some(fields) = raw.as_object() {
        for (field, value) in fields {
            let mut candidate = merged.clone();
            candidate.insert(field.clone(), value.clone());
            if serde_json::from_value::<R>(Value::Object(candidate)).is_ok() {
                merged.insert(field.clone(), value.clone());
            } else {
                tracing::warn!(
                    key = %key,
                    field = %field,
                    value = %value,
                    "Config value has the wrong type, inserting default"
                );
            }
        }
    }
    let record = serde_json::from_value(Value::Object(merged)).unwrap_or_default();
    (record, true)
}

/// Enforce cross-record invariants. Returns true if anything changed.
///
/// - each record's `key` equals its map key
/// - every subscription references an existing feed; orphans holding only
///   default data are dropped, the rest move to the dummy feed
pub(crate) fn reconcile(config: &mut ConfigSnapshot) -> bool {
    let mut changed = fix_keys(&mut config.rssfeeds)
        | fix_keys(&mut config.subscriptions)
        | fix_keys(&mut config.cookies)
        | fix_keys(&mut config.email_messages);

    let orphans: Vec<String> = config
        .subscriptions
        .values()
        .filter(|s| !config.rssfeeds.contains_key(&s.rssfeed_key))
        .map(|s| s.key.clone())
        .collect();

    for key in orphans {
        let Some(sub) = config.subscriptions.get_mut(&key) else {
            continue;
        };
        changed = true;
        if sub.is_default_data() {
            tracing::warn!(
                subscription = %key,
                "Subscription references a missing feed and is empty, deleting it"
            );
            config.subscriptions.remove(&key);
            continue;
        }
        tracing::warn!(
            subscription = %key,
            rssfeed_key = %sub.rssfeed_key,
            "Subscription references a missing feed, moving it to the dummy feed"
        );
        sub.rssfeed_key = DUMMY_RSSFEED_KEY.to_string();
        config
            .rssfeeds
            .entry(DUMMY_RSSFEED_KEY.to_string())
            .or_insert_with(Feed::dummy);
    }
    changed
}

fn fix_keys<R: Record>(records: &mut BTreeMap<String, R>) -> bool {
    let mut changed = false;
    for (key, record) in records.iter_mut() {
        if record.key() != key {
            record.set_key(key.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn manager() -> (ConfigManager, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConfigManager::load(backend.clone()).await.unwrap();
        (manager, backend)
    }

    fn feed(url: &str) -> Feed {
        Feed {
            name: "Feed".into(),
            url: url.into(),
            ..Feed::default()
        }
    }

    #[tokio::test]
    async fn test_load_empty_backend_persists_defaults() {
        let (manager, backend) = manager().await;
        assert_eq!(manager.get_config(), &ConfigSnapshot::default());
        let stored = backend.contents().unwrap();
        assert_eq!(stored.version, CURRENT_CONFIG_VERSION);
    }

    #[tokio::test]
    async fn test_save_record_allocates_first_free_key() {
        let (mut manager, _) = manager().await;
        let first = manager.save_record(feed("https://a.example/rss")).await.unwrap();
        let second = manager.save_record(feed("https://b.example/rss")).await.unwrap();
        assert_eq!(first.key, "0");
        assert_eq!(second.key, "1");

        manager.delete_record::<Feed>("0").await.unwrap();
        let third = manager.save_record(feed("https://c.example/rss")).await.unwrap();
        assert_eq!(third.key, "0");
    }

    #[tokio::test]
    async fn test_save_feed_derives_site() {
        let (mut manager, _) = manager().await;
        let saved = manager
            .save_record(feed("https://tracker.example.org/rss?cat=3"))
            .await
            .unwrap();
        assert_eq!(saved.site, "tracker.example.org");
    }

    #[tokio::test]
    async fn test_save_feed_rejects_bad_url() {
        let (mut manager, _) = manager().await;
        let err = manager.save_record(feed("file:///etc/passwd")).await.unwrap_err();
        assert!(matches!(err, SaveError::InvalidRecord { .. }));
        assert!(manager.get_config().rssfeeds.is_empty());
    }

    #[tokio::test]
    async fn test_generic_save_rejects_unknown_section() {
        let (mut manager, _) = manager().await;
        let err = manager
            .generic_save("torrents", None, Some(json!({})), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::UnknownSection(_)));
    }

    #[tokio::test]
    async fn test_generic_save_rejects_email_configurations() {
        let (mut manager, _) = manager().await;
        let err = manager
            .generic_save("email_configurations", Some("0"), Some(json!({})), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::NotACollection(_)));
    }

    #[tokio::test]
    async fn test_generic_save_delete_requires_flag_and_key() {
        let (mut manager, _) = manager().await;
        manager.save_record(feed("https://a.example/rss")).await.unwrap();

        let err = manager.generic_save("rssfeeds", None, None, true).await.unwrap_err();
        assert!(matches!(err, SaveError::MissingKey));

        let err = manager
            .generic_save("rssfeeds", Some("0"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::DeleteNotConfirmed));

        let err = manager
            .generic_save("rssfeeds", Some("42"), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::NoSuchEntry(_)));

        let config = manager
            .generic_save("rssfeeds", Some("0"), None, true)
            .await
            .unwrap();
        assert!(config.rssfeeds.is_empty());
    }

    #[tokio::test]
    async fn test_generic_save_rejects_malformed_record() {
        let (mut manager, _) = manager().await;
        let err = manager
            .generic_save("rssfeeds", None, Some(json!({ "update_interval": "often" })), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::InvalidRecord { .. }));

        let err = manager
            .generic_save("cookies", None, Some(json!([1, 2])), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::InvalidRecord { .. }));
    }

    #[tokio::test]
    async fn test_generic_save_creates_record() {
        let (mut manager, _) = manager().await;
        let config = manager
            .generic_save(
                "cookies",
                None,
                Some(json!({ "site": "example.com", "value": { "uid": "1" } })),
                false,
            )
            .await
            .unwrap();
        assert_eq!(config.cookies["0"].site, "example.com");
        assert_eq!(config.cookies["0"].key, "0");
    }

    #[tokio::test]
    async fn test_deleting_feed_moves_customized_subscription_to_dummy() {
        let (mut manager, _) = manager().await;
        let saved = manager.save_record(feed("https://a.example/rss")).await.unwrap();
        manager
            .save_record(Subscription {
                rssfeed_key: saved.key.clone(),
                regex_include: "sparc64".into(),
                ..Subscription::default()
            })
            .await
            .unwrap();
        manager
            .save_record(Subscription {
                rssfeed_key: saved.key.clone(),
                ..Subscription::default()
            })
            .await
            .unwrap();

        manager.delete_record::<Feed>(&saved.key).await.unwrap();

        let config = manager.get_config();
        assert_eq!(config.subscriptions.len(), 1);
        assert_eq!(config.subscriptions["0"].rssfeed_key, DUMMY_RSSFEED_KEY);
        assert!(!config.rssfeeds[DUMMY_RSSFEED_KEY].active);
    }

    #[tokio::test]
    async fn test_set_config_replaces_only_given_sections() {
        let (mut manager, _) = manager().await;
        manager.save_record(feed("https://a.example/rss")).await.unwrap();

        let mut cookies = BTreeMap::new();
        cookies.insert(
            "5".to_string(),
            CookieSet {
                site: "a.example".into(),
                ..CookieSet::default()
            },
        );
        manager
            .set_config(ConfigPatch {
                cookies: Some(cookies),
                ..ConfigPatch::default()
            })
            .await
            .unwrap();

        let config = manager.get_config();
        assert_eq!(config.rssfeeds.len(), 1);
        assert_eq!(config.cookies["5"].key, "5");
    }

    #[tokio::test]
    async fn test_load_fixes_wrong_types_and_keys() {
        let mut sections = Map::new();
        sections.insert(
            "rssfeeds".into(),
            json!({ "3": { "key": "wrong", "url": "http://a/rss", "update_interval": "soon" } }),
        );
        let backend = Arc::new(MemoryBackend::with_contents(StoredConfig {
            version: CURRENT_CONFIG_VERSION,
            sections,
        }));

        let manager = ConfigManager::load(backend.clone()).await.unwrap();
        let feed = manager.feed("3").unwrap();
        assert_eq!(feed.key, "3");
        assert_eq!(feed.url, "http://a/rss");
        assert_eq!(feed.update_interval, crate::storage::DEFAULT_UPDATE_INTERVAL);

        let stored = backend.contents().unwrap();
        assert_eq!(stored.sections["rssfeeds"]["3"]["key"], json!("3"));
    }

    #[test]
    fn test_new_record_key_fills_gaps() {
        let mut records = BTreeMap::new();
        records.insert("0".to_string(), ());
        records.insert("2".to_string(), ());
        assert_eq!(new_record_key(&records), "1");
    }
}
