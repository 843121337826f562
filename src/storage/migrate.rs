//! Versioned migration of the stored config document.
//!
//! The stored config is a JSON object with one member per section. Older
//! versions used loosely typed values (booleans for tri-state options, pair
//! lists for cookies, naive timestamps, newline-joined custom text lines).
//! Each step upgrades the raw document by exactly one version; missing fields
//! are left to the typed records' `#[serde(default)]`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Deserializer, Map, Value};

use super::types::StorageError;

/// Version written by this build.
pub const CURRENT_CONFIG_VERSION: u32 = 4;

type Step = fn(&mut Map<String, Value>);

/// `(from_version, step)`; each step produces `from_version + 1`.
const STEPS: &[(u32, Step)] = &[
    (1, drop_search_and_rename_last_update),
    (2, convert_tristates_and_cookies),
    (3, normalize_timestamps_and_text_lines),
];

/// Upgrade `doc` from `version` to [`CURRENT_CONFIG_VERSION`].
///
/// Returns true if anything was applied. Versions newer than this build are
/// left untouched (with a warning).
pub fn migrate(doc: &mut Map<String, Value>, version: u32) -> bool {
    if version > CURRENT_CONFIG_VERSION {
        tracing::warn!(
            stored = version,
            supported = CURRENT_CONFIG_VERSION,
            "Stored config is newer than this build, loading as-is"
        );
        return false;
    }

    let mut applied = false;
    for (from, step) in STEPS {
        if *from >= version {
            tracing::info!(from = *from, to = *from + 1, "Updating stored config");
            step(doc);
            applied = true;
        }
    }
    applied
}

fn records_mut<'a>(
    doc: &'a mut Map<String, Value>,
    section: &str,
) -> impl Iterator<Item = &'a mut Map<String, Value>> {
    doc.get_mut(section)
        .and_then(Value::as_object_mut)
        .into_iter()
        .flat_map(|records| records.values_mut())
        .filter_map(Value::as_object_mut)
}

fn drop_search_and_rename_last_update(doc: &mut Map<String, Value>) {
    for sub in records_mut(doc, "subscriptions") {
        sub.remove("search");
        if let Some(last_update) = sub.remove("last_update") {
            sub.entry("last_match").or_insert(last_update);
        }
    }
}

const TRISTATE_FIELDS: [&str; 4] = [
    "add_torrents_in_paused_state",
    "auto_managed",
    "sequential_download",
    "prioritize_first_last_pieces",
];

fn convert_tristates_and_cookies(doc: &mut Map<String, Value>) {
    for sub in records_mut(doc, "subscriptions") {
        for field in TRISTATE_FIELDS {
            if let Some(Value::Bool(flag)) = sub.get(field) {
                let converted = if *flag { "True" } else { "False" };
                sub.insert(field.to_string(), Value::String(converted.to_string()));
            }
        }
    }

    for cookie in records_mut(doc, "cookies") {
        let Some(Value::Array(pairs)) = cookie.get("value") else {
            continue;
        };
        let mut values = Map::new();
        for pair in pairs {
            if let Some([Value::String(k), v]) = pair.as_array().map(Vec::as_slice) {
                values.insert(k.clone(), v.clone());
            }
        }
        cookie.insert("value".to_string(), Value::Object(values));
    }
}

fn normalize_timestamps_and_text_lines(doc: &mut Map<String, Value>) {
    for sub in records_mut(doc, "subscriptions") {
        normalize_timestamp_field(sub, "last_match");

        if let Some(Value::String(lines)) = sub.get("custom_text_lines") {
            let split: Vec<Value> = lines
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| Value::String(l.to_string()))
                .collect();
            sub.insert("custom_text_lines".to_string(), Value::Array(split));
        }
    }
    for feed in records_mut(doc, "rssfeeds") {
        normalize_timestamp_field(feed, "last_update");
    }
}

fn normalize_timestamp_field(record: &mut Map<String, Value>, field: &str) {
    let normalized = match record.get(field) {
        Some(Value::String(raw)) => match parse_timestamp(raw) {
            Some(dt) => Value::String(dt.to_rfc3339()),
            None => {
                if !raw.trim().is_empty() {
                    tracing::warn!(field, value = %raw, "Unparsable timestamp in stored config, clearing");
                }
                Value::Null
            }
        },
        _ => return,
    };
    record.insert(field.to_string(), normalized);
}

/// Read a legacy config file.
///
/// Legacy files hold two concatenated JSON objects: a header such as
/// `{"file": 2, "format": 1}` whose `file` member is the config version, then
/// the config itself. A file with a single object is taken to be at
/// `default_version`.
pub fn parse_legacy_document(
    content: &str,
    default_version: u32,
) -> Result<(Map<String, Value>, u32), StorageError> {
    let values = Deserializer::from_str(content)
        .into_iter::<Value>()
        .collect::<Result<Vec<_>, _>>()?;

    let (version, body) = match values.as_slice() {
        [body] => (default_version, body),
        [header, body] => {
            let version = header
                .get("file")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    StorageError::Migration("legacy header has no `file` version".to_string())
                })?;
            (version, body)
        }
        _ => {
            return Err(StorageError::Migration(format!(
                "expected one or two JSON objects, found {}",
                values.len()
            )))
        }
    };

    match body {
        Value::Object(map) => Ok((map.clone(), version)),
        _ => Err(StorageError::Migration(
            "legacy config is not a JSON object".to_string(),
        )),
    }
}

/// Parse an ISO 8601 timestamp; inputs without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
