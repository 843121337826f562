use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser::{self, ParseFeedError};
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::LazyLock;

const TORRENT_MIME: &str = "application/x-bittorrent";

/// Warning attached to feeds whose items carry no timestamps at all.
pub const NO_PUBLISHED_TIME: &str = "Published time not available";

#[allow(clippy::expect_used)]
static TTL_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<ttl>\s*([^<]*?)\s*</ttl>").expect("TTL regex is valid") // Static pattern, safe to panic
});

/// One normalized feed entry, alive for a single fetch cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: String,
    /// Resolved link handed to the dispatcher. `None` for custom text lines.
    pub link: Option<String>,
    pub torrent: Option<String>,
    pub magnet: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Enclosure size in bytes, when advertised
    pub size: Option<u64>,
    /// Sub-folder hint (first category)
    pub folder: Option<String>,
    /// Synthetic item added from a subscription's custom text lines
    pub custom_line: bool,
    pub matches: bool,
    /// Byte span of the include match within `title`
    pub regex_include_match: Option<Range<usize>>,
    /// Byte span of the exclude match within `title`
    pub regex_exclude_match: Option<Range<usize>>,
}

impl FeedItem {
    /// A synthetic item for a dry-run title.
    pub fn custom(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            custom_line: true,
            ..Self::default()
        }
    }
}

/// Normalized result of one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    /// Items keyed by position in the feed
    pub items: BTreeMap<usize, FeedItem>,
    /// Feed-advertised refresh hint in minutes
    pub ttl: Option<u32>,
    pub warning: Option<String>,
    /// Recoverable problems found while normalizing the feed
    pub bozo_exception: Option<String>,
}

/// Parse RSS/Atom bytes and normalize every entry into a [`FeedItem`].
///
/// Entries without any usable link are skipped and reported through
/// `bozo_exception`. `prefer_magnet` picks the magnet URI over the
/// torrent enclosure when an entry offers both.
pub fn parse_feed(bytes: &[u8], prefer_magnet: bool) -> Result<ParsedFeed, ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let mut items = BTreeMap::new();
    let mut skipped = 0usize;
    for entry in feed.entries {
        match normalize_entry(entry, prefer_magnet) {
            Some(item) => {
                items.insert(items.len(), item);
            }
            None => skipped += 1,
        }
    }

    let mut warnings = Vec::new();
    if !items.is_empty() && items.values().all(|i| i.published.is_none()) {
        warnings.push(NO_PUBLISHED_TIME.to_string());
    }

    let ttl = match feed.ttl {
        Some(ttl) => Some(ttl),
        None => {
            if let Some(raw) = raw_ttl(bytes) {
                tracing::warn!(ttl = %raw, "Feed advertises an unparsable TTL, ignoring it");
                warnings.push(format!("Invalid TTL value: {raw}"));
            }
            None
        }
    };

    let bozo_exception =
        (skipped > 0).then(|| format!("{skipped} entries without a usable link were skipped"));

    Ok(ParsedFeed {
        items,
        ttl,
        warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
        bozo_exception,
    })
}

fn raw_ttl(bytes: &[u8]) -> Option<String> {
    let captures = TTL_ELEMENT.captures(bytes)?;
    let raw = String::from_utf8_lossy(captures.get(1)?.as_bytes()).into_owned();
    (!raw.is_empty()).then_some(raw)
}

fn normalize_entry(entry: Entry, prefer_magnet: bool) -> Option<FeedItem> {
    let mut page = None;
    let mut torrent = None;
    let mut magnet = None;
    let mut size = None;

    for link in &entry.links {
        let href = link.href.trim();
        if href.is_empty() {
            continue;
        }
        if is_magnet(href) {
            magnet.get_or_insert_with(|| href.to_string());
        } else if link.media_type.as_deref() == Some(TORRENT_MIME) || is_torrent_url(href) {
            if torrent.is_none() {
                torrent = Some(href.to_string());
                size = size.or(link.length);
            }
        } else if page.is_none() {
            page = Some(href.to_string());
        }
    }

    // RSS enclosures and Media RSS content
    for content in entry.media.iter().flat_map(|m| m.content.iter()) {
        let Some(url) = content.url.as_ref().map(|u| u.as_str().to_string()) else {
            continue;
        };
        let torrent_type = content
            .content_type
            .as_ref()
            .is_some_and(|ct| ct.essence().to_string() == TORRENT_MIME);
        if is_magnet(&url) {
            magnet.get_or_insert(url);
        } else if torrent_type || is_torrent_url(&url) {
            if torrent.is_none() {
                torrent = Some(url);
                size = size.or(content.size);
            }
        } else if page.is_none() {
            page = Some(url);
        }
    }

    let link = if prefer_magnet && magnet.is_some() {
        magnet.clone()
    } else {
        torrent.clone().or_else(|| page.clone()).or_else(|| magnet.clone())
    }?;

    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .unwrap_or_default();
    let folder = entry
        .categories
        .first()
        .map(|c| c.term.trim().to_string())
        .filter(|t| !t.is_empty());

    Some(FeedItem {
        title,
        link: Some(link),
        torrent,
        magnet,
        published: entry.published.or(entry.updated),
        size,
        folder,
        ..FeedItem::default()
    })
}

fn is_magnet(url: &str) -> bool {
    url.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:"))
}

fn is_torrent_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".torrent")
}
