//! Feed retrieval: HTTP fetching, RSS/Atom normalization and cookies.
//!
//! - [`parser`] - turns `feed-rs` entries into [`FeedItem`]s and extracts the TTL hint
//! - [`fetcher`] - HTTP fetching with retry, size limits and the [`FeedSource`] seam
//! - [`cookies`] - per-site cookie selection and `Cookie` header encoding

mod cookies;
mod fetcher;
mod parser;

pub use cookies::{encode_cookie_header, matching_cookies};
pub use fetcher::{FeedSource, FetchError, FetchRequest, FetchSettings, HttpFeedSource};
pub use parser::{parse_feed, FeedItem, ParsedFeed, NO_PUBLISHED_TIME};
