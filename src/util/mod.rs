//! Utility functions for feed URL handling.
//!
//! # Examples
//!
//! ```
//! use feedwatch::util::{site_from_url, validate_feed_url};
//!
//! let url = validate_feed_url("https://example.com/feed.xml").unwrap();
//! assert_eq!(site_from_url(url.as_str()).as_deref(), Some("example.com"));
//! ```

mod url_validator;

pub use url_validator::{site_from_url, validate_feed_url, UrlValidationError};
