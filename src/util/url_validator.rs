use thiserror::Error;
use url::Url;

/// Errors that can occur during feed URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host to derive a site from.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a URL string for use as a feed source.
///
/// Only `http` and `https` URLs with a host are accepted. Private and
/// loopback addresses are allowed: trackers on the local network are a
/// normal deployment.
///
/// # Examples
///
/// ```
/// use feedwatch::util::validate_feed_url;
///
/// let url = validate_feed_url("https://tracker.example.org/rss").unwrap();
/// assert_eq!(url.host_str(), Some("tracker.example.org"));
///
/// assert!(validate_feed_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }

    Ok(url)
}

/// Host part of a feed URL, used as the feed's `site` for cookie lookup.
///
/// Returns `None` for URLs [`validate_feed_url`] rejects.
pub fn site_from_url(url_str: &str) -> Option<String> {
    let url = validate_feed_url(url_str).ok()?;
    let host = url.host_str()?;
    // IPv6 hosts come back bracketed
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
        assert!(validate_feed_url("http://news.example.org").is_ok());
        assert!(validate_feed_url("  https://example.com/rss  ").is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_feed_url("file:///etc/passwd"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_feed_url("ftp://example.com").is_err());
        assert!(validate_feed_url("magnet:?xt=urn:btih:abc").is_err());
    }

    #[test]
    fn test_unparsable_rejected() {
        assert!(matches!(
            validate_feed_url("not a url"),
            Err(UrlValidationError::InvalidUrl(_))
        ));
        assert!(validate_feed_url("").is_err());
    }

    #[test]
    fn test_local_network_accepted() {
        assert!(validate_feed_url("http://127.0.0.1:8080/rss").is_ok());
        assert!(validate_feed_url("http://192.168.1.10/feed").is_ok());
    }

    #[test]
    fn test_site_from_url() {
        assert_eq!(
            site_from_url("https://tracker.example.org:8443/rss?passkey=1").as_deref(),
            Some("tracker.example.org")
        );
        assert_eq!(site_from_url("http://[::1]/rss").as_deref(), Some("::1"));
        assert_eq!(site_from_url("ftp://example.com/rss"), None);
    }
}
