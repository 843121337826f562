use std::collections::BTreeMap;

use crate::storage::CookieSet;

/// Merge the values of every active cookie set whose `site` occurs in `url`.
///
/// Later sets (in key order) override earlier ones for the same cookie name.
pub fn matching_cookies<'a, I>(cookies: I, url: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a CookieSet>,
{
    let mut merged = BTreeMap::new();
    for set in cookies {
        if !set.active || set.site.is_empty() || !url.contains(&set.site) {
            continue;
        }
        merged.extend(set.value.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Encode cookies as an HTTP `Cookie` header value: `k1=v1; k2=v2`, sorted by name.
///
/// Returns `None` when there is nothing to send.
pub fn encode_cookie_header(cookies: &BTreeMap<String, String>) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    let header = cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ");
    Some(header)
}
