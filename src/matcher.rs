//! Include/exclude regex matching over one fetch cycle's items.

use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

use crate::feed::FeedItem;
use crate::storage::Subscription;

/// Filter rules applied to a feed's items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOptions {
    /// `None` matches nothing; `Some("")` matches every title
    pub regex_include: Option<String>,
    /// `None` and `Some("")` both disable exclusion
    pub regex_exclude: Option<String>,
    pub regex_include_ignorecase: bool,
    pub regex_exclude_ignorecase: bool,
    /// Extra titles appended as synthetic items before matching
    pub custom_text_lines: Option<Vec<String>>,
}

impl MatchOptions {
    /// Options for a scheduled run. Custom text lines are left out.
    pub fn for_subscription(subscription: &Subscription) -> Self {
        Self {
            regex_include: Some(subscription.regex_include.clone()),
            regex_exclude: Some(subscription.regex_exclude.clone()),
            regex_include_ignorecase: subscription.regex_include_ignorecase,
            regex_exclude_ignorecase: subscription.regex_exclude_ignorecase,
            custom_text_lines: None,
        }
    }

    /// Options for a dry run, including the subscription's custom text lines.
    pub fn for_preview(subscription: &Subscription) -> Self {
        Self {
            custom_text_lines: Some(subscription.custom_text_lines.clone()),
            ..Self::for_subscription(subscription)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// Items with `matches == true`, under their input keys
    pub matched: BTreeMap<usize, FeedItem>,
    /// Set when a pattern failed to compile and was skipped
    pub warning: Option<String>,
}

/// Classify `items` against `options`.
///
/// Mutates only the per-cycle fields of each item (`matches` and the two
/// spans). Link-less items left over from an earlier pass are removed and
/// custom text lines are appended after the highest existing key. An
/// exclude match always overrides an include match.
pub fn match_items(items: &mut BTreeMap<usize, FeedItem>, options: &MatchOptions) -> MatchOutcome {
    items.retain(|_, item| item.link.is_some());

    if let Some(lines) = &options.custom_text_lines {
        let mut next_key = items.keys().next_back().map_or(0, |k| k + 1);
        for line in lines.iter().filter(|l| !l.trim().is_empty()) {
            items.insert(next_key, FeedItem::custom(line.as_str()));
            next_key += 1;
        }
    }

    let mut warnings = Vec::new();
    let include = compile(
        options.regex_include.as_deref(),
        options.regex_include_ignorecase,
        "include",
        &mut warnings,
    );
    let exclude = compile(
        options.regex_exclude.as_deref().filter(|p| !p.is_empty()),
        options.regex_exclude_ignorecase,
        "exclude",
        &mut warnings,
    );

    let mut matched = BTreeMap::new();
    for (key, item) in items.iter_mut() {
        item.matches = false;
        item.regex_include_match = None;
        item.regex_exclude_match = None;

        if let Some(found) = include.as_ref().and_then(|re| re.find(&item.title)) {
            item.matches = true;
            item.regex_include_match = Some(found.range());
        }
        if let Some(found) = exclude.as_ref().and_then(|re| re.find(&item.title)) {
            item.matches = false;
            item.regex_exclude_match = Some(found.range());
        }
        if item.matches {
            matched.insert(*key, item.clone());
        }
    }

    MatchOutcome {
        matched,
        warning: (!warnings.is_empty()).then(|| warnings.join("\n")),
    }
}

fn compile(
    pattern: Option<&str>,
    ignore_case: bool,
    which: &str,
    warnings: &mut Vec<String>,
) -> Option<Regex> {
    let pattern = pattern?;
    match RegexBuilder::new(pattern)
        .case_insensitive(ignore_case)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern = %pattern, which, error = %e, "Invalid regex, pattern disabled");
            warnings.push(format!("Regex {which} error: {e}"));
            None
        }
    }
}
