//! Fetch-and-match stage, run on a run-queue worker.
//!
//! The handler works on a read-only config snapshot and never writes back:
//! everything the control loop has to apply comes back in [`UpdateOutcome`].

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

use crate::feed::{
    encode_cookie_header, matching_cookies, FeedItem, FeedSource, FetchError, FetchRequest,
};
use crate::matcher::{match_items, MatchOptions};
use crate::storage::{ConfigSnapshot, Feed, Subscription};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("rssfeed_key and subscription_key cannot both be None")]
    MissingKeys,
    #[error("No feed with key {0}")]
    UnknownFeed(String),
    #[error("No subscription with key {0}")]
    UnknownSubscription(String),
    #[error("Failed to fetch and parse feed")]
    Fetch(#[from] FetchError),
}

/// What to run: a whole feed, or one subscription (manual run).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    pub feed_key: Option<String>,
    pub subscription_key: Option<String>,
}

impl UpdateRequest {
    pub fn feed(key: impl Into<String>) -> Self {
        Self {
            feed_key: Some(key.into()),
            subscription_key: None,
        }
    }

    pub fn subscription(key: impl Into<String>) -> Self {
        Self {
            feed_key: None,
            subscription_key: Some(key.into()),
        }
    }

    /// True for runs that poll the feed as a whole.
    pub fn is_feed_level(&self) -> bool {
        self.subscription_key.is_none()
    }
}

/// One matched item ready for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedTorrent {
    pub title: String,
    pub link: String,
    pub torrent: Option<String>,
    pub magnet: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub folder: Option<String>,
    pub site_cookies: BTreeMap<String, String>,
    pub cookie_header: Option<String>,
    pub user_agent: String,
    /// URL of the feed the item came from
    pub referrer: String,
    pub subscription_key: String,
    /// Subscription as it was when the fetch started
    pub subscription: Subscription,
}

/// Result of one handler run, applied by the control loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub request: UpdateRequest,
    /// Feed the run resolved to, when it got that far
    pub feed_key: Option<String>,
    /// True when the feed was actually fetched and parsed
    pub fetched: bool,
    pub matched: Vec<MatchedTorrent>,
    pub ttl: Option<u32>,
    pub warnings: Vec<String>,
    /// Set when the run failed; the run then carries no matches
    pub error: Option<String>,
}

impl UpdateOutcome {
    fn empty(request: &UpdateRequest, feed_key: Option<String>) -> Self {
        Self {
            request: request.clone(),
            feed_key,
            ..Self::default()
        }
    }
}

/// Dry-run result: every item with its match flags and spans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviewOutcome {
    pub items: BTreeMap<usize, FeedItem>,
    pub matched_keys: Vec<usize>,
    pub warnings: Vec<String>,
}

pub struct FeedUpdateHandler {
    source: Arc<dyn FeedSource>,
    default_user_agent: String,
}

struct FetchContext {
    request: FetchRequest,
    site_cookies: BTreeMap<String, String>,
}

impl FeedUpdateHandler {
    pub fn new(source: Arc<dyn FeedSource>, default_user_agent: impl Into<String>) -> Self {
        Self {
            source,
            default_user_agent: default_user_agent.into(),
        }
    }

    fn fetch_context(&self, config: &ConfigSnapshot, feed: &Feed) -> FetchContext {
        let site_cookies = matching_cookies(config.cookies.values(), &feed.url);
        let user_agent = if feed.user_agent.trim().is_empty() {
            self.default_user_agent.clone()
        } else {
            feed.user_agent.clone()
        };
        FetchContext {
            request: FetchRequest {
                url: feed.url.clone(),
                cookie_header: encode_cookie_header(&site_cookies),
                user_agent,
                prefer_magnet: feed.prefer_magnet,
            },
            site_cookies,
        }
    }

    /// Fetch the feed once and match it against every subscription in scope.
    ///
    /// A feed-level run on an inactive feed returns an empty outcome without
    /// fetching. A subscription-level run uses only that subscription, even
    /// when it is inactive.
    pub async fn run(
        &self,
        config: &ConfigSnapshot,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, HandlerError> {
        let named = match &request.subscription_key {
            Some(key) => Some(
                config
                    .subscriptions
                    .get(key)
                    .ok_or_else(|| HandlerError::UnknownSubscription(key.clone()))?,
            ),
            None => None,
        };
        let feed_key = match (&request.feed_key, named) {
            (Some(key), _) => key.clone(),
            (None, Some(sub)) => sub.rssfeed_key.clone(),
            (None, None) => return Err(HandlerError::MissingKeys),
        };
        let feed = config
            .rssfeeds
            .get(&feed_key)
            .ok_or_else(|| HandlerError::UnknownFeed(feed_key.clone()))?;

        if let Some(sub) = named {
            tracing::info!(subscription = %sub.key, name = %sub.name, "Manually running subscription");
        } else if !feed.active {
            tracing::debug!(feed = %feed_key, "Feed is inactive, skipping update");
            return Ok(UpdateOutcome::empty(request, Some(feed_key)));
        }

        let subscriptions: Vec<&Subscription> = match named {
            Some(sub) => vec![sub],
            None => config
                .subscriptions_for(&feed_key)
                .filter(|s| s.active)
                .collect(),
        };
        if subscriptions.is_empty() {
            tracing::debug!(feed = %feed_key, "No active subscriptions, skipping fetch");
            return Ok(UpdateOutcome::empty(request, Some(feed_key)));
        }

        tracing::info!(
            feed = %feed_key,
            name = %feed.name,
            site = %feed.site,
            update_interval = feed.update_interval,
            subscriptions = subscriptions.len(),
            "Update handler executed on feed"
        );

        let context = self.fetch_context(config, feed);
        let parsed = self.source.fetch(&context.request).await?;

        let mut outcome = UpdateOutcome::empty(request, Some(feed_key.clone()));
        outcome.fetched = true;
        outcome.ttl = parsed.ttl;
        outcome.warnings.extend(parsed.warning.clone());
        if parsed.items.is_empty() {
            tracing::warn!(feed = %feed_key, "No items retrieved");
            return Ok(outcome);
        }

        for sub in subscriptions {
            let mut items = parsed.items.clone();
            let matched = match_items(&mut items, &MatchOptions::for_subscription(sub));
            outcome.warnings.extend(matched.warning);

            for item in matched.matched.into_values() {
                let Some(link) = item.link else {
                    continue;
                };
                if !sub.ignore_timestamp {
                    if let (Some(published), Some(last_match)) = (item.published, sub.last_match) {
                        if published <= last_match {
                            tracing::debug!(
                                subscription = %sub.key,
                                title = %item.title,
                                "Not adding, old timestamp"
                            );
                            continue;
                        }
                    }
                }

                tracing::info!(subscription = %sub.key, title = %item.title, "Matched torrent");
                outcome.matched.push(MatchedTorrent {
                    title: item.title,
                    link,
                    torrent: item.torrent,
                    magnet: item.magnet,
                    published: item.published,
                    size: item.size,
                    folder: item.folder,
                    site_cookies: context.site_cookies.clone(),
                    cookie_header: context.request.cookie_header.clone(),
                    user_agent: context.request.user_agent.clone(),
                    referrer: feed.url.clone(),
                    subscription_key: sub.key.clone(),
                    subscription: sub.clone(),
                });
            }
        }

        Ok(outcome)
    }

    /// [`run`](Self::run) that never fails: errors and panics are logged and
    /// turned into an outcome with `error` set and no matches.
    pub async fn run_safe(&self, config: &ConfigSnapshot, request: UpdateRequest) -> UpdateOutcome {
        match AssertUnwindSafe(self.run(config, &request))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let feed_key = request.feed_key.clone();
                let err = anyhow::Error::new(e);
                tracing::error!(
                    feed = ?feed_key,
                    subscription = ?request.subscription_key,
                    error = %format!("{err:#}"),
                    "Feed update failed"
                );
                UpdateOutcome {
                    error: Some(format!("{err:#}")),
                    ..UpdateOutcome::empty(&request, feed_key)
                }
            }
            Err(_) => {
                tracing::error!(
                    feed = ?request.feed_key,
                    subscription = ?request.subscription_key,
                    "Feed update panicked"
                );
                UpdateOutcome {
                    error: Some("feed update panicked".to_string()),
                    ..UpdateOutcome::empty(&request, request.feed_key.clone())
                }
            }
        }
    }

    /// Dry run for one subscription, including its custom text lines.
    ///
    /// Uses the subscription as given (it may be unsaved) and its feed from
    /// `config`. Nothing is dispatched and no watermark is applied.
    pub async fn preview(
        &self,
        config: &ConfigSnapshot,
        subscription: &Subscription,
    ) -> Result<PreviewOutcome, HandlerError> {
        let feed = config
            .rssfeeds
            .get(&subscription.rssfeed_key)
            .ok_or_else(|| HandlerError::UnknownFeed(subscription.rssfeed_key.clone()))?;

        let context = self.fetch_context(config, feed);
        let parsed = self.source.fetch(&context.request).await?;

        let mut items = parsed.items;
        let outcome = match_items(&mut items, &MatchOptions::for_preview(subscription));
        let warnings = parsed.warning.into_iter().chain(outcome.warning).collect();

        Ok(PreviewOutcome {
            matched_keys: outcome.matched.into_keys().collect(),
            items,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ParsedFeed;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Serves one canned feed and records every request.
    struct CannedSource {
        feed: Result<ParsedFeed, u16>,
        requests: Mutex<Vec<FetchRequest>>,
    }

    #[async_trait]
    impl FeedSource for CannedSource {
        async fn fetch(&self, request: &FetchRequest) -> Result<ParsedFeed, FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            self.feed.clone().map_err(FetchError::HttpStatus)
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 1, 9, hour, 0, 0).unwrap()
    }

    fn canned(titles: &[(&str, Option<DateTime<Utc>>)]) -> Arc<CannedSource> {
        let items = titles
            .iter()
            .enumerate()
            .map(|(i, (title, published))| {
                (
                    i,
                    FeedItem {
                        title: title.to_string(),
                        link: Some(format!("https://tracker.example.org/{i}.torrent")),
                        published: *published,
                        ..FeedItem::default()
                    },
                )
            })
            .collect();
        Arc::new(CannedSource {
            feed: Ok(ParsedFeed {
                items,
                ttl: Some(60),
                ..ParsedFeed::default()
            }),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn config() -> ConfigSnapshot {
        let mut config = ConfigSnapshot::default();
        config.rssfeeds.insert(
            "0".into(),
            Feed {
                key: "0".into(),
                url: "https://tracker.example.org/rss".into(),
                site: "tracker.example.org".into(),
                ..Feed::default()
            },
        );
        config.subscriptions.insert(
            "0".into(),
            Subscription {
                key: "0".into(),
                rssfeed_key: "0".into(),
                regex_include: "sparc64".into(),
                last_match: Some(at(1)),
                custom_text_lines: vec!["custom sparc64".into()],
                ..Subscription::default()
            },
        );
        config.subscriptions.insert(
            "1".into(),
            Subscription {
                key: "1".into(),
                rssfeed_key: "0".into(),
                last_match: Some(at(1)),
                ..Subscription::default()
            },
        );
        config
    }

    const TITLES: [&str; 3] = [
        "FreeBSD-9.0-RELEASE-sparc64-all",
        "FreeBSD-9.0-RELEASE-i386-all",
        "FreeBSD-9.0-RELEASE-amd64-all",
    ];

    fn fresh_feed() -> Arc<CannedSource> {
        canned(&[
            (TITLES[0], Some(at(10))),
            (TITLES[1], Some(at(11))),
            (TITLES[2], Some(at(12))),
        ])
    }

    fn titles_for(outcome: &UpdateOutcome, sub: &str) -> Vec<String> {
        outcome
            .matched
            .iter()
            .filter(|m| m.subscription_key == sub)
            .map(|m| m.title.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_single_fetch_fans_out_to_subscriptions() {
        let source = fresh_feed();
        let handler = FeedUpdateHandler::new(source.clone(), "feedwatch-test");

        let outcome = handler.run(&config(), &UpdateRequest::feed("0")).await.unwrap();

        assert_eq!(source.requests.lock().unwrap().len(), 1);
        assert_eq!(titles_for(&outcome, "0"), vec![TITLES[0].to_string()]);
        assert_eq!(titles_for(&outcome, "1").len(), 3);
        assert_eq!(outcome.ttl, Some(60));
        assert!(outcome.fetched);
        // Custom text lines never reach scheduled runs
        assert!(outcome.matched.iter().all(|m| m.title != "custom sparc64"));
    }

    #[tokio::test]
    async fn test_watermark_filters_old_items() {
        let source = canned(&[
            (TITLES[0], Some(at(1))),
            (TITLES[1], Some(at(2))),
            (TITLES[2], None),
        ]);
        let handler = FeedUpdateHandler::new(source, "ua");
        let outcome = handler.run(&config(), &UpdateRequest::feed("0")).await.unwrap();
        assert_eq!(
            titles_for(&outcome, "1"),
            vec![TITLES[1].to_string(), TITLES[2].to_string()]
        );
    }

    #[tokio::test]
    async fn test_ignore_timestamp_keeps_old_items() {
        let source = canned(&[(TITLES[0], Some(at(0)))]);
        let handler = FeedUpdateHandler::new(source, "ua");
        let mut config = config();
        config.subscriptions.get_mut("1").unwrap().ignore_timestamp = true;

        let outcome = handler.run(&config, &UpdateRequest::feed("0")).await.unwrap();
        assert_eq!(titles_for(&outcome, "1"), vec![TITLES[0].to_string()]);
        assert!(titles_for(&outcome, "0").is_empty());
    }

    #[tokio::test]
    async fn test_inactive_feed_short_circuits() {
        let source = fresh_feed();
        let handler = FeedUpdateHandler::new(source.clone(), "ua");
        let mut config = config();
        config.rssfeeds.get_mut("0").unwrap().active = false;

        let outcome = handler.run(&config, &UpdateRequest::feed("0")).await.unwrap();
        assert!(!outcome.fetched);
        assert!(outcome.matched.is_empty());
        assert!(source.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_run_uses_only_that_subscription() {
        let source = fresh_feed();
        let handler = FeedUpdateHandler::new(source, "ua");
        let mut config = config();
        config.rssfeeds.get_mut("0").unwrap().active = false;
        config.subscriptions.get_mut("0").unwrap().active = false;

        let outcome = handler
            .run(&config, &UpdateRequest::subscription("0"))
            .await
            .unwrap();
        assert_eq!(outcome.feed_key.as_deref(), Some("0"));
        assert_eq!(titles_for(&outcome, "0"), vec![TITLES[0].to_string()]);
        assert!(titles_for(&outcome, "1").is_empty());
    }

    #[tokio::test]
    async fn test_inactive_subscription_skipped_on_feed_run() {
        let handler = FeedUpdateHandler::new(fresh_feed(), "ua");
        let mut config = config();
        config.subscriptions.get_mut("1").unwrap().active = false;

        let outcome = handler.run(&config, &UpdateRequest::feed("0")).await.unwrap();
        assert!(titles_for(&outcome, "1").is_empty());
        assert_eq!(titles_for(&outcome, "0").len(), 1);
    }

    #[tokio::test]
    async fn test_cookies_and_user_agent_forwarded() {
        let source = fresh_feed();
        let handler = FeedUpdateHandler::new(source.clone(), "default-ua");
        let mut config = config();
        config.cookies.insert(
            "0".into(),
            crate::storage::CookieSet {
                key: "0".into(),
                site: "tracker.example.org".into(),
                value: [("uid".to_string(), "12".to_string())].into(),
                active: true,
            },
        );

        let outcome = handler.run(&config, &UpdateRequest::feed("0")).await.unwrap();
        let requests = source.requests.lock().unwrap();
        assert_eq!(requests[0].cookie_header.as_deref(), Some("uid=12"));
        assert_eq!(requests[0].user_agent, "default-ua");

        let first = &outcome.matched[0];
        assert_eq!(first.site_cookies["uid"], "12");
        assert_eq!(first.referrer, "https://tracker.example.org/rss");
    }

    #[tokio::test]
    async fn test_missing_keys_and_unknown_entries() {
        let handler = FeedUpdateHandler::new(fresh_feed(), "ua");
        let config = config();

        let err = handler.run(&config, &UpdateRequest::default()).await.unwrap_err();
        assert!(matches!(err, HandlerError::MissingKeys));
        let err = handler.run(&config, &UpdateRequest::feed("42")).await.unwrap_err();
        assert!(matches!(err, HandlerError::UnknownFeed(_)));
        let err = handler
            .run(&config, &UpdateRequest::subscription("42"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnknownSubscription(_)));
    }

    #[tokio::test]
    async fn test_run_safe_turns_fetch_failure_into_empty_outcome() {
        let source = Arc::new(CannedSource {
            feed: Err(503),
            requests: Mutex::new(Vec::new()),
        });
        let handler = FeedUpdateHandler::new(source, "ua");

        let outcome = handler.run_safe(&config(), UpdateRequest::feed("0")).await;
        assert!(outcome.matched.is_empty());
        assert!(!outcome.fetched);
        let error = outcome.error.unwrap();
        assert!(error.contains("503"), "unexpected error text: {error}");
    }

    #[tokio::test]
    async fn test_preview_includes_custom_lines() {
        let handler = FeedUpdateHandler::new(fresh_feed(), "ua");
        let config = config();
        let sub = config.subscriptions["0"].clone();

        let preview = handler.preview(&config, &sub).await.unwrap();
        assert_eq!(preview.items.len(), 4);
        assert_eq!(preview.matched_keys, vec![0, 3]);
        assert!(preview.items[&3].custom_line);
        assert_eq!(preview.items[&0].regex_include_match, Some(20..27));
    }
}
