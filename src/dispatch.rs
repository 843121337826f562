//! Collaborators fed by the scheduler: torrent dispatch and notifications.
//!
//! Both are called from the control loop only, after a run's result has
//! been handed back by the run queue.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::scheduler::MatchedTorrent;
use crate::storage::{ConfigSnapshot, EmailConfiguration, EmailMessage};

/// Per-item result reported by a [`TorrentDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Added,
    Failed(String),
}

impl DispatchStatus {
    pub fn is_added(&self) -> bool {
        matches!(self, DispatchStatus::Added)
    }
}

/// Adds matched torrents to the torrent client.
///
/// Must return one status per input item, in input order. Retrying failed
/// adds is the dispatcher's business; the scheduler never retries.
#[async_trait]
pub trait TorrentDispatcher: Send + Sync {
    async fn add_torrents(&self, torrents: &[MatchedTorrent]) -> Vec<DispatchStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    TorrentAdded,
    TorrentCompleted,
}

/// One email to render and send.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub event: NotificationEvent,
    pub email_configuration: EmailConfiguration,
    pub message: EmailMessage,
    pub subscription_name: String,
    pub matched_titles: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> anyhow::Result<()>;
}

/// Build the notifications for torrents that reached `event`.
///
/// `torrents` are `(subscription_key, title)` pairs. One request is built
/// per subscription and email message with the matching trigger enabled.
/// Nothing is built when email is disabled globally; inactive or missing
/// messages are skipped.
pub fn build_notifications<'a, I>(
    config: &ConfigSnapshot,
    event: NotificationEvent,
    torrents: I,
) -> Vec<NotificationRequest>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    if !config.email_configurations.send_email_on_torrent_events {
        return Vec::new();
    }

    let mut grouped: BTreeMap<(&str, &str), Vec<String>> = BTreeMap::new();
    for (subscription_key, title) in torrents {
        let Some(subscription) = config.subscriptions.get(subscription_key) else {
            continue;
        };
        for (message_key, triggers) in &subscription.email_notifications {
            let enabled = match event {
                NotificationEvent::TorrentAdded => triggers.on_torrent_added,
                NotificationEvent::TorrentCompleted => triggers.on_torrent_completed,
            };
            if enabled {
                grouped
                    .entry((subscription.key.as_str(), message_key.as_str()))
                    .or_default()
                    .push(title.to_string());
            }
        }
    }

    grouped
        .into_iter()
        .filter_map(|((subscription_key, message_key), matched_titles)| {
            let message = config.email_messages.get(message_key)?;
            if !message.active {
                tracing::debug!(message = %message_key, "Email message inactive, not sending");
                return None;
            }
            let subscription = config.subscriptions.get(subscription_key)?;
            Some(NotificationRequest {
                event,
                email_configuration: config.email_configurations.clone(),
                message: message.clone(),
                subscription_name: subscription.name.clone(),
                matched_titles,
            })
        })
        .collect()
}

/// Dispatcher that only logs. Used when no torrent client is attached.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl TorrentDispatcher for LogDispatcher {
    async fn add_torrents(&self, torrents: &[MatchedTorrent]) -> Vec<DispatchStatus> {
        torrents
            .iter()
            .map(|t| {
                tracing::info!(
                    title = %t.title,
                    link = %t.link,
                    subscription = %t.subscription_key,
                    folder = ?t.folder,
                    "Torrent matched"
                );
                DispatchStatus::Added
            })
            .collect()
    }
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, request: NotificationRequest) -> anyhow::Result<()> {
        tracing::info!(
            event = ?request.event,
            to = %request.message.to_address,
            subscription = %request.subscription_name,
            torrents = request.matched_titles.len(),
            "Notification"
        );
        Ok(())
    }
}

/// Keeps everything it is given in memory. Titles listed in `reject` fail.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    added: Mutex<Vec<MatchedTorrent>>,
    reject: Vec<String>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(titles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            added: Mutex::new(Vec::new()),
            reject: titles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn added(&self) -> Vec<MatchedTorrent> {
        self.added
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TorrentDispatcher for RecordingDispatcher {
    async fn add_torrents(&self, torrents: &[MatchedTorrent]) -> Vec<DispatchStatus> {
        let mut added = self.added.lock().unwrap_or_else(PoisonError::into_inner);
        torrents
            .iter()
            .map(|t| {
                if self.reject.contains(&t.title) {
                    DispatchStatus::Failed("rejected".to_string())
                } else {
                    added.push(t.clone());
                    DispatchStatus::Added
                }
            })
            .collect()
    }
}

/// Keeps every notification request in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, request: NotificationRequest) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EmailNotification, Subscription};
    use pretty_assertions::assert_eq;

    fn config(send: bool) -> ConfigSnapshot {
        let mut config = ConfigSnapshot::default();
        config.email_configurations.send_email_on_torrent_events = send;
        config.email_messages.insert(
            "0".into(),
            EmailMessage {
                key: "0".into(),
                name: "added".into(),
                to_address: "me@example.org".into(),
                ..EmailMessage::default()
            },
        );
        config.email_messages.insert(
            "1".into(),
            EmailMessage {
                key: "1".into(),
                active: false,
                ..EmailMessage::default()
            },
        );

        let mut notifications = BTreeMap::new();
        notifications.insert(
            "0".to_string(),
            EmailNotification {
                on_torrent_added: true,
                on_torrent_completed: false,
            },
        );
        notifications.insert(
            "1".to_string(),
            EmailNotification {
                on_torrent_added: true,
                on_torrent_completed: true,
            },
        );
        config.subscriptions.insert(
            "0".into(),
            Subscription {
                key: "0".into(),
                name: "BSD".into(),
                email_notifications: notifications,
                ..Subscription::default()
            },
        );
        config.subscriptions.insert(
            "1".into(),
            Subscription {
                key: "1".into(),
                name: "quiet".into(),
                ..Subscription::default()
            },
        );
        config
    }

    #[test]
    fn test_added_notifications_grouped_per_message() {
        let config = config(true);
        let requests = build_notifications(
            &config,
            NotificationEvent::TorrentAdded,
            [("0", "a"), ("0", "b"), ("1", "c")],
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].subscription_name, "BSD");
        assert_eq!(requests[0].message.to_address, "me@example.org");
        assert_eq!(requests[0].matched_titles, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_completed_only_uses_completed_trigger() {
        let config = config(true);
        // Message "1" has the completed trigger but is inactive
        let requests =
            build_notifications(&config, NotificationEvent::TorrentCompleted, [("0", "a")]);
        assert!(requests.is_empty());
    }

    #[test]
    fn test_disabled_globally() {
        let config = config(false);
        let requests = build_notifications(&config, NotificationEvent::TorrentAdded, [("0", "a")]);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_recording_dispatcher_rejects_listed_titles() {
        let dispatcher = RecordingDispatcher::rejecting(["bad"]);
        let torrent = |title: &str| MatchedTorrent {
            title: title.to_string(),
            link: "https://a.example/1.torrent".into(),
            torrent: None,
            magnet: None,
            published: None,
            size: None,
            folder: None,
            site_cookies: BTreeMap::new(),
            cookie_header: None,
            user_agent: String::new(),
            referrer: String::new(),
            subscription_key: "0".into(),
            subscription: Subscription::default(),
        };

        let statuses = dispatcher
            .add_torrents(&[torrent("good"), torrent("bad")])
            .await;
        assert_eq!(
            statuses,
            vec![DispatchStatus::Added, DispatchStatus::Failed("rejected".into())]
        );
        assert_eq!(dispatcher.added().len(), 1);
    }
}
