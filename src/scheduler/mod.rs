//! Per-feed scheduling and the control loop that owns all mutable state.
//!
//! A single task runs [`Scheduler::run`]. It owns the config, the timer
//! table and the run queue's completions; nothing else mutates them. Timer
//! tasks and [`SchedulerHandle`]s only post messages to it, and fetch jobs
//! only return data. Dispatch, watermark updates, notifications and config
//! saves therefore always happen on the control loop, in completion order.

mod handler;
mod run_queue;
mod timers;

pub use handler::{
    FeedUpdateHandler, HandlerError, MatchedTorrent, PreviewOutcome, UpdateOutcome, UpdateRequest,
};
pub use run_queue::{JobError, JobHandle, RunQueue};
pub use timers::{TimerEntry, TimerFired};

use chrono::{SubsecRound, Utc};
use futures::stream::FuturesOrdered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::dispatch::{build_notifications, NotificationEvent, Notifier, TorrentDispatcher};
use crate::storage::{
    ConfigManager, ConfigPatch, ConfigSnapshot, Feed, SaveError, StorageError, Subscription,
};

/// TTL hints at or above this many minutes (about a year) are ignored.
pub const MAX_TTL_MINUTES: u32 = 524_160;

const CONTROL_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is not running")]
    Stopped,
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Broadcast to listeners (UIs) after config changes. Lagging or absent
/// listeners are not an error.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    ConfigChanged {
        config: Arc<ConfigSnapshot>,
        /// Non-fatal problems from the run that caused the change
        warnings: Vec<String>,
    },
}

/// What a completed run did, once applied on the control loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSummary {
    pub feed_key: Option<String>,
    pub fetched: bool,
    pub matched: usize,
    pub added: usize,
    pub failed: usize,
    /// Interval adopted from the feed's TTL during this run
    pub new_interval: Option<u32>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

type Reply<T> = oneshot::Sender<T>;

enum ControlMessage {
    RunFeed {
        feed_key: String,
        reply: Reply<UpdateSummary>,
    },
    RunSubscription {
        subscription_key: String,
        reply: Reply<UpdateSummary>,
    },
    SaveFeed {
        feed: Feed,
        reply: Reply<Result<Feed, SaveError>>,
    },
    DeleteFeed {
        key: String,
        reply: Reply<Result<Feed, SaveError>>,
    },
    SaveSubscription {
        subscription: Subscription,
        reply: Reply<Result<Subscription, SaveError>>,
    },
    DeleteSubscription {
        key: String,
        reply: Reply<Result<Subscription, SaveError>>,
    },
    GenericSave {
        section: String,
        key: Option<String>,
        data: Option<Value>,
        delete: bool,
        reply: Reply<Result<ConfigSnapshot, SaveError>>,
    },
    SetConfig {
        patch: ConfigPatch,
        reply: Reply<Result<(), StorageError>>,
    },
    TorrentCompleted {
        subscription_key: String,
        title: String,
    },
    Preview {
        subscription: Subscription,
        reply: Reply<Result<PreviewOutcome, HandlerError>>,
    },
    GetConfig {
        reply: Reply<ConfigSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct Completion {
    request: UpdateRequest,
    reply: Option<Reply<UpdateSummary>>,
    result: Result<UpdateOutcome, JobError>,
}

type InFlight = Pin<Box<dyn Future<Output = Completion> + Send>>;

pub struct Scheduler {
    config: ConfigManager,
    handler: Arc<FeedUpdateHandler>,
    dispatcher: Arc<dyn TorrentDispatcher>,
    notifier: Arc<dyn Notifier>,
    run_queue: RunQueue<UpdateOutcome>,
    in_flight: FuturesOrdered<InFlight>,
    timers: HashMap<String, TimerEntry>,
    timers_enabled: bool,
    next_generation: u64,
    timer_tx: mpsc::Sender<TimerFired>,
    timer_rx: mpsc::Receiver<TimerFired>,
    control_rx: mpsc::Receiver<ControlMessage>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Build the scheduler and the handle used to talk to it.
    ///
    /// Timers are not started until [`enable_timers`](Self::enable_timers).
    pub fn new(
        config: ConfigManager,
        handler: FeedUpdateHandler,
        dispatcher: Arc<dyn TorrentDispatcher>,
        notifier: Arc<dyn Notifier>,
        concurrency: usize,
    ) -> (Self, SchedulerHandle) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let handle = SchedulerHandle {
            tx: control_tx,
            events: events.clone(),
        };
        let scheduler = Self {
            config,
            handler: Arc::new(handler),
            dispatcher,
            notifier,
            run_queue: RunQueue::new(concurrency),
            in_flight: FuturesOrdered::new(),
            timers: HashMap::new(),
            timers_enabled: false,
            next_generation: 0,
            timer_tx,
            timer_rx,
            control_rx,
            events,
        };
        (scheduler, handle)
    }

    pub fn config(&self) -> &ConfigSnapshot {
        self.config.get_config()
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Start a timer for every active feed; queue an immediate run for those
    /// flagged `update_on_startup`.
    pub fn enable_timers(&mut self) {
        self.timers_enabled = true;
        let feeds: Vec<(String, u32, bool)> = self
            .config
            .get_config()
            .rssfeeds
            .values()
            .filter(|f| f.active)
            .map(|f| (f.key.clone(), f.update_interval, f.update_on_startup))
            .collect();

        for (key, interval, on_startup) in feeds {
            if self.set_timer(&key, interval) {
                tracing::info!(feed = %key, interval_minutes = interval, "Scheduled feed");
            }
            if on_startup {
                tracing::info!(feed = %key, "Updating feed on startup");
                self.queue_rssfeed_update(UpdateRequest::feed(key), None);
            }
        }
    }

    pub fn disable_timers(&mut self) {
        self.timers_enabled = false;
        self.timers.clear();
    }

    /// Create or reschedule the timer for `key`.
    ///
    /// Returns false when nothing changed: the timer already runs at
    /// `interval_minutes`, or the interval is 0.
    pub fn set_timer(&mut self, key: &str, interval_minutes: u32) -> bool {
        if interval_minutes == 0 {
            tracing::warn!(feed = %key, "Refusing to schedule feed with interval 0");
            return false;
        }
        if let Some(existing) = self.timers.get(key) {
            if existing.interval_minutes() == interval_minutes {
                return false;
            }
        }

        self.next_generation += 1;
        let entry = TimerEntry::start(
            key.to_string(),
            interval_minutes,
            self.next_generation,
            self.timer_tx.clone(),
        );
        // Replacing the entry drops (and stops) the old timer
        self.timers.insert(key.to_string(), entry);
        true
    }

    /// Stop and remove the timer for `key`. False if there was none.
    pub fn delete_timer(&mut self, key: &str) -> bool {
        if self.timers.remove(key).is_none() {
            tracing::warn!(feed = %key, "Cannot delete timer, no timer with that key");
            return false;
        }
        true
    }

    pub fn timer_interval(&self, key: &str) -> Option<Duration> {
        self.timers.get(key).map(TimerEntry::interval)
    }

    /// Bring timers in line with the current feeds after a config edit.
    fn sync_timers(&mut self) {
        if !self.timers_enabled {
            return;
        }
        let feeds = &self.config.get_config().rssfeeds;
        let stale: Vec<String> = self
            .timers
            .keys()
            .filter(|k| !feeds.get(*k).is_some_and(|f| f.active))
            .cloned()
            .collect();
        let wanted: Vec<(String, u32)> = feeds
            .values()
            .filter(|f| f.active)
            .map(|f| (f.key.clone(), f.update_interval))
            .collect();

        for key in stale {
            self.delete_timer(&key);
        }
        for (key, interval) in wanted {
            self.set_timer(&key, interval);
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        let current = self.timers.get(&fired.feed_key).map(TimerEntry::generation);
        if current != Some(fired.generation) {
            tracing::debug!(feed = %fired.feed_key, "Ignoring fire from a replaced timer");
            return;
        }
        self.queue_rssfeed_update(UpdateRequest::feed(fired.feed_key), None);
    }

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    /// Push a fetch-and-match job. Its result is applied by the control loop
    /// in submission order.
    pub fn queue_rssfeed_update(
        &mut self,
        request: UpdateRequest,
        reply: Option<Reply<UpdateSummary>>,
    ) {
        let handler = Arc::clone(&self.handler);
        let config = self.config.get_config().clone();
        let job_request = request.clone();
        let job = self
            .run_queue
            .push(async move { Ok(handler.run_safe(&config, job_request).await) });

        self.in_flight.push_back(Box::pin(job.map(move |result| Completion {
            request,
            reply,
            result,
        })));
    }

    async fn on_completion(&mut self, completion: Completion) {
        let Completion {
            request,
            reply,
            result,
        } = completion;

        let summary = match result {
            Ok(outcome) => self.apply_outcome(outcome).await,
            Err(e) => {
                tracing::error!(
                    feed = ?request.feed_key,
                    subscription = ?request.subscription_key,
                    error = %e,
                    "Feed update job did not complete"
                );
                UpdateSummary {
                    feed_key: request.feed_key.clone(),
                    error: Some(e.to_string()),
                    ..UpdateSummary::default()
                }
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(summary);
        }
    }

    /// Apply a run's result: TTL, `last_update`, dispatch, watermarks,
    /// notifications, then persist and announce.
    async fn apply_outcome(&mut self, outcome: UpdateOutcome) -> UpdateSummary {
        let mut summary = UpdateSummary {
            feed_key: outcome.feed_key.clone(),
            fetched: outcome.fetched,
            matched: outcome.matched.len(),
            warnings: outcome.warnings.clone(),
            error: outcome.error.clone(),
            ..UpdateSummary::default()
        };

        let feed_key = outcome.feed_key.clone();
        if let Some(key) = &feed_key {
            if self.config.feed(key).is_none() {
                tracing::info!(feed = %key, "Feed was deleted while updating, discarding result");
                summary.error = Some(format!("feed {key} was deleted"));
                summary.matched = 0;
                return summary;
            }
        }

        let mut changed = false;
        if let (Some(key), Some(ttl)) = (&feed_key, outcome.ttl) {
            if let Some(interval) = self.reconcile_ttl(key, ttl, &mut summary.warnings) {
                summary.new_interval = Some(interval);
                changed = true;
            }
        }

        if outcome.request.is_feed_level() && outcome.fetched && outcome.error.is_none() {
            if let Some(feed) = feed_key.as_deref().and_then(|k| self.config.feed_mut(k)) {
                feed.last_update = Some(Utc::now().trunc_subsecs(0));
                changed = true;
            }
        }

        let feed_level = outcome.request.is_feed_level();
        let matched: Vec<MatchedTorrent> = outcome
            .matched
            .into_iter()
            .filter(|torrent| self.still_wanted(torrent, feed_level))
            .collect();
        summary.matched = matched.len();

        let mut added = Vec::new();
        if !matched.is_empty() {
            let statuses = self.dispatcher.add_torrents(&matched).await;
            if statuses.len() != matched.len() {
                tracing::warn!(
                    expected = matched.len(),
                    received = statuses.len(),
                    "Dispatcher returned a status count that does not match"
                );
            }

            for (torrent, status) in matched.iter().zip(statuses) {
                if !status.is_added() {
                    summary.failed += 1;
                    tracing::warn!(title = %torrent.title, link = %torrent.link, status = ?status, "Failed to add torrent");
                    continue;
                }
                summary.added += 1;
                tracing::info!(title = %torrent.title, "Successfully added torrent");
                changed |= self.advance_watermark(torrent);
                added.push((torrent.subscription_key.clone(), torrent.title.clone()));
            }
        }

        if changed {
            if let Err(e) = self.config.save().await {
                tracing::error!(error = %e, "Failed to save config after feed update");
            }
        }

        self.notify(
            NotificationEvent::TorrentAdded,
            added.iter().map(|(k, t)| (k.as_str(), t.as_str())),
        )
        .await;

        self.emit_config_changed(summary.warnings.clone());
        summary
    }

    /// Re-check a matched item against the current config. The run matched
    /// against the snapshot it was queued with, which may be stale by now.
    fn still_wanted(&self, torrent: &MatchedTorrent, feed_level: bool) -> bool {
        let Some(sub) = self.config.subscription(&torrent.subscription_key) else {
            tracing::info!(
                subscription = %torrent.subscription_key,
                title = %torrent.title,
                "Subscription was deleted while updating, not adding torrent"
            );
            return false;
        };
        if feed_level && !sub.active {
            tracing::info!(
                subscription = %sub.key,
                title = %torrent.title,
                "Subscription was deactivated while updating, not adding torrent"
            );
            return false;
        }
        let already_seen = match (torrent.published, sub.last_match) {
            (Some(published), Some(last_match)) => !sub.ignore_timestamp && last_match >= published,
            _ => false,
        };
        if already_seen {
            tracing::debug!(
                subscription = %sub.key,
                title = %torrent.title,
                "Torrent already added by an earlier update"
            );
        }
        !already_seen
    }

    fn reconcile_ttl(&mut self, key: &str, ttl: u32, warnings: &mut Vec<String>) -> Option<u32> {
        let feed = self.config.feed(key)?;
        if !feed.obey_ttl || ttl == feed.update_interval {
            return None;
        }
        if !(1..MAX_TTL_MINUTES).contains(&ttl) {
            tracing::warn!(feed = %key, ttl, "Implausible TTL value, ignoring");
            warnings.push(format!("Implausible TTL value {ttl} ignored"));
            return None;
        }

        tracing::info!(feed = %key, ttl, "Rescheduling feed according to TTL");
        let active = feed.active;
        if active && self.timers_enabled {
            self.set_timer(key, ttl);
        }
        if let Some(feed) = self.config.feed_mut(key) {
            feed.update_interval = ttl;
        }
        Some(ttl)
    }

    /// Move the subscription's watermark up to the torrent's timestamp.
    fn advance_watermark(&mut self, torrent: &MatchedTorrent) -> bool {
        let Some(published) = torrent.published else {
            return false;
        };
        let Some(subscription) = self.config.subscription_mut(&torrent.subscription_key) else {
            return false;
        };
        if subscription.last_match.is_some_and(|last| last >= published) {
            return false;
        }
        subscription.last_match = Some(published);
        true
    }

    async fn notify<'a, I>(&mut self, event: NotificationEvent, torrents: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let requests = build_notifications(self.config.get_config(), event, torrents);
        for request in requests {
            let to = request.message.to_address.clone();
            if let Err(e) = self.notifier.notify(request).await {
                tracing::warn!(to = %to, error = %format!("{e:#}"), "Failed to send notification");
            }
        }
    }

    fn emit_config_changed(&self, warnings: Vec<String>) {
        let event = SchedulerEvent::ConfigChanged {
            config: Arc::new(self.config.get_config().clone()),
            warnings,
        };
        // No listener is fine
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------------

    async fn on_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::RunFeed { feed_key, reply } => {
                self.queue_rssfeed_update(UpdateRequest::feed(feed_key), Some(reply));
            }
            ControlMessage::RunSubscription {
                subscription_key,
                reply,
            } => {
                self.queue_rssfeed_update(UpdateRequest::subscription(subscription_key), Some(reply));
            }
            ControlMessage::SaveFeed { feed, reply } => {
                let result = self.config.save_record(feed).await;
                self.after_edit(result.is_ok());
                let _ = reply.send(result);
            }
            ControlMessage::DeleteFeed { key, reply } => {
                let result = self.config.delete_record::<Feed>(&key).await;
                self.after_edit(result.is_ok());
                let _ = reply.send(result);
            }
            ControlMessage::SaveSubscription {
                subscription,
                reply,
            } => {
                let result = self.config.save_record(subscription).await;
                self.after_edit(result.is_ok());
                let _ = reply.send(result);
            }
            ControlMessage::DeleteSubscription { key, reply } => {
                let result = self.config.delete_record::<Subscription>(&key).await;
                self.after_edit(result.is_ok());
                let _ = reply.send(result);
            }
            ControlMessage::GenericSave {
                section,
                key,
                data,
                delete,
                reply,
            } => {
                let result = self
                    .config
                    .generic_save(&section, key.as_deref(), data, delete)
                    .await
                    .map(Clone::clone);
                self.after_edit(result.is_ok());
                let _ = reply.send(result);
            }
            ControlMessage::SetConfig { patch, reply } => {
                let result = self.config.set_config(patch).await;
                self.after_edit(result.is_ok());
                let _ = reply.send(result);
            }
            ControlMessage::TorrentCompleted {
                subscription_key,
                title,
            } => {
                tracing::info!(subscription = %subscription_key, title = %title, "Torrent completed");
                self.notify(
                    NotificationEvent::TorrentCompleted,
                    [(subscription_key.as_str(), title.as_str())],
                )
                .await;
            }
            ControlMessage::Preview {
                subscription,
                reply,
            } => {
                let handler = Arc::clone(&self.handler);
                let config = self.config.get_config().clone();
                tokio::spawn(async move {
                    let _ = reply.send(handler.preview(&config, &subscription).await);
                });
            }
            ControlMessage::GetConfig { reply } => {
                let _ = reply.send(self.config.get_config().clone());
            }
            // Handled by the loop itself
            ControlMessage::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn after_edit(&mut self, succeeded: bool) {
        if succeeded {
            self.sync_timers();
            self.emit_config_changed(Vec::new());
        }
    }

    /// Run the control loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        let shutdown_reply = loop {
            tokio::select! {
                Some(fired) = self.timer_rx.recv() => self.on_timer(fired),
                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_completion(completion).await;
                }
                message = self.control_rx.recv() => match message {
                    Some(ControlMessage::Shutdown { reply }) => break Some(reply),
                    Some(message) => self.on_control(message).await,
                    None => break None,
                },
            }
        };

        self.disable_timers();
        if !self.in_flight.is_empty() {
            tracing::info!(
                pending = self.in_flight.len(),
                "Discarding in-flight feed updates on shutdown"
            );
        }
        if let Err(e) = self.config.save().await {
            tracing::error!(error = %e, "Failed to save config on shutdown");
        }
        tracing::info!("Scheduler stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front end to a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<ControlMessage>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    async fn request<R>(
        &self,
        build: impl FnOnce(Reply<R>) -> ControlMessage,
    ) -> Result<R, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Run a whole feed now; resolves once the result has been applied.
    pub async fn run_feed_now(&self, feed_key: &str) -> Result<UpdateSummary, SchedulerError> {
        let feed_key = feed_key.to_string();
        self.request(|reply| ControlMessage::RunFeed { feed_key, reply })
            .await
    }

    /// Run a single subscription now. Does not touch the feed's `last_update`.
    pub async fn run_subscription_now(
        &self,
        subscription_key: &str,
    ) -> Result<UpdateSummary, SchedulerError> {
        let subscription_key = subscription_key.to_string();
        self.request(|reply| ControlMessage::RunSubscription {
            subscription_key,
            reply,
        })
        .await
    }

    pub async fn save_feed(&self, feed: Feed) -> Result<Feed, SchedulerError> {
        Ok(self
            .request(|reply| ControlMessage::SaveFeed { feed, reply })
            .await??)
    }

    pub async fn delete_feed(&self, key: &str) -> Result<Feed, SchedulerError> {
        let key = key.to_string();
        Ok(self
            .request(|reply| ControlMessage::DeleteFeed { key, reply })
            .await??)
    }

    pub async fn save_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<Subscription, SchedulerError> {
        Ok(self
            .request(|reply| ControlMessage::SaveSubscription {
                subscription,
                reply,
            })
            .await??)
    }

    pub async fn delete_subscription(&self, key: &str) -> Result<Subscription, SchedulerError> {
        let key = key.to_string();
        Ok(self
            .request(|reply| ControlMessage::DeleteSubscription { key, reply })
            .await??)
    }

    pub async fn generic_save(
        &self,
        section: &str,
        key: Option<&str>,
        data: Option<Value>,
        delete: bool,
    ) -> Result<ConfigSnapshot, SchedulerError> {
        let section = section.to_string();
        let key = key.map(str::to_string);
        Ok(self
            .request(|reply| ControlMessage::GenericSave {
                section,
                key,
                data,
                delete,
                reply,
            })
            .await??)
    }

    pub async fn set_config(&self, patch: ConfigPatch) -> Result<(), SchedulerError> {
        Ok(self
            .request(|reply| ControlMessage::SetConfig { patch, reply })
            .await??)
    }

    /// Report that a torrent added for `subscription_key` finished downloading.
    pub async fn torrent_completed(
        &self,
        subscription_key: &str,
        title: &str,
    ) -> Result<(), SchedulerError> {
        self.tx
            .send(ControlMessage::TorrentCompleted {
                subscription_key: subscription_key.to_string(),
                title: title.to_string(),
            })
            .await
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Dry-run `subscription` against its feed, including custom text lines.
    pub async fn preview(
        &self,
        subscription: Subscription,
    ) -> Result<PreviewOutcome, SchedulerError> {
        Ok(self
            .request(|reply| ControlMessage::Preview {
                subscription,
                reply,
            })
            .await??)
    }

    pub async fn get_config(&self) -> Result<ConfigSnapshot, SchedulerError> {
        self.request(|reply| ControlMessage::GetConfig { reply })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Stop timers, save the config and end the control loop.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(|reply| ControlMessage::Shutdown { reply })
            .await
    }
}
