//! Polls torrent RSS/Atom feeds, filters their items through per-subscription
//! include/exclude rules and hands new matches to a torrent client.
//!
//! - [`scheduler`] - per-feed timers, the run queue and the control loop
//! - [`matcher`] - include/exclude regex matching
//! - [`feed`] - fetching and parsing feeds
//! - [`storage`] - the persisted config store
//! - [`dispatch`] - torrent-add and notification collaborators
//! - [`config`] - daemon settings file

pub mod config;
pub mod dispatch;
pub mod feed;
pub mod matcher;
pub mod scheduler;
pub mod storage;
pub mod util;
