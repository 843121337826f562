use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Posted to the control loop each time a feed's timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub feed_key: String,
    /// Identifies the timer instance, so fires from a replaced timer can be ignored
    pub generation: u64,
}

/// A repeating per-feed timer. The first fire happens one full interval
/// after start. Dropping the entry stops the timer.
#[derive(Debug)]
pub struct TimerEntry {
    feed_key: String,
    interval_minutes: u32,
    generation: u64,
    task: JoinHandle<()>,
}

impl TimerEntry {
    pub fn start(
        feed_key: String,
        interval_minutes: u32,
        generation: u64,
        fired: mpsc::Sender<TimerFired>,
    ) -> Self {
        let period = minutes(interval_minutes);
        let key = feed_key.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let event = TimerFired {
                    feed_key: key.clone(),
                    generation,
                };
                if fired.send(event).await.is_err() {
                    // Control loop is gone
                    break;
                }
            }
        });

        tracing::debug!(feed = %feed_key, interval_minutes, "Timer started");
        Self {
            feed_key,
            interval_minutes,
            generation,
            task,
        }
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn interval(&self) -> Duration {
        minutes(self.interval_minutes)
    }
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!(feed = %self.feed_key, "Timer stopped");
    }
}

fn minutes(m: u32) -> Duration {
    Duration::from_secs(u64::from(m) * 60)
}
