use crate::config::PollTarget;
use crate::dispatcher::Dispatcher;
use crate::router::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Periodic reader for features the device never notifies about
///
/// Each target gets its own task. A tick issues a `get` and publishes the
/// result through the [`Router`] as if it had been a notification; a failed
/// tick is logged and the next one runs on schedule.
pub struct Poller {
    tasks: Vec<JoinHandle<()>>,
}

impl Poller {
    /// Start polling every target
    pub fn start(targets: &[PollTarget], dispatcher: Arc<Dispatcher>, router: Arc<Router>) -> Self {
        let tasks = targets
            .iter()
            .cloned()
            .map(|target| {
                let dispatcher = dispatcher.clone();
                let router = router.clone();
                tokio::spawn(poll_loop(target, dispatcher, router))
            })
            .collect();

        Self { tasks }
    }

    /// Stop all polling tasks
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(target: PollTarget, dispatcher: Arc<Dispatcher>, router: Arc<Router>) {
    tracing::debug!("Polling {} every {:?}", target.feature, target.interval);

    let mut ticker = interval(target.interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match dispatcher.get(&target.feature).await {
            Ok(value) => router.publish(&target.feature, value),
            Err(e) => tracing::debug!("Poll of {} skipped: {}", target.feature, e),
        }
    }
}
