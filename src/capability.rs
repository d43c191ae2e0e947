//! Subwoofer presence detection.
//!
//! The device never reports whether a subwoofer is attached, but the bass
//! level feature changes shape with it: -10..=10 with a subwoofer, 0..=2
//! (MIN/MID/MAX) without. A reading outside 0..=2 settles the question on
//! its own. Otherwise the probe briefly sets the bass level to -1, which only
//! a subwoofer setup accepts, and then writes the original level back. The
//! restore is attempted whatever the probe's outcome.

use crate::config::DetectionPolicy;
use crate::dispatcher::Dispatcher;
use crate::error::{BraviaError, Result};
use crate::router::Router;
use crate::types::{as_integer, is_ack, Feature, BASS_RANGE_WITHOUT_SUBWOOFER, SUBWOOFER_CAPABILITY};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Bass level only legal with a subwoofer attached
const PROBE_LEVEL: i64 = -1;

/// Detection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubwooferState {
    Unknown,
    Probing,
    Present,
    Absent,
}

impl SubwooferState {
    /// Detected presence, `None` while unknown or probing
    pub fn present(self) -> Option<bool> {
        match self {
            SubwooferState::Present => Some(true),
            SubwooferState::Absent => Some(false),
            SubwooferState::Unknown | SubwooferState::Probing => None,
        }
    }
}

type Outcome = Option<std::result::Result<bool, String>>;

/// Runs at most one probe at a time and publishes the result under
/// [`SUBWOOFER_CAPABILITY`]
pub struct SubwooferDetector {
    dispatcher: Arc<Dispatcher>,
    router: Arc<Router>,
    policy: DetectionPolicy,
    state: Arc<Mutex<SubwooferState>>,
    in_flight: Arc<Mutex<Option<watch::Receiver<Outcome>>>>,
}

impl SubwooferDetector {
    pub fn new(dispatcher: Arc<Dispatcher>, router: Arc<Router>, policy: DetectionPolicy) -> Self {
        Self {
            dispatcher,
            router,
            policy,
            state: Arc::new(Mutex::new(SubwooferState::Unknown)),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> SubwooferState {
        *lock(&self.state)
    }

    /// Detect subwoofer presence
    ///
    /// A call made while a probe is running joins that probe, or fails with
    /// `DetectionBusy` under [`DetectionPolicy::Reject`]. The probe runs in
    /// its own task so dropping the caller never skips the restore.
    pub async fn detect(&self) -> Result<bool> {
        let mut rx = {
            let mut in_flight = lock(&self.in_flight);
            if let Some(rx) = in_flight.as_ref() {
                if self.policy == DetectionPolicy::Reject {
                    return Err(BraviaError::DetectionBusy);
                }
                tracing::debug!("Joining running subwoofer detection");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                *in_flight = Some(rx.clone());
                self.spawn_probe(tx);
                rx
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
            .map_err(|_| BraviaError::DetectionFailed("detection task ended".to_string()))?;

        match outcome {
            Some(Ok(present)) => Ok(present),
            Some(Err(reason)) => Err(BraviaError::DetectionFailed(reason)),
            None => Err(BraviaError::DetectionFailed("no outcome".to_string())),
        }
    }

    fn spawn_probe(&self, tx: watch::Sender<Outcome>) {
        let dispatcher = self.dispatcher.clone();
        let router = self.router.clone();
        let state = self.state.clone();
        let in_flight = self.in_flight.clone();

        let previous = std::mem::replace(&mut *lock(&state), SubwooferState::Probing);
        tracing::info!("Starting subwoofer detection");

        tokio::spawn(async move {
            let outcome = probe(&dispatcher, &router).await;

            match &outcome {
                Ok(present) => {
                    *lock(&state) = if *present {
                        SubwooferState::Present
                    } else {
                        SubwooferState::Absent
                    };
                    router.publish(SUBWOOFER_CAPABILITY, Value::Bool(*present));
                }
                Err(e) => {
                    tracing::warn!("Subwoofer detection failed: {}", e);
                    *lock(&state) = previous;
                }
            }

            lock(&in_flight).take();
            tx.send_replace(Some(outcome.map_err(|e| e.to_string())));
        });
    }
}

async fn probe(dispatcher: &Dispatcher, router: &Router) -> Result<bool> {
    let bass = Feature::BassLevel.key();

    let original = dispatcher.get(bass).await?;
    router.publish(bass, original.clone());

    let Some(level) = as_integer(&original) else {
        return Err(BraviaError::DetectionFailed(format!(
            "unreadable bass level {}",
            original
        )));
    };

    if !BASS_RANGE_WITHOUT_SUBWOOFER.contains(&level) {
        tracing::info!("Subwoofer detected: bass level {} is outside 0-2 range", level);
        return Ok(true);
    }

    let attempt = dispatcher.set(bass, Value::from(PROBE_LEVEL)).await;

    match dispatcher.set(bass, original.clone()).await {
        Ok(reply) if is_ack(&reply) => router.publish(bass, original),
        Ok(reply) => tracing::warn!("Restoring bass level {} answered {}", level, reply),
        Err(e) => tracing::warn!("Failed to restore bass level {}: {}", level, e),
    }

    let present = is_ack(&attempt?);
    if present {
        tracing::info!("Subwoofer detected: device accepted bass level {}", PROBE_LEVEL);
    } else {
        tracing::info!("No subwoofer detected: device rejected bass level {}", PROBE_LEVEL);
    }
    Ok(present)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
