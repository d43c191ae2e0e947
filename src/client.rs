use crate::capability::{SubwooferDetector, SubwooferState};
use crate::config::ClientConfig;
use crate::connection::{Connection, SessionHandler, SessionState};
use crate::dispatcher::Dispatcher;
use crate::error::{BraviaError, Result};
use crate::poller::Poller;
use crate::protocol::Inbound;
use crate::router::{CachedValue, ListenerId, Router};
use crate::subscription::ChangeReceiver;
use crate::types::{
    as_integer, bass_range, is_ack, on_off, up_on_off, DrcMode, Feature, FeatureValue, Input,
    SUBWOOFER_CAPABILITY,
};
use serde_json::Value;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Pause between the two `bluetooth.mode` writes of a pairing request
const PAIRING_SETTLE: Duration = Duration::from_millis(500);

/// Client for a Bravia Quad
///
/// The `BraviaClient` owns one session to the device. It correlates requests
/// with their results, routes notifications to listeners, polls the features
/// that never notify, and keeps the last known value of every feature it has
/// seen. Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct BraviaClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    connection: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<Router>,
    detector: SubwooferDetector,
    poller: Mutex<Option<Poller>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// Demultiplexes a session's frames and lifecycle into the dispatcher and router
struct Engine {
    dispatcher: Arc<Dispatcher>,
    router: Arc<Router>,
}

impl SessionHandler for Engine {
    fn on_frame(&self, frame: Inbound) {
        match frame {
            Inbound::Result(reply) => {
                self.dispatcher.resolve(reply);
            }
            Inbound::Notification(notification) => {
                self.router.publish(&notification.feature, notification.value);
            }
            Inbound::Malformed(reason) => {
                tracing::warn!("Discarding frame: {}", BraviaError::MalformedFrame(reason));
            }
        }
    }

    fn on_connected(&self, reconnected: bool) {
        self.router.set_stale(false);
        if reconnected {
            let dispatcher = self.dispatcher.clone();
            let router = self.router.clone();
            tokio::spawn(async move { reprime(&dispatcher, &router).await });
        }
    }

    fn on_disconnected(&self) {
        self.router.set_stale(true);
        self.dispatcher.fail_all();
    }
}

/// Re-read every feature someone listens to
///
/// The device does not replay notifications missed while disconnected.
async fn reprime(dispatcher: &Dispatcher, router: &Router) {
    for feature in router.subscribed_features() {
        let write_only = Feature::from_key(&feature).is_some_and(|f| !f.is_readable());
        if write_only || feature == SUBWOOFER_CAPABILITY {
            continue;
        }
        match dispatcher.get(&feature).await {
            Ok(value) => router.publish(&feature, value),
            Err(e) => tracing::warn!("Failed to refresh {} after reconnect: {}", feature, e),
        }
    }
}

impl BraviaClient {
    /// Create a disconnected client
    pub fn new(config: ClientConfig) -> Self {
        let connection = Arc::new(Connection::new(&config));
        let dispatcher = Arc::new(Dispatcher::new(connection.clone(), config.request_timeout));
        let router = Arc::new(Router::new());
        let detector = SubwooferDetector::new(dispatcher.clone(), router.clone(), config.detection_policy);

        Self {
            inner: Arc::new(Inner {
                config,
                connection,
                dispatcher,
                router,
                detector,
                poller: Mutex::new(None),
            }),
        }
    }

    /// Connect to the device at `address`
    ///
    /// The address is a host name or IP, optionally with a port; the
    /// configured port (33336 by default) is used otherwise. Connecting again
    /// replaces the current session. Once connected the session reconnects on
    /// its own until [`BraviaClient::close`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use bravia_quad::{BraviaClient, ClientConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = BraviaClient::new(ClientConfig::default());
    ///     client.connect("192.168.1.50").await?;
    ///     client.set_volume(20).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(&self, address: &str) -> Result<()> {
        let engine = Arc::new(Engine {
            dispatcher: self.inner.dispatcher.clone(),
            router: self.inner.router.clone(),
        });
        self.inner.connection.open(address, engine).await?;

        let mut poller = self.lock_poller();
        if poller.is_none() {
            *poller = Some(Poller::start(
                &self.inner.config.poll_targets,
                self.inner.dispatcher.clone(),
                self.inner.router.clone(),
            ));
        }
        Ok(())
    }

    /// Close the session, stop polling and drop cached values
    pub async fn close(&self) {
        if let Some(mut poller) = self.lock_poller().take() {
            poller.stop();
        }
        self.inner.connection.close().await;
        self.inner.dispatcher.fail_all();
        self.inner.router.clear();
    }

    /// Current session state
    pub fn current_state(&self) -> SessionState {
        self.inner.connection.state()
    }

    /// Watch session state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.connection.watch()
    }

    /// Whether cached values may be out of date because the session dropped
    pub fn is_stale(&self) -> bool {
        self.inner.router.is_stale()
    }

    /// Watch the stale flag
    ///
    /// Turns true when the session drops and false once it is back, before
    /// subscribed features are re-read.
    pub fn watch_stale(&self) -> watch::Receiver<bool> {
        self.inner.router.watch_stale()
    }

    /// Read a feature from the device
    ///
    /// The reply is recorded in the value cache and delivered to listeners.
    pub async fn get_value(&self, feature: impl AsRef<str>) -> Result<FeatureValue> {
        let feature = feature.as_ref();
        let value = self.inner.dispatcher.get(feature).await?;
        self.inner.router.publish(feature, value.clone());
        Ok(value)
    }

    /// Set a feature, returning the device's reply as sent
    ///
    /// An `"ACK"` reply records the new value in the cache. Any other reply is
    /// passed through untouched; the device's handling of out-of-range values
    /// is not documented.
    pub async fn set_value(
        &self,
        feature: impl AsRef<str>,
        value: impl Into<FeatureValue>,
    ) -> Result<FeatureValue> {
        let feature = feature.as_ref();
        let value = value.into();
        let reply = self.inner.dispatcher.set(feature, value.clone()).await?;
        if is_ack(&reply) {
            self.inner.router.publish(feature, value);
        }
        Ok(reply)
    }

    /// Call `listener` with every value published for `feature`
    pub fn on_change<F>(&self, feature: impl AsRef<str>, listener: F) -> ListenerId
    where
        F: Fn(&FeatureValue) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(feature.as_ref(), Arc::new(listener))
    }

    /// Remove a listener registered with [`BraviaClient::on_change`]
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.router.unsubscribe(id)
    }

    /// Receive every change across all features
    pub fn subscribe_changes(&self) -> ChangeReceiver {
        self.inner.router.changes()
    }

    /// Last known value of a feature, `None` if never observed
    pub fn current_value(&self, feature: impl AsRef<str>) -> Option<FeatureValue> {
        self.inner.router.current_value(feature.as_ref())
    }

    /// Last known value of a feature together with when it was recorded
    pub fn cached_value(&self, feature: impl AsRef<str>) -> Option<CachedValue> {
        self.inner.router.cached(feature.as_ref())
    }

    /// Number of requests still waiting for a result
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.outstanding()
    }

    /// Detect whether a subwoofer is connected
    ///
    /// The probe may briefly change the bass level and always tries to
    /// restore it. The result is also published under
    /// [`SUBWOOFER_CAPABILITY`].
    pub async fn detect_subwoofer(&self) -> Result<bool> {
        self.inner.detector.detect().await
    }

    /// Subwoofer detection state
    pub fn subwoofer(&self) -> SubwooferState {
        self.inner.detector.state()
    }

    /// Legal bass range given what is known about the subwoofer
    pub fn bass_range(&self) -> RangeInclusive<i64> {
        bass_range(self.subwoofer().present())
    }

    /// Read every readable catalogued feature once
    ///
    /// Failures are logged and skipped.
    pub async fn refresh_all(&self) {
        tracing::debug!("Fetching all device states");
        for feature in Feature::ALL.into_iter().filter(|f| f.is_readable()) {
            if let Err(e) = self.get_value(feature).await {
                tracing::warn!("Failed to fetch {}: {}", feature, e);
            }
        }
    }

    // ========== Typed controls ==========

    pub async fn set_power(&self, on: bool) -> Result<()> {
        self.set_acked(Feature::Power, on_off(on)).await
    }

    /// Set the volume (0-100)
    pub async fn set_volume(&self, volume: i64) -> Result<()> {
        self.set_level(Feature::Volume, volume).await
    }

    /// Select an input source
    pub async fn set_input(&self, input: Input) -> Result<()> {
        if !input.is_selectable() {
            return Err(BraviaError::InvalidValue {
                feature: Feature::Input.key().to_string(),
                value: Value::from(input.as_str()),
            });
        }
        self.set_acked(Feature::Input, Value::from(input.as_str())).await
    }

    /// Set the rear speaker level (-10 to 10)
    pub async fn set_rear_level(&self, level: i64) -> Result<()> {
        self.set_level(Feature::RearLevel, level).await
    }

    /// Set the bass level
    ///
    /// With a subwoofer: -10 to 10. Without: 0 (MIN), 1 (MID), 2 (MAX).
    pub async fn set_bass_level(&self, level: i64) -> Result<()> {
        self.set_level(Feature::BassLevel, level).await
    }

    pub async fn set_voice_enhancer(&self, on: bool) -> Result<()> {
        self.set_acked(Feature::VoiceEnhancer, up_on_off(on)).await
    }

    pub async fn set_sound_field(&self, on: bool) -> Result<()> {
        self.set_acked(Feature::SoundField, on_off(on)).await
    }

    pub async fn set_night_mode(&self, on: bool) -> Result<()> {
        self.set_acked(Feature::NightMode, on_off(on)).await
    }

    pub async fn set_hdmi_cec(&self, on: bool) -> Result<()> {
        self.set_acked(Feature::HdmiCec, on_off(on)).await
    }

    pub async fn set_auto_standby(&self, on: bool) -> Result<()> {
        self.set_acked(Feature::AutoStandby, on_off(on)).await
    }

    /// Set the dynamic range compressor mode
    pub async fn set_drc(&self, mode: DrcMode) -> Result<()> {
        self.set_acked(Feature::DynamicRangeCompressor, Value::from(mode.as_str()))
            .await
    }

    /// Enable or disable automatic volume adjustment
    pub async fn set_auto_volume(&self, on: bool) -> Result<()> {
        self.set_acked(Feature::AutoVolume, on_off(on)).await
    }

    /// Walk the volume to `target` one step at a time
    ///
    /// Sleeps `step_interval` before each step and stops at the first step
    /// that fails. A zero interval sets the target directly. Dropping the
    /// returned future cancels the remaining steps.
    pub async fn ramp_volume(&self, target: i64, step_interval: Duration) -> Result<()> {
        check_range(Feature::Volume, target, &crate::types::VOLUME_RANGE)?;

        let volume = Feature::Volume.key();
        let current = match self.current_value(volume).as_ref().and_then(as_integer) {
            Some(current) => current,
            None => {
                let value = self.get_value(volume).await?;
                as_integer(&value).ok_or_else(|| BraviaError::InvalidValue {
                    feature: volume.to_string(),
                    value,
                })?
            }
        };

        if step_interval.is_zero() || current == target {
            return self.set_volume(target).await;
        }

        let step = if target > current { 1 } else { -1 };
        let mut level = current;
        while level != target {
            sleep(step_interval).await;
            level += step;
            self.set_volume(level).await?;
        }
        Ok(())
    }

    /// Put the device into Bluetooth pairing mode
    ///
    /// Switches the input to Bluetooth if needed, then cycles
    /// `bluetooth.mode` through `Off` and `RX`.
    pub async fn start_bluetooth_pairing(&self) -> Result<()> {
        tracing::info!("Triggering Bluetooth pairing mode");

        let current = self.get_value(Feature::Input).await?;
        if current.as_str().and_then(Input::parse) != Some(Input::Bluetooth) {
            tracing::info!("Current input is {}, switching to bluetooth", current);
            self.set_input(Input::Bluetooth).await?;
        }

        let reply = self.set_value(Feature::BluetoothMode, "Off").await?;
        if !is_ack(&reply) {
            tracing::warn!("Unexpected reply setting bluetooth.mode to Off: {}", reply);
        }

        sleep(PAIRING_SETTLE).await;

        let reply = self.set_value(Feature::BluetoothMode, "RX").await?;
        if !is_ack(&reply) {
            tracing::warn!("Unexpected reply setting bluetooth.mode to RX: {}", reply);
        }
        Ok(())
    }

    async fn set_level(&self, feature: Feature, level: i64) -> Result<()> {
        let range = match feature {
            Feature::BassLevel => self.bass_range(),
            _ => feature.range().ok_or_else(|| BraviaError::InvalidValue {
                feature: feature.key().to_string(),
                value: Value::from(level),
            })?,
        };
        check_range(feature, level, &range)?;
        self.set_acked(feature, Value::from(level)).await
    }

    async fn set_acked(&self, feature: Feature, value: FeatureValue) -> Result<()> {
        let reply = self.set_value(feature, value).await?;
        if is_ack(&reply) {
            Ok(())
        } else {
            Err(BraviaError::Rejected {
                feature: feature.key().to_string(),
                reply,
            })
        }
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, Option<Poller>> {
        self.inner.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_range(feature: Feature, value: i64, range: &RangeInclusive<i64>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(BraviaError::OutOfRange {
            feature: feature.key().to_string(),
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}
