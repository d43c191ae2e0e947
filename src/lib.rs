//! Rust client for the Sony Bravia Quad control protocol
//!
//! The Bravia Quad speaks newline-delimited JSON over TCP port 33336. This
//! library keeps a live session to one device and provides:
//!
//! - Get/set requests correlated with their asynchronous results
//! - Notification routing to per-feature listeners
//! - A cache of the last known value of every feature
//! - Polling for features the device never notifies about
//! - Subwoofer detection, which changes the legal bass range
//! - Automatic reconnection with backoff
//!
//! # Quick Start
//!
//! ```no_run
//! use bravia_quad::{BraviaClient, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BraviaClient::new(ClientConfig::default());
//!     client.connect("192.168.1.50").await?;
//!
//!     client.on_change("main.power", |value| {
//!         println!("Power is now {}", value);
//!     });
//!
//!     let volume = client.get_value("main.volumestep").await?;
//!     println!("Volume: {}", volume);
//!
//!     if client.detect_subwoofer().await? {
//!         client.set_bass_level(-3).await?;
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: the public facade tying the components together
//! - **Connection**: TCP session ownership, serialized writes, reconnection
//! - **Codec**: JSON frame encoding and decoding
//! - **Dispatcher**: request ids, result correlation, timeouts
//! - **Router**: listeners and the value cache
//! - **Poller**: periodic reads of notify-less features
//! - **Capability**: subwoofer detection

mod capability;
mod client;
mod codec;
mod config;
mod connection;
mod dispatcher;
mod error;
mod poller;
mod protocol;
mod router;
mod subscription;
mod types;

// Public exports
pub use capability::SubwooferState;
pub use client::BraviaClient;
pub use config::{ClientConfig, DetectionPolicy, PollTarget, DEFAULT_POLL_INTERVAL, DEFAULT_PORT};
pub use connection::SessionState;
pub use error::{BraviaError, Result};
pub use protocol::{Inbound, Notification, Reply, Request, RequestType};
pub use router::{CachedValue, ListenerId};
pub use subscription::{ChangeReceiver, FeatureChange};
pub use types::{
    as_integer, bass_range, is_ack, DrcMode, Feature, FeatureMode, FeatureValue, Input, ACK,
    BASS_RANGE_WITHOUT_SUBWOOFER, BASS_RANGE_WITH_SUBWOOFER, REAR_LEVEL_RANGE,
    SUBWOOFER_CAPABILITY, VOLUME_RANGE,
};
