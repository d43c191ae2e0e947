use serde_json::Value;
use std::fmt;
use std::ops::RangeInclusive;

/// Value of a device feature, passed through exactly as the device sent it
pub type FeatureValue = Value;

/// Reply value the device uses to acknowledge a set
pub const ACK: &str = "ACK";

/// Synthetic feature key under which the subwoofer capability is published
pub const SUBWOOFER_CAPABILITY: &str = "capability.subwoofer";

/// Volume steps
pub const VOLUME_RANGE: RangeInclusive<i64> = 0..=100;

/// Rear speaker level steps
pub const REAR_LEVEL_RANGE: RangeInclusive<i64> = -10..=10;

/// Bass level steps when a subwoofer is connected
pub const BASS_RANGE_WITH_SUBWOOFER: RangeInclusive<i64> = -10..=10;

/// Bass level MIN/MID/MAX when no subwoofer is connected
pub const BASS_RANGE_WITHOUT_SUBWOOFER: RangeInclusive<i64> = 0..=2;

/// Legal bass range for a known or unknown subwoofer state
///
/// An unknown state allows the wider range and leaves the verdict to the device.
pub fn bass_range(subwoofer: Option<bool>) -> RangeInclusive<i64> {
    match subwoofer {
        Some(false) => BASS_RANGE_WITHOUT_SUBWOOFER,
        _ => BASS_RANGE_WITH_SUBWOOFER,
    }
}

/// Whether a result value acknowledges a set
pub fn is_ack(value: &FeatureValue) -> bool {
    value.as_str().is_some_and(|s| s.eq_ignore_ascii_case(ACK))
}

/// Integer view of a stepped value, accepting numeric strings
pub fn as_integer(value: &FeatureValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// How the device reports changes to a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureMode {
    /// Changes arrive as notifications
    Push,
    /// The device never notifies; the value must be polled
    Poll,
}

/// Features of the device known to this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Power,
    Volume,
    RearLevel,
    BassLevel,
    Input,
    VoiceEnhancer,
    SoundField,
    NightMode,
    HdmiCec,
    AutoStandby,
    DynamicRangeCompressor,
    AutoVolume,
    BluetoothMode,
}

impl Feature {
    /// Every catalogued feature
    pub const ALL: [Feature; 13] = [
        Feature::Power,
        Feature::Volume,
        Feature::RearLevel,
        Feature::BassLevel,
        Feature::Input,
        Feature::VoiceEnhancer,
        Feature::SoundField,
        Feature::NightMode,
        Feature::HdmiCec,
        Feature::AutoStandby,
        Feature::DynamicRangeCompressor,
        Feature::AutoVolume,
        Feature::BluetoothMode,
    ];

    /// Wire key of the feature
    pub fn key(self) -> &'static str {
        match self {
            Feature::Power => "main.power",
            Feature::Volume => "main.volumestep",
            Feature::RearLevel => "main.rearvolumestep",
            Feature::BassLevel => "main.bassstep",
            Feature::Input => "main.input",
            Feature::VoiceEnhancer => "audio.voiceenhancer",
            Feature::SoundField => "audio.soundfield",
            Feature::NightMode => "audio.nightmode",
            Feature::HdmiCec => "hdmi.cec",
            Feature::AutoStandby => "system.autostandby",
            Feature::DynamicRangeCompressor => "audio.drangecomp",
            Feature::AutoVolume => "audio.aav",
            Feature::BluetoothMode => "bluetooth.mode",
        }
    }

    /// Look up a feature by its wire key
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    /// Whether the device notifies changes or the value has to be polled
    pub fn mode(self) -> FeatureMode {
        match self {
            Feature::DynamicRangeCompressor | Feature::AutoVolume => FeatureMode::Poll,
            _ => FeatureMode::Push,
        }
    }

    /// Whether a `get` is meaningful for this feature
    ///
    /// `bluetooth.mode` is a command-style feature that is only ever set.
    pub fn is_readable(self) -> bool {
        !matches!(self, Feature::BluetoothMode)
    }

    /// Integer range for stepped features
    ///
    /// Bass reports the subwoofer range; see [`bass_range`] for the narrower
    /// one without a subwoofer.
    pub fn range(self) -> Option<RangeInclusive<i64>> {
        match self {
            Feature::Volume => Some(VOLUME_RANGE),
            Feature::RearLevel => Some(REAR_LEVEL_RANGE),
            Feature::BassLevel => Some(BASS_RANGE_WITH_SUBWOOFER),
            _ => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.key())
    }
}

impl AsRef<str> for Feature {
    fn as_ref(&self) -> &str {
        self.key()
    }
}

/// Input source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Tv,
    Hdmi1,
    Spotify,
    Bluetooth,
    /// Reported by the device while casting; cannot be selected
    AirPlay2,
}

impl Input {
    pub fn as_str(self) -> &'static str {
        match self {
            Input::Tv => "tv",
            Input::Hdmi1 => "hdmi1",
            Input::Spotify => "spotify",
            Input::Bluetooth => "bluetooth",
            Input::AirPlay2 => "airplay2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tv" => Some(Input::Tv),
            "hdmi1" => Some(Input::Hdmi1),
            "spotify" => Some(Input::Spotify),
            "bluetooth" => Some(Input::Bluetooth),
            "airplay2" => Some(Input::AirPlay2),
            _ => None,
        }
    }

    /// Whether the input can be chosen with a set
    pub fn is_selectable(self) -> bool {
        self != Input::AirPlay2
    }
}

/// Dynamic range compressor mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrcMode {
    Auto,
    On,
    Off,
}

impl DrcMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DrcMode::Auto => "auto",
            DrcMode::On => "on",
            DrcMode::Off => "off",
        }
    }
}

/// `"on"`/`"off"` wire value
pub fn on_off(enabled: bool) -> FeatureValue {
    Value::from(if enabled { "on" } else { "off" })
}

/// `"upon"`/`"upoff"` wire value used by the voice enhancer
pub fn up_on_off(enabled: bool) -> FeatureValue {
    Value::from(if enabled { "upon" } else { "upoff" })
}
