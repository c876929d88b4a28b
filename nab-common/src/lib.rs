use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Re-export common dependencies
pub use serde_json;
pub use tracing;

// TCP client module
pub mod client;

/// Default TCP port the daemon listens on (loopback only).
pub const DEFAULT_PORT: u16 = 10543;

/// The virtual backend's ANSI view is served on `daemon port + 1`.
pub const VIRTUAL_PORT_OFFSET: u16 = 1;

/// One LED color as six lowercase hex characters on the wire, no `#`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse a six-character lowercase hex triplet.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(format!("invalid color '{}': expected six lowercase hex characters", s));
        }
        let r = u8::from_str_radix(&s[0..2], 16).map_err(|e| e.to_string())?;
        let g = u8::from_str_radix(&s[2..4], 16).map_err(|e| e.to_string())?;
        let b = u8::from_str_radix(&s[4..6], 16).map_err(|e| e.to_string())?;
        Ok(Self { r, g, b })
    }

    pub fn is_black(&self) -> bool {
        *self == Self::BLACK
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Color::parse(&s).map_err(D::Error::custom)
    }
}

/// Signed ear position, clamped to the mechanical range [-17, +17].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EarPosition(i8);

impl EarPosition {
    pub const MIN: i8 = -17;
    pub const MAX: i8 = 17;

    /// Reject values outside the mechanical range.
    pub fn new(value: i64) -> Result<Self, String> {
        if value < Self::MIN as i64 || value > Self::MAX as i64 {
            return Err(format!("ear position {} out of range [{}, {}]", value, Self::MIN, Self::MAX));
        }
        Ok(Self(value as i8))
    }

    /// Clamp into range, for values produced by hardware rather than clients.
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(Self::MIN as i64, Self::MAX as i64) as i8)
    }

    pub fn get(&self) -> i8 {
        self.0
    }
}

impl Serialize for EarPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.0)
    }
}

impl<'de> Deserialize<'de> for EarPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = i64::deserialize(deserializer)?;
        EarPosition::new(v).map_err(D::Error::custom)
    }
}

/// RFID tag UID: colon-separated lowercase hex bytes, e.g. `d0:02:1a:05:26:81:a2:b9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagUid(String);

impl TagUid {
    pub fn parse(s: &str) -> Result<Self, String> {
        let valid = !s.is_empty()
            && s.split(':').all(|part| {
                part.len() == 2 && part.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            });
        if !valid {
            return Err(format!("invalid tag uid '{}': expected colon-separated lowercase hex bytes", s));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for TagUid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TagUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TagUid::parse(&s).map_err(D::Error::custom)
    }
}

/// High-level daemon state, broadcast to every writer on each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RabbitState {
    Idle,
    Playing,
    Interactive,
    Recording,
    Asleep,
}

impl fmt::Display for RabbitState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RabbitState::Idle => "idle",
            RabbitState::Playing => "playing",
            RabbitState::Interactive => "interactive",
            RabbitState::Recording => "recording",
            RabbitState::Asleep => "asleep",
        };
        f.write_str(s)
    }
}

/// One unit of playback: an audio fallback list and/or a choreography reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choreography: Option<String>,
}

impl CommandItem {
    /// A command item must carry at least one of audio or choreography.
    pub fn is_empty(&self) -> bool {
        self.audio.as_ref().map_or(true, |a| a.is_empty())
            && self.choreography.as_ref().map_or(true, |c| c.is_empty())
    }
}

/// One idle animation frame; absent channels hold the previous color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Color>,
}

/// A short LED loop played while the daemon is idle, published via `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleAnimation {
    /// Seconds per frame; must be positive.
    pub tempo: f64,
    pub colors: Vec<AnimationFrame>,
}

impl IdleAnimation {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.tempo > 0.0) {
            return Err(format!("animation tempo {} must be positive", self.tempo));
        }
        if self.colors.is_empty() {
            return Err("animation has no frames".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Idle,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Ears,
    Leds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    Halt,
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ear {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonEventKind {
    Down,
    Up,
    Click,
    DoubleClick,
    TripleClick,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfidEventKind {
    Detected,
    Removed,
}

/// Speech recognition result attached to `asr_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nlu {
    pub intent: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub slots: serde_json::Value,
}

/// Client-to-daemon packets, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Enqueue a playback sequence (or bypass the queue for the interactive owner).
    Command {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        sequence: Vec<CommandItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancelable: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expiration: Option<DateTime<Utc>>,
    },

    /// Signature-body-signature playback.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<CommandItem>,
        body: Vec<CommandItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancelable: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expiration: Option<DateTime<Utc>>,
    },

    /// Update event subscriptions and request/release the interactive slot.
    Mode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<ModeKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        events: Option<Vec<String>>,
    },

    /// Publish, replace or revoke an idle animation; bare `info` is a query.
    Info {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        animation: Option<IdleAnimation>,
    },

    Sleep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Wakeup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Cancel the item previously submitted with this `request_id`.
    Cancel { request_id: String },

    Test {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        test: TestKind,
    },

    Gestalt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    RfidWrite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        tech: String,
        uid: TagUid,
        picture: u8,
        app: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
    },

    #[serde(rename = "config-update")]
    ConfigUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot: Option<serde_json::Value>,
    },

    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<ShutdownMode>,
    },
}

impl Packet {
    /// The correlation id the response (if any) will carry.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Packet::Command { request_id, .. }
            | Packet::Message { request_id, .. }
            | Packet::Mode { request_id, .. }
            | Packet::Info { request_id, .. }
            | Packet::Sleep { request_id }
            | Packet::Wakeup { request_id }
            | Packet::Test { request_id, .. }
            | Packet::Gestalt { request_id }
            | Packet::RfidWrite { request_id, .. }
            | Packet::ConfigUpdate { request_id, .. }
            | Packet::Shutdown { request_id, .. } => request_id.as_deref(),
            Packet::Cancel { request_id } => Some(request_id),
        }
    }
}

/// Final status of a `response` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Failure,
    Error,
    Expired,
    Timeout,
    Canceled,
}

/// Error taxonomy carried in the `class` field of error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    ProtocolError,
    InvalidPacket,
    MissingField,
    InvalidParameter,
    InvalidResource,
    HardwareError,
    #[serde(rename = "NFCException")]
    NfcException,
    StateError,
    QueueOverflow,
}

/// Acknowledgement of a client packet, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<TagUid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl Response {
    pub fn ok(request_id: Option<String>) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            class: None,
            message: None,
            uid: None,
            info: None,
        }
    }

    pub fn status(request_id: Option<String>, status: Status) -> Self {
        Self {
            request_id,
            status,
            class: None,
            message: None,
            uid: None,
            info: None,
        }
    }

    pub fn error(request_id: Option<String>, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: Status::Error,
            class: Some(class),
            message: Some(message.into()),
            uid: None,
            info: None,
        }
    }

    pub fn failure(request_id: Option<String>, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: Status::Failure,
            class: Some(class),
            message: Some(message.into()),
            uid: None,
            info: None,
        }
    }
}

/// Daemon-to-client frames, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Sent on accept and on every state transition, to all writers.
    State { state: RabbitState },

    Response(Response),

    ButtonEvent {
        event: ButtonEventKind,
        time: f64,
    },

    EarEvent {
        ear: Ear,
        position: EarPosition,
        time: f64,
    },

    RfidEvent {
        tech: String,
        uid: TagUid,
        event: RfidEventKind,
        support: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        picture: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        time: f64,
    },

    AsrEvent { nlu: Nlu, time: f64 },
}

impl Frame {
    /// Synthetic event name used for subscription matching.
    ///
    /// Responses have no event name; they are always delivered to the
    /// requesting writer regardless of subscriptions.
    pub fn event_name(&self) -> Option<String> {
        match self {
            Frame::State { .. } => Some("state".to_string()),
            Frame::Response(_) => None,
            Frame::ButtonEvent { .. } => Some("button".to_string()),
            Frame::EarEvent { .. } => Some("ears".to_string()),
            Frame::RfidEvent { app, .. } => Some(match app {
                Some(app) => format!("rfid/{}", app),
                None => "rfid".to_string(),
            }),
            Frame::AsrEvent { nlu, .. } => Some(if nlu.intent.is_empty() {
                "asr".to_string()
            } else {
                format!("asr/{}", nlu.intent)
            }),
        }
    }
}

/// Subscription pattern matching.
///
/// A pattern matches if it equals the event name, or ends with `*` and the
/// name starts with the prefix. A `/*` suffix additionally matches the bare
/// parent (`rfid/*` matches both `rfid` and `rfid/weather`).
pub fn matches_subscription(pattern: &str, event_name: &str) -> bool {
    if let Some(base) = pattern.strip_suffix("/*") {
        return event_name == base || event_name.starts_with(&format!("{}/", base));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return event_name.starts_with(prefix);
    }
    pattern == event_name
}

/// Serialize a frame as one wire line (without the trailing newline).
pub fn encode_frame(frame: &Frame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|e| {
        tracing::error!("failed to serialize frame: {:?}", e);
        String::new()
    })
}

/// Serialize a packet as one wire line (without the trailing newline).
pub fn encode_packet(packet: &Packet) -> String {
    serde_json::to_string(packet).unwrap_or_else(|e| {
        tracing::error!("failed to serialize packet: {:?}", e);
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_roundtrip() {
        let c = Color::parse("ff00a0").unwrap();
        assert_eq!(c, Color::new(0xff, 0x00, 0xa0));
        assert_eq!(c.to_string(), "ff00a0");

        assert!(Color::parse("FF00A0").is_err()); // uppercase rejected
        assert!(Color::parse("ff00a").is_err());
        assert!(Color::parse("#ff00a0").is_err());
    }

    #[test]
    fn test_ear_position_range() {
        assert!(EarPosition::new(17).is_ok());
        assert!(EarPosition::new(-17).is_ok());
        assert!(EarPosition::new(18).is_err());
        assert!(EarPosition::new(-18).is_err());
        assert_eq!(EarPosition::clamped(40).get(), 17);
    }

    #[test]
    fn test_tag_uid_validation() {
        assert!(TagUid::parse("d0:02:1a:05").is_ok());
        assert!(TagUid::parse("D0:02").is_err());
        assert!(TagUid::parse("d002").is_err());
        assert!(TagUid::parse("").is_err());
    }

    #[test]
    fn test_packet_roundtrip() {
        let line = r#"{"type":"command","request_id":"a1","sequence":[{"audio":["test/sounds/ping.wav"]}]}"#;
        let packet: Packet = serde_json::from_str(line).unwrap();
        match &packet {
            Packet::Command { request_id, sequence, cancelable, expiration } => {
                assert_eq!(request_id.as_deref(), Some("a1"));
                assert_eq!(sequence.len(), 1);
                assert!(cancelable.is_none());
                assert!(expiration.is_none());
            }
            _ => panic!("expected Command packet"),
        }
        let reencoded = encode_packet(&packet);
        let reparsed: Packet = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(packet, reparsed);
    }

    #[test]
    fn test_config_update_wire_name() {
        let line = r#"{"type":"config-update","service":"locale"}"#;
        let packet: Packet = serde_json::from_str(line).unwrap();
        assert!(matches!(packet, Packet::ConfigUpdate { ref service, .. } if service == "locale"));
    }

    #[test]
    fn test_nfc_exception_wire_name() {
        let response = Response::error(None, ErrorClass::NfcException, "no reader");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("NFCException"));
    }

    #[test]
    fn test_frame_event_names() {
        let button = Frame::ButtonEvent { event: ButtonEventKind::Click, time: 1.0 };
        assert_eq!(button.event_name().as_deref(), Some("button"));

        let rfid = Frame::RfidEvent {
            tech: "st25tb".to_string(),
            uid: TagUid::parse("d0:02").unwrap(),
            event: RfidEventKind::Detected,
            support: "formatted".to_string(),
            picture: None,
            app: Some("weather".to_string()),
            data: None,
            time: 1.0,
        };
        assert_eq!(rfid.event_name().as_deref(), Some("rfid/weather"));

        let asr = Frame::AsrEvent {
            nlu: Nlu { intent: "clock".to_string(), slots: serde_json::Value::Null },
            time: 2.0,
        };
        assert_eq!(asr.event_name().as_deref(), Some("asr/clock"));
    }

    #[test]
    fn test_subscription_matching() {
        assert!(matches_subscription("button", "button"));
        assert!(!matches_subscription("button", "ears"));
        assert!(matches_subscription("rfid/*", "rfid/weather"));
        assert!(matches_subscription("rfid/*", "rfid"));
        assert!(!matches_subscription("rfid/*", "rfidx"));
        assert!(matches_subscription("asr*", "asr/clock"));
        assert!(matches_subscription("asr*", "asr"));
        assert!(matches_subscription("*", "anything"));
    }

    #[test]
    fn test_command_item_emptiness() {
        let empty = CommandItem { audio: None, choreography: None };
        assert!(empty.is_empty());
        let empty_list = CommandItem { audio: Some(vec![]), choreography: None };
        assert!(empty_list.is_empty());
        let ok = CommandItem { audio: Some(vec!["a.wav".to_string()]), choreography: None };
        assert!(!ok.is_empty());
    }

    #[test]
    fn test_state_frame_wire_shape() {
        let frame = Frame::State { state: RabbitState::Asleep };
        let json = encode_frame(&frame);
        assert_eq!(json, r#"{"type":"state","state":"asleep"}"#);
    }

    #[test]
    fn test_expiration_parses_iso8601() {
        let line = r#"{"type":"command","sequence":[{"audio":["a.wav"]}],"expiration":"2026-01-01T00:00:00Z"}"#;
        let packet: Packet = serde_json::from_str(line).unwrap();
        match packet {
            Packet::Command { expiration, .. } => assert!(expiration.is_some()),
            _ => panic!("expected Command packet"),
        }
    }
}
