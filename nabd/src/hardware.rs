//! Hardware capability interfaces
//!
//! The daemon never talks to drivers directly; every device is consumed
//! through one of the traits below. The virtual backend implements all of
//! them for headless development, and concrete driver crates can plug in the
//! same way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use nab_common::{ButtonEventKind, Color, Ear, EarPosition, Nlu, RfidEventKind, TagUid};

/// Upper bound on any single actuator call. A driver that overruns this
/// turns into a `failure` response for the enclosing work item instead of
/// stalling the scheduler.
pub const ACTUATOR_CALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Number of addressable LEDs on the rabbit.
pub const LED_COUNT: usize = 5;

pub type HardwareResult<T> = Result<T, HardwareError>;

/// Errors surfaced by actuator and sensor drivers
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("actuator call timed out after {0}ms")]
    Timeout(u64),

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("tag incompatible: {0}")]
    TagIncompatible(String),
}

/// A preloaded, playable audio asset.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub name: String,
    pub data: Arc<Vec<u8>>,
    /// Nominal playback duration, derived from the container header.
    pub duration: Duration,
}

/// The five-LED strip. Writes are idempotent snapshots of all LEDs.
#[async_trait]
pub trait LedStrip: Send + Sync {
    async fn set_all(&self, colors: [Color; LED_COUNT]) -> HardwareResult<()>;

    async fn clear(&self) -> HardwareResult<()> {
        self.set_all([Color::BLACK; LED_COUNT]).await
    }
}

/// The two stepper-driven ears. Moves are target-based: `go` returns as soon
/// as the controller accepts the target and the ear travels at its own rate.
#[async_trait]
pub trait Ears: Send + Sync {
    async fn go(&self, ear: Ear, position: EarPosition) -> HardwareResult<()>;

    /// Wait until the given ear has reached its last target. Only used when
    /// a choreography frame retargets an ear that is still moving.
    async fn wait_idle(&self, ear: Ear) -> HardwareResult<()>;

    /// Stop both ears where they are.
    async fn halt(&self) -> HardwareResult<()>;
}

/// The single audio output. Clips are enqueued without blocking and played
/// back to back.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn enqueue(&self, clip: AudioClip) -> HardwareResult<()>;

    /// Resolve once everything enqueued so far has finished playing.
    async fn drain(&self) -> HardwareResult<()>;

    /// Stop playback and discard anything still queued.
    async fn flush(&self) -> HardwareResult<()>;
}

/// Optional microphone with a speech recognizer behind it.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn start_capture(&self) -> HardwareResult<()>;

    /// Stop capturing and return the recognition result, if any.
    async fn stop_capture(&self) -> HardwareResult<Option<Nlu>>;
}

/// Optional RFID writer. Tag detections arrive through the sensor channel.
#[async_trait]
pub trait RfidReader: Send + Sync {
    async fn write(
        &self,
        tech: &str,
        uid: &TagUid,
        picture: u8,
        app: &str,
        data: Option<&str>,
    ) -> HardwareResult<TagUid>;
}

/// Asynchronous events pushed by the sensor side of the hardware.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    Button(ButtonEventKind),
    Ear { ear: Ear, position: EarPosition },
    Rfid {
        tech: String,
        uid: TagUid,
        event: RfidEventKind,
        support: String,
        app: Option<String>,
        data: Option<String>,
        picture: Option<u8>,
    },
    Asr(Nlu),
}

/// Bundle of capability handles handed to the daemon at startup.
pub struct HardwareBackend {
    pub leds: Arc<dyn LedStrip>,
    pub ears: Arc<dyn Ears>,
    pub audio: Arc<dyn AudioSink>,
    pub audio_source: Option<Arc<dyn AudioSource>>,
    pub rfid: Option<Arc<dyn RfidReader>>,
    sensor_events: Option<mpsc::Receiver<SensorEvent>>,
}

impl HardwareBackend {
    pub fn new(
        leds: Arc<dyn LedStrip>,
        ears: Arc<dyn Ears>,
        audio: Arc<dyn AudioSink>,
        audio_source: Option<Arc<dyn AudioSource>>,
        rfid: Option<Arc<dyn RfidReader>>,
        sensor_events: mpsc::Receiver<SensorEvent>,
    ) -> Self {
        Self {
            leds,
            ears,
            audio,
            audio_source,
            rfid,
            sensor_events: Some(sensor_events),
        }
    }

    /// Take the sensor event receiver for the dispatcher
    pub fn take_sensor_events(&mut self) -> mpsc::Receiver<SensorEvent> {
        self.sensor_events.take().expect("sensor event receiver already taken")
    }

    /// One-line capability summary for gestalt answers
    pub fn summary(&self) -> String {
        let mut parts = vec!["leds", "ears", "audio"];
        if self.audio_source.is_some() {
            parts.push("microphone");
        }
        if self.rfid.is_some() {
            parts.push("rfid");
        }
        parts.join(",")
    }
}

/// Bound an actuator call to [`ACTUATOR_CALL_TIMEOUT`].
pub async fn bounded<T>(
    fut: impl std::future::Future<Output = HardwareResult<T>>,
) -> HardwareResult<T> {
    match tokio::time::timeout(ACTUATOR_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(HardwareError::Timeout(ACTUATOR_CALL_TIMEOUT.as_millis() as u64)),
    }
}
