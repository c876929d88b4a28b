//! Choreography execution engine
//!
//! Plays one command item at a time against the actuator capabilities: the
//! audio list and the choreography program run as parallel timelines joined
//! on completion. The program is time-quantized at a 10 ms base tick and the
//! engine sleeps to absolute deadlines, so rounding error never accumulates.
//! Cancellation is an explicit token checked at every frame boundary; on
//! cancel the LEDs go black, the ears halt in place and the audio sink is
//! flushed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nab_common::{Color, CommandItem, Ear, EarPosition};

use crate::hardware::{bounded, AudioSink, Ears, HardwareError, LedStrip, LED_COUNT};
use crate::resources::{ResolveError, ResourceResolver};

/// Base quantum of the choreography timeline.
pub const TEMPO_TICK: Duration = Duration::from_millis(10);

/// Errors from executing one command item
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Resource(#[from] ResolveError),

    #[error("invalid choreography: {0}")]
    BadProgram(String),
}

/// Target ear positions for one frame; absent ears keep their last target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EarTargets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<EarPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<EarPosition>,
}

/// One time-quantized frame. `leds` is a five-entry snapshot where `null`
/// holds the previous color; `tempo` overrides the tick multiplier from this
/// frame on; `audio` is an inline cue enqueued without blocking the timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChorFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leds: Option<Vec<Option<Color>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ears: Option<EarTargets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

/// A parsed choreography asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoreographyProgram {
    pub frames: Vec<ChorFrame>,
}

impl ChoreographyProgram {
    pub fn parse(data: &[u8]) -> Result<Self, EngineError> {
        let program: ChoreographyProgram =
            serde_json::from_slice(data).map_err(|e| EngineError::BadProgram(e.to_string()))?;
        for frame in &program.frames {
            if let Some(leds) = &frame.leds {
                if leds.len() != LED_COUNT {
                    return Err(EngineError::BadProgram(format!(
                        "frame has {} led entries, expected {}",
                        leds.len(),
                        LED_COUNT
                    )));
                }
            }
        }
        Ok(program)
    }
}

/// Executes command items against the actuator capabilities.
pub struct Engine {
    leds: Arc<dyn LedStrip>,
    ears: Arc<dyn Ears>,
    audio: Arc<dyn AudioSink>,
    resolver: Arc<ResourceResolver>,
}

impl Engine {
    pub fn new(
        leds: Arc<dyn LedStrip>,
        ears: Arc<dyn Ears>,
        audio: Arc<dyn AudioSink>,
        resolver: Arc<ResourceResolver>,
    ) -> Self {
        Self { leds, ears, audio, resolver }
    }

    /// Play a command sequence in order.
    pub async fn play_sequence(
        &self,
        sequence: &[CommandItem],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let result = self.play_sequence_inner(sequence, cancel).await;
        if result.is_err() {
            self.settle().await;
        }
        result
    }

    /// Play a message: signature, each body item, signature again. The
    /// bracketing is skipped when there is no signature.
    pub async fn play_message(
        &self,
        signature: Option<&CommandItem>,
        body: &[CommandItem],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut items: Vec<&CommandItem> = Vec::with_capacity(body.len() + 2);
        if let Some(sig) = signature {
            items.push(sig);
        }
        items.extend(body.iter());
        if let Some(sig) = signature {
            items.push(sig);
        }

        for item in items {
            if let Err(e) = self.play_item(item, cancel).await {
                self.settle().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn play_sequence_inner(
        &self,
        sequence: &[CommandItem],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        for item in sequence {
            self.play_item(item, cancel).await?;
        }
        Ok(())
    }

    /// Play one item: resolve everything up front, then run the audio and
    /// choreography timelines in parallel and wait for both to drain.
    async fn play_item(&self, item: &CommandItem, cancel: &CancellationToken) -> Result<(), EngineError> {
        let clips = match &item.audio {
            Some(refs) if !refs.is_empty() => self.resolver.resolve_audio(refs).await?,
            _ => Vec::new(),
        };
        let program = match &item.choreography {
            Some(reference) => {
                let asset = self.resolver.resolve(reference).await?;
                Some(ChoreographyProgram::parse(&asset.data)?)
            }
            None => None,
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }

        let audio_timeline = async {
            for clip in clips {
                bounded(self.audio.enqueue(clip)).await?;
            }
            Ok::<(), EngineError>(())
        };

        let chor_timeline = async {
            if let Some(program) = &program {
                self.run_program(program, cancel).await?;
            }
            Ok::<(), EngineError>(())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Canceled),
            result = async {
                // Inline cues keep landing on the sink until the program
                // ends, so the sink is drained only once every producer is
                // done. Drain is open-ended by design: it tracks real
                // playback, not a single actuator write, so it is not
                // wrapped in bounded().
                tokio::try_join!(audio_timeline, chor_timeline)?;
                self.audio.drain().await?;
                Ok(())
            } => result,
        }
    }

    /// Run one choreography program with absolute frame deadlines.
    async fn run_program(
        &self,
        program: &ChoreographyProgram,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let mut elapsed_ticks: u64 = 0;
        let mut multiplier: u64 = 1;
        let mut snapshot = [Color::BLACK; LED_COUNT];
        let mut left_moving = false;
        let mut right_moving = false;

        for frame in &program.frames {
            if cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }

            if let Some(tempo) = frame.tempo {
                multiplier = tempo.max(1) as u64;
            }

            if let Some(leds) = &frame.leds {
                let mut dirty = false;
                for (slot, entry) in snapshot.iter_mut().zip(leds.iter()) {
                    if let Some(color) = entry {
                        *slot = *color;
                        dirty = true;
                    }
                }
                // Hold-previous frames skip the write entirely
                if dirty {
                    bounded(self.leds.set_all(snapshot)).await?;
                }
            }

            if let Some(targets) = &frame.ears {
                if let Some(position) = targets.left {
                    if left_moving {
                        bounded(self.ears.wait_idle(Ear::Left)).await?;
                    }
                    bounded(self.ears.go(Ear::Left, position)).await?;
                    left_moving = true;
                }
                if let Some(position) = targets.right {
                    if right_moving {
                        bounded(self.ears.wait_idle(Ear::Right)).await?;
                    }
                    bounded(self.ears.go(Ear::Right, position)).await?;
                    right_moving = true;
                }
            }

            if let Some(cue) = &frame.audio {
                let clip = self.resolver.resolve(cue).await?.as_clip();
                bounded(self.audio.enqueue(clip)).await?;
            }

            elapsed_ticks += multiplier;
            let deadline = start + TEMPO_TICK * elapsed_ticks as u32;
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Canceled),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        Ok(())
    }

    /// Return the rabbit to rest: LEDs black, ears halted, audio flushed.
    /// Called after any cancel or failure so the hardware never keeps stale
    /// output.
    pub async fn settle(&self) {
        if let Err(e) = bounded(self.leds.clear()).await {
            warn!("failed to clear LEDs: {}", e);
        }
        if let Err(e) = bounded(self.ears.halt()).await {
            warn!("failed to halt ears: {}", e);
        }
        if let Err(e) = bounded(self.audio.flush()).await {
            warn!("failed to flush audio: {}", e);
        }
        debug!("hardware settled");
    }

    /// Diagnostic LED pattern: each LED in turn, then all clear.
    pub async fn test_leds(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut frames = Vec::new();
        let palette = [
            Color::new(0xff, 0x00, 0x00),
            Color::new(0x00, 0xff, 0x00),
            Color::new(0x00, 0x00, 0xff),
        ];
        for color in palette {
            for led in 0..LED_COUNT {
                let mut entries: Vec<Option<Color>> = vec![Some(Color::BLACK); LED_COUNT];
                entries[led] = Some(color);
                frames.push(ChorFrame { tempo: Some(10), leds: Some(entries), ..Default::default() });
            }
        }
        frames.push(ChorFrame {
            leds: Some(vec![Some(Color::BLACK); LED_COUNT]),
            ..Default::default()
        });
        let result = self.run_program(&ChoreographyProgram { frames }, cancel).await;
        if result.is_err() {
            self.settle().await;
        }
        result
    }

    /// Diagnostic ear sweep: both ears to each extreme and back to zero.
    pub async fn test_ears(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let sweep = [EarPosition::MAX, EarPosition::MIN, 0];
        let mut frames = Vec::new();
        for target in sweep {
            let position = EarPosition::new(target as i64).expect("sweep targets are in range");
            frames.push(ChorFrame {
                tempo: Some(100),
                ears: Some(EarTargets { left: Some(position), right: Some(position) }),
                ..Default::default()
            });
        }
        let result = self.run_program(&ChoreographyProgram { frames }, cancel).await;
        if result.is_err() {
            self.settle().await;
        }
        result
    }
}
