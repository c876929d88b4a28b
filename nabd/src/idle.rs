//! Idle animator
//!
//! While the daemon is idle with an empty queue, rotates round-robin through
//! the idle animations published by writers via `info` packets, playing each
//! one once before advancing. The scheduler starts and cancels the animator;
//! on cancel the LEDs are cleared so queued work begins from black.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nab_common::{AnimationFrame, Color, IdleAnimation};

use crate::hardware::{bounded, LedStrip, LED_COUNT};

// Strip positions of the three animation channels (0 = nose, 4 = bottom).
const LED_LEFT: usize = 1;
const LED_CENTER: usize = 2;
const LED_RIGHT: usize = 3;

struct Inner {
    // BTreeMap keeps the rotation order stable across publishes.
    animations: BTreeMap<String, IdleAnimation>,
    cursor: usize,
}

/// Registry of idle animations plus the rotation cursor, shared between the
/// scheduler and the playback task it spawns.
#[derive(Clone)]
pub struct IdleAnimator {
    inner: Arc<Mutex<Inner>>,
}

impl IdleAnimator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { animations: BTreeMap::new(), cursor: 0 })),
        }
    }

    /// Publish or replace an animation under `info_id`.
    pub fn publish(&self, info_id: String, animation: IdleAnimation) {
        debug!("idle animation '{}' published", info_id);
        self.inner.lock().unwrap().animations.insert(info_id, animation);
    }

    /// Revoke the animation under `info_id`, if any.
    pub fn revoke(&self, info_id: &str) {
        debug!("idle animation '{}' revoked", info_id);
        self.inner.lock().unwrap().animations.remove(info_id);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().animations.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().animations.keys().cloned().collect()
    }

    /// Pop the next animation in rotation order, advancing the cursor.
    fn next_animation(&self) -> Option<(String, IdleAnimation)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.animations.is_empty() {
            return None;
        }
        let index = inner.cursor % inner.animations.len();
        inner.cursor = inner.cursor.wrapping_add(1);
        inner
            .animations
            .iter()
            .nth(index)
            .map(|(id, anim)| (id.clone(), anim.clone()))
    }

    /// Spawn the playback task. Runs until cancelled or until the map
    /// empties; clears the LEDs on the way out.
    pub fn spawn(&self, leds: Arc<dyn LedStrip>) -> (CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let animator = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some((id, animation)) = animator.next_animation() else {
                    break;
                };
                debug!("idle animator playing '{}'", id);
                if play_animation(&*leds, &animation, &task_token).await.is_err() {
                    break;
                }
                if task_token.is_cancelled() {
                    break;
                }
            }
            if let Err(e) = bounded(leds.clear()).await {
                warn!("failed to clear LEDs after idle animation: {}", e);
            }
        });

        (token, handle)
    }
}

impl Default for IdleAnimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Play one animation once. Err means cancelled or hardware failure.
async fn play_animation(
    leds: &dyn LedStrip,
    animation: &IdleAnimation,
    token: &CancellationToken,
) -> Result<(), ()> {
    let frame_time = Duration::from_secs_f64(animation.tempo.max(0.001));
    let mut snapshot = [Color::BLACK; LED_COUNT];

    for frame in &animation.colors {
        if token.is_cancelled() {
            return Err(());
        }
        if apply_frame(&mut snapshot, frame) {
            if let Err(e) = bounded(leds.set_all(snapshot)).await {
                warn!("idle animation LED write failed: {}", e);
                return Err(());
            }
        }
        tokio::select! {
            _ = token.cancelled() => return Err(()),
            _ = tokio::time::sleep(frame_time) => {}
        }
    }
    Ok(())
}

/// Apply one frame to the snapshot; absent channels hold. Returns whether
/// anything changed enough to need a write.
fn apply_frame(snapshot: &mut [Color; LED_COUNT], frame: &AnimationFrame) -> bool {
    let mut dirty = false;
    for (index, color) in [
        (LED_LEFT, frame.left),
        (LED_CENTER, frame.center),
        (LED_RIGHT, frame.right),
    ] {
        if let Some(color) = color {
            snapshot[index] = color;
            dirty = true;
        }
    }
    dirty
}
