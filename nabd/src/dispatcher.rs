//! Sensor event dispatcher
//!
//! Single fan-in point for asynchronous hardware events. Every event is
//! stamped with monotonic time, side effects are applied (a short click
//! cancels cancelable playback, a hold drives transient audio capture,
//! formatted RFID detections get their stored tag picture), and the result
//! is broadcast to subscribed writers. Events never touch the scheduler
//! queue; a dispatcher error is logged and the event dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use nab_common::{ButtonEventKind, Frame, Nlu};

use crate::hardware::{AudioSource, SensorEvent};
use crate::registry::WriterRegistry;
use crate::scheduler::SchedulerHandle;

pub struct SensorDispatcher {
    events: mpsc::Receiver<SensorEvent>,
    registry: Arc<WriterRegistry>,
    scheduler: SchedulerHandle,
    audio_source: Option<Arc<dyn AudioSource>>,
    tag_pictures: Arc<RwLock<HashMap<String, u8>>>,
    started_at: Instant,
    capturing: bool,
}

impl SensorDispatcher {
    pub fn new(
        events: mpsc::Receiver<SensorEvent>,
        registry: Arc<WriterRegistry>,
        scheduler: SchedulerHandle,
        audio_source: Option<Arc<dyn AudioSource>>,
        tag_pictures: Arc<RwLock<HashMap<String, u8>>>,
    ) -> Self {
        Self {
            events,
            registry,
            scheduler,
            audio_source,
            tag_pictures,
            started_at: Instant::now(),
            capturing: false,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle_event(event).await;
        }
        debug!("sensor channel closed, dispatcher exiting");
    }

    fn now(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    async fn handle_event(&mut self, event: SensorEvent) {
        let time = self.now();
        match event {
            SensorEvent::Button(kind) => self.handle_button(kind, time).await,
            SensorEvent::Ear { ear, position } => {
                self.registry.broadcast(&Frame::EarEvent { ear, position, time }).await;
            }
            SensorEvent::Rfid { tech, uid, event, support, app, data, picture } => {
                // Formatted tags of a known app carry that app's stored picture
                let picture = match (&picture, support.as_str(), &app) {
                    (None, "formatted", Some(app)) => {
                        self.tag_pictures.read().await.get(app).copied()
                    }
                    _ => picture,
                };
                self.registry
                    .broadcast(&Frame::RfidEvent { tech, uid, event, support, picture, app, data, time })
                    .await;
            }
            SensorEvent::Asr(nlu) => {
                self.registry.broadcast(&Frame::AsrEvent { nlu, time }).await;
            }
        }
    }

    async fn handle_button(&mut self, kind: ButtonEventKind, time: f64) {
        match kind {
            ButtonEventKind::Click => {
                // Cancels the running item iff it is cancelable; the click
                // is broadcast either way.
                self.scheduler.button_click().await;
            }
            ButtonEventKind::Hold => self.start_capture().await,
            ButtonEventKind::Up => {
                // The recognition result follows the button event it ended on
                let nlu = self.finish_capture().await;
                self.registry.broadcast(&Frame::ButtonEvent { event: kind, time }).await;
                if let Some(nlu) = nlu {
                    self.registry.broadcast(&Frame::AsrEvent { nlu, time }).await;
                }
                return;
            }
            _ => {}
        }
        self.registry.broadcast(&Frame::ButtonEvent { event: kind, time }).await;
    }

    /// Button hold starts transient audio capture when a microphone exists
    /// and the scheduler confirms the recording phase, so the broadcast
    /// state and the microphone never diverge.
    async fn start_capture(&mut self) {
        let Some(source) = self.audio_source.clone() else {
            return;
        };
        if self.capturing {
            return;
        }
        if !self.scheduler.begin_recording().await {
            debug!("capture refused in the current state");
            return;
        }
        match source.start_capture().await {
            Ok(()) => {
                debug!("audio capture started");
                self.capturing = true;
            }
            Err(e) => {
                warn!("failed to start audio capture: {}", e);
                self.scheduler.end_recording().await;
            }
        }
    }

    async fn finish_capture(&mut self) -> Option<Nlu> {
        if !self.capturing {
            return None;
        }
        self.capturing = false;
        self.scheduler.end_recording().await;

        let source = self.audio_source.clone()?;
        match source.stop_capture().await {
            Ok(Some(nlu)) => Some(nlu),
            Ok(None) => {
                debug!("capture ended without a recognition result");
                None
            }
            Err(e) => {
                warn!("failed to stop audio capture: {}", e);
                None
            }
        }
    }
}
