//! Virtual hardware backend
//!
//! Implements every actuator and sensor capability against in-memory state
//! so the daemon runs headless: LEDs, ears with simulated travel time, an
//! audio sink that "plays" clips for their nominal duration, a scriptable
//! microphone and RFID writer. An ANSI view of the rabbit is served on
//! `daemon port + 1`; lines received on that socket are scripted sensor
//! inputs (`button click`, `ear left 5`, `rfid detected …`, `asr …`).
//!
//! Every hardware call lands in a journal with a monotonic timestamp, which
//! is also what the integration tests assert against.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nab_common::{
    ButtonEventKind, Color, Ear, EarPosition, Nlu, RabbitState, RfidEventKind, TagUid,
};

use crate::hardware::{
    AudioClip, AudioSink, AudioSource, Ears, HardwareBackend, HardwareError, HardwareResult,
    LedStrip, RfidReader, SensorEvent, LED_COUNT,
};

/// Simulated ear travel time per position step.
const EAR_STEP_TIME: Duration = Duration::from_millis(20);

struct EarMotion {
    from: f64,
    target: i8,
    start: Instant,
    arrival: Instant,
}

impl EarMotion {
    fn at_rest(position: i8) -> Self {
        let now = Instant::now();
        Self { from: position as f64, target: position, start: now, arrival: now }
    }

    fn position(&self, now: Instant) -> f64 {
        if now >= self.arrival {
            return self.target as f64;
        }
        let total = (self.arrival - self.start).as_secs_f64();
        if total <= 0.0 {
            return self.target as f64;
        }
        let progress = (now - self.start).as_secs_f64() / total;
        self.from + (self.target as f64 - self.from) * progress
    }
}

struct VirtState {
    started_at: Instant,
    leds: Mutex<[Color; LED_COUNT]>,
    left_ear: Mutex<EarMotion>,
    right_ear: Mutex<EarMotion>,
    audio_queue: Mutex<VecDeque<(String, Duration)>>,
    pending_voice: Mutex<Option<Nlu>>,
    journal: Mutex<Vec<(f64, String)>>,
    version: watch::Sender<u64>,
    sensor_tx: mpsc::Sender<SensorEvent>,
}

impl VirtState {
    fn new(sensor_tx: mpsc::Sender<SensorEvent>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            started_at: Instant::now(),
            leds: Mutex::new([Color::BLACK; LED_COUNT]),
            left_ear: Mutex::new(EarMotion::at_rest(0)),
            right_ear: Mutex::new(EarMotion::at_rest(0)),
            audio_queue: Mutex::new(VecDeque::new()),
            pending_voice: Mutex::new(None),
            journal: Mutex::new(Vec::new()),
            version,
            sensor_tx,
        }
    }

    fn record(&self, call: String) {
        let stamp = self.started_at.elapsed().as_secs_f64();
        self.journal.lock().unwrap().push((stamp, call));
        self.version.send_modify(|v| *v += 1);
    }

    fn ear(&self, ear: Ear) -> &Mutex<EarMotion> {
        match ear {
            Ear::Left => &self.left_ear,
            Ear::Right => &self.right_ear,
        }
    }
}

struct VirtLeds(Arc<VirtState>);

#[async_trait]
impl LedStrip for VirtLeds {
    async fn set_all(&self, colors: [Color; LED_COUNT]) -> HardwareResult<()> {
        *self.0.leds.lock().unwrap() = colors;
        let rendered: Vec<String> = colors.iter().map(|c| c.to_string()).collect();
        self.0.record(format!("leds {}", rendered.join(" ")));
        Ok(())
    }
}

struct VirtEars(Arc<VirtState>);

#[async_trait]
impl Ears for VirtEars {
    async fn go(&self, ear: Ear, position: EarPosition) -> HardwareResult<()> {
        let now = Instant::now();
        {
            let mut motion = self.0.ear(ear).lock().unwrap();
            let from = motion.position(now);
            let steps = (position.get() as f64 - from).abs();
            *motion = EarMotion {
                from,
                target: position.get(),
                start: now,
                arrival: now + EAR_STEP_TIME.mul_f64(steps),
            };
        }
        self.0.record(format!("ear {:?} go {}", ear, position.get()));
        Ok(())
    }

    async fn wait_idle(&self, ear: Ear) -> HardwareResult<()> {
        let arrival = self.0.ear(ear).lock().unwrap().arrival;
        tokio::time::sleep_until(arrival).await;
        Ok(())
    }

    async fn halt(&self) -> HardwareResult<()> {
        let now = Instant::now();
        for ear in [Ear::Left, Ear::Right] {
            let mut motion = self.0.ear(ear).lock().unwrap();
            let position = motion.position(now).round() as i8;
            *motion = EarMotion::at_rest(position);
        }
        self.0.record("ear halt".to_string());
        Ok(())
    }
}

struct VirtSink(Arc<VirtState>);

#[async_trait]
impl AudioSink for VirtSink {
    async fn enqueue(&self, clip: AudioClip) -> HardwareResult<()> {
        self.0.record(format!("audio enqueue {}", clip.name));
        self.0.audio_queue.lock().unwrap().push_back((clip.name, clip.duration));
        Ok(())
    }

    async fn drain(&self) -> HardwareResult<()> {
        // "Plays" each clip for its nominal duration. Cancellation drops
        // this future mid-sleep; flush then discards whatever is left.
        loop {
            let next = self.0.audio_queue.lock().unwrap().pop_front();
            match next {
                Some((name, duration)) => {
                    tokio::time::sleep(duration).await;
                    self.0.record(format!("audio played {}", name));
                }
                None => return Ok(()),
            }
        }
    }

    async fn flush(&self) -> HardwareResult<()> {
        let dropped = self.0.audio_queue.lock().unwrap().len();
        self.0.audio_queue.lock().unwrap().clear();
        self.0.record(format!("audio flush ({} dropped)", dropped));
        Ok(())
    }
}

struct VirtMic(Arc<VirtState>);

#[async_trait]
impl AudioSource for VirtMic {
    async fn start_capture(&self) -> HardwareResult<()> {
        self.0.record("capture start".to_string());
        Ok(())
    }

    async fn stop_capture(&self) -> HardwareResult<Option<Nlu>> {
        self.0.record("capture stop".to_string());
        Ok(self.0.pending_voice.lock().unwrap().take())
    }
}

struct VirtRfid(Arc<VirtState>);

#[async_trait]
impl RfidReader for VirtRfid {
    async fn write(
        &self,
        tech: &str,
        uid: &TagUid,
        picture: u8,
        app: &str,
        data: Option<&str>,
    ) -> HardwareResult<TagUid> {
        if tech == "locked" {
            return Err(HardwareError::TagIncompatible(format!("tag {} is locked", uid)));
        }
        self.0.record(format!(
            "rfid write {} {} picture={} app={} data={:?}",
            tech, uid, picture, app, data
        ));
        Ok(uid.clone())
    }
}

/// Inspection and scripting handle over the virtual rabbit.
#[derive(Clone)]
pub struct VirtualHandle {
    state: Arc<VirtState>,
}

impl VirtualHandle {
    /// All hardware calls so far, stamped with seconds since start.
    pub fn journal(&self) -> Vec<(f64, String)> {
        self.state.journal.lock().unwrap().clone()
    }

    pub fn led_snapshot(&self) -> [Color; LED_COUNT] {
        *self.state.leds.lock().unwrap()
    }

    pub fn ear_positions(&self) -> (f64, f64) {
        let now = Instant::now();
        (
            self.state.left_ear.lock().unwrap().position(now),
            self.state.right_ear.lock().unwrap().position(now),
        )
    }

    /// Parse one scripted input line and inject the matching sensor event.
    pub async fn inject(&self, line: &str) -> Result<(), String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let event = match parts.as_slice() {
            ["button", kind] => SensorEvent::Button(parse_button(kind)?),
            ["ear", which, position] => {
                let ear = parse_ear(which)?;
                let value: i64 = position.parse().map_err(|_| format!("bad position '{}'", position))?;
                let position = EarPosition::new(value)?;
                // A scripted move is the user physically turning the ear
                let mut motion = self.state.ear(ear).lock().unwrap();
                *motion = EarMotion::at_rest(position.get());
                drop(motion);
                self.state.version.send_modify(|v| *v += 1);
                SensorEvent::Ear { ear, position }
            }
            ["rfid", kind, tech, uid, rest @ ..] => {
                let event = match *kind {
                    "detected" => RfidEventKind::Detected,
                    "removed" => RfidEventKind::Removed,
                    other => return Err(format!("unknown rfid event '{}'", other)),
                };
                SensorEvent::Rfid {
                    tech: tech.to_string(),
                    uid: TagUid::parse(uid)?,
                    event,
                    support: rest.first().unwrap_or(&"formatted").to_string(),
                    app: rest.get(1).map(|s| s.to_string()),
                    data: rest.get(2).map(|s| s.to_string()),
                    picture: None,
                }
            }
            ["asr", intent] => SensorEvent::Asr(Nlu {
                intent: intent.to_string(),
                slots: serde_json::Value::Null,
            }),
            ["voice", intent] => {
                // Queued recognition result for the next button-hold capture
                *self.state.pending_voice.lock().unwrap() = Some(Nlu {
                    intent: intent.to_string(),
                    slots: serde_json::Value::Null,
                });
                return Ok(());
            }
            _ => return Err(format!("unrecognized script line '{}'", line)),
        };

        self.state
            .sensor_tx
            .send(event)
            .await
            .map_err(|_| "sensor channel closed".to_string())
    }

    /// Render the rabbit as one ANSI frame.
    pub fn render(&self, state: RabbitState) -> String {
        let leds = self.led_snapshot();
        let (left, right) = self.ear_positions();
        let queue = self.state.audio_queue.lock().unwrap().len();

        let mut out = String::from("\x1b[2J\x1b[H");
        out.push_str(&format!("nabd virtual rabbit (state: {})\r\n\r\n", state));
        out.push_str(&format!("  ears   left {:+.1}  right {:+.1}\r\n", left, right));
        out.push_str("  leds   ");
        for color in leds {
            out.push_str(&format!(
                "\x1b[38;2;{};{};{}m●\x1b[0m ",
                color.r, color.g, color.b
            ));
        }
        out.push_str("\r\n");
        out.push_str(&format!("  audio  {} clip(s) queued\r\n", queue));
        out.push_str("\r\nscript: button <kind> | ear <side> <pos> | rfid <event> <tech> <uid> [support] [app] [data] | asr <intent> | voice <intent>\r\n");
        out
    }
}

fn parse_button(kind: &str) -> Result<ButtonEventKind, String> {
    match kind {
        "down" => Ok(ButtonEventKind::Down),
        "up" => Ok(ButtonEventKind::Up),
        "click" => Ok(ButtonEventKind::Click),
        "double_click" => Ok(ButtonEventKind::DoubleClick),
        "triple_click" => Ok(ButtonEventKind::TripleClick),
        "hold" => Ok(ButtonEventKind::Hold),
        other => Err(format!("unknown button event '{}'", other)),
    }
}

fn parse_ear(which: &str) -> Result<Ear, String> {
    match which {
        "left" => Ok(Ear::Left),
        "right" => Ok(Ear::Right),
        other => Err(format!("unknown ear '{}'", other)),
    }
}

/// Build the virtual backend and its handle.
pub fn build() -> (HardwareBackend, VirtualHandle) {
    let (sensor_tx, sensor_rx) = mpsc::channel(64);
    let state = Arc::new(VirtState::new(sensor_tx));

    let backend = HardwareBackend::new(
        Arc::new(VirtLeds(Arc::clone(&state))),
        Arc::new(VirtEars(Arc::clone(&state))),
        Arc::new(VirtSink(Arc::clone(&state))),
        Some(Arc::new(VirtMic(Arc::clone(&state)))),
        Some(Arc::new(VirtRfid(Arc::clone(&state)))),
        sensor_rx,
    );

    (backend, VirtualHandle { state })
}

/// Serve the ANSI view plus scripted input on the given listener. Each
/// connected terminal gets a fresh frame on every hardware or state change.
pub async fn serve_view(
    listener: TcpListener,
    handle: VirtualHandle,
    state_rx: watch::Receiver<RabbitState>,
) {
    info!("virtual rabbit view on {:?}", listener.local_addr().ok());
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            return;
        };
        debug!("view client connected from {}", peer);

        let handle = handle.clone();
        let mut state_rx = state_rx.clone();
        let mut version_rx = handle.state.version.subscribe();

        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            loop {
                let frame = handle.render(*state_rx.borrow());
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
                tokio::select! {
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) if !line.trim().is_empty() => {
                                if let Err(e) = handle.inject(line.trim()).await {
                                    warn!("bad script line: {}", e);
                                }
                            }
                            Ok(Some(_)) => {}
                            _ => return,
                        }
                    }
                }
            }
        });
    }
}
