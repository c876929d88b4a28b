//! Work scheduler and state machine driver
//!
//! The scheduler is the single authority that advances work: it owns the
//! FIFO queue, the five-state machine, the interactive slot and the idle
//! animation map, and every mutation goes through its mailbox. Exactly one
//! work item runs at any instant; everything else waits in submission order,
//! with expiration swept lazily at the queue head, `sleep` barriers rotated
//! behind pending hardware work, and the interactive owner's commands routed
//! through a bypass lane.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nab_common::{
    CommandItem, ErrorClass, Frame, IdleAnimation, RabbitState, Response, ShutdownMode, Status,
    TagUid, TestKind,
};

use crate::choreography::{Engine, EngineError};
use crate::config::ConfigManager;
use crate::hardware::{HardwareError, LedStrip, RfidReader};
use crate::idle::IdleAnimator;
use crate::registry::{WriterId, WriterRegistry};
use crate::resources::{ResolveError, ResourceResolver};
use crate::state::StateMachine;

/// Default timeout for `rfid_write`, in seconds.
pub const RFID_WRITE_TIMEOUT_S: f64 = 20.0;

const MAILBOX_CAPACITY: usize = 256;

/// The unit the scheduler enqueues.
#[derive(Debug)]
pub enum WorkItem {
    Command {
        sequence: Vec<CommandItem>,
        cancelable: bool,
        expiration: Option<DateTime<Utc>>,
        origin: WriterId,
        request_id: Option<String>,
    },
    Message {
        signature: Option<CommandItem>,
        body: Vec<CommandItem>,
        cancelable: bool,
        expiration: Option<DateTime<Utc>>,
        origin: WriterId,
        request_id: Option<String>,
    },
    Sleep {
        origin: WriterId,
        request_id: Option<String>,
    },
    /// Request for the interactive slot; granting blocks on the queue.
    ModeSwitch {
        origin: WriterId,
        request_id: Option<String>,
    },
    Test {
        which: TestKind,
        origin: WriterId,
        request_id: Option<String>,
    },
    RfidWrite {
        tech: String,
        uid: TagUid,
        picture: u8,
        app: String,
        data: Option<String>,
        /// Seconds; falls back to the configured default.
        timeout: Option<f64>,
        origin: WriterId,
        request_id: Option<String>,
    },
    ConfigUpdate {
        service: String,
        origin: WriterId,
        request_id: Option<String>,
    },
    Shutdown {
        mode: ShutdownMode,
        origin: WriterId,
        request_id: Option<String>,
    },
}

impl WorkItem {
    pub fn origin(&self) -> WriterId {
        match self {
            WorkItem::Command { origin, .. }
            | WorkItem::Message { origin, .. }
            | WorkItem::Sleep { origin, .. }
            | WorkItem::ModeSwitch { origin, .. }
            | WorkItem::Test { origin, .. }
            | WorkItem::RfidWrite { origin, .. }
            | WorkItem::ConfigUpdate { origin, .. }
            | WorkItem::Shutdown { origin, .. } => *origin,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkItem::Command { request_id, .. }
            | WorkItem::Message { request_id, .. }
            | WorkItem::Sleep { request_id, .. }
            | WorkItem::ModeSwitch { request_id, .. }
            | WorkItem::Test { request_id, .. }
            | WorkItem::RfidWrite { request_id, .. }
            | WorkItem::ConfigUpdate { request_id, .. }
            | WorkItem::Shutdown { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Items that drive hardware keep a `sleep` barrier rotating behind them.
    fn blocks_sleep(&self) -> bool {
        matches!(
            self,
            WorkItem::Command { .. }
                | WorkItem::Message { .. }
                | WorkItem::Test { .. }
                | WorkItem::RfidWrite { .. }
        )
    }

    /// While asleep the queue may only hold sleeps, diagnostics and
    /// shutdowns; everything else is rejected instead of queued.
    fn allowed_while_asleep(&self) -> bool {
        matches!(
            self,
            WorkItem::Sleep { .. } | WorkItem::Test { .. } | WorkItem::Shutdown { .. }
        )
    }

    /// An item expires iff its expiration is set and in the past before it
    /// starts. Already-running items are never interrupted for expiration.
    fn expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            WorkItem::Command { expiration, .. } | WorkItem::Message { expiration, .. } => {
                expiration.is_some_and(|e| e < now)
            }
            _ => false,
        }
    }

    fn is_bypass_kind(&self) -> bool {
        matches!(self, WorkItem::Command { .. } | WorkItem::Message { .. })
    }
}

/// Messages into the scheduler's mailbox.
pub enum SchedulerMsg {
    Submit(WorkItem),
    Cancel {
        origin: WriterId,
        target: String,
    },
    Wakeup {
        origin: WriterId,
        request_id: Option<String>,
    },
    /// `mode=idle` from the interactive owner; processed out of band.
    ReleaseInteractive {
        origin: WriterId,
        request_id: Option<String>,
    },
    PublishInfo {
        info_id: String,
        animation: IdleAnimation,
    },
    RevokeInfo {
        info_id: String,
    },
    InfoQuery {
        origin: WriterId,
        request_id: Option<String>,
    },
    Gestalt {
        origin: WriterId,
        request_id: Option<String>,
    },
    WriterGone(WriterId),
    ButtonClick,
    /// Ask to enter the recording phase; `reply` carries whether the
    /// current phase allows it, so the microphone only engages when the
    /// broadcast state says so.
    BeginRecording {
        reply: oneshot::Sender<bool>,
    },
    EndRecording,
    ItemFinished {
        outcome: ItemOutcome,
    },
}

/// Final outcome of an executed work item.
#[derive(Debug)]
pub enum ItemOutcome {
    Ok,
    OkUid(TagUid),
    Canceled,
    Timeout,
    Failure { class: ErrorClass, message: String },
    Error { class: ErrorClass, message: String },
}

/// Handle used by the front-end and the dispatcher to reach the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMsg>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: mpsc::Sender<SchedulerMsg>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: SchedulerMsg) {
        if self.tx.send(msg).await.is_err() {
            debug!("scheduler mailbox closed");
        }
    }

    pub async fn submit(&self, item: WorkItem) {
        self.send(SchedulerMsg::Submit(item)).await;
    }

    pub async fn writer_gone(&self, id: WriterId) {
        self.send(SchedulerMsg::WriterGone(id)).await;
    }

    pub async fn button_click(&self) {
        self.send(SchedulerMsg::ButtonClick).await;
    }

    /// Request the recording phase. Returns false when the current state
    /// does not allow capture (asleep, or already recording).
    pub async fn begin_recording(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMsg::BeginRecording { reply }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn end_recording(&self) {
        self.send(SchedulerMsg::EndRecording).await;
    }
}

struct Running {
    origin: WriterId,
    request_id: Option<String>,
    cancelable: bool,
    cancel_requested: bool,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The scheduler actor. Single-threaded by construction: `run` is its only
/// driver and all state lives inside.
pub struct Scheduler {
    rx: mpsc::Receiver<SchedulerMsg>,
    self_tx: mpsc::Sender<SchedulerMsg>,
    registry: Arc<WriterRegistry>,
    engine: Arc<Engine>,
    resolver: Arc<ResourceResolver>,
    config: Arc<ConfigManager>,
    leds: Arc<dyn LedStrip>,
    rfid: Option<Arc<dyn RfidReader>>,
    tag_pictures: Arc<RwLock<HashMap<String, u8>>>,
    hardware_summary: String,
    started_at: Instant,

    phase: StateMachine,
    state_tx: watch::Sender<RabbitState>,
    queue: VecDeque<WorkItem>,
    interactive_owner: Option<WriterId>,
    interactive_queue: VecDeque<WorkItem>,
    running: Option<Running>,
    animator: IdleAnimator,
    idle_task: Option<(CancellationToken, JoinHandle<()>)>,
    recording_return: Option<RabbitState>,
    shutdown_tx: mpsc::Sender<ShutdownMode>,
    stopping: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<WriterRegistry>,
        engine: Arc<Engine>,
        resolver: Arc<ResourceResolver>,
        config: Arc<ConfigManager>,
        leds: Arc<dyn LedStrip>,
        rfid: Option<Arc<dyn RfidReader>>,
        tag_pictures: Arc<RwLock<HashMap<String, u8>>>,
        hardware_summary: String,
    ) -> (
        Self,
        SchedulerHandle,
        watch::Receiver<RabbitState>,
        mpsc::Receiver<ShutdownMode>,
    ) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(RabbitState::Idle);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let scheduler = Self {
            rx,
            self_tx: tx.clone(),
            registry,
            engine,
            resolver,
            config,
            leds,
            rfid,
            tag_pictures,
            hardware_summary,
            started_at: Instant::now(),
            phase: StateMachine::new(),
            state_tx,
            queue: VecDeque::new(),
            interactive_owner: None,
            interactive_queue: VecDeque::new(),
            running: None,
            animator: IdleAnimator::new(),
            idle_task: None,
            recording_return: None,
            shutdown_tx,
            stopping: false,
        };

        (scheduler, SchedulerHandle { tx }, state_rx, shutdown_rx)
    }

    /// Drive the scheduler until shutdown.
    pub async fn run(mut self) {
        info!("scheduler started");
        loop {
            self.advance().await;
            if self.stopping && self.running.is_none() {
                break;
            }
            match self.rx.recv().await {
                Some(msg) => self.handle_msg(msg).await,
                None => break,
            }
        }
        self.stop_idle().await;
        self.engine.settle().await;
        info!("scheduler stopped");
    }

    async fn handle_msg(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Submit(item) => self.submit(item).await,
            SchedulerMsg::ItemFinished { outcome } => self.finish_running(outcome).await,
            SchedulerMsg::Cancel { origin, target } => self.handle_cancel(origin, target).await,
            SchedulerMsg::Wakeup { origin, request_id } => {
                if self.phase.current() == RabbitState::Asleep {
                    info!("wakeup");
                    self.set_phase(RabbitState::Idle).await;
                }
                self.respond(origin, Response::ok(request_id)).await;
            }
            SchedulerMsg::ReleaseInteractive { origin, request_id } => {
                self.release_interactive(origin, request_id).await;
            }
            SchedulerMsg::PublishInfo { info_id, animation } => {
                self.animator.publish(info_id, animation);
                // Restart the rotation so the new entry is picked up
                self.stop_idle().await;
            }
            SchedulerMsg::RevokeInfo { info_id } => {
                self.animator.revoke(&info_id);
                self.stop_idle().await;
            }
            SchedulerMsg::InfoQuery { origin, request_id } => {
                let mut response = Response::ok(request_id);
                response.info = Some(serde_json::json!({ "animations": self.animator.ids() }));
                self.respond(origin, response).await;
            }
            SchedulerMsg::Gestalt { origin, request_id } => {
                let mut response = Response::ok(request_id);
                response.info = Some(serde_json::json!({
                    "uptime": self.started_at.elapsed().as_secs(),
                    "state": self.phase.current().to_string(),
                    "connected_writers": self.registry.writer_ids().await,
                    "hardware": self.hardware_summary,
                    "queued": self.queue.len() + self.interactive_queue.len(),
                }));
                self.respond(origin, response).await;
            }
            SchedulerMsg::WriterGone(id) => self.writer_gone(id).await,
            SchedulerMsg::ButtonClick => {
                if let Some(running) = self.running.as_mut() {
                    if running.cancelable && !running.cancel_requested {
                        info!("button click cancels running item");
                        running.cancel_requested = true;
                        running.cancel.cancel();
                    }
                }
            }
            SchedulerMsg::BeginRecording { reply } => {
                let accepted = self.begin_recording().await;
                let _ = reply.send(accepted);
            }
            SchedulerMsg::EndRecording => self.end_recording().await,
        }
    }

    async fn submit(&mut self, item: WorkItem) {
        if self.stopping {
            let response = Response::error(
                item.request_id().map(str::to_string),
                ErrorClass::StateError,
                "daemon is shutting down",
            );
            self.respond(item.origin(), response).await;
            return;
        }

        // While asleep only sleep/test/shutdown may sit in the queue;
        // anything else answers immediately so services wake us first.
        if self.phase.current() == RabbitState::Asleep && !item.allowed_while_asleep() {
            self.reject_asleep(item).await;
            return;
        }

        if self.interactive_owner == Some(item.origin()) && item.is_bypass_kind() {
            // Owner's commands bypass the queue; if one is already running
            // the new item waits right behind it.
            self.interactive_queue.push_back(item);
        } else {
            self.queue.push_back(item);
        }
    }

    /// Sweep the queue head, rotate sleep barriers, start the next eligible
    /// item, and keep the idle animator consistent with what it finds.
    async fn advance(&mut self) {
        if self.stopping {
            self.stop_idle().await;
            return;
        }

        // A capture in flight holds new work back until the phase returns
        if self.running.is_none() && self.phase.current() != RabbitState::Recording {
            if self.phase.current() == RabbitState::Asleep {
                self.advance_asleep().await;
            } else if self.interactive_owner.is_some() {
                self.advance_interactive().await;
            } else {
                self.advance_queue().await;
            }
        }

        // Normalize the phase once nothing is running or startable
        if self.running.is_none()
            && self.phase.current() == RabbitState::Playing
            && self.interactive_owner.is_none()
        {
            self.set_phase(RabbitState::Idle).await;
        }

        self.manage_idle_animation().await;
    }

    /// While asleep the queue holds nothing but diagnostics, shutdowns and
    /// redundant sleeps (submission and the sleep-entry sweep reject the
    /// rest), so this only needs to service those.
    async fn advance_asleep(&mut self) {
        let index = self.queue.iter().position(|item| {
            matches!(
                item,
                WorkItem::Sleep { .. } | WorkItem::Test { .. } | WorkItem::Shutdown { .. }
            )
        });
        let Some(index) = index else {
            return;
        };
        let item = self.queue.remove(index).expect("index from position");
        match item {
            WorkItem::Sleep { origin, request_id } => {
                // Already asleep
                self.respond(origin, Response::ok(request_id)).await;
            }
            WorkItem::Shutdown { mode, origin, request_id } => {
                self.begin_shutdown(mode, origin, request_id).await;
            }
            item @ WorkItem::Test { .. } => {
                // Diagnostics run immediately when asleep
                self.start_execution(item).await;
            }
            _ => unreachable!("position matched only sleep/test/shutdown"),
        }
    }

    async fn advance_interactive(&mut self) {
        let now = Utc::now();
        while let Some(item) = self.interactive_queue.pop_front() {
            if item.expired(now) {
                self.respond_expired(item).await;
                continue;
            }
            self.start_execution(item).await;
            return;
        }
    }

    async fn advance_queue(&mut self) {
        let now = Utc::now();
        let mut rotations = 0usize;

        while let Some(head) = self.queue.front() {
            if head.expired(now) {
                let item = self.queue.pop_front().expect("checked front");
                self.respond_expired(item).await;
                continue;
            }

            match head {
                WorkItem::Sleep { .. } => {
                    let blocked = self.queue.iter().skip(1).any(WorkItem::blocks_sleep);
                    if blocked && rotations < self.queue.len() {
                        // A sleep never runs before strictly later work;
                        // migrate it to the tail.
                        let sleep = self.queue.pop_front().expect("checked front");
                        self.queue.push_back(sleep);
                        rotations += 1;
                        continue;
                    }
                    let WorkItem::Sleep { origin, request_id } =
                        self.queue.pop_front().expect("checked front")
                    else {
                        unreachable!()
                    };
                    info!("queue drained into sleep");
                    self.stop_idle().await;
                    // Asleep is entered from idle; normalize first in case
                    // the last item left us in playing.
                    self.set_phase(RabbitState::Idle).await;
                    self.set_phase(RabbitState::Asleep).await;
                    self.respond(origin, Response::ok(request_id)).await;
                    // Stragglers behind the barrier that may not stay
                    // queued while asleep answer the same way late
                    // submissions do.
                    let drained: Vec<WorkItem> = self.queue.drain(..).collect();
                    for item in drained {
                        if item.allowed_while_asleep() {
                            self.queue.push_back(item);
                        } else {
                            self.reject_asleep(item).await;
                        }
                    }
                    return;
                }
                WorkItem::ModeSwitch { .. } => {
                    let WorkItem::ModeSwitch { origin, request_id } =
                        self.queue.pop_front().expect("checked front")
                    else {
                        unreachable!()
                    };
                    self.grant_interactive(origin, request_id).await;
                    return;
                }
                WorkItem::ConfigUpdate { .. } => {
                    let WorkItem::ConfigUpdate { service, origin, request_id } =
                        self.queue.pop_front().expect("checked front")
                    else {
                        unreachable!()
                    };
                    let response = self.apply_config_update(&service, request_id).await;
                    self.respond(origin, response).await;
                    continue;
                }
                WorkItem::Shutdown { .. } => {
                    let WorkItem::Shutdown { mode, origin, request_id } =
                        self.queue.pop_front().expect("checked front")
                    else {
                        unreachable!()
                    };
                    self.begin_shutdown(mode, origin, request_id).await;
                    return;
                }
                _ => {
                    let item = self.queue.pop_front().expect("checked front");
                    self.start_execution(item).await;
                    return;
                }
            }
        }
    }

    /// Grant the interactive slot and pull the new owner's queued commands
    /// into the bypass lane so they run before other writers' work.
    async fn grant_interactive(&mut self, origin: WriterId, request_id: Option<String>) {
        info!("interactive slot granted to writer {}", origin);
        self.interactive_owner = Some(origin);

        let mut remaining = VecDeque::with_capacity(self.queue.len());
        for item in self.queue.drain(..) {
            if item.origin() == origin && item.is_bypass_kind() {
                self.interactive_queue.push_back(item);
            } else {
                remaining.push_back(item);
            }
        }
        self.queue = remaining;

        self.stop_idle().await;
        self.set_phase(RabbitState::Interactive).await;
        self.respond(origin, Response::ok(request_id)).await;
    }

    async fn release_interactive(&mut self, origin: WriterId, request_id: Option<String>) {
        if self.interactive_owner == Some(origin) {
            info!("interactive slot released by writer {}", origin);
            self.interactive_owner = None;
            // Accepted bypass items still run first, ahead of other writers
            while let Some(item) = self.interactive_queue.pop_back() {
                self.queue.push_front(item);
            }
            self.leave_interactive_phase().await;
        }
        self.respond(origin, Response::ok(request_id)).await;
    }

    async fn start_execution(&mut self, item: WorkItem) {
        self.stop_idle().await;

        let origin = item.origin();
        let request_id = item.request_id().map(str::to_string);
        let cancelable = matches!(
            &item,
            WorkItem::Command { cancelable: true, .. } | WorkItem::Message { cancelable: true, .. }
        );

        // Owner bypass keeps the interactive state; everything else plays.
        if self.interactive_owner.is_none()
            && self.phase.current() != RabbitState::Asleep
            && matches!(
                item,
                WorkItem::Command { .. } | WorkItem::Message { .. } | WorkItem::Test { .. }
            )
        {
            self.set_phase(RabbitState::Playing).await;
        }

        let cancel = CancellationToken::new();
        let engine = Arc::clone(&self.engine);
        let rfid = self.rfid.clone();
        let tag_pictures = Arc::clone(&self.tag_pictures);
        let rfid_timeout = self.config.get().await.scheduler.rfid_write_timeout;
        let tx = self.self_tx.clone();
        let token = cancel.clone();

        debug!("starting work item (request_id={:?})", request_id);
        let task = tokio::spawn(async move {
            // The engine runs in its own task so a panic is caught at the
            // item boundary and the daemon continues.
            let inner = tokio::spawn(run_payload(engine, rfid, tag_pictures, rfid_timeout, item, token));
            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!("work item panicked");
                        ItemOutcome::Failure {
                            class: ErrorClass::HardwareError,
                            message: "internal error while executing item".to_string(),
                        }
                    } else {
                        ItemOutcome::Canceled
                    }
                }
            };
            let _ = tx.send(SchedulerMsg::ItemFinished { outcome }).await;
        });

        self.running = Some(Running {
            origin,
            request_id,
            cancelable,
            cancel_requested: false,
            cancel,
            task,
        });
    }

    async fn finish_running(&mut self, outcome: ItemOutcome) {
        let Some(running) = self.running.take() else {
            warn!("item finished with nothing running");
            return;
        };
        running.task.abort();

        debug!("work item finished: {:?} (request_id={:?})", outcome, running.request_id);
        let response = match outcome {
            ItemOutcome::Ok => Response::ok(running.request_id),
            ItemOutcome::OkUid(uid) => {
                let mut response = Response::ok(running.request_id);
                response.uid = Some(uid);
                response
            }
            ItemOutcome::Canceled => Response::status(running.request_id, Status::Canceled),
            ItemOutcome::Timeout => Response::status(running.request_id, Status::Timeout),
            ItemOutcome::Failure { class, message } => {
                Response::failure(running.request_id, class, message)
            }
            ItemOutcome::Error { class, message } => {
                Response::error(running.request_id, class, message)
            }
        };
        self.respond(running.origin, response).await;
    }

    async fn handle_cancel(&mut self, origin: WriterId, target: String) {
        // Running item first
        if let Some(running) = self.running.as_mut() {
            if running.request_id.as_deref() == Some(target.as_str()) {
                if running.cancelable && !running.cancel_requested {
                    running.cancel_requested = true;
                    running.cancel.cancel();
                    // The canceled response follows from ItemFinished
                    return;
                }
                let response = Response::error(
                    Some(target),
                    ErrorClass::StateError,
                    "item is not cancelable or already canceling",
                );
                self.respond(origin, response).await;
                return;
            }
        }

        // Then both queues
        let removed = if let Some(index) =
            self.queue.iter().position(|i| i.request_id() == Some(target.as_str()))
        {
            Some(self.queue.remove(index).expect("index from position"))
        } else if let Some(index) = self
            .interactive_queue
            .iter()
            .position(|i| i.request_id() == Some(target.as_str()))
        {
            Some(self.interactive_queue.remove(index).expect("index from position"))
        } else {
            None
        };
        if let Some(item) = removed {
            let response = Response::status(Some(target), Status::Canceled);
            self.respond(item.origin(), response).await;
            return;
        }

        let response = Response::error(
            Some(target),
            ErrorClass::StateError,
            "no cancelable item with this request_id",
        );
        self.respond(origin, response).await;
    }

    async fn writer_gone(&mut self, id: WriterId) {
        self.queue.retain(|item| item.origin() != id);
        self.interactive_queue.retain(|item| item.origin() != id);
        if self.interactive_owner == Some(id) {
            info!("interactive owner {} disconnected", id);
            self.interactive_owner = None;
            self.leave_interactive_phase().await;
        }
    }

    /// Leave the interactive phase after a release or owner disconnect.
    /// A capture in flight ends back in idle instead of interactive.
    async fn leave_interactive_phase(&mut self) {
        if self.phase.current() == RabbitState::Recording {
            self.recording_return = Some(RabbitState::Idle);
            return;
        }
        let next = if self.running.is_some() || !self.queue.is_empty() {
            RabbitState::Playing
        } else {
            RabbitState::Idle
        };
        self.set_phase(next).await;
    }

    /// Enter the recording phase if the current one allows capture.
    async fn begin_recording(&mut self) -> bool {
        let current = self.phase.current();
        if !matches!(
            current,
            RabbitState::Idle | RabbitState::Interactive | RabbitState::Playing
        ) {
            debug!("capture refused while {}", current);
            return false;
        }
        self.stop_idle().await;
        self.recording_return = Some(current);
        self.set_phase(RabbitState::Recording).await;
        true
    }

    async fn end_recording(&mut self) {
        if self.phase.current() == RabbitState::Recording {
            let back = self.recording_return.take().unwrap_or(RabbitState::Idle);
            self.set_phase(back).await;
        }
    }

    async fn apply_config_update(&mut self, service: &str, request_id: Option<String>) -> Response {
        match service {
            "nabd" | "locale" => match self.config.reload().await {
                Ok(()) => {
                    let locale = self.config.get().await.media.locale;
                    self.resolver.set_locale(locale).await;
                    Response::ok(request_id)
                }
                Err(e) => {
                    warn!("config reload failed: {}", e);
                    Response::error(request_id, ErrorClass::StateError, e.to_string())
                }
            },
            other => {
                // Other services watch their own configuration
                debug!("config-update for service '{}' ignored", other);
                Response::ok(request_id)
            }
        }
    }

    async fn begin_shutdown(
        &mut self,
        mode: ShutdownMode,
        origin: WriterId,
        request_id: Option<String>,
    ) {
        info!("shutdown requested: {:?}", mode);
        self.respond(origin, Response::ok(request_id)).await;
        let _ = self.shutdown_tx.send(mode).await;
        self.stopping = true;
    }

    async fn respond(&self, origin: WriterId, response: Response) {
        self.registry.send(origin, &Frame::Response(response)).await;
    }

    async fn respond_expired(&self, item: WorkItem) {
        debug!("item expired before start (request_id={:?})", item.request_id());
        let response = Response::status(item.request_id().map(str::to_string), Status::Expired);
        self.respond(item.origin(), response).await;
    }

    async fn reject_asleep(&self, item: WorkItem) {
        debug!("item rejected while asleep (request_id={:?})", item.request_id());
        let response = Response::error(
            item.request_id().map(str::to_string),
            ErrorClass::StateError,
            "daemon is asleep",
        );
        self.respond(item.origin(), response).await;
    }

    async fn set_phase(&mut self, to: RabbitState) {
        if let Some(new_state) = self.phase.transition(to) {
            let _ = self.state_tx.send(new_state);
            self.registry.broadcast(&Frame::State { state: new_state }).await;
        }
    }

    /// Idle animations drive the LEDs only when nothing else can.
    async fn manage_idle_animation(&mut self) {
        let eligible = !self.stopping
            && self.running.is_none()
            && self.phase.current() == RabbitState::Idle
            && self.queue.is_empty()
            && self.interactive_queue.is_empty()
            && !self.animator.is_empty();

        match (&self.idle_task, eligible) {
            (None, true) => {
                debug!("starting idle animation rotation");
                self.idle_task = Some(self.animator.spawn(Arc::clone(&self.leds)));
            }
            (Some(_), false) => self.stop_idle().await,
            _ => {}
        }
    }

    async fn stop_idle(&mut self) {
        if let Some((token, handle)) = self.idle_task.take() {
            token.cancel();
            // Wait for the LED clear so queued work starts from black
            let _ = handle.await;
        }
    }
}

/// Execute one work item's payload to an outcome.
async fn run_payload(
    engine: Arc<Engine>,
    rfid: Option<Arc<dyn RfidReader>>,
    tag_pictures: Arc<RwLock<HashMap<String, u8>>>,
    rfid_timeout_default: f64,
    item: WorkItem,
    cancel: CancellationToken,
) -> ItemOutcome {
    let result = match item {
        WorkItem::Command { sequence, .. } => engine.play_sequence(&sequence, &cancel).await,
        WorkItem::Message { signature, body, .. } => {
            engine.play_message(signature.as_ref(), &body, &cancel).await
        }
        WorkItem::Test { which, .. } => match which {
            TestKind::Leds => engine.test_leds(&cancel).await,
            TestKind::Ears => engine.test_ears(&cancel).await,
        },
        WorkItem::RfidWrite { tech, uid, picture, app, data, timeout, .. } => {
            let timeout = timeout.unwrap_or(rfid_timeout_default);
            return rfid_write(rfid, tag_pictures, tech, uid, picture, app, data, timeout).await;
        }
        other => {
            warn!("non-executable item reached the engine: {:?}", other);
            return ItemOutcome::Error {
                class: ErrorClass::StateError,
                message: "item is not executable".to_string(),
            };
        }
    };

    match result {
        Ok(()) => ItemOutcome::Ok,
        Err(e) => outcome_from_engine_error(e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn rfid_write(
    rfid: Option<Arc<dyn RfidReader>>,
    tag_pictures: Arc<RwLock<HashMap<String, u8>>>,
    tech: String,
    uid: TagUid,
    picture: u8,
    app: String,
    data: Option<String>,
    timeout: f64,
) -> ItemOutcome {
    let Some(reader) = rfid else {
        return ItemOutcome::Error {
            class: ErrorClass::NfcException,
            message: "no RFID reader present".to_string(),
        };
    };

    let duration = std::time::Duration::from_secs_f64(timeout.max(0.0));
    match tokio::time::timeout(duration, reader.write(&tech, &uid, picture, &app, data.as_deref()))
        .await
    {
        Ok(Ok(written_uid)) => {
            // Remember the picture so later formatted detections of this
            // app's tags are annotated before broadcast.
            tag_pictures.write().await.insert(app, picture);
            ItemOutcome::OkUid(written_uid)
        }
        Ok(Err(HardwareError::TagIncompatible(message))) => ItemOutcome::Error {
            class: ErrorClass::NfcException,
            message,
        },
        Ok(Err(e)) => ItemOutcome::Failure {
            class: ErrorClass::HardwareError,
            message: e.to_string(),
        },
        Err(_) => ItemOutcome::Timeout,
    }
}

fn outcome_from_engine_error(error: EngineError) -> ItemOutcome {
    match error {
        EngineError::Canceled => ItemOutcome::Canceled,
        EngineError::Hardware(e) => ItemOutcome::Failure {
            class: ErrorClass::HardwareError,
            message: e.to_string(),
        },
        EngineError::Resource(ResolveError::AbsolutePath(path)) => ItemOutcome::Error {
            class: ErrorClass::InvalidParameter,
            message: format!("absolute resource path rejected: {}", path),
        },
        EngineError::Resource(e) => ItemOutcome::Error {
            class: ErrorClass::InvalidResource,
            message: e.to_string(),
        },
        EngineError::BadProgram(message) => ItemOutcome::Error {
            class: ErrorClass::InvalidResource,
            message,
        },
    }
}
