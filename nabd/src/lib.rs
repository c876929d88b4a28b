//! nabd daemon library
//!
//! One resident process arbitrating exclusive access to the rabbit's
//! actuators (five LEDs, two ears, audio, optional RFID and microphone, one
//! button) among concurrent TCP clients speaking line-delimited JSON:
//! - command queue and state machine serializing hardware access
//! - choreography engine with 10 ms tempo resolution
//! - multiplexed TCP front-end with per-writer event subscriptions
//! - virtual backend for headless development

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::warn;

pub mod choreography;
pub mod config;
pub mod dispatcher;
pub mod hardware;
pub mod idle;
pub mod ipc;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod state;
pub mod virt;

// Re-export common types
pub use nab_common::{Frame, Packet, RabbitState, Response, ShutdownMode};

use crate::choreography::Engine;
use crate::config::ConfigManager;
use crate::dispatcher::SensorDispatcher;
use crate::ipc::IpcServer;
use crate::registry::WriterRegistry;
use crate::resources::ResourceResolver;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::virt::VirtualHandle;

/// A fully wired daemon, used by `main` and by the integration tests.
pub struct Daemon {
    pub addr: SocketAddr,
    pub view_addr: Option<SocketAddr>,
    pub scheduler: SchedulerHandle,
    pub virt: Option<VirtualHandle>,
    pub state_rx: watch::Receiver<RabbitState>,
    pub shutdown_rx: mpsc::Receiver<ShutdownMode>,
    registry: Arc<WriterRegistry>,
    ipc: IpcServer,
}

impl Daemon {
    /// Wire every component against the configured backend and start
    /// listening. With the virtual backend enabled the ANSI view is served
    /// on the port right above the daemon's.
    pub async fn start(config_manager: Arc<ConfigManager>) -> std::io::Result<Self> {
        let config = config_manager.get().await;

        // The virtual backend is currently the only in-tree driver set;
        // concrete drivers plug in through the same HardwareBackend.
        let (mut backend, virt_handle) = virt::build();

        let resolver = Arc::new(ResourceResolver::new(
            &config.media.root,
            &config.media.locale,
            config.virt.seed,
        ));
        let engine = Arc::new(Engine::new(
            Arc::clone(&backend.leds),
            Arc::clone(&backend.ears),
            Arc::clone(&backend.audio),
            Arc::clone(&resolver),
        ));

        let registry = Arc::new(WriterRegistry::new());
        let tag_pictures = Arc::new(RwLock::new(HashMap::new()));
        let sensor_events = backend.take_sensor_events();

        let (scheduler, scheduler_handle, state_rx, shutdown_rx) = Scheduler::new(
            Arc::clone(&registry),
            engine,
            Arc::clone(&resolver),
            Arc::clone(&config_manager),
            Arc::clone(&backend.leds),
            backend.rfid.clone(),
            Arc::clone(&tag_pictures),
            backend.summary(),
        );
        tokio::spawn(scheduler.run());

        let sensor_dispatcher = SensorDispatcher::new(
            sensor_events,
            Arc::clone(&registry),
            scheduler_handle.clone(),
            backend.audio_source.clone(),
            tag_pictures,
        );
        tokio::spawn(sensor_dispatcher.run());

        let mut ipc = IpcServer::new(format!("{}:{}", config.daemon.bind_addr, config.daemon.port));
        let addr = ipc
            .start(Arc::clone(&registry), scheduler_handle.clone(), state_rx.clone())
            .await?;

        // Virtual view on daemon port + 1
        let view_addr = if config.virt.enabled {
            let view_bind = format!(
                "{}:{}",
                config.daemon.bind_addr,
                addr.port() + nab_common::VIRTUAL_PORT_OFFSET
            );
            match TcpListener::bind(&view_bind).await {
                Ok(listener) => {
                    let view_addr = listener.local_addr().ok();
                    tokio::spawn(virt::serve_view(
                        listener,
                        virt_handle.clone(),
                        state_rx.clone(),
                    ));
                    view_addr
                }
                Err(e) => {
                    warn!("could not bind virtual view on {}: {}", view_bind, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            addr,
            view_addr,
            scheduler: scheduler_handle,
            virt: Some(virt_handle),
            state_rx,
            shutdown_rx,
            registry,
            ipc,
        })
    }

    /// Stop accepting connections and hang up on connected writers.
    pub async fn stop(&mut self) {
        self.ipc.shutdown().await;
        registry::shutdown_notice(&self.registry).await;
    }
}
