//! Process entry point: initialize logging, load configuration, wire the
//! subsystems together, and run the supervisor until SIGINT.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use halo_core::bus::{EventBus, EventPayload};
use halo_core::config::{self, paths::get_data_dir};
use halo_core::device::volume::SoftwareVolume;
use halo_core::device::{DeviceCoordinator, LogLedDriver, LogSpeakerphone};
use halo_core::input::InputListener;
use halo_core::memory::{EmbeddingClient, MemoryStore};
use halo_core::supervisor::Supervisor;
use halo_core::tools::plugins::{
    EyesPlugin, GeoIpPlugin, MemoryPlugin, SystemPlugin, WeatherPlugin,
};
use halo_core::tools::{Plugin, ToolRegistry};

const SENDER: &str = "main";

#[tokio::main]
async fn main() {
    // Tracing setup: file appender when the data dir is writable,
    // stderr otherwise. Respects RUST_LOG, defaults to info.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let data_dir = get_data_dir();
    let use_file = std::fs::create_dir_all(&data_dir).is_ok();

    // The non-blocking guard must stay alive for the program lifetime.
    let _guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if use_file {
        let file_appender = tracing_appender::rolling::never(&data_dir, "halo-core.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
    } else {
        _guard = None;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let app_config = config::load();
    info!(
        agents = app_config.agents.len(),
        model = %app_config.model,
        "configuration loaded"
    );
    if app_config.api_key.is_empty() {
        warn!(
            "no API key configured — edit {} before waking the assistant",
            config::get_config_path().display()
        );
    }

    let bus = EventBus::new();

    // Device feedback: tracing-backed drivers unless real hardware is
    // wired in here.
    let coordinator = DeviceCoordinator::new(
        Box::new(LogLedDriver),
        Box::new(LogSpeakerphone),
        Box::new(SoftwareVolume::new()),
    );
    coordinator.start(&bus);

    // Memory store, with embeddings when both key and model are set.
    let embedder = match (&app_config.embedding_model, app_config.api_key.is_empty()) {
        (Some(model), false) => Some(EmbeddingClient::new(&app_config.api_key, model)),
        _ => None,
    };
    let memory_store = match MemoryStore::open(
        data_dir.join("memories.json"),
        app_config.memory_cap,
        embedder,
    ) {
        Ok(store) => store,
        Err(e) => {
            warn!("memory store unavailable: {e}");
            MemoryStore::open(
                std::env::temp_dir().join("halo-memories.json"),
                app_config.memory_cap,
                None,
            )
            .expect("temp-dir memory store")
        }
    };
    let memory_store = Arc::new(Mutex::new(memory_store));

    let registry = Arc::new(ToolRegistry::new(
        vec![
            Plugin::Calculator,
            Plugin::DateTime,
            Plugin::GeoIp(GeoIpPlugin::new()),
            Plugin::Weather(WeatherPlugin::new()),
            Plugin::Memory(MemoryPlugin::new(memory_store)),
            Plugin::System(SystemPlugin::new(bus.clone(), coordinator.clone())),
            Plugin::Eyes(EyesPlugin::new(coordinator.clone())),
        ],
        bus.clone(),
    ));

    // Space bar and arrow keys stand in for the hangup button and the
    // volume rocker during development.
    let input = InputListener::new();
    input.start(bus.clone());

    // Graceful shutdown on SIGINT.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, shutting down");
                bus.publish(SENDER, EventPayload::Shutdown);
                shutdown.cancel();
            }
        });
    }

    let mut supervisor = Supervisor::new(
        bus.clone(),
        registry,
        coordinator,
        shutdown.clone(),
        app_config,
    );
    supervisor.run().await;

    input.stop();
    info!("halo-core stopped");
}
