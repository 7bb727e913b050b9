//! Top-level supervisor.
//!
//! Idles on the wake stage, maps a detection to an agent configuration,
//! runs the realtime agent until hangup or inactivity, and recovers from
//! errors with a short delay. Remote sessions are kept alive between
//! conversations and recreated once they outlive the session timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{EventBus, EventKind, EventPayload};
use crate::config::paths::get_model_dir;
use crate::config::{self, AppConfig};
use crate::device::DeviceCoordinator;
use crate::realtime::{AgentStateUpdate, RealtimeAgent, RunResult};
use crate::tools::ToolRegistry;
use crate::wake::stage::WakeStage;
use crate::wake::{WakeEngine, WakeModelConfig};

const SENDER: &str = "supervisor";

/// Delay before retrying after an unexpected failure.
const RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// A token that triggers when either input token triggers.
fn linked_token(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let combined = CancellationToken::new();
    let out = combined.clone();
    let a = a.clone();
    let b = b.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = a.cancelled() => {}
            _ = b.cancelled() => {}
        }
        combined.cancel();
    });
    out
}

/// Whether the cached agent must be replaced before the next run.
fn needs_new_agent(
    cached: Option<&RealtimeAgent>,
    agent_name: &str,
    session_timeout: Duration,
) -> bool {
    match cached {
        None => true,
        Some(agent) => agent.agent_name() != agent_name || agent.age() >= session_timeout,
    }
}

pub struct Supervisor {
    bus: EventBus,
    registry: Arc<ToolRegistry>,
    coordinator: DeviceCoordinator,
    shutdown: CancellationToken,
    config: AppConfig,
    config_dirty: Arc<AtomicBool>,
    /// Replaced with a fresh token once the current one is consumed.
    hangup: Arc<Mutex<CancellationToken>>,
    cached_agent: Option<RealtimeAgent>,
    wake_stage: Option<WakeStage>,
}

impl Supervisor {
    pub fn new(
        bus: EventBus,
        registry: Arc<ToolRegistry>,
        coordinator: DeviceCoordinator,
        shutdown: CancellationToken,
        config: AppConfig,
    ) -> Self {
        let supervisor = Self {
            bus,
            registry,
            coordinator,
            shutdown,
            config,
            config_dirty: Arc::new(AtomicBool::new(false)),
            hangup: Arc::new(Mutex::new(CancellationToken::new())),
            cached_agent: None,
            wake_stage: None,
        };
        supervisor.subscribe();
        supervisor
    }

    fn subscribe(&self) {
        let hangup = Arc::clone(&self.hangup);
        self.bus.subscribe(
            EventKind::HangupInput,
            Arc::new(move |_| {
                info!("hangup requested");
                hangup.lock().unwrap().cancel();
            }),
        );

        let dirty = Arc::clone(&self.config_dirty);
        self.bus.subscribe(
            EventKind::ConfigChanged,
            Arc::new(move |_| {
                dirty.store(true, Ordering::Release);
            }),
        );
    }

    /// Current hangup token, minting a fresh one if the last was consumed.
    fn current_hangup(&self) -> CancellationToken {
        let mut guard = self.hangup.lock().unwrap();
        if guard.is_cancelled() {
            *guard = CancellationToken::new();
        }
        guard.clone()
    }

    fn build_wake_stage(&self) -> WakeStage {
        let models: Vec<WakeModelConfig> = self
            .config
            .agents
            .iter()
            .filter(|a| !a.disabled)
            .map(|a| WakeModelConfig {
                model_id: a.wake_word_model.clone(),
                threshold: a.wake_word_threshold,
                trigger_level: a.wake_word_trigger_level,
            })
            .collect();
        let engine = WakeEngine::with_models(&models, &get_model_dir());
        WakeStage::new(
            engine,
            self.bus.clone(),
            self.config.wake_word_silence_threshold,
        )
    }

    /// Dispose the cached agent and re-read configuration.
    async fn apply_config_change(&mut self) {
        info!("configuration changed, reloading");
        if let Some(mut agent) = self.cached_agent.take() {
            agent.dispose().await;
        }
        self.wake_stage = None;
        self.config = config::load();
    }

    /// Main loop. Returns when the shutdown token triggers.
    pub async fn run(&mut self) {
        self.coordinator.apply_startup(self.config.startup_volume);
        self.bus.publish(SENDER, EventPayload::SystemOk);

        while !self.shutdown.is_cancelled() {
            if let Err(e) = self.cycle().await {
                error!("conversation cycle failed: {e}");
                self.bus.publish(
                    SENDER,
                    EventPayload::SystemError {
                        message: e.to_string(),
                    },
                );
                if let Some(mut agent) = self.cached_agent.take() {
                    agent.dispose().await;
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECOVERY_DELAY) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }

        if let Some(mut agent) = self.cached_agent.take() {
            agent.dispose().await;
        }
        info!("supervisor stopped");
    }

    /// One wake → select → run cycle.
    async fn cycle(&mut self) -> anyhow::Result<()> {
        if self.config_dirty.swap(false, Ordering::AcqRel) {
            self.apply_config_change().await;
        }
        self.bus.publish(SENDER, EventPayload::SystemOk);

        if self.wake_stage.is_none() {
            self.wake_stage = Some(self.build_wake_stage());
        }

        // The wake wait is interruptible by both process shutdown and the
        // hangup button (which acts as a manual wake).
        let hangup = self.current_hangup();
        let wake_cancel = linked_token(&self.shutdown, &hangup);
        let stage = self.wake_stage.as_mut().expect("wake stage built above");
        let detected = stage.wait_for_wake_word(&wake_cancel).await?;

        let agent_config = match detected {
            Some(model) => {
                self.bus.publish(
                    SENDER,
                    EventPayload::WakeWordDetected {
                        model: model.clone(),
                    },
                );
                match self.config.agent_for_wake_word(&model) {
                    Some(agent) => agent.clone(),
                    None => {
                        error!(model = %model, "no agent configured for wake word");
                        return Ok(());
                    }
                }
            }
            None if self.shutdown.is_cancelled() => return Ok(()),
            None => {
                // Hangup while idle: manual wake of the first agent.
                let Some(agent) = self.config.first_enabled_agent() else {
                    warn!("manual wake with no enabled agents");
                    return Ok(());
                };
                let agent = agent.clone();
                self.bus.publish(
                    SENDER,
                    EventPayload::WakeWordDetected {
                        model: agent.wake_word_model.clone(),
                    },
                );
                agent
            }
        };

        let session_timeout = Duration::from_secs(self.config.session_timeout_minutes * 60);
        if needs_new_agent(self.cached_agent.as_ref(), &agent_config.name, session_timeout) {
            if let Some(mut stale) = self.cached_agent.take() {
                info!(agent = %stale.agent_name(), "disposing stale agent");
                stale.dispose().await;
            }
            self.cached_agent = Some(RealtimeAgent::new(
                self.config.clone(),
                agent_config.clone(),
                Arc::clone(&self.registry),
            ));
        }

        let run_cancel = linked_token(&self.shutdown, &self.current_hangup());
        let state_bus = self.bus.clone();
        let meter_bus = self.bus.clone();
        let agent = self.cached_agent.as_mut().expect("agent created above");

        let result = agent
            .run(
                move |update| match update {
                    AgentStateUpdate::Ready => {
                        state_bus.publish(SENDER, EventPayload::StartListening)
                    }
                    AgentStateUpdate::SpeakingStarted => {}
                    AgentStateUpdate::SpeakingStopped => {
                        state_bus.publish(SENDER, EventPayload::TalkLevel(None))
                    }
                },
                move |level| meter_bus.publish(SENDER, EventPayload::TalkLevel(Some(level))),
                &run_cancel,
            )
            .await;

        self.bus.publish(SENDER, EventPayload::StopListening);

        match result? {
            RunResult::Cancelled => info!("conversation cancelled"),
            RunResult::InactivityTimeout => info!("conversation timed out"),
        }
        Ok(())
    }
}
