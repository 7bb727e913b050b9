//! Realtime agent core.
//!
//! One agent owns one long-lived remote session. A receive loop (session
//! lifetime) consumes server events — audio deltas, tool calls, response
//! boundaries — while an audio-capture loop (one per `run()`) does local
//! VAD, utterance segmentation, and barge-in. The two share a single
//! mutex-guarded playback-sync record; neither blocks the other for more
//! than one chunk of audio.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::resample::{pcm16_to_bytes, pcm16_to_f32, resample_nearest};
use crate::audio::{
    Microphone, Speaker, REMOTE_SAMPLE_RATE, SPEAKER_CHUNK_SIZE, VAD_SAMPLE_RATE,
};
use crate::config::paths::get_model_dir;
use crate::config::{AgentConfig, AppConfig};
use crate::error::AssistantError;
use crate::tools::ToolRegistry;
use crate::vad::VadDetector;

use super::client::{self, SessionCommands, SessionHandle};
use super::events::SessionEvent;

/// Frames of 24 kHz pre-roll retained before speech is confirmed.
const PRE_BUFFER_FRAMES: usize = 15;

/// Consecutive speech frames that start a recording.
const MIN_SPEECH_FRAMES: u32 = 3;

/// Consecutive speech frames that trigger barge-in while the model speaks.
const MIN_SPEECH_FRAMES_FOR_BARGE_IN: u32 = 2;

/// Silence that ends an utterance.
const SILENCE_MS_TO_STOP: f64 = 1600.0;

/// VAD probability at or above which a frame counts as speech.
const SPEECH_PROBABILITY_THRESHOLD: f32 = 0.5;

/// How long to wait for the model before giving up on a response.
const RESPONSE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one `run()` call. Both leave the session intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Cancelled,
    InactivityTimeout,
}

/// State transitions surfaced to the supervisor during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStateUpdate {
    Ready,
    SpeakingStarted,
    SpeakingStopped,
}

/// Playback synchronization record. All fields move together under one
/// lock; critical sections are short and never block on I/O (the
/// speaker write is a ring enqueue).
#[derive(Debug)]
pub struct PlaybackSync {
    pub model_is_speaking: bool,
    pub waiting_for_response: bool,
    pub response_requested_at: Instant,
    pub barge_in_triggered: bool,
    pub current_item_id: Option<String>,
    /// Pending downlink audio, drained in SPEAKER_CHUNK_SIZE chunks.
    pub output_buffer: Vec<u8>,
}

impl Default for PlaybackSync {
    fn default() -> Self {
        Self {
            model_is_speaking: false,
            waiting_for_response: false,
            response_requested_at: Instant::now(),
            barge_in_triggered: false,
            current_item_id: None,
            output_buffer: Vec::new(),
        }
    }
}

/// What one capture frame did to the turn state.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    None,
    /// The user interrupted the model; recording has begun.
    BargeIn,
    UtteranceStarted,
    /// A complete utterance, as 24 kHz PCM16 samples.
    UtteranceFinished(Vec<i16>),
}

/// Per-run capture-loop state: pre-roll ring, utterance buffer, and the
/// speech/silence counters. Owned by one `run()`; never shared.
pub struct CaptureState {
    pre_buffer: VecDeque<Vec<i16>>,
    utterance: Vec<i16>,
    is_recording: bool,
    speech_frames: u32,
    barge_in_speech_frames: u32,
    silence_ms: f64,
    was_model_speaking: bool,
    last_activity: Instant,
}

impl CaptureState {
    pub fn new(now: Instant) -> Self {
        Self {
            pre_buffer: VecDeque::with_capacity(PRE_BUFFER_FRAMES),
            utterance: Vec::new(),
            is_recording: false,
            speech_frames: 0,
            barge_in_speech_frames: 0,
            silence_ms: 0.0,
            was_model_speaking: false,
            last_activity: now,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    /// Time since the last speech frame or model-speech boundary.
    pub fn idle_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn begin_recording(&mut self, first_frame: Option<&[i16]>) {
        self.is_recording = true;
        self.utterance.clear();
        for frame in self.pre_buffer.drain(..) {
            self.utterance.extend_from_slice(&frame);
        }
        if let Some(frame) = first_frame {
            self.utterance.extend_from_slice(frame);
        }
        self.silence_ms = 0.0;
        self.speech_frames = 0;
    }

    /// Advance on one frame of upsampled (24 kHz) audio.
    pub fn step(
        &mut self,
        frame24: &[i16],
        is_speech: bool,
        model_is_speaking: bool,
        frame_ms: f64,
        now: Instant,
    ) -> TurnEvent {
        // Any user speech, or the model finishing a turn, counts as
        // conversational activity.
        if is_speech || (self.was_model_speaking && !model_is_speaking) {
            self.last_activity = now;
        }
        self.was_model_speaking = model_is_speaking;

        // Barge-in: sustained speech over the model's own voice.
        if model_is_speaking && !self.is_recording {
            if is_speech {
                self.barge_in_speech_frames += 1;
            } else {
                self.barge_in_speech_frames = 0;
            }
            if self.barge_in_speech_frames >= MIN_SPEECH_FRAMES_FOR_BARGE_IN {
                self.barge_in_speech_frames = 0;
                // The interrupting audio becomes the next user turn.
                self.begin_recording(Some(frame24));
                return TurnEvent::BargeIn;
            }
        } else {
            self.barge_in_speech_frames = 0;
        }

        if !self.is_recording {
            if self.pre_buffer.len() == PRE_BUFFER_FRAMES {
                self.pre_buffer.pop_front();
            }
            self.pre_buffer.push_back(frame24.to_vec());

            if !model_is_speaking {
                if is_speech {
                    self.speech_frames += 1;
                } else {
                    self.speech_frames = 0;
                }
                if self.speech_frames >= MIN_SPEECH_FRAMES {
                    // The triggering frames are already in the pre-roll.
                    self.begin_recording(None);
                    return TurnEvent::UtteranceStarted;
                }
            }
            return TurnEvent::None;
        }

        // Recording: accumulate and watch for the closing silence.
        self.utterance.extend_from_slice(frame24);
        if is_speech {
            self.silence_ms = 0.0;
        } else {
            self.silence_ms += frame_ms;
            if self.silence_ms >= SILENCE_MS_TO_STOP {
                self.is_recording = false;
                self.silence_ms = 0.0;
                return TurnEvent::UtteranceFinished(std::mem::take(&mut self.utterance));
            }
        }
        TurnEvent::None
    }
}

/// Shared handles the receive loop operates on.
pub(crate) struct ReceiveContext {
    pub commands: SessionCommands,
    pub sync: Arc<Mutex<PlaybackSync>>,
    pub speaker: Arc<Mutex<Option<Speaker>>>,
    pub registry: Arc<ToolRegistry>,
    pub notices: Arc<Mutex<Option<mpsc::UnboundedSender<AgentStateUpdate>>>>,
    /// Session-scoped: cancelled only on dispose, never by a run.
    pub cancel: CancellationToken,
}

fn notify(
    notices: &Arc<Mutex<Option<mpsc::UnboundedSender<AgentStateUpdate>>>>,
    update: AgentStateUpdate,
) {
    if let Some(tx) = notices.lock().unwrap().as_ref() {
        let _ = tx.send(update);
    }
}

async fn wait_speaker_drained(speaker: &Arc<Mutex<Option<Speaker>>>) {
    loop {
        let buffered = speaker
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.buffered_samples());
        match buffered {
            Some(n) if n > 0 => tokio::time::sleep(Duration::from_millis(20)).await,
            _ => break,
        }
    }
}

/// Session-lifetime receive loop. Consumes server events until the wire
/// closes or the session is disposed. Never propagates errors upward.
pub(crate) async fn receive_loop(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ctx: ReceiveContext,
) {
    // Accumulates streamed function-call arguments per item id.
    let mut arg_builders: HashMap<String, String> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    info!("server event stream ended");
                    break;
                }
            },
        };

        match event {
            SessionEvent::SessionStarted { session_id } => {
                info!(session_id = %session_id, "session started");
            }
            SessionEvent::OutputStreamingStarted {
                item_id,
                function_name,
            } => {
                debug!(item_id = %item_id, function = ?function_name, "output streaming started");
                {
                    let mut sync = ctx.sync.lock().unwrap();
                    sync.model_is_speaking = true;
                    sync.barge_in_triggered = false;
                    sync.waiting_for_response = false;
                    sync.current_item_id = Some(item_id);
                    sync.output_buffer.clear();
                }
                notify(&ctx.notices, AgentStateUpdate::SpeakingStarted);
            }
            SessionEvent::OutputDelta {
                item_id,
                audio,
                audio_transcript,
                text,
                function_arguments,
                ..
            } => {
                if let Some(bytes) = audio {
                    let mut sync = ctx.sync.lock().unwrap();
                    sync.output_buffer.extend_from_slice(&bytes);
                    while sync.output_buffer.len() >= SPEAKER_CHUNK_SIZE
                        && !sync.barge_in_triggered
                    {
                        let chunk: Vec<u8> =
                            sync.output_buffer.drain(..SPEAKER_CHUNK_SIZE).collect();
                        // Non-blocking ring enqueue; safe under the sync lock.
                        if let Some(speaker) = ctx.speaker.lock().unwrap().as_ref() {
                            speaker.write(&chunk);
                        }
                    }
                }
                if let Some(args) = function_arguments {
                    arg_builders.entry(item_id).or_default().push_str(&args);
                }
                if let Some(t) = audio_transcript {
                    debug!(delta = %t, "audio transcript delta");
                }
                if let Some(t) = text {
                    debug!(delta = %t, "text delta");
                }
            }
            SessionEvent::OutputStreamingFinished {
                item_id,
                function_call_id,
                function_name,
            } => {
                let Some(call_id) = function_call_id else {
                    continue;
                };
                let Some(name) = function_name else {
                    warn!(item_id = %item_id, "function call finished without a name");
                    continue;
                };
                let args = arg_builders.remove(&item_id).unwrap_or_default();
                let output = ctx
                    .registry
                    .invoke_function(&name, &call_id, &args, &ctx.cancel)
                    .await;
                if let Err(e) = ctx.commands.add_item(output) {
                    warn!("failed to append tool output: {e}");
                }
            }
            SessionEvent::InputAudioTranscriptionFinished { transcript } => {
                info!(transcript = %transcript, "user said");
            }
            SessionEvent::ResponseFinished { created_items } => {
                let flush_residual = {
                    let mut sync = ctx.sync.lock().unwrap();
                    sync.waiting_for_response = false;
                    if sync.barge_in_triggered {
                        sync.output_buffer.clear();
                        false
                    } else {
                        if !sync.output_buffer.is_empty() {
                            let residual: Vec<u8> = sync.output_buffer.drain(..).collect();
                            if let Some(speaker) = ctx.speaker.lock().unwrap().as_ref() {
                                speaker.write(&residual);
                            }
                        }
                        true
                    }
                };

                if flush_residual {
                    wait_speaker_drained(&ctx.speaker).await;
                }

                ctx.sync.lock().unwrap().model_is_speaking = false;
                notify(&ctx.notices, AgentStateUpdate::SpeakingStopped);

                // A turn that produced tool calls needs another response
                // now that the outputs have been appended.
                if created_items.iter().any(|i| i.function_name.is_some()) {
                    debug!("tool outputs appended, requesting follow-up response");
                    {
                        let mut sync = ctx.sync.lock().unwrap();
                        sync.waiting_for_response = true;
                        sync.response_requested_at = Instant::now();
                    }
                    if let Err(e) = ctx.commands.start_response() {
                        warn!("follow-up response request failed: {e}");
                    }
                }
            }
            SessionEvent::Error { message } => {
                error!(message = %message, "server error");
            }
        }
    }
    debug!("receive loop ended");
}

/// One conversational agent bound to one remote session.
pub struct RealtimeAgent {
    app: AppConfig,
    agent: AgentConfig,
    registry: Arc<ToolRegistry>,
    session: Option<SessionHandle>,
    session_cancel: CancellationToken,
    receive_task: Option<tokio::task::JoinHandle<()>>,
    sync: Arc<Mutex<PlaybackSync>>,
    speaker: Arc<Mutex<Option<Speaker>>>,
    notices: Arc<Mutex<Option<mpsc::UnboundedSender<AgentStateUpdate>>>>,
    created_at: Instant,
}

impl RealtimeAgent {
    pub fn new(app: AppConfig, agent: AgentConfig, registry: Arc<ToolRegistry>) -> Self {
        Self {
            app,
            agent,
            registry,
            session: None,
            session_cancel: CancellationToken::new(),
            receive_task: None,
            sync: Arc::new(Mutex::new(PlaybackSync::default())),
            speaker: Arc::new(Mutex::new(None)),
            notices: Arc::new(Mutex::new(None)),
            created_at: Instant::now(),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent.name
    }

    /// Age of this agent instance, for the session-timeout check.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Connect and configure if there is no live session. A session
    /// whose receive loop has terminated (wire closure) is disposed and
    /// replaced.
    pub async fn ensure_session(&mut self) -> Result<(), AssistantError> {
        if self.session.as_ref().is_some_and(|s| !s.is_alive()) {
            info!("session wire closed, reconnecting");
            self.dispose().await;
        }
        if self.session.is_some() {
            return Ok(());
        }

        let tools = self.registry.descriptors(&self.agent.tools);
        let setup = client::session_setup(&self.app, &self.agent, tools);
        let mut handle = client::connect(&self.app, &setup).await?;
        let events = handle
            .take_events()
            .expect("fresh session always has an event stream");

        self.session_cancel = CancellationToken::new();
        let ctx = ReceiveContext {
            commands: handle.commands(),
            sync: Arc::clone(&self.sync),
            speaker: Arc::clone(&self.speaker),
            registry: Arc::clone(&self.registry),
            notices: Arc::clone(&self.notices),
            cancel: self.session_cancel.clone(),
        };
        self.receive_task = Some(tokio::spawn(receive_loop(events, ctx)));
        self.session = Some(handle);
        Ok(())
    }

    /// Barge-in: stop playback, cancel the in-flight response, and tell
    /// the server how much audio was actually heard.
    fn handle_barge_in(
        &self,
        commands: &SessionCommands,
    ) -> Result<(), AssistantError> {
        let item_id = {
            let mut sync = self.sync.lock().unwrap();
            if sync.barge_in_triggered || !sync.model_is_speaking {
                // Already handled, or the response finished first.
                sync.model_is_speaking = false;
                return Ok(());
            }
            sync.barge_in_triggered = true;
            sync.model_is_speaking = false;
            sync.current_item_id.clone()
        };

        let played_ms = {
            let speaker = self.speaker.lock().unwrap();
            speaker
                .as_ref()
                .map(|s| {
                    let ms = s.estimated_played_ms();
                    s.clear();
                    ms
                })
                .unwrap_or(0)
        };

        info!(played_ms, "barge-in");
        commands.cancel_response()?;
        if let Some(item_id) = item_id {
            commands.truncate_item(&item_id, 0, played_ms)?;
        }
        Ok(())
    }

    /// Run one conversation. Returns when cancelled (hangup/shutdown) or
    /// after the inactivity timeout; the session survives either way.
    ///
    /// Microphone, speaker, and VAD are scoped to this call and released
    /// on every exit path.
    pub async fn run(
        &mut self,
        on_state: impl Fn(AgentStateUpdate),
        on_meter: impl Fn(u8) + Send + Sync + 'static,
        cancel: &CancellationToken,
    ) -> Result<RunResult, AssistantError> {
        self.ensure_session().await?;
        let commands = self
            .session
            .as_ref()
            .expect("ensure_session just created a session")
            .commands();

        let mut mic = Microphone::open(None)?;
        let native_rate = mic.native_sample_rate();

        let mut vad = VadDetector::new(VAD_SAMPLE_RATE)?;
        vad.load(&get_model_dir());
        let vad_window = vad.frame_len();

        let mut speaker = Speaker::new(REMOTE_SAMPLE_RATE)?;
        speaker.set_meter_callback(on_meter);
        speaker.start();
        *self.speaker.lock().unwrap() = Some(speaker);

        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        *self.notices.lock().unwrap() = Some(notice_tx);

        on_state(AgentStateUpdate::Ready);
        info!(agent = %self.agent.name, "conversation started");

        let inactivity_timeout =
            Duration::from_secs(self.app.conversation_inactivity_timeout_seconds);
        let mut capture = CaptureState::new(Instant::now());
        let mut vad_feed: Vec<f32> = Vec::new();
        let mut last_prob = 0.0f32;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(RunResult::Cancelled);
            }

            while let Ok(update) = notice_rx.try_recv() {
                on_state(update);
            }

            let mut command_error = None;
            while let Some(frame) = mic.read_frame() {
                let frame16 = resample_nearest(&frame, native_rate, VAD_SAMPLE_RATE);
                vad_feed.extend(pcm16_to_f32(&frame16));
                while vad_feed.len() >= vad_window {
                    let window: Vec<f32> = vad_feed.drain(..vad_window).collect();
                    last_prob = vad.predict(&window);
                }
                let is_speech = last_prob >= SPEECH_PROBABILITY_THRESHOLD;

                let model_is_speaking = self.sync.lock().unwrap().model_is_speaking;
                let frame24 = resample_nearest(&frame, native_rate, REMOTE_SAMPLE_RATE);
                let frame_ms = 1000.0 * frame.len() as f64 / native_rate as f64;

                let outcome = capture.step(
                    &frame24,
                    is_speech,
                    model_is_speaking,
                    frame_ms,
                    Instant::now(),
                );
                let step_result = match outcome {
                    TurnEvent::None => Ok(()),
                    TurnEvent::UtteranceStarted => {
                        debug!("utterance started");
                        Ok(())
                    }
                    TurnEvent::BargeIn => {
                        let result = self.handle_barge_in(&commands);
                        on_state(AgentStateUpdate::SpeakingStopped);
                        vad.reset();
                        vad_feed.clear();
                        last_prob = 0.0;
                        result
                    }
                    TurnEvent::UtteranceFinished(samples) => {
                        debug!(samples = samples.len(), "utterance finished");
                        let result = commands
                            .send_input_audio(pcm16_to_bytes(&samples))
                            .and_then(|_| commands.commit_pending_audio())
                            .and_then(|_| commands.start_response());
                        if result.is_ok() {
                            let mut sync = self.sync.lock().unwrap();
                            sync.waiting_for_response = true;
                            sync.response_requested_at = Instant::now();
                        }
                        vad.reset();
                        vad_feed.clear();
                        last_prob = 0.0;
                        result
                    }
                };
                if let Err(e) = step_result {
                    command_error = Some(e);
                    break;
                }
            }
            if let Some(e) = command_error {
                break Err(e);
            }

            // Response-wait watchdog: give up on a response that never
            // started, so inactivity tracking can end the conversation.
            {
                let mut sync = self.sync.lock().unwrap();
                if sync.waiting_for_response
                    && sync.response_requested_at.elapsed() > RESPONSE_WAIT_TIMEOUT
                {
                    sync.waiting_for_response = false;
                    warn!("response wait timed out");
                }
            }

            {
                let sync = self.sync.lock().unwrap();
                if !capture.is_recording()
                    && !sync.model_is_speaking
                    && !sync.waiting_for_response
                    && capture.idle_duration(Instant::now()) >= inactivity_timeout
                {
                    break Ok(RunResult::InactivityTimeout);
                }
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        };

        // Release run-scoped resources on every exit path.
        *self.notices.lock().unwrap() = None;
        if let Some(mut speaker) = self.speaker.lock().unwrap().take() {
            speaker.stop();
        }
        drop(mic);

        match &result {
            Ok(outcome) => info!(?outcome, "conversation ended"),
            Err(e) => warn!("conversation failed: {e}"),
        }
        result
    }

    /// Close the remote session and stop the receive loop.
    pub async fn dispose(&mut self) {
        self.session_cancel.cancel();
        if let Some(task) = self.receive_task.take() {
            let _ = task.await;
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        *self.sync.lock().unwrap() = PlaybackSync::default();
        info!(agent = %self.agent.name, "agent disposed");
    }
}
