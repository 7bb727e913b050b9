//! Realtime session client.
//!
//! Thin wrapper around the bidirectional WebSocket. A writer task pumps
//! typed commands onto the socket; a reader task parses incoming frames
//! into the closed [`SessionEvent`] set. Both halves die together: when
//! the wire closes, the event channel ends and `is_alive()` turns false,
//! which is how the agent detects a session that needs reconnecting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, AppConfig};
use crate::error::AssistantError;
use crate::tools::FunctionCallOutput;

use super::events::{self, SessionEvent, SessionSetup};

/// Commands accepted by the socket writer.
#[derive(Debug)]
pub(crate) enum ClientCommand {
    SendInputAudio(Vec<u8>),
    CommitPendingAudio,
    StartResponse,
    CancelResponse,
    TruncateItem {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },
    AddItem(FunctionCallOutput),
    Close,
}

/// Cloneable command surface shared by the capture and receive loops.
#[derive(Clone)]
pub struct SessionCommands {
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl SessionCommands {
    fn send(&self, cmd: ClientCommand) -> Result<(), AssistantError> {
        self.tx
            .send(cmd)
            .map_err(|_| AssistantError::Session("session connection closed".to_string()))
    }

    pub fn send_input_audio(&self, audio: Vec<u8>) -> Result<(), AssistantError> {
        self.send(ClientCommand::SendInputAudio(audio))
    }

    pub fn commit_pending_audio(&self) -> Result<(), AssistantError> {
        self.send(ClientCommand::CommitPendingAudio)
    }

    pub fn start_response(&self) -> Result<(), AssistantError> {
        self.send(ClientCommand::StartResponse)
    }

    pub fn cancel_response(&self) -> Result<(), AssistantError> {
        self.send(ClientCommand::CancelResponse)
    }

    pub fn truncate_item(
        &self,
        item_id: &str,
        content_index: u32,
        audio_end_ms: u64,
    ) -> Result<(), AssistantError> {
        self.send(ClientCommand::TruncateItem {
            item_id: item_id.to_string(),
            content_index,
            audio_end_ms,
        })
    }

    pub fn add_item(&self, output: FunctionCallOutput) -> Result<(), AssistantError> {
        self.send(ClientCommand::AddItem(output))
    }

    pub fn close(&self) {
        let _ = self.tx.send(ClientCommand::Close);
    }
}

/// An open session: command surface plus the server-event stream.
pub struct SessionHandle {
    commands: SessionCommands,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    alive: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Wire a handle from raw channel halves. Used by `connect` and by
    /// tests that stand in for the remote service.
    pub(crate) fn from_parts(
        tx: mpsc::UnboundedSender<ClientCommand>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            commands: SessionCommands { tx },
            events: Some(events),
            alive,
        }
    }

    pub fn commands(&self) -> SessionCommands {
        self.commands.clone()
    }

    /// Take the server-event stream; the receive loop owns it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// False once the wire has closed (reader task exited).
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        self.commands.close();
    }
}

/// Resolve the WebSocket request. An API key alone goes straight to the
/// service; key plus endpoint uses the Azure-style path with an
/// `api-key` header.
fn build_request(
    config: &AppConfig,
) -> Result<http::Request<()>, AssistantError> {
    if config.api_key.is_empty() {
        return Err(AssistantError::Configuration(
            "remote API key is not configured".to_string(),
        ));
    }

    let mut request = match &config.endpoint {
        Some(endpoint) if !endpoint.is_empty() => {
            let base = endpoint.trim_end_matches('/').replacen("https://", "wss://", 1);
            let url = format!(
                "{base}/openai/realtime?api-version=2024-10-01-preview&deployment={}",
                config.model
            );
            let mut req = url.into_client_request().map_err(|e| {
                AssistantError::Configuration(format!("invalid endpoint: {e}"))
            })?;
            req.headers_mut().insert(
                "api-key",
                config.api_key.parse().map_err(|_| {
                    AssistantError::Configuration("API key is not header-safe".to_string())
                })?,
            );
            req
        }
        _ => {
            let url = format!("wss://api.openai.com/v1/realtime?model={}", config.model);
            let mut req = url.into_client_request().map_err(|e| {
                AssistantError::Configuration(format!("invalid realtime URL: {e}"))
            })?;
            req.headers_mut().insert(
                http::header::AUTHORIZATION,
                format!("Bearer {}", config.api_key).parse().map_err(|_| {
                    AssistantError::Configuration("API key is not header-safe".to_string())
                })?,
            );
            req
        }
    };

    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse().expect("static header"));
    Ok(request)
}

/// Session setup derived from the app and agent configuration: global
/// and agent instructions concatenated, the agent's voice and
/// temperature, and the tools enabled for this agent.
pub fn session_setup(
    app: &AppConfig,
    agent: &AgentConfig,
    tools: Vec<crate::tools::ToolDescriptor>,
) -> SessionSetup {
    let mut instructions = app.instructions.clone();
    if let Some(extra) = &agent.instructions {
        if !instructions.is_empty() {
            instructions.push_str("\n\n");
        }
        instructions.push_str(extra);
    }
    SessionSetup {
        voice: agent.voice.clone(),
        instructions,
        temperature: agent.temperature,
        tools,
    }
}

/// Connect to the remote realtime service and apply the session setup.
pub async fn connect(
    config: &AppConfig,
    setup: &SessionSetup,
) -> Result<SessionHandle, AssistantError> {
    let request = build_request(config)?;

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| AssistantError::Session(format!("realtime connect failed: {e}")))?;
    info!(model = %config.model, "realtime session connected");

    let (mut sink, mut stream) = ws.split();

    // Configure before anything else goes over the wire.
    sink.send(Message::Text(events::session_update(setup).into()))
        .await
        .map_err(|e| AssistantError::Session(format!("session configure failed: {e}")))?;

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let alive = Arc::new(AtomicBool::new(true));

    // Writer: typed commands -> wire frames.
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            let frame = match cmd {
                ClientCommand::SendInputAudio(audio) => events::input_audio_append(&audio),
                ClientCommand::CommitPendingAudio => events::input_audio_commit(),
                ClientCommand::StartResponse => events::response_create(),
                ClientCommand::CancelResponse => events::response_cancel(),
                ClientCommand::TruncateItem {
                    item_id,
                    content_index,
                    audio_end_ms,
                } => events::item_truncate(&item_id, content_index, audio_end_ms),
                ClientCommand::AddItem(output) => events::function_output_item(&output),
                ClientCommand::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                warn!("realtime send failed: {e}");
                break;
            }
        }
        debug!("realtime writer task ended");
    });

    // Reader: wire frames -> typed events.
    let reader_alive = Arc::clone(&alive);
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match events::parse_server_event(&text) {
                    Some(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    None => debug!("ignoring unhandled server event"),
                },
                Ok(Message::Close(_)) => {
                    info!("realtime session closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("realtime receive failed: {e}");
                    break;
                }
            }
        }
        reader_alive.store(false, Ordering::Release);
        debug!("realtime reader task ended");
    });

    Ok(SessionHandle::from_parts(cmd_tx, event_rx, alive))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stand-in for the remote service: a handle whose command stream
    //! is observable and whose event stream is scriptable.

    use super::*;

    /// What a test observed the client send.
    #[derive(Debug, Clone, PartialEq)]
    pub enum SentCommand {
        InputAudio(Vec<u8>),
        Commit,
        StartResponse,
        CancelResponse,
        Truncate {
            item_id: String,
            audio_end_ms: u64,
        },
        AddItem(FunctionCallOutput),
        Close,
    }

    pub struct FakeSession {
        pub handle: SessionHandle,
        pub events: mpsc::UnboundedSender<SessionEvent>,
        pub sent: std::sync::Arc<std::sync::Mutex<Vec<SentCommand>>>,
        pub alive: Arc<AtomicBool>,
    }

    /// Build a session handle backed by in-memory channels. A relay task
    /// records every command.
    pub fn fake_session() -> FakeSession {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let alive = Arc::new(AtomicBool::new(true));
        let sent = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let sent_clone = sent.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let observed = match cmd {
                    ClientCommand::SendInputAudio(audio) => SentCommand::InputAudio(audio),
                    ClientCommand::CommitPendingAudio => SentCommand::Commit,
                    ClientCommand::StartResponse => SentCommand::StartResponse,
                    ClientCommand::CancelResponse => SentCommand::CancelResponse,
                    ClientCommand::TruncateItem {
                        item_id,
                        audio_end_ms,
                        ..
                    } => SentCommand::Truncate {
                        item_id,
                        audio_end_ms,
                    },
                    ClientCommand::AddItem(output) => SentCommand::AddItem(output),
                    ClientCommand::Close => SentCommand::Close,
                };
                sent_clone.lock().unwrap().push(observed);
            }
        });

        FakeSession {
            handle: SessionHandle::from_parts(cmd_tx, event_rx, Arc::clone(&alive)),
            events: event_tx,
            sent,
            alive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(api_key: &str, endpoint: Option<&str>) -> AppConfig {
        AppConfig {
            api_key: api_key.to_string(),
            endpoint: endpoint.map(str::to_string),
            ..AppConfig::default()
        }
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let err = build_request(&config_with("", None)).unwrap_err();
        assert!(matches!(err, AssistantError::Configuration(_)));
    }

    #[test]
    fn direct_path_uses_bearer_auth() {
        let request = build_request(&config_with("sk-test", None)).unwrap();
        assert!(request.uri().to_string().starts_with("wss://api.openai.com/v1/realtime"));
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer sk-test"
        );
        assert_eq!(request.headers().get("OpenAI-Beta").unwrap(), "realtime=v1");
    }

    #[test]
    fn endpoint_switches_to_azure_path() {
        let request =
            build_request(&config_with("key", Some("https://unit.openai.azure.com"))).unwrap();
        let uri = request.uri().to_string();
        assert!(uri.starts_with("wss://unit.openai.azure.com/openai/realtime"));
        assert_eq!(request.headers().get("api-key").unwrap(), "key");
    }

    #[test]
    fn setup_concatenates_instructions() {
        let app = AppConfig {
            instructions: "global".to_string(),
            ..AppConfig::default()
        };
        let agent = AgentConfig {
            instructions: Some("agent".to_string()),
            voice: "ash".to_string(),
            temperature: Some(0.6),
            ..AgentConfig::default()
        };
        let setup = session_setup(&app, &agent, vec![]);
        assert_eq!(setup.instructions, "global\n\nagent");
        assert_eq!(setup.voice, "ash");
        assert_eq!(setup.temperature, Some(0.6));
    }
}
