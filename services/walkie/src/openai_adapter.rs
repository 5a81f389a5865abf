use anyhow::{Context, Result};
use async_trait::async_trait;
use openai_realtime::OAIClient;
use openai_realtime::types::audio::{AudioFormat as WireFormat, TranscriptionModel, Voice};
use openai_realtime::types::events::ServerEvent;
use openai_realtime::types::events::server::{ItemResource, ResponseStatus};
use openai_realtime::types::tools::{FunctionTool, Tool as WireTool, ToolChoice};
use openai_realtime::types::{FunctionCallOutputItem, Item, MessageItem, MessageRole, Session};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use walkie_core::ToolCallRequest;
use walkie_core::audio::{AudioFormat, AudioFrame};
use walkie_core::error::{ProtocolError, TransportError};
use walkie_core::tools::ToolDefinition;
use walkie_core::transport::{Transport, TransportEvent};
use walkie_native_utils::audio;

/// The realtime API speaks mono PCM16 at 24 kHz in both directions.
pub const WIRE_AUDIO_FORMAT: AudioFormat =
    AudioFormat::pcm16_mono(audio::REALTIME_API_PCM16_SAMPLE_RATE as u32);

/// Largest slice of PCM16 sent in one `input_audio_buffer.append`.
const APPEND_CHUNK_BYTES: usize = 32 * 1024;

const SESSION_READY_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 256;

/// Builds the `session.update` payload for push-to-talk: no server turn detection, PCM16
/// both ways, whisper transcription of the user, and the registry's tools.
pub fn build_session(instructions: &str, voice: Voice, tools: &[ToolDefinition]) -> Session {
    let tools = tools
        .iter()
        .map(|t| WireTool::Function(FunctionTool::new(&t.name, &t.description, t.parameters.clone())))
        .collect();
    Session::builder()
        .with_modalities_enable_audio()
        .with_instructions(instructions)
        .with_voice(voice)
        .with_input_audio_format(WireFormat::Pcm16)
        .with_output_audio_format(WireFormat::Pcm16)
        .with_input_audio_transcription_enable(TranscriptionModel::Whisper)
        .with_turn_detection_disable()
        .with_tools(tools)
        .with_tool_choice(ToolChoice::Auto)
        .with_temperature(0.8)
        .build()
}

/// Tracks the response in flight. The API accepts one response at a time, so
/// `response.create` calls made meanwhile are queued and released one per `response.done`.
#[derive(Debug, Default)]
struct ResponseGate {
    in_flight: bool,
    active: Option<String>,
    deferred: u32,
    cancel_next: bool,
    cancelled: HashSet<String>,
}

impl ResponseGate {
    /// Whether a `response.create` may go out now.
    fn request(&mut self) -> bool {
        if self.in_flight {
            self.deferred += 1;
            return false;
        }
        self.in_flight = true;
        true
    }

    fn created(&mut self, id: &str) {
        self.in_flight = true;
        self.active = Some(id.to_string());
        if self.cancel_next {
            self.cancel_next = false;
            self.cancelled.insert(id.to_string());
        }
    }

    /// Whether a `response.cancel` should be sent.
    fn cancel(&mut self) -> bool {
        self.deferred = 0;
        if !self.in_flight {
            return false;
        }
        match &self.active {
            Some(id) => {
                self.cancelled.insert(id.clone());
            }
            None => self.cancel_next = true,
        }
        true
    }

    fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.contains(id)
    }

    /// Returns whether the completion should be forwarded and whether a queued
    /// `response.create` should go out now.
    fn done(&mut self, id: &str) -> (bool, bool) {
        self.active = None;
        let forward = !self.cancelled.remove(id);
        if self.deferred > 0 {
            self.deferred -= 1;
            self.in_flight = true;
            (forward, true)
        } else {
            self.in_flight = false;
            (forward, false)
        }
    }
}

fn lock(gate: &Mutex<ResponseGate>) -> MutexGuard<'_, ResponseGate> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_error(e: anyhow::Error) -> TransportError {
    TransportError::Send(format!("{:#}", e))
}

fn connect_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Connect(e.to_string())
}

pub fn parse_arguments(call_id: &str, raw: &str) -> Result<Map<String, Value>, ProtocolError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|source| ProtocolError::MalformedArguments {
            call_id: call_id.to_string(),
            source,
        })?;
    match value {
        Value::Object(arguments) => Ok(arguments),
        _ => Err(ProtocolError::ArgumentsNotObject {
            call_id: call_id.to_string(),
        }),
    }
}

/// Maps server events onto session events.
struct Translator<C: OAIClient> {
    client: Arc<C>,
    gate: Arc<Mutex<ResponseGate>>,
}

impl<C: OAIClient> Translator<C> {
    fn live(&self, response_id: &str) -> bool {
        !lock(&self.gate).is_cancelled(response_id)
    }

    async fn translate(&self, event: ServerEvent) -> Option<TransportEvent> {
        match event {
            ServerEvent::Error(e) => Some(TransportEvent::Error(e.error().message().to_string())),
            ServerEvent::SessionCreated(data) => {
                tracing::debug!("session created: {}", data.session().id());
                None
            }
            ServerEvent::SessionUpdated(_) => None,
            ServerEvent::InputAudioBufferCommitted(data) => {
                tracing::debug!("input audio committed as item {}", data.item_id());
                None
            }
            ServerEvent::InputAudioBufferSpeechStarted(_) => Some(TransportEvent::Interrupt),
            ServerEvent::InputAudioBufferSpeechStopped(_) => None,
            ServerEvent::ConversationItemInputAudioTranscriptionDelta(data) => {
                Some(TransportEvent::InputTranscript {
                    text: data.delta().to_string(),
                    is_final: false,
                })
            }
            ServerEvent::ConversationItemInputAudioTranscriptionCompleted(data) => {
                let text = data.transcript().trim().to_string();
                tracing::info!("user said: {:?}", text);
                Some(TransportEvent::InputTranscript {
                    text,
                    is_final: true,
                })
            }
            ServerEvent::ConversationItemInputAudioTranscriptionFailed(data) => {
                tracing::warn!("transcription failed: {}", data.error().message());
                None
            }
            ServerEvent::ResponseCreated(data) => {
                lock(&self.gate).created(data.response().id());
                None
            }
            ServerEvent::ResponseTextDelta(data) => self
                .live(data.response_id())
                .then(|| TransportEvent::TextDelta(data.delta().to_string())),
            ServerEvent::ResponseAudioTranscriptDelta(data) => {
                self.live(data.response_id())
                    .then(|| TransportEvent::OutputTranscript {
                        text: data.delta().to_string(),
                        is_final: false,
                    })
            }
            ServerEvent::ResponseAudioTranscriptDone(data) => {
                tracing::info!("assistant said: {:?}", data.transcript());
                self.live(data.response_id())
                    .then(|| TransportEvent::OutputTranscript {
                        text: data.transcript().to_string(),
                        is_final: true,
                    })
            }
            ServerEvent::ResponseAudioDelta(data) => {
                if !self.live(data.response_id()) {
                    return None;
                }
                match audio::decode_bytes(data.delta()) {
                    Ok(bytes) => Some(TransportEvent::AudioDelta(AudioFrame::new(
                        bytes,
                        WIRE_AUDIO_FORMAT,
                    ))),
                    Err(e) => {
                        tracing::warn!("{}", ProtocolError::MalformedAudio(e.to_string()));
                        None
                    }
                }
            }
            ServerEvent::ResponseAudioDone(_) => None,
            ServerEvent::ResponseOutputItemDone(data) => {
                let ItemResource::FunctionCall(call) = data.item() else {
                    return None;
                };
                if !self.live(data.response_id()) {
                    tracing::debug!("dropping call {} from a cancelled response", call.call_id());
                    return None;
                }
                match parse_arguments(call.call_id(), call.arguments()) {
                    Ok(arguments) => Some(TransportEvent::ToolCallRequest(ToolCallRequest {
                        id: call.call_id().to_string(),
                        name: call.name().to_string(),
                        arguments,
                    })),
                    Err(e) => {
                        tracing::warn!("ignoring call to {}: {}", call.name(), e);
                        None
                    }
                }
            }
            ServerEvent::ResponseDone(data) => {
                let response = data.response();
                tracing::debug!("response {} done: {:?}", response.id(), response.status());
                let (forward, create_next) = lock(&self.gate).done(response.id());
                if create_next {
                    tracing::debug!("sending deferred response.create");
                    if let Err(e) = self.client.create_response().await {
                        tracing::error!("failed to request deferred response: {:#}", e);
                    }
                }
                if !forward {
                    return None;
                }
                // Server VAD is off, so a cancellation we did not ask for is the
                // backend cutting the assistant off.
                if response.status() == ResponseStatus::Cancelled {
                    tracing::info!("response {} cancelled by the backend", response.id());
                    return Some(TransportEvent::Interrupt);
                }
                Some(TransportEvent::ResponseDone)
            }
            ServerEvent::Close { .. } => None,
            ServerEvent::Unknown => {
                tracing::trace!("ignoring unmodelled server event");
                None
            }
        }
    }
}

/// [`Transport`] over the OpenAI realtime API.
///
/// Generic over [`OAIClient`] so the wire client can be mocked in tests.
pub struct OpenAiTransport<C: OAIClient> {
    client: Arc<C>,
    session: Session,
    gate: Arc<Mutex<ResponseGate>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl OpenAiTransport<openai_realtime::Client> {
    pub async fn open(config: openai_realtime::Config, session: Session) -> Result<Self> {
        let client = openai_realtime::connect_with_config(EVENT_CAPACITY * 4, config)
            .await
            .context("Failed to connect to OpenAI Realtime API")?;
        Ok(Self::new(client, session))
    }
}

impl<C: OAIClient + 'static> OpenAiTransport<C> {
    pub fn new(client: C, session: Session) -> Self {
        Self {
            client: Arc::new(client),
            session,
            gate: Arc::new(Mutex::new(ResponseGate::default())),
            forwarder: Mutex::new(None),
        }
    }

    async fn request_response(&self) -> Result<(), TransportError> {
        if !lock(&self.gate).request() {
            tracing::debug!("response in flight, deferring response.create");
            return Ok(());
        }
        self.client.create_response().await.map_err(send_error)
    }
}

async fn wait_until_configured(
    server_rx: &mut broadcast::Receiver<ServerEvent>,
) -> Result<(), TransportError> {
    loop {
        match server_rx.recv().await {
            Ok(ServerEvent::SessionUpdated(data)) => {
                tracing::info!(
                    "session configured: model {}, {} tools",
                    data.session().model(),
                    data.session().tools().len()
                );
                return Ok(());
            }
            Ok(ServerEvent::Error(e)) => return Err(connect_error(e.error().message())),
            Ok(ServerEvent::Close { reason }) => {
                return Err(connect_error(format!("connection closed: {:?}", reason)));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("skipped {} server events while configuring", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(connect_error("connection closed"));
            }
        }
    }
}

#[async_trait]
impl<C: OAIClient + 'static> Transport for OpenAiTransport<C> {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut server_rx = self
            .client
            .server_events()
            .await
            .map_err(|e| connect_error(format!("{:#}", e)))?;
        self.client
            .update_session(self.session.clone())
            .await
            .map_err(|e| connect_error(format!("{:#}", e)))?;
        tokio::time::timeout(SESSION_READY_TIMEOUT, wait_until_configured(&mut server_rx))
            .await
            .map_err(|_| connect_error("timed out waiting for session.updated"))??;

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let translator = Translator {
            client: self.client.clone(),
            gate: self.gate.clone(),
        };
        let forwarder = tokio::spawn(async move {
            loop {
                let event = match server_rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("dropped {} server events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let ServerEvent::Close { reason } = &event {
                    tracing::info!("realtime connection closed: {:?}", reason);
                    break;
                }
                if let Some(event) = translator.translate(event).await {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("session stopped listening");
                        break;
                    }
                }
            }
        });
        *self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(forwarder);
        Ok(rx)
    }

    async fn send_audio(&self, frame: AudioFrame) -> Result<(), TransportError> {
        if frame.format != WIRE_AUDIO_FORMAT {
            tracing::warn!(
                "sending {:?} audio, the session expects {:?}",
                frame.format,
                WIRE_AUDIO_FORMAT
            );
        }
        self.client
            .clear_input_audio_buffer()
            .await
            .map_err(send_error)?;
        for chunk in frame.data.chunks(APPEND_CHUNK_BYTES) {
            self.client
                .append_input_audio_buffer(audio::encode_bytes(chunk))
                .await
                .map_err(send_error)?;
        }
        self.client
            .commit_input_audio_buffer()
            .await
            .map_err(send_error)?;
        self.request_response().await
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let item = MessageItem::builder()
            .with_role(MessageRole::User)
            .with_input_text(text)
            .build();
        self.client
            .create_conversation_item(Item::Message(item))
            .await
            .map_err(send_error)?;
        self.request_response().await
    }

    async fn send_tool_result(
        &self,
        id: &str,
        payload: Value,
        respond: bool,
    ) -> Result<(), TransportError> {
        let output = serde_json::to_string(&payload)
            .map_err(|e| TransportError::Send(format!("failed to encode result: {}", e)))?;
        self.client
            .create_conversation_item(Item::FunctionCallOutput(FunctionCallOutputItem::new(
                id, &output,
            )))
            .await
            .map_err(send_error)?;
        if !respond {
            tracing::debug!("result of call {} sent without asking for a response", id);
            return Ok(());
        }
        self.request_response().await
    }

    async fn cancel_response(&self) -> Result<(), TransportError> {
        if !lock(&self.gate).cancel() {
            return Ok(());
        }
        self.client.cancel_response().await.map_err(send_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        self.client.close().await.map_err(send_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::{Sequence, mock};
    use serde_json::json;

    mock! {
        pub OAIClient {}
        #[async_trait]
        impl OAIClient for OAIClient {
            async fn update_session(&self, config: Session) -> Result<()>;
            async fn append_input_audio_buffer(&self, audio: String) -> Result<()>;
            async fn commit_input_audio_buffer(&self) -> Result<()>;
            async fn clear_input_audio_buffer(&self) -> Result<()>;
            async fn create_conversation_item(&self, item: Item) -> Result<()>;
            async fn create_response(&self) -> Result<()>;
            async fn cancel_response(&self) -> Result<()>;
            async fn server_events(&self) -> Result<openai_realtime::ServerRx>;
            async fn close(&self) -> Result<()>;
        }
    }

    fn server_event(value: Value) -> ServerEvent {
        serde_json::from_value(value).unwrap()
    }

    fn response_created(id: &str) -> ServerEvent {
        server_event(json!({
            "type": "response.created",
            "event_id": "e_created",
            "response": {"id": id, "status": "in_progress"}
        }))
    }

    fn response_done(id: &str) -> ServerEvent {
        server_event(json!({
            "type": "response.done",
            "event_id": "e_done",
            "response": {"id": id, "status": "completed", "output": []}
        }))
    }

    fn audio_delta(response_id: &str, delta: &str) -> ServerEvent {
        server_event(json!({
            "type": "response.audio.delta",
            "event_id": "e_audio",
            "response_id": response_id,
            "item_id": "item_1",
            "output_index": 0,
            "content_index": 0,
            "delta": delta
        }))
    }

    fn translator(client: MockOAIClient) -> Translator<MockOAIClient> {
        Translator {
            client: Arc::new(client),
            gate: Arc::new(Mutex::new(ResponseGate::default())),
        }
    }

    #[test]
    fn test_parse_arguments() {
        let arguments = parse_arguments("call_1", r#"{"forecast_type":"current"}"#).unwrap();
        assert_eq!(arguments.get("forecast_type"), Some(&json!("current")));
        assert!(parse_arguments("call_1", "").unwrap().is_empty());
        assert!(matches!(
            parse_arguments("call_1", "{not json"),
            Err(ProtocolError::MalformedArguments { .. })
        ));
        assert!(matches!(
            parse_arguments("call_1", "[1, 2]"),
            Err(ProtocolError::ArgumentsNotObject { .. })
        ));
    }

    #[test]
    fn test_session_disables_turn_detection_and_lists_tools() {
        let tools = vec![ToolDefinition {
            name: "get_weather".to_string(),
            description: "weather".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let session = build_session("be brief", Voice::Alloy, &tools);
        let wire = serde_json::to_value(&session).unwrap();
        assert_eq!(wire["turn_detection"], Value::Null);
        assert_eq!(wire["modalities"], json!(["text", "audio"]));
        assert_eq!(wire["input_audio_format"], json!("pcm16"));
        assert_eq!(wire["tools"][0]["type"], json!("function"));
        assert_eq!(wire["tools"][0]["name"], json!("get_weather"));
    }

    #[test]
    fn test_gate_defers_and_releases_one_per_done() {
        let mut gate = ResponseGate::default();
        assert!(gate.request());
        gate.created("resp_1");
        assert!(!gate.request());
        assert!(!gate.request());
        assert_eq!(gate.done("resp_1"), (true, true));
        gate.created("resp_2");
        assert_eq!(gate.done("resp_2"), (true, true));
        assert_eq!(gate.done("resp_3"), (true, false));
        assert!(gate.request());
    }

    #[test]
    fn test_gate_cancel_before_created() {
        let mut gate = ResponseGate::default();
        assert!(!gate.cancel());
        assert!(gate.request());
        assert!(gate.cancel());
        gate.created("resp_1");
        assert!(gate.is_cancelled("resp_1"));
        assert_eq!(gate.done("resp_1"), (false, false));
        assert!(!gate.is_cancelled("resp_1"));
    }

    #[tokio::test]
    async fn test_audio_delta_is_decoded() {
        let translator = translator(MockOAIClient::new());
        let delta = audio::encode_bytes(&[1, 0, 2, 0]);
        let event = translator.translate(audio_delta("resp_1", &delta)).await;
        assert_eq!(
            event,
            Some(TransportEvent::AudioDelta(AudioFrame::new(
                vec![1, 0, 2, 0],
                WIRE_AUDIO_FORMAT
            )))
        );
    }

    #[tokio::test]
    async fn test_malformed_audio_is_ignored() {
        let translator = translator(MockOAIClient::new());
        let event = translator.translate(audio_delta("resp_1", "%%%not base64")).await;
        assert_eq!(event, None);
    }

    #[tokio::test]
    async fn test_function_call_becomes_tool_request() {
        let translator = translator(MockOAIClient::new());
        let event = server_event(json!({
            "type": "response.output_item.done",
            "event_id": "e_item",
            "response_id": "resp_1",
            "output_index": 0,
            "item": {
                "id": "item_9",
                "type": "function_call",
                "status": "completed",
                "call_id": "call_42",
                "name": "get_weather",
                "arguments": "{\"forecast_type\":\"hourly\",\"location\":\"Oslo\"}"
            }
        }));
        let Some(TransportEvent::ToolCallRequest(request)) = translator.translate(event).await
        else {
            panic!("expected a tool call");
        };
        assert_eq!(request.id, "call_42");
        assert_eq!(request.name, "get_weather");
        assert_eq!(request.arguments.get("location"), Some(&json!("Oslo")));
    }

    #[tokio::test]
    async fn test_speech_started_interrupts() {
        let translator = translator(MockOAIClient::new());
        let event = server_event(json!({
            "type": "input_audio_buffer.speech_started",
            "event_id": "e_vad",
            "audio_start_ms": 1000,
            "item_id": "item_1"
        }));
        assert_eq!(
            translator.translate(event).await,
            Some(TransportEvent::Interrupt)
        );
    }

    #[tokio::test]
    async fn test_cancelled_response_is_silenced() {
        let mut client = MockOAIClient::new();
        client.expect_create_response().times(1).returning(|| Ok(()));
        client.expect_cancel_response().times(1).returning(|| Ok(()));
        let transport = OpenAiTransport::new(client, Session::builder().build());
        let translator = Translator {
            client: transport.client.clone(),
            gate: transport.gate.clone(),
        };

        transport.request_response().await.unwrap();
        translator.translate(response_created("resp_1")).await;
        transport.cancel_response().await.unwrap();

        let delta = audio::encode_bytes(&[1, 0]);
        assert_eq!(translator.translate(audio_delta("resp_1", &delta)).await, None);
        assert_eq!(translator.translate(response_done("resp_1")).await, None);
    }

    #[tokio::test]
    async fn test_tool_result_waits_for_response_in_flight() {
        let mut seq = Sequence::new();
        let mut client = MockOAIClient::new();
        client
            .expect_create_response()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        client
            .expect_create_conversation_item()
            .withf(|item| {
                matches!(item, Item::FunctionCallOutput(output)
                    if output.call_id() == "call_1" && output.output() == r#"{"error":"tool not found"}"#)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        client
            .expect_create_response()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let transport = OpenAiTransport::new(client, Session::builder().build());
        let translator = Translator {
            client: transport.client.clone(),
            gate: transport.gate.clone(),
        };

        transport.request_response().await.unwrap();
        translator.translate(response_created("resp_1")).await;
        transport
            .send_tool_result("call_1", json!({"error": "tool not found"}), true)
            .await
            .unwrap();
        assert_eq!(
            translator.translate(response_done("resp_1")).await,
            Some(TransportEvent::ResponseDone)
        );
    }

    #[tokio::test]
    async fn test_stale_tool_result_does_not_request_response() {
        let mut seq = Sequence::new();
        let mut client = MockOAIClient::new();
        client
            .expect_create_conversation_item()
            .withf(|item| matches!(item, Item::FunctionCallOutput(output) if output.call_id() == "call_old"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        // Only the new turn asks for a response, and it goes out at once.
        client
            .expect_create_response()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let transport = OpenAiTransport::new(client, Session::builder().build());

        // Nothing is in flight when the abandoned turn is cancelled.
        transport.cancel_response().await.unwrap();
        transport
            .send_tool_result("call_old", json!({"temperature": 72}), false)
            .await
            .unwrap();
        transport.request_response().await.unwrap();
        assert!(lock(&transport.gate).in_flight);
        assert_eq!(lock(&transport.gate).deferred, 0);
    }

    #[tokio::test]
    async fn test_backend_cancellation_interrupts() {
        let mut client = MockOAIClient::new();
        client.expect_create_response().times(1).returning(|| Ok(()));
        let transport = OpenAiTransport::new(client, Session::builder().build());
        let translator = Translator {
            client: transport.client.clone(),
            gate: transport.gate.clone(),
        };

        transport.request_response().await.unwrap();
        translator.translate(response_created("resp_1")).await;
        let cancelled = server_event(json!({
            "type": "response.done",
            "event_id": "e_done",
            "response": {"id": "resp_1", "status": "cancelled", "output": []}
        }));
        assert_eq!(
            translator.translate(cancelled).await,
            Some(TransportEvent::Interrupt)
        );
        assert!(!lock(&transport.gate).in_flight);
    }

    #[tokio::test]
    async fn test_send_audio_appends_in_chunks() {
        let mut seq = Sequence::new();
        let mut client = MockOAIClient::new();
        client
            .expect_clear_input_audio_buffer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        client
            .expect_append_input_audio_buffer()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        client
            .expect_commit_input_audio_buffer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        client
            .expect_create_response()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let transport = OpenAiTransport::new(client, Session::builder().build());

        let frame = AudioFrame::new(vec![0; APPEND_CHUNK_BYTES + 2], WIRE_AUDIO_FORMAT);
        transport.send_audio(frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_maps_to_transport_error() {
        let mut client = MockOAIClient::new();
        client
            .expect_create_conversation_item()
            .returning(|_| Err(anyhow::anyhow!("connection closed")));
        let transport = OpenAiTransport::new(client, Session::builder().build());

        let err = transport.send_text("hello").await.unwrap_err();
        assert!(matches!(err, TransportError::Send(message) if message.contains("connection closed")));
    }

    #[tokio::test]
    async fn test_connect_waits_for_session_updated() {
        let (events_tx, _) = broadcast::channel(16);
        let subscribe_tx = events_tx.clone();
        let mut client = MockOAIClient::new();
        client
            .expect_server_events()
            .times(1)
            .returning(move || Ok(subscribe_tx.subscribe()));
        let updated_tx = events_tx.clone();
        client.expect_update_session().times(1).returning(move |_| {
            let _ = updated_tx.send(server_event(json!({
                "type": "session.updated",
                "event_id": "e_1",
                "session": {"id": "sess_1", "model": "gpt-4o-realtime-preview", "modalities": ["text", "audio"]}
            })));
            Ok(())
        });
        let transport = OpenAiTransport::new(client, Session::builder().build());

        let mut events = transport.connect().await.unwrap();
        events_tx
            .send(server_event(json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "event_id": "e_2",
                "item_id": "item_1",
                "content_index": 0,
                "transcript": " What's the weather? "
            })))
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::InputTranscript {
                text: "What's the weather?".to_string(),
                is_final: true
            })
        );

        events_tx
            .send(ServerEvent::Close { reason: None })
            .unwrap();
        assert_eq!(events.recv().await, None);
    }
}
