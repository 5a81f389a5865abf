mod error;
mod resources;

pub use error::ErrorDetails;
pub use resources::*;

/// `error` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    event_id: String,

    /// Details about the error
    error: ErrorDetails,
}

impl ErrorEvent {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn error(&self) -> &ErrorDetails {
        &self.error
    }
}

/// `session.created` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionCreatedEvent {
    #[serde(default)]
    event_id: String,
    session: SessionResource,
}

impl SessionCreatedEvent {
    pub fn session(&self) -> &SessionResource {
        &self.session
    }
}

/// `session.updated` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionUpdatedEvent {
    #[serde(default)]
    event_id: String,
    session: SessionResource,
}

impl SessionUpdatedEvent {
    pub fn session(&self) -> &SessionResource {
        &self.session
    }
}

/// `input_audio_buffer.committed` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InputAudioBufferCommittedEvent {
    #[serde(default)]
    event_id: String,

    /// The ID of the user message item that will be created
    item_id: String,
}

impl InputAudioBufferCommittedEvent {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}

/// `input_audio_buffer.speech_started` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InputAudioBufferSpeechStartedEvent {
    #[serde(default)]
    event_id: String,

    /// Milliseconds since the session started when speech was detected
    #[serde(default)]
    audio_start_ms: i32,
    item_id: String,
}

impl InputAudioBufferSpeechStartedEvent {
    pub fn audio_start_ms(&self) -> i32 {
        self.audio_start_ms
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}

/// `input_audio_buffer.speech_stopped` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InputAudioBufferSpeechStoppedEvent {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    audio_end_ms: i32,
    item_id: String,
}

impl InputAudioBufferSpeechStoppedEvent {
    pub fn audio_end_ms(&self) -> i32 {
        self.audio_end_ms
    }
}

/// `conversation.item.input_audio_transcription.delta` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationItemInputAudioTranscriptionDeltaEvent {
    #[serde(default)]
    event_id: String,
    item_id: String,
    #[serde(default)]
    content_index: i32,
    delta: String,
}

impl ConversationItemInputAudioTranscriptionDeltaEvent {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn delta(&self) -> &str {
        &self.delta
    }
}

/// `conversation.item.input_audio_transcription.completed` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationItemInputAudioTranscriptionCompletedEvent {
    #[serde(default)]
    event_id: String,

    /// The ID of the user message item
    item_id: String,

    #[serde(default)]
    content_index: i32,

    /// The transcribed text
    transcript: String,
}

impl ConversationItemInputAudioTranscriptionCompletedEvent {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }
}

/// `conversation.item.input_audio_transcription.failed` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationItemInputAudioTranscriptionFailedEvent {
    #[serde(default)]
    event_id: String,
    item_id: String,
    #[serde(default)]
    content_index: i32,

    /// Details of the transcription error
    error: ErrorDetails,
}

impl ConversationItemInputAudioTranscriptionFailedEvent {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn error(&self) -> &ErrorDetails {
        &self.error
    }
}

/// `response.created` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseCreatedEvent {
    #[serde(default)]
    event_id: String,
    response: ResponseResource,
}

impl ResponseCreatedEvent {
    pub fn response(&self) -> &ResponseResource {
        &self.response
    }
}

/// `response.done` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseDoneEvent {
    #[serde(default)]
    event_id: String,
    response: ResponseResource,
}

impl ResponseDoneEvent {
    pub fn response(&self) -> &ResponseResource {
        &self.response
    }
}

/// `response.output_item.done` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseOutputItemDoneEvent {
    #[serde(default)]
    event_id: String,

    /// The ID of the response to which the item belongs
    response_id: String,
    #[serde(default)]
    output_index: i32,

    /// The completed item
    item: ItemResource,
}

impl ResponseOutputItemDoneEvent {
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn item(&self) -> &ItemResource {
        &self.item
    }
}

/// `response.text.delta` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseTextDeltaEvent {
    #[serde(default)]
    event_id: String,
    response_id: String,
    item_id: String,
    delta: String,
}

impl ResponseTextDeltaEvent {
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn delta(&self) -> &str {
        &self.delta
    }
}

/// `response.audio_transcript.delta` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseAudioTranscriptDeltaEvent {
    #[serde(default)]
    event_id: String,
    response_id: String,
    item_id: String,
    delta: String,
}

impl ResponseAudioTranscriptDeltaEvent {
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn delta(&self) -> &str {
        &self.delta
    }
}

/// `response.audio_transcript.done` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseAudioTranscriptDoneEvent {
    #[serde(default)]
    event_id: String,
    response_id: String,
    item_id: String,

    /// The final transcript of the audio
    transcript: String,
}

impl ResponseAudioTranscriptDoneEvent {
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }
}

/// `response.audio.delta` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseAudioDeltaEvent {
    #[serde(default)]
    event_id: String,
    response_id: String,
    item_id: String,

    /// Base64-encoded audio data delta
    delta: String,
}

impl ResponseAudioDeltaEvent {
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn delta(&self) -> &str {
        &self.delta
    }
}

/// `response.audio.done` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseAudioDoneEvent {
    #[serde(default)]
    event_id: String,
    response_id: String,
    item_id: String,
}

impl ResponseAudioDoneEvent {
    pub fn response_id(&self) -> &str {
        &self.response_id
    }
}
