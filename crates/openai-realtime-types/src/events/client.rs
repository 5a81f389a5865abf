use crate::Item;
use crate::audio::Base64EncodedAudioBytes;
use crate::session::Session;

/// `session.update` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionUpdateEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,

    /// The session configuration to update
    session: Session,
}

impl SessionUpdateEvent {
    pub fn new(session: Session) -> Self {
        Self {
            event_id: None,
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

/// `input_audio_buffer.append` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InputAudioBufferAppendEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,

    /// The audio data to append to the buffer
    audio: Base64EncodedAudioBytes,
}

impl InputAudioBufferAppendEvent {
    pub fn new(audio: Base64EncodedAudioBytes) -> Self {
        Self {
            event_id: None,
            audio,
        }
    }

    pub fn audio(&self) -> &Base64EncodedAudioBytes {
        &self.audio
    }
}

/// `input_audio_buffer.commit` event, closes the user turn
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InputAudioBufferCommitEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
}

impl InputAudioBufferCommitEvent {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `input_audio_buffer.clear` event
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InputAudioBufferClearEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
}

impl InputAudioBufferClearEvent {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `conversation.item.create` event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationItemCreateEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,

    /// The ID of the preceding item after which the new item will be inserted
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_item_id: Option<String>,

    /// The item to add to the conversation
    item: Item,
}

impl ConversationItemCreateEvent {
    pub fn new(item: Item) -> Self {
        Self {
            event_id: None,
            previous_item_id: None,
            item,
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }
}

/// `response.create` event
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResponseCreateEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,

    /// Per-response overrides of the session configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Session>,
}

impl ResponseCreateEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update_session(mut self, response: Session) -> Self {
        self.response = Some(response);
        self
    }
}

/// `response.cancel` event
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResponseCancelEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
}

impl ResponseCancelEvent {
    pub fn new() -> Self {
        Self::default()
    }
}
