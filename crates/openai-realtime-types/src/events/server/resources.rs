use crate::audio::{TurnDetection, Voice};

/// The session as the server reports it in `session.created` / `session.updated`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionResource {
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    modalities: Vec<String>,
    voice: Option<Voice>,
    #[serde(default)]
    turn_detection: Option<TurnDetection>,
    #[serde(default)]
    tools: Vec<serde_json::Value>,
}

impl SessionResource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn modalities(&self) -> &[String] {
        &self.modalities
    }

    pub fn voice(&self) -> Option<&Voice> {
        self.voice.as_ref()
    }

    pub fn turn_detection(&self) -> Option<&TurnDetection> {
        self.turn_detection.as_ref()
    }

    pub fn tools(&self) -> &[serde_json::Value] {
        &self.tools
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    Cancelled,
    Failed,
    Incomplete,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseResource {
    id: String,
    status: ResponseStatus,
    #[serde(default)]
    status_details: Option<serde_json::Value>,
    #[serde(default)]
    output: Vec<ItemResource>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl ResponseResource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn status_details(&self) -> Option<&serde_json::Value> {
        self.status_details.as_ref()
    }

    pub fn output(&self) -> &[ItemResource] {
        &self.output
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    total_tokens: i32,
    input_tokens: i32,
    output_tokens: i32,
}

impl Usage {
    pub fn total_tokens(&self) -> i32 {
        self.total_tokens
    }

    pub fn input_tokens(&self) -> i32 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> i32 {
        self.output_tokens
    }
}

/// A conversation item emitted by the server. Only function calls are modelled.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ItemResource {
    #[serde(rename = "function_call")]
    FunctionCall(FunctionCallResource),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionCallResource {
    #[serde(default)]
    id: String,
    call_id: String,
    name: String,

    /// JSON-encoded arguments, as produced by the model
    #[serde(default)]
    arguments: String,
}

impl FunctionCallResource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }
}
