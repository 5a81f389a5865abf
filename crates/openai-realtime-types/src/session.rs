use crate::audio::{AudioFormat, InputAudioTranscription, TranscriptionModel, TurnDetection, Voice};
use crate::tools::{Tool, ToolChoice};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Session {
    /// The set of modalities the model can respond with. To disable audio, set this to ["text"].
    modalities: Vec<String>,

    /// The default system instructions prepended to model calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,

    /// The voice the model uses to respond. ex: "alloy"
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<Voice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_format: Option<AudioFormat>,

    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_format: Option<AudioFormat>,

    /// Configuration for input audio transcription.
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<InputAudioTranscription>,

    /// Configuration for turn detection. Always serialized: `null` turns server VAD off.
    turn_detection: Option<TurnDetection>,

    /// Tools (functions) available to the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,

    /// Sampling temperature for the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,

    /// "inf" or number
    #[serde(skip_serializing_if = "Option::is_none")]
    max_response_output_tokens: Option<MaxOutputTokens>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum MaxOutputTokens {
    Number(i32),
    Infinity(String),
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn modalities(&self) -> &[String] {
        &self.modalities
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn voice(&self) -> Option<&Voice> {
        self.voice.as_ref()
    }

    pub fn turn_detection(&self) -> Option<&TurnDetection> {
        self.turn_detection.as_ref()
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }
}

pub struct SessionBuilder {
    session: Session,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            session: Session {
                modalities: vec!["text".to_string(), "audio".to_string()],
                instructions: None,
                voice: None,
                input_audio_format: None,
                output_audio_format: None,
                input_audio_transcription: None,
                turn_detection: None,
                tools: vec![],
                tool_choice: None,
                temperature: None,
                max_response_output_tokens: None,
            },
        }
    }

    pub fn with_modalities_disable_audio(mut self) -> Self {
        self.session.modalities = vec!["text".to_string()];
        self
    }

    pub fn with_modalities_enable_audio(mut self) -> Self {
        self.session.modalities = vec!["text".to_string(), "audio".to_string()];
        self
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.session.instructions = Some(instructions.to_string());
        self
    }

    pub fn with_voice(mut self, voice: Voice) -> Self {
        self.session.voice = Some(voice);
        self
    }

    pub fn with_input_audio_format(mut self, format: AudioFormat) -> Self {
        self.session.input_audio_format = Some(format);
        self
    }

    pub fn with_output_audio_format(mut self, format: AudioFormat) -> Self {
        self.session.output_audio_format = Some(format);
        self
    }

    pub fn with_input_audio_transcription_enable(mut self, model: TranscriptionModel) -> Self {
        self.session.input_audio_transcription =
            Some(InputAudioTranscription::new().with_model(model));
        self
    }

    pub fn with_turn_detection_enable(mut self, turn_detection: TurnDetection) -> Self {
        self.session.turn_detection = Some(turn_detection);
        self
    }

    pub fn with_turn_detection_disable(mut self) -> Self {
        self.session.turn_detection = None;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.session.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.session.tool_choice = Some(tool_choice);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.session.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: MaxOutputTokens) -> Self {
        self.session.max_response_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn build(self) -> Session {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FunctionTool;

    #[test]
    fn test_push_to_talk_session_disables_vad_explicitly() {
        let session = Session::builder()
            .with_voice(Voice::Alloy)
            .with_input_audio_format(AudioFormat::Pcm16)
            .with_turn_detection_disable()
            .with_tools(vec![Tool::Function(FunctionTool::new(
                "get_weather",
                "Get the weather",
                serde_json::json!({"type": "object", "properties": {}}),
            ))])
            .with_tool_choice(ToolChoice::Auto)
            .with_temperature(0.8)
            .build();

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["turn_detection"], serde_json::Value::Null);
        assert_eq!(json["voice"], "alloy");
        assert_eq!(json["input_audio_format"], "pcm16");
        assert_eq!(json["tool_choice"], "auto");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["name"], "get_weather");
        assert!(json.get("instructions").is_none());
    }
}
