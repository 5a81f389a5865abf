mod consts;
mod transcription;
mod turn_detection;

pub use consts::*;
pub use transcription::InputAudioTranscription;
pub use turn_detection::{ServerVadTurnDetection, TurnDetection};

/// Audio data encoded as base64
pub type Base64EncodedAudioBytes = String;
