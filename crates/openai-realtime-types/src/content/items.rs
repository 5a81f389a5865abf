use crate::content::message::MessageItem;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum Item {
    #[serde(rename = "message")]
    Message(MessageItem),
    #[serde(rename = "function_call_output")]
    FunctionCallOutput(FunctionCallOutputItem),
}

/// The result of a function call, sent back under the id the model issued.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionCallOutputItem {
    call_id: String,
    /// JSON-encoded output of the function call
    output: String,
}

impl FunctionCallOutputItem {
    pub fn new(call_id: &str, output: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            output: output.to_string(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}
