use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

pub mod http;
pub mod loader;

pub const UNRECOGNIZED_RESPONSE: &str = "Unexpected response format";
pub const EMPTY_EXTRACTION_RESPONSE: &str = "Failed to get a response";

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("AI capability is not loaded")]
    Unavailable,
    #[error("request failed: {0}")]
    Request(String),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn base64_image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatPayload {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOptions {
    pub model: String,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechOptions {
    pub voice: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub content: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatResponse {
    Text(String),
    Message(ResponseMessage),
    Extraction(Option<String>),
    Unrecognized(Value),
}

impl ChatResponse {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Object(mut fields) if fields.contains_key("message") => {
                let content = match fields.remove("message") {
                    Some(Value::Object(mut message)) => message.remove("content"),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other),
                };
                Self::Message(ResponseMessage { content })
            }
            Value::Object(fields) if fields.contains_key("text") => {
                Self::Extraction(fields.get("text").and_then(Value::as_str).map(str::to_string))
            }
            other => Self::Unrecognized(other),
        }
    }

    pub fn into_display_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Message(message) => match message.content {
                Some(Value::Array(blocks)) => {
                    let first_text = blocks
                        .first()
                        .and_then(|block| block.get("text"))
                        .and_then(Value::as_str)
                        .filter(|text| !text.is_empty())
                        .map(str::to_string);
                    first_text.unwrap_or_else(|| Value::Array(blocks).to_string())
                }
                Some(Value::String(text)) => text,
                Some(Value::Null) | None => UNRECOGNIZED_RESPONSE.to_string(),
                Some(other) => other.to_string(),
            },
            Self::Extraction(Some(text)) if !text.is_empty() => text,
            Self::Extraction(_) => EMPTY_EXTRACTION_RESPONSE.to_string(),
            Self::Unrecognized(value @ Value::Object(_)) => value.to_string(),
            Self::Unrecognized(_) => UNRECOGNIZED_RESPONSE.to_string(),
        }
    }
}

#[async_trait]
pub trait AiCapability: Send + Sync {
    async fn chat(
        &self,
        payload: ChatPayload,
        options: &ChatOptions,
    ) -> Result<ChatResponse, CapabilityError>;

    /// `image` is a data URL. `None` means the service answered with
    /// something other than text.
    async fn image_to_text(
        &self,
        image: &str,
        test_mode: bool,
    ) -> Result<Option<String>, CapabilityError>;

    async fn text_to_speech(
        &self,
        text: &str,
        options: &SpeechOptions,
    ) -> Result<Vec<u8>, CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityStatus {
    Loading,
    Ready,
    Unavailable,
}

/// Write-once holder for the loaded capability. Settling with `None`
/// records a failed load; either way the slot never changes again.
#[derive(Clone, Default)]
pub struct CapabilitySlot {
    inner: Arc<OnceLock<Option<Arc<dyn AiCapability>>>>,
}

impl CapabilitySlot {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn ready(capability: Arc<dyn AiCapability>) -> Self {
        let slot = Self::new();
        slot.settle(Some(capability));
        slot
    }

    pub fn settle(&self, capability: Option<Arc<dyn AiCapability>>) -> bool {
        self.inner.set(capability).is_ok()
    }

    pub fn get(&self) -> Option<Arc<dyn AiCapability>> {
        self.inner.get().and_then(Clone::clone)
    }

    pub fn status(&self) -> CapabilityStatus {
        match self.inner.get() {
            None => CapabilityStatus::Loading,
            Some(Some(_)) => CapabilityStatus::Ready,
            Some(None) => CapabilityStatus::Unavailable,
        }
    }
}
