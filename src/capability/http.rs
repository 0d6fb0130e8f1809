use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use super::{
    AiCapability, CapabilityError, ChatOptions, ChatPayload, ChatResponse, ContentBlock,
    ResponseMessage, SpeechOptions,
};
use crate::config::Config;

const EXTRACTION_PROMPT: &str =
    "Extract all text visible in this image. Reply with the extracted text only.";
const TEST_MODE_EXTRACTION: &str = "Sample extracted text (test mode)";

pub struct HttpCapability {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    vision_model: String,
    speech_model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<GatewayMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct GatewayMessage {
    role: &'static str,
    content: GatewayContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GatewayContent {
    Text(String),
    Parts(Vec<GatewayPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

impl From<ContentBlock> for GatewayPart {
    fn from(block: ContentBlock) -> Self {
        match block {
            ContentBlock::Text { text } => Self::Text { text },
            ContentBlock::Image { source } => Self::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", source.media_type, source.data),
                },
            },
        }
    }
}

impl HttpCapability {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        vision_model: impl Into<String>,
        speech_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CapabilityError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CapabilityError::Request(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            vision_model: vision_model.into(),
            speech_model: speech_model.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, CapabilityError> {
        let base_url = config
            .gateway_url
            .clone()
            .ok_or(CapabilityError::Unavailable)?;
        Self::new(
            base_url,
            config.api_key.clone(),
            config.vision_model.clone(),
            config.speech_model.clone(),
            config.request_timeout(),
        )
    }

    pub async fn probe(&self) -> Result<(), CapabilityError> {
        let request = self.client.get(format!("{}/models", self.base_url));
        let response = self.send(request).await?;
        tracing::debug!(status = %response.status(), base_url = %self.base_url, "gateway reachable");
        Ok(())
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CapabilityError> {
        let response = self
            .apply_auth(request)
            .send()
            .await
            .map_err(|err| CapabilityError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Api { status, message });
        }
        Ok(response)
    }

    async fn complete(
        &self,
        model: &str,
        content: GatewayContent,
        stream: bool,
    ) -> Result<Value, CapabilityError> {
        let body = ChatCompletionRequest {
            model,
            messages: vec![GatewayMessage {
                role: "user",
                content,
            }],
            stream,
        };
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        self.send(request)
            .await?
            .json::<Value>()
            .await
            .map_err(|err| CapabilityError::InvalidResponse(err.to_string()))
    }
}

fn first_choice_message(mut body: Value) -> Result<Value, Value> {
    let message = body
        .get_mut("choices")
        .and_then(|choices| choices.get_mut(0))
        .and_then(|choice| choice.get_mut("message"))
        .map(Value::take);
    message.ok_or(body)
}

#[async_trait]
impl AiCapability for HttpCapability {
    async fn chat(
        &self,
        payload: ChatPayload,
        options: &ChatOptions,
    ) -> Result<ChatResponse, CapabilityError> {
        let content = match payload {
            ChatPayload::Text(text) => GatewayContent::Text(text),
            ChatPayload::Blocks(blocks) => {
                GatewayContent::Parts(blocks.into_iter().map(GatewayPart::from).collect())
            }
        };
        // Replies are read whole; `stream` is forwarded as requested.
        let body = self.complete(&options.model, content, options.stream).await?;
        Ok(match first_choice_message(body) {
            Ok(mut message) => ChatResponse::Message(ResponseMessage {
                content: message.get_mut("content").map(Value::take),
            }),
            Err(other) => ChatResponse::from_value(other),
        })
    }

    async fn image_to_text(
        &self,
        image: &str,
        test_mode: bool,
    ) -> Result<Option<String>, CapabilityError> {
        if test_mode {
            return Ok(Some(TEST_MODE_EXTRACTION.to_string()));
        }
        let content = GatewayContent::Parts(vec![
            GatewayPart::Text {
                text: EXTRACTION_PROMPT.to_string(),
            },
            GatewayPart::ImageUrl {
                image_url: ImageUrl {
                    url: image.to_string(),
                },
            },
        ]);
        let body = self.complete(&self.vision_model, content, false).await?;
        let text = first_choice_message(body)
            .ok()
            .and_then(|message| message.get("content").and_then(Value::as_str).map(str::to_string));
        Ok(text)
    }

    async fn text_to_speech(
        &self,
        text: &str,
        options: &SpeechOptions,
    ) -> Result<Vec<u8>, CapabilityError> {
        let body = SpeechRequest {
            model: &self.speech_model,
            input: text,
            voice: &options.voice,
        };
        let request = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .json(&body);
        let bytes = self
            .send(request)
            .await?
            .bytes()
            .await
            .map_err(|err| CapabilityError::InvalidResponse(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}
