use chrono::{DateTime, Local, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub mod codec;
pub mod hydration;
pub mod store;

use codec::FileHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Point in time of a turn. Stored timestamps that fail to parse are kept
/// verbatim so a later save writes back exactly what was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timestamp {
    At(DateTime<Utc>),
    Invalid(String),
}

impl Timestamp {
    pub fn now() -> Self {
        Self::At(Utc::now().trunc_subsecs(3))
    }

    pub fn parse(raw: &str) -> Self {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Self::At(parsed.with_timezone(&Utc)),
            Err(_) => Self::Invalid(raw.to_string()),
        }
    }

    pub fn to_iso_string(&self) -> String {
        match self {
            Self::At(at) => at.to_rfc3339_opts(SecondsFormat::Millis, true),
            Self::Invalid(raw) => raw.clone(),
        }
    }

    #[cfg(test)]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::At(_))
    }

    pub fn clock_label(&self) -> String {
        match self {
            Self::At(at) => at.with_timezone(&Local).format("%H:%M").to_string(),
            Self::Invalid(_) => "Invalid Date".to_string(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(_) => f.write_str(&self.to_iso_string()),
            Self::Invalid(_) => f.write_str("Invalid Date"),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match raw {
            Some(serde_json::Value::String(raw)) => Self::parse(&raw),
            Some(other) => Self::Invalid(other.to_string()),
            None => Self::Invalid(String::new()),
        })
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::Invalid(String::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub file: FileHandle,
    pub preview: String,
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: Timestamp,
    pub model: Option<String>,
    pub image: Option<ImageAttachment>,
    pub is_text_extraction: Option<bool>,
}

impl Message {
    pub fn user(content: impl Into<String>, image: Option<ImageAttachment>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            content: content.into(),
            timestamp: Timestamp::now(),
            model: None,
            image,
            is_text_extraction: None,
        }
    }

    pub fn assistant(content: impl Into<String>, model: &str) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: content.into(),
            timestamp: Timestamp::now(),
            model: Some(model.to_string()),
            image: None,
            is_text_extraction: None,
        }
    }

    pub fn with_text_extraction(mut self, flag: bool) -> Self {
        self.is_text_extraction = Some(flag);
        self
    }
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    #[serde(default)]
    pub preview: String,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
}

pub fn default_file_name() -> String {
    "image.jpg".to_string()
}

/// At-rest form of [`Message`]. Field names match the records written by
/// earlier builds so old histories keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<StoredImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_text_extraction: Option<bool>,
}
