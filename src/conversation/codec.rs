use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::ImageAttachment;

const FALLBACK_MEDIA_TYPE: &str = "image/jpeg";

/// Binary file held by an attachment. A zero-length handle stands in for
/// bytes that could not be recovered from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub name: String,
    pub media_type: String,
    bytes: Arc<[u8]>,
}

impl FileHandle {
    pub fn from_bytes(
        name: impl Into<String>,
        media_type: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::from_bytes(name, FALLBACK_MEDIA_TYPE, Vec::<u8>::new())
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("Image must be a data URL")]
    NotDataUrl,
    #[error("Invalid image data URL format")]
    MalformedDataUrl,
    #[error("unsupported image type: {0}")]
    UnsupportedType(String),
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub media_type: String,
    pub payload: String,
}

impl DataUrl {
    pub fn from_bytes(media_type: &str, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            payload: STANDARD.encode(bytes),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AttachmentError> {
        let rest = raw.strip_prefix("data:").ok_or(AttachmentError::NotDataUrl)?;
        let (media_type, payload) = rest
            .split_once(";base64,")
            .ok_or(AttachmentError::MalformedDataUrl)?;
        if media_type.is_empty() || media_type.contains(';') || payload.is_empty() {
            return Err(AttachmentError::MalformedDataUrl);
        }
        Ok(Self {
            media_type: media_type.to_string(),
            payload: payload.to_string(),
        })
    }

    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.payload.trim())
    }
}

impl fmt::Display for DataUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.media_type, self.payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("attachment {0} has no readable bytes")]
    Empty(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("stored attachment payload is not a data URL: {0}")]
    Format(#[from] AttachmentError),
    #[error("stored attachment payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[async_trait]
pub trait AttachmentCodec: Send + Sync {
    async fn encode(&self, file: &FileHandle) -> Result<String, EncodeError>;

    fn decode(&self, data: &str, file_name: &str) -> Result<FileHandle, DecodeError>;

    fn decode_or_placeholder(&self, data: &str, file_name: &str) -> FileHandle {
        match self.decode(data, file_name) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(file_name, error = %err, "restoring attachment as placeholder");
                FileHandle::placeholder(file_name)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Codec;

#[async_trait]
impl AttachmentCodec for Base64Codec {
    async fn encode(&self, file: &FileHandle) -> Result<String, EncodeError> {
        if file.is_empty() {
            return Err(EncodeError::Empty(file.name.clone()));
        }
        Ok(DataUrl::from_bytes(&file.media_type, file.bytes()).to_string())
    }

    fn decode(&self, data: &str, file_name: &str) -> Result<FileHandle, DecodeError> {
        let url = DataUrl::parse(data)?;
        let bytes = url.decode_payload()?;
        Ok(FileHandle::from_bytes(file_name, url.media_type, bytes))
    }
}

pub fn media_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub async fn load_image(path: &Path) -> Result<ImageAttachment, AttachmentError> {
    let media_type = media_type_for(path)
        .ok_or_else(|| AttachmentError::UnsupportedType(path.display().to_string()))?;
    let bytes = tokio::fs::read(path).await.map_err(|err| AttachmentError::Read {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(super::default_file_name);
    let preview = DataUrl::from_bytes(media_type, &bytes).to_string();

    Ok(ImageAttachment {
        file: FileHandle::from_bytes(name, media_type, bytes),
        preview,
        extracted_text: None,
    })
}
