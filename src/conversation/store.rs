use crate::conversation::codec::{AttachmentCodec, FileHandle};
use crate::conversation::hydration::HydrationGate;
use crate::conversation::{ImageAttachment, Message, StoredImage, StoredMessage};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(test)]
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    sync::Mutex,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error("failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait StorageBackend: Send + Sync {
    fn prepare(&self) -> Result<(), StorageError>;
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn write_error(path: &Path, source: io::Error) -> StorageError {
    StorageError::Write {
        path: path.display().to_string(),
        source,
    }
}

impl StorageBackend for FileStorage {
    fn prepare(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            StorageError::Unavailable(format!(
                "failed to initialize {}: {err}",
                self.dir.display()
            ))
        })
    }

    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let final_path = self.path_for(key);
        let tmp_path = self.dir.join(format!("{key}.json.tmp"));

        fs::write(&tmp_path, value).map_err(|err| write_error(&tmp_path, err))?;
        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                if final_path.exists() {
                    fs::remove_file(&final_path).map_err(|err| write_error(&final_path, err))?;
                    fs::rename(&tmp_path, &final_path)
                        .map_err(|err| write_error(&final_path, err))
                } else {
                    Err(write_error(&final_path, rename_err))
                }
            }
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(write_error(&path, err)),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        let storage = Self::default();
        storage.unavailable.store(true, Ordering::SeqCst);
        storage
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
impl StorageBackend for MemoryStorage {
    fn prepare(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory storage disabled".to_string(),
            ));
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.raw(key))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Write {
                path: key.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "quota exceeded"),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert_raw(key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Save,
    Remove,
}

pub struct MessageStore {
    key: String,
    backend: Arc<dyn StorageBackend>,
    codec: Arc<dyn AttachmentCodec>,
    gate: HydrationGate,
    messages: Vec<Message>,
    pending: Option<PendingWrite>,
}

impl MessageStore {
    pub fn new(
        key: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        codec: Arc<dyn AttachmentCodec>,
    ) -> Self {
        Self {
            key: key.into(),
            backend,
            codec,
            gate: HydrationGate::new(),
            messages: Vec::new(),
            pending: None,
        }
    }

    #[cfg(test)]
    pub fn is_hydrated(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Opens the hydration gate once the backend is usable. A write requested
    /// while the gate was closed is replayed; otherwise the stored history is
    /// loaded. Returns whether the gate is open afterwards.
    pub async fn hydrate(&mut self) -> bool {
        if self.gate.is_ready() {
            return true;
        }
        if let Err(err) = self.backend.prepare() {
            tracing::warn!(key = %self.key, error = %err, "persistent storage unavailable; history kept in memory");
            return false;
        }
        if !self.gate.open() {
            return true;
        }

        match self.pending.take() {
            Some(PendingWrite::Save) => {
                tracing::debug!(key = %self.key, "replaying history written before hydration");
                self.persist().await;
            }
            Some(PendingWrite::Remove) => self.remove_persisted(),
            None => {
                self.load();
            }
        }
        true
    }

    pub fn load(&mut self) -> &[Message] {
        if !self.gate.is_ready() {
            return &self.messages;
        }

        match self.backend.read(&self.key) {
            Ok(Some(raw)) => {
                self.messages = decode_history(&raw, self.codec.as_ref());
                tracing::info!(key = %self.key, count = self.messages.len(), "history loaded");
            }
            Ok(None) => {
                tracing::debug!(key = %self.key, "no stored history");
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "failed to read stored history");
            }
        }
        &self.messages
    }

    pub async fn save(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        if !self.gate.is_ready() {
            self.pending = Some(PendingWrite::Save);
            return;
        }
        self.persist().await;
    }

    pub async fn append(&mut self, message: Message) {
        let mut next = self.messages.clone();
        next.push(message);
        self.save(next).await;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        if !self.gate.is_ready() {
            self.pending = Some(PendingWrite::Remove);
            return;
        }
        self.remove_persisted();
    }

    async fn persist(&self) {
        let mut records = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            records.push(encode_message(message, self.codec.as_ref()).await);
        }

        let result = serde_json::to_string_pretty(&records)
            .map_err(StorageError::from)
            .and_then(|data| self.backend.write(&self.key, &data));
        match result {
            Ok(()) => tracing::debug!(key = %self.key, count = records.len(), "history persisted"),
            Err(err) => tracing::warn!(key = %self.key, error = %err, "failed to persist history"),
        }
    }

    fn remove_persisted(&self) {
        if let Err(err) = self.backend.remove(&self.key) {
            tracing::warn!(key = %self.key, error = %err, "failed to remove stored history");
        }
    }
}

async fn encode_message(message: &Message, codec: &dyn AttachmentCodec) -> StoredMessage {
    let image = match &message.image {
        Some(image) => Some(encode_image(image, codec).await),
        None => None,
    };

    StoredMessage {
        id: message.id.clone(),
        role: message.role,
        content: message.content.clone(),
        timestamp: message.timestamp.clone(),
        model: message.model.clone(),
        image,
        is_text_extraction: message.is_text_extraction,
    }
}

async fn encode_image(image: &ImageAttachment, codec: &dyn AttachmentCodec) -> StoredImage {
    let file_data = if image.file.is_empty() {
        None
    } else {
        match codec.encode(&image.file).await {
            Ok(data) => Some(data),
            Err(err) => {
                tracing::warn!(file_name = %image.file.name, error = %err, "storing attachment metadata only");
                None
            }
        }
    };

    StoredImage {
        preview: image.preview.clone(),
        file_name: image.file.name.clone(),
        file_size: image.file.size(),
        extracted_text: image.extracted_text.clone(),
        file_data,
    }
}

fn decode_history(raw: &str, codec: &dyn AttachmentCodec) -> Vec<Message> {
    let records = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(records)) => records,
        Ok(_) => {
            tracing::warn!("stored history is not a JSON array; ignoring it");
            return Vec::new();
        }
        Err(err) => {
            tracing::warn!(error = %err, "stored history is not valid JSON; ignoring it");
            return Vec::new();
        }
    };

    records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| match serde_json::from_value::<StoredMessage>(record) {
            Ok(stored) => Some(decode_message(stored, codec)),
            Err(err) => {
                tracing::warn!(index, error = %err, "skipping corrupt history record");
                None
            }
        })
        .collect()
}

fn decode_message(stored: StoredMessage, codec: &dyn AttachmentCodec) -> Message {
    let image = stored.image.map(|image| {
        let file = match image.file_data.as_deref() {
            Some(data) => codec.decode_or_placeholder(data, &image.file_name),
            None => FileHandle::placeholder(image.file_name.clone()),
        };
        ImageAttachment {
            file,
            preview: image.preview,
            extracted_text: image.extracted_text,
        }
    });

    Message {
        id: stored.id,
        role: stored.role,
        content: stored.content,
        timestamp: stored.timestamp,
        model: stored.model,
        image,
        is_text_extraction: stored.is_text_extraction,
    }
}
