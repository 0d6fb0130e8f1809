use std::path::PathBuf;

use crate::capability::CapabilityStatus;
use crate::conversation::{ImageAttachment, Message};

#[derive(Debug, Clone)]
pub enum AppEvent {
    Hydrated(bool),
    CapabilityChanged(CapabilityStatus),
    Conversation(Vec<Message>),
    Busy(bool),
    ImageAttached(ImageAttachment),
    AttachFailed(String),
    SpeechSaved { message_id: String, path: PathBuf },
    Diagnostic(String),
}
