use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use tokio::sync::Mutex;

use crate::capability::{
    AiCapability, CapabilityError, CapabilitySlot, CapabilityStatus, ChatOptions, ChatPayload,
    ContentBlock, SpeechOptions,
};
use crate::conversation::codec::{AttachmentError, DataUrl};
use crate::conversation::store::MessageStore;
use crate::conversation::{ImageAttachment, Message};
use crate::event::AppEvent;

pub const CHAT_APOLOGY: &str = "Sorry, an error occurred while processing your request.";
pub const EXTRACTION_APOLOGY: &str =
    "Sorry, an error occurred while extracting text from the image.";
const IMAGE_ONLY_CONTENT: &str = "Image uploaded";
const DEFAULT_IMAGE_PROMPT: &str = "Describe this image in detail";
const EXTRACTION_FALLBACK: &str = "Could not extract text from the image";

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("Image file is unavailable. Try uploading the image again.")]
    MissingImageFile,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    CapabilityUnavailable,
    EmptyInput,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ignored(IgnoreReason),
    Answered,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub model: String,
    pub voice: String,
    pub test_mode: bool,
}

#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Mutex<MessageStore>,
    capability: CapabilitySlot,
    sending: AtomicBool,
    model: RwLock<String>,
    voice: String,
    test_mode: bool,
    tx: mpsc::Sender<AppEvent>,
}

struct SendingGuard<'a> {
    inner: &'a Inner,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.sending.store(false, Ordering::Release);
        let _ = self.inner.tx.send(AppEvent::Busy(false));
        tracing::debug!("conversation idle");
    }
}

impl ConversationController {
    pub fn new(
        store: MessageStore,
        capability: CapabilitySlot,
        settings: ControllerSettings,
        tx: mpsc::Sender<AppEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                capability,
                sending: AtomicBool::new(false),
                model: RwLock::new(settings.model),
                voice: settings.voice,
                test_mode: settings.test_mode,
                tx,
            }),
        }
    }

    pub async fn hydrate(&self) -> bool {
        let mut store = self.inner.store.lock().await;
        let hydrated = store.hydrate().await;
        let _ = self.inner.tx.send(AppEvent::Hydrated(hydrated));
        self.publish(&store);
        hydrated
    }

    #[cfg(test)]
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.store.lock().await.messages().to_vec()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.sending.load(Ordering::Acquire)
    }

    pub fn capability_status(&self) -> CapabilityStatus {
        self.inner.capability.status()
    }

    pub fn model(&self) -> String {
        self.inner
            .model
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn select_model(&self, model: &str) -> bool {
        if self.is_busy() {
            return false;
        }
        *self
            .inner
            .model
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = model.to_string();
        tracing::info!(model, "model selected");
        true
    }

    pub async fn submit(&self, text: &str, image: Option<ImageAttachment>) -> Outcome {
        let Some(capability) = self.inner.capability.get() else {
            tracing::debug!("submit ignored: AI capability not loaded");
            return Outcome::Ignored(IgnoreReason::CapabilityUnavailable);
        };
        let text = text.trim();
        if text.is_empty() && image.is_none() {
            return Outcome::Ignored(IgnoreReason::EmptyInput);
        }
        let Some(_guard) = self.begin_sending() else {
            tracing::debug!("submit ignored: request already in flight");
            return Outcome::Ignored(IgnoreReason::Busy);
        };

        let model = self.model();
        let content = if text.is_empty() { IMAGE_ONLY_CONTENT } else { text };
        let has_image = image.is_some();
        self.append(Message::user(content, image.clone())).await;

        match self
            .request_chat(capability.as_ref(), text, image.as_ref(), &model)
            .await
        {
            Ok(reply) => {
                let message = Message::assistant(reply, &model).with_text_extraction(has_image);
                self.append(message).await;
                Outcome::Answered
            }
            Err(err) => {
                tracing::error!(error = %err, model = %model, "chat request failed");
                let content = format!("{CHAT_APOLOGY} Details: {err}");
                self.append(Message::assistant(content, &model)).await;
                Outcome::Failed
            }
        }
    }

    pub async fn extract_text(&self, image: &ImageAttachment) -> Outcome {
        let Some(capability) = self.inner.capability.get() else {
            tracing::debug!("text extraction ignored: AI capability not loaded");
            return Outcome::Ignored(IgnoreReason::CapabilityUnavailable);
        };
        let Some(_guard) = self.begin_sending() else {
            return Outcome::Ignored(IgnoreReason::Busy);
        };

        let model = self.model();
        match self.request_extraction(capability.as_ref(), image).await {
            Ok(text) => {
                let content = format!("📝 **Extracted text from image:**\n\n{text}");
                let message = Message::assistant(content, &model).with_text_extraction(true);
                self.append(message).await;
                Outcome::Answered
            }
            Err(err) => {
                tracing::error!(error = %err, file_name = %image.file.name, "text extraction failed");
                let content = format!("{EXTRACTION_APOLOGY} Details: {err}");
                self.append(Message::assistant(content, &model)).await;
                Outcome::Failed
            }
        }
    }

    pub async fn speak(&self, text: &str) -> Result<Vec<u8>, CapabilityError> {
        let capability = self
            .inner
            .capability
            .get()
            .ok_or(CapabilityError::Unavailable)?;
        if text.trim().is_empty() {
            return Err(CapabilityError::Rejected("no text to speak".to_string()));
        }
        let options = SpeechOptions {
            voice: self.inner.voice.clone(),
        };
        capability.text_to_speech(text, &options).await
    }

    pub async fn clear(&self) -> bool {
        let Some(_guard) = self.begin_sending() else {
            tracing::debug!("clear ignored: request already in flight");
            return false;
        };
        let mut store = self.inner.store.lock().await;
        store.clear();
        tracing::info!("conversation cleared");
        self.publish(&store);
        true
    }

    fn begin_sending(&self) -> Option<SendingGuard<'_>> {
        self.inner
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let _ = self.inner.tx.send(AppEvent::Busy(true));
        tracing::debug!("conversation sending");
        Some(SendingGuard { inner: &self.inner })
    }

    async fn append(&self, message: Message) {
        let mut store = self.inner.store.lock().await;
        store.append(message).await;
        self.publish(&store);
    }

    fn publish(&self, store: &MessageStore) {
        let _ = self
            .inner
            .tx
            .send(AppEvent::Conversation(store.messages().to_vec()));
    }

    async fn request_chat(
        &self,
        capability: &dyn AiCapability,
        text: &str,
        image: Option<&ImageAttachment>,
        model: &str,
    ) -> Result<String, TurnError> {
        let payload = match image {
            Some(image) => {
                let url = DataUrl::parse(&image.preview)?;
                let prompt = if text.is_empty() { DEFAULT_IMAGE_PROMPT } else { text };
                ChatPayload::Blocks(vec![
                    ContentBlock::text(prompt),
                    ContentBlock::base64_image(url.media_type, url.payload),
                ])
            }
            None => ChatPayload::Text(text.to_string()),
        };
        let options = ChatOptions {
            model: model.to_string(),
            stream: false,
        };
        let response = capability.chat(payload, &options).await?;
        Ok(response.into_display_text())
    }

    async fn request_extraction(
        &self,
        capability: &dyn AiCapability,
        image: &ImageAttachment,
    ) -> Result<String, TurnError> {
        if image.file.is_empty() {
            return Err(TurnError::MissingImageFile);
        }
        DataUrl::parse(&image.preview)?;
        let text = capability
            .image_to_text(&image.preview, self.inner.test_mode)
            .await?;
        Ok(text.unwrap_or_else(|| EXTRACTION_FALLBACK.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ChatResponse;
    use crate::conversation::codec::{Base64Codec, FileHandle};
    use crate::conversation::store::MemoryStorage;
    use crate::conversation::Role;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    const KEY: &str = "ai-chat-history";

    enum Reply {
        Respond(ChatResponse),
        Reject(&'static str),
    }

    struct FakeCapability {
        reply: Reply,
        chat_calls: AtomicUsize,
        extraction_calls: AtomicUsize,
        payloads: StdMutex<Vec<(ChatPayload, ChatOptions)>>,
        entered: Arc<Notify>,
        hold: Option<Arc<Notify>>,
    }

    impl FakeCapability {
        fn replying(reply: Reply) -> Self {
            Self {
                reply,
                chat_calls: AtomicUsize::new(0),
                extraction_calls: AtomicUsize::new(0),
                payloads: StdMutex::new(Vec::new()),
                entered: Arc::new(Notify::new()),
                hold: None,
            }
        }

        fn text(reply: &str) -> Self {
            Self::replying(Reply::Respond(ChatResponse::Text(reply.to_string())))
        }
    }

    #[async_trait]
    impl AiCapability for FakeCapability {
        async fn chat(
            &self,
            payload: ChatPayload,
            options: &ChatOptions,
        ) -> Result<ChatResponse, CapabilityError> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            self.payloads
                .lock()
                .expect("payload log")
                .push((payload, options.clone()));
            self.entered.notify_one();
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            match &self.reply {
                Reply::Respond(response) => Ok(response.clone()),
                Reply::Reject(message) => Err(CapabilityError::Rejected(message.to_string())),
            }
        }

        async fn image_to_text(
            &self,
            _image: &str,
            test_mode: bool,
        ) -> Result<Option<String>, CapabilityError> {
            self.extraction_calls.fetch_add(1, Ordering::SeqCst);
            if test_mode {
                return Ok(None);
            }
            Ok(Some("TOTAL 12.50".to_string()))
        }

        async fn text_to_speech(
            &self,
            text: &str,
            options: &SpeechOptions,
        ) -> Result<Vec<u8>, CapabilityError> {
            Ok(format!("{}:{text}", options.voice).into_bytes())
        }
    }

    struct Harness {
        controller: ConversationController,
        capability: Arc<FakeCapability>,
        storage: Arc<MemoryStorage>,
        _rx: mpsc::Receiver<AppEvent>,
    }

    async fn harness(capability: FakeCapability) -> Harness {
        let capability = Arc::new(capability);
        let slot = CapabilitySlot::ready(Arc::clone(&capability) as Arc<dyn AiCapability>);
        harness_with_slot(slot, capability).await
    }

    async fn harness_with_slot(slot: CapabilitySlot, capability: Arc<FakeCapability>) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let store = MessageStore::new(KEY, storage.clone(), Arc::new(Base64Codec));
        let (tx, rx) = mpsc::channel();
        let controller = ConversationController::new(
            store,
            slot,
            ControllerSettings {
                model: "claude-sonnet-4".to_string(),
                voice: "alloy".to_string(),
                test_mode: false,
            },
            tx,
        );
        assert!(controller.hydrate().await);
        Harness {
            controller,
            capability,
            storage,
            _rx: rx,
        }
    }

    fn png_attachment(preview: &str) -> ImageAttachment {
        ImageAttachment {
            file: FileHandle::from_bytes("receipt.png", "image/png", vec![137u8, 80, 78, 71]),
            preview: preview.to_string(),
            extracted_text: None,
        }
    }

    #[tokio::test]
    async fn text_turn_records_user_and_assistant() {
        let h = harness(FakeCapability::text("Hi there!")).await;

        assert_eq!(h.controller.submit("Hello", None).await, Outcome::Answered);

        let messages = h.controller.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there!");
        assert_eq!(messages[1].model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(messages[1].is_text_extraction, Some(false));

        let payloads = h.capability.payloads.lock().expect("payload log");
        assert_eq!(payloads[0].0, ChatPayload::Text("Hello".to_string()));
        assert_eq!(payloads[0].1.model, "claude-sonnet-4");
        assert!(!payloads[0].1.stream);
        drop(payloads);

        let raw = h.storage.raw(KEY).expect("history persisted");
        assert!(raw.contains("Hi there!"));
    }

    #[tokio::test]
    async fn assistant_turn_uses_currently_selected_model() {
        let h = harness(FakeCapability::text("ok")).await;
        assert!(h.controller.select_model("claude-opus-4"));

        h.controller.submit("Hello", None).await;

        let messages = h.controller.messages().await;
        assert_eq!(messages[1].model.as_deref(), Some("claude-opus-4"));
    }

    #[tokio::test]
    async fn invalid_preview_fails_before_calling_out() {
        let h = harness(FakeCapability::text("unused")).await;

        let outcome = h
            .controller
            .submit("What is this?", Some(png_attachment("not-a-data-url")))
            .await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(h.capability.chat_calls.load(Ordering::SeqCst), 0);
        let messages = h.controller.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[0].image.is_some());
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].content.starts_with(CHAT_APOLOGY));
        assert!(messages[1].content.contains("data URL"));
    }

    #[tokio::test]
    async fn rejected_chat_becomes_apology_turn() {
        let h = harness(FakeCapability::replying(Reply::Reject("gateway exploded"))).await;

        assert_eq!(h.controller.submit("Hello", None).await, Outcome::Failed);

        let messages = h.controller.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Hello");
        assert!(messages[1].content.starts_with(CHAT_APOLOGY));
        assert!(messages[1].content.contains("gateway exploded"));
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn image_turn_sends_blocks_and_flags_reply() {
        let h = harness(FakeCapability::replying(Reply::Respond(ChatResponse::from_value(
            json!({ "message": { "content": [ { "text": "A receipt." } ] } }),
        ))))
        .await;

        let outcome = h
            .controller
            .submit("  ", Some(png_attachment("data:image/png;base64,iVBORw==")))
            .await;

        assert_eq!(outcome, Outcome::Answered);
        let messages = h.controller.messages().await;
        assert_eq!(messages[0].content, "Image uploaded");
        assert_eq!(messages[1].content, "A receipt.");
        assert_eq!(messages[1].is_text_extraction, Some(true));

        let payloads = h.capability.payloads.lock().expect("payload log");
        assert_eq!(
            payloads[0].0,
            ChatPayload::Blocks(vec![
                ContentBlock::text("Describe this image in detail"),
                ContentBlock::base64_image("image/png", "iVBORw=="),
            ])
        );
    }

    #[tokio::test]
    async fn unknown_response_shape_is_not_an_error() {
        let h = harness(FakeCapability::replying(Reply::Respond(ChatResponse::Unrecognized(
            json!(7),
        ))))
        .await;

        assert_eq!(h.controller.submit("Hello", None).await, Outcome::Answered);
        let messages = h.controller.messages().await;
        assert_eq!(messages[1].content, crate::capability::UNRECOGNIZED_RESPONSE);
    }

    #[tokio::test]
    async fn submit_while_sending_is_ignored() {
        let hold = Arc::new(Notify::new());
        let mut fake = FakeCapability::text("first reply");
        fake.hold = Some(Arc::clone(&hold));
        let entered = Arc::clone(&fake.entered);
        let h = harness(fake).await;

        let controller = h.controller.clone();
        let in_flight = tokio::spawn(async move { controller.submit("first", None).await });
        entered.notified().await;

        assert!(h.controller.is_busy());
        assert_eq!(h.controller.messages().await.len(), 1);
        assert_eq!(
            h.controller.submit("second", None).await,
            Outcome::Ignored(IgnoreReason::Busy)
        );
        assert_eq!(h.controller.messages().await.len(), 1);
        assert!(!h.controller.clear().await);
        assert!(!h.controller.select_model("claude-opus-4"));

        hold.notify_one();
        assert_eq!(in_flight.await.expect("task"), Outcome::Answered);
        assert!(!h.controller.is_busy());
        let messages = h.controller.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "first reply");
    }

    #[tokio::test]
    async fn submissions_are_ignored_without_capability_or_input() {
        let unloaded = harness_with_slot(
            CapabilitySlot::new(),
            Arc::new(FakeCapability::text("unused")),
        )
        .await;
        assert_eq!(
            unloaded.controller.submit("Hello", None).await,
            Outcome::Ignored(IgnoreReason::CapabilityUnavailable)
        );
        assert!(unloaded.controller.messages().await.is_empty());

        let failed = CapabilitySlot::new();
        failed.settle(None);
        let absent = harness_with_slot(failed, Arc::new(FakeCapability::text("unused"))).await;
        assert_eq!(
            absent.controller.submit("Hello", None).await,
            Outcome::Ignored(IgnoreReason::CapabilityUnavailable)
        );

        let h = harness(FakeCapability::text("unused")).await;
        assert_eq!(
            h.controller.submit("   ", None).await,
            Outcome::Ignored(IgnoreReason::EmptyInput)
        );
        assert!(h.controller.messages().await.is_empty());
        assert_eq!(h.capability.chat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn extract_text_appends_flagged_assistant_turn() {
        let h = harness(FakeCapability::text("unused")).await;

        let image = png_attachment("data:image/png;base64,iVBORw==");
        assert_eq!(h.controller.extract_text(&image).await, Outcome::Answered);

        let messages = h.controller.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert!(messages[0].content.starts_with("📝 **Extracted text from image:**"));
        assert!(messages[0].content.ends_with("TOTAL 12.50"));
        assert_eq!(messages[0].is_text_extraction, Some(true));
    }

    #[tokio::test]
    async fn extract_text_requires_real_bytes_and_data_url() {
        let h = harness(FakeCapability::text("unused")).await;

        let mut placeholder = png_attachment("data:image/png;base64,iVBORw==");
        placeholder.file = FileHandle::placeholder("receipt.png");
        assert_eq!(h.controller.extract_text(&placeholder).await, Outcome::Failed);

        let bad_preview = png_attachment("blob:receipt");
        assert_eq!(h.controller.extract_text(&bad_preview).await, Outcome::Failed);

        let messages = h.controller.messages().await;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.starts_with(EXTRACTION_APOLOGY));
        assert!(messages[0].content.contains("Image file is unavailable"));
        assert!(messages[1].content.contains("data URL"));
        assert_eq!(h.capability.extraction_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clear_empties_store_and_storage() {
        let h = harness(FakeCapability::text("Hi there!")).await;
        h.controller.submit("Hello", None).await;
        assert!(h.storage.raw(KEY).is_some());

        assert!(h.controller.clear().await);
        assert!(h.controller.messages().await.is_empty());
        assert!(h.storage.raw(KEY).is_none());
    }

    #[tokio::test]
    async fn speak_uses_configured_voice() {
        let h = harness(FakeCapability::text("unused")).await;

        let audio = h.controller.speak("read this").await.expect("speech");
        assert_eq!(audio, b"alloy:read this".to_vec());

        let err = h.controller.speak("   ").await.expect_err("blank text");
        assert!(matches!(err, CapabilityError::Rejected(_)));
    }

    #[tokio::test]
    async fn speak_without_capability_is_unavailable() {
        let failed = CapabilitySlot::new();
        failed.settle(None);
        let h = harness_with_slot(failed, Arc::new(FakeCapability::text("unused"))).await;

        let err = h.controller.speak("read this").await.expect_err("no capability");
        assert!(matches!(err, CapabilityError::Unavailable));

        let loading = harness_with_slot(
            CapabilitySlot::new(),
            Arc::new(FakeCapability::text("unused")),
        )
        .await;
        let err = loading.controller.speak("read this").await.expect_err("still loading");
        assert!(matches!(err, CapabilityError::Unavailable));
    }

    #[tokio::test]
    async fn clear_holds_the_sending_slot_until_done() {
        let h = harness(FakeCapability::text("Hi there!")).await;
        h.controller.submit("Hello", None).await;

        let store = h.controller.inner.store.lock().await;
        let controller = h.controller.clone();
        let clearing = tokio::spawn(async move { controller.clear().await });
        while !h.controller.is_busy() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            h.controller.submit("racing", None).await,
            Outcome::Ignored(IgnoreReason::Busy)
        );
        drop(store);

        assert!(clearing.await.expect("task"));
        assert!(!h.controller.is_busy());
        assert!(h.controller.messages().await.is_empty());
        assert_eq!(h.capability.chat_calls.load(Ordering::SeqCst), 1);
    }
}
