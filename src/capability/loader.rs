use std::future::Future;
use std::sync::{mpsc, Arc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{AiCapability, CapabilityError, CapabilitySlot};
use crate::event::AppEvent;

pub async fn settle_from<F>(slot: CapabilitySlot, tx: mpsc::Sender<AppEvent>, load: F)
where
    F: Future<Output = Result<Arc<dyn AiCapability>, CapabilityError>>,
{
    let capability = match load.await {
        Ok(capability) => {
            tracing::info!("AI capability loaded");
            Some(capability)
        }
        Err(err) => {
            tracing::error!(error = %err, "AI capability failed to load");
            let _ = tx.send(AppEvent::Diagnostic(format!(
                "AI capability failed to load: {err}"
            )));
            None
        }
    };

    if !slot.settle(capability) {
        tracing::debug!("AI capability slot already settled");
    }
    let _ = tx.send(AppEvent::CapabilityChanged(slot.status()));
}

pub fn spawn<F>(
    handle: &Handle,
    slot: CapabilitySlot,
    tx: mpsc::Sender<AppEvent>,
    load: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<Arc<dyn AiCapability>, CapabilityError>> + Send + 'static,
{
    let _ = tx.send(AppEvent::CapabilityChanged(slot.status()));
    handle.spawn(settle_from(slot, tx, load))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        CapabilityStatus, ChatOptions, ChatPayload, ChatResponse, SpeechOptions,
    };
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl AiCapability for Echo {
        async fn chat(
            &self,
            _payload: ChatPayload,
            _options: &ChatOptions,
        ) -> Result<ChatResponse, CapabilityError> {
            Ok(ChatResponse::Text("echo".to_string()))
        }

        async fn image_to_text(
            &self,
            _image: &str,
            _test_mode: bool,
        ) -> Result<Option<String>, CapabilityError> {
            Ok(None)
        }

        async fn text_to_speech(
            &self,
            _text: &str,
            _options: &SpeechOptions,
        ) -> Result<Vec<u8>, CapabilityError> {
            Ok(Vec::new())
        }
    }

    fn statuses(rx: &mpsc::Receiver<AppEvent>) -> Vec<CapabilityStatus> {
        rx.try_iter()
            .filter_map(|event| match event {
                AppEvent::CapabilityChanged(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_load_marks_slot_ready() {
        let slot = CapabilitySlot::new();
        let (tx, rx) = mpsc::channel();
        let handle = Handle::current();

        spawn(&handle, slot.clone(), tx, async {
            Ok(Arc::new(Echo) as Arc<dyn AiCapability>)
        })
        .await
        .expect("loader task should finish");

        assert_eq!(slot.status(), CapabilityStatus::Ready);
        assert!(slot.get().is_some());
        assert_eq!(
            statuses(&rx),
            vec![CapabilityStatus::Loading, CapabilityStatus::Ready]
        );
    }

    #[tokio::test]
    async fn failed_load_leaves_capability_absent() {
        let slot = CapabilitySlot::new();
        let (tx, rx) = mpsc::channel();

        settle_from(slot.clone(), tx, async { Err(CapabilityError::Unavailable) }).await;

        assert_eq!(slot.status(), CapabilityStatus::Unavailable);
        assert!(slot.get().is_none());
        let events: Vec<AppEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|event| matches!(event, AppEvent::Diagnostic(text) if text.contains("failed to load"))));
    }
}
