mod app;
mod capability;
mod config;
mod controller;
mod conversation;
mod event;
mod models;
mod observability;

use app::MonicaApp;
use capability::http::HttpCapability;
use capability::{AiCapability, CapabilitySlot};
use config::Config;
use controller::{ControllerSettings, ConversationController};
use conversation::codec::Base64Codec;
use conversation::store::{FileStorage, MessageStore};
use eframe::egui;
use std::sync::{mpsc, Arc};

async fn load_capability(config: Config) -> Result<Arc<dyn AiCapability>, capability::CapabilityError> {
    let capability = HttpCapability::from_config(&config)?;
    capability.probe().await?;
    Ok(Arc::new(capability))
}

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    observability::init_tracing(&config);

    let (tx, rx) = mpsc::channel();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("monica-runtime")
        .build()?;

    let store = MessageStore::new(
        config.storage_key.clone(),
        Arc::new(FileStorage::new(config.data_dir.clone())),
        Arc::new(Base64Codec),
    );
    let slot = CapabilitySlot::new();
    let controller = ConversationController::new(
        store,
        slot.clone(),
        ControllerSettings {
            model: config.default_model.clone(),
            voice: config.voice.clone(),
            test_mode: config.test_mode,
        },
        tx.clone(),
    );

    // Storage first; the capability loads once the history is in place.
    let hydrating = controller.clone();
    let loader_tx = tx.clone();
    let loader_config = config.clone();
    let handle = runtime.handle().clone();
    runtime.spawn(async move {
        hydrating.hydrate().await;
        capability::loader::spawn(&handle, slot, loader_tx, load_capability(loader_config));
    });

    let app = MonicaApp::new(rx, tx, controller, runtime.handle().clone(), config.speech_dir());
    let _runtime = runtime;

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1100.0, 760.0])
            .with_min_inner_size([720.0, 520.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Monica",
        native_options,
        Box::new(move |_creation_context| Ok(Box::new(app))),
    )
    .map_err(|err| anyhow::anyhow!("failed to run window: {err}"))?;

    Ok(())
}
