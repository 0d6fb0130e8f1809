use crate::capability::CapabilityStatus;
use crate::controller::{ConversationController, Outcome};
use crate::conversation::codec::load_image;
use crate::conversation::{ImageAttachment, Message, Role};
use crate::event::AppEvent;
use crate::models::{self, MODELS};
use eframe::egui::{self, Color32, RichText, ScrollArea};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use tokio::runtime::Handle;

const MAX_DIAGNOSTICS: usize = 200;

enum TurnAction {
    ExtractText(ImageAttachment),
    Speak { message_id: String, text: String },
}

pub struct MonicaApp {
    rx: Receiver<AppEvent>,
    tx: Sender<AppEvent>,
    controller: ConversationController,
    runtime: Handle,
    speech_dir: PathBuf,
    hydration_settled: bool,
    capability_status: CapabilityStatus,
    transcript: Vec<Message>,
    is_busy: bool,
    selected_model: String,
    input_buffer: String,
    image_path: String,
    pending_image: Option<ImageAttachment>,
    attaching: bool,
    diagnostics_log: Vec<String>,
    scroll_to_bottom: bool,
}

impl MonicaApp {
    pub fn new(
        rx: Receiver<AppEvent>,
        tx: Sender<AppEvent>,
        controller: ConversationController,
        runtime: Handle,
        speech_dir: PathBuf,
    ) -> Self {
        let selected_model = controller.model();
        let capability_status = controller.capability_status();
        Self {
            rx,
            tx,
            controller,
            runtime,
            speech_dir,
            hydration_settled: false,
            capability_status,
            transcript: Vec::new(),
            is_busy: false,
            selected_model,
            input_buffer: String::new(),
            image_path: String::new(),
            pending_image: None,
            attaching: false,
            diagnostics_log: Vec::new(),
            scroll_to_bottom: false,
        }
    }

    fn log_diagnostic(&mut self, message: impl Into<String>) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.diagnostics_log
            .push(format!("[{stamp}] {}", message.into()));
        if self.diagnostics_log.len() > MAX_DIAGNOSTICS {
            let overflow = self.diagnostics_log.len() - MAX_DIAGNOSTICS;
            self.diagnostics_log.drain(..overflow);
        }
    }

    fn capability_label(&self) -> (&'static str, Color32) {
        match self.capability_status {
            CapabilityStatus::Ready => ("AI Connected", Color32::LIGHT_GREEN),
            CapabilityStatus::Loading => ("Loading AI...", Color32::YELLOW),
            CapabilityStatus::Unavailable => ("AI Unavailable", Color32::RED),
        }
    }

    fn input_enabled(&self) -> bool {
        self.capability_status == CapabilityStatus::Ready && !self.is_busy
    }

    fn drain_events(&mut self, ctx: &egui::Context) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.apply_event(event, ctx),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.log_diagnostic("event channel disconnected");
                    break;
                }
            }
        }
    }

    fn apply_event(&mut self, event: AppEvent, ctx: &egui::Context) {
        match event {
            AppEvent::Hydrated(persistent) => {
                self.hydration_settled = true;
                if !persistent {
                    self.log_diagnostic("history storage unavailable; chat will not be saved");
                }
            }
            AppEvent::CapabilityChanged(status) => {
                self.capability_status = status;
                self.log_diagnostic(format!("AI capability: {status:?}"));
            }
            AppEvent::Conversation(messages) => {
                self.transcript = messages;
                self.scroll_to_bottom = true;
            }
            AppEvent::Busy(busy) => {
                self.is_busy = busy;
            }
            AppEvent::ImageAttached(image) => {
                self.attaching = false;
                self.log_diagnostic(format!(
                    "attached {} ({} bytes)",
                    image.file.name,
                    image.file.size()
                ));
                self.pending_image = Some(image);
                self.image_path.clear();
            }
            AppEvent::SpeechSaved { message_id, path } => {
                self.log_diagnostic(format!(
                    "speech for {message_id} saved to {}",
                    path.display()
                ));
            }
            AppEvent::AttachFailed(reason) => {
                self.attaching = false;
                self.log_diagnostic(format!("cannot attach image: {reason}"));
            }
            AppEvent::Diagnostic(message) => self.log_diagnostic(message),
        }
        ctx.request_repaint();
    }

    fn spawn_with_repaint<F>(&self, ctx: &egui::Context, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let ctx = ctx.clone();
        self.runtime.spawn(async move {
            task.await;
            ctx.request_repaint();
        });
    }

    fn submit_prompt(&mut self, ctx: &egui::Context) {
        let text = std::mem::take(&mut self.input_buffer);
        let image = self.pending_image.take();
        if text.trim().is_empty() && image.is_none() {
            return;
        }

        let controller = self.controller.clone();
        let tx = self.tx.clone();
        self.spawn_with_repaint(ctx, async move {
            if let Outcome::Ignored(reason) = controller.submit(&text, image).await {
                let _ = tx.send(AppEvent::Diagnostic(format!(
                    "message not sent: {reason:?}"
                )));
            }
        });
        self.scroll_to_bottom = true;
    }

    fn attach_image(&mut self, ctx: &egui::Context) {
        let raw = self.image_path.trim();
        if raw.is_empty() || self.attaching {
            return;
        }
        self.attaching = true;
        self.spawn_with_repaint(ctx, attach_from_path(PathBuf::from(raw), self.tx.clone()));
    }

    fn run_action(&mut self, action: TurnAction, ctx: &egui::Context) {
        let controller = self.controller.clone();
        let tx = self.tx.clone();
        match action {
            TurnAction::ExtractText(image) => {
                self.spawn_with_repaint(ctx, async move {
                    if let Outcome::Ignored(reason) = controller.extract_text(&image).await {
                        let _ = tx.send(AppEvent::Diagnostic(format!(
                            "text extraction not started: {reason:?}"
                        )));
                    }
                });
            }
            TurnAction::Speak { message_id, text } => {
                let speech_dir = self.speech_dir.clone();
                self.spawn_with_repaint(ctx, async move {
                    let event = match save_speech(&controller, &speech_dir, &message_id, &text).await {
                        Ok(path) => AppEvent::SpeechSaved { message_id, path },
                        Err(err) => AppEvent::Diagnostic(format!("text-to-speech failed: {err}")),
                    };
                    let _ = tx.send(event);
                });
            }
        }
    }

    fn clear_chat(&mut self, ctx: &egui::Context) {
        let controller = self.controller.clone();
        let tx = self.tx.clone();
        self.spawn_with_repaint(ctx, async move {
            if !controller.clear().await {
                let _ = tx.send(AppEvent::Diagnostic(
                    "cannot clear while a request is in flight".to_string(),
                ));
            }
        });
    }

    fn render_top_bar(&mut self, ctx: &egui::Context) {
        let (status_label, status_color) = self.capability_label();
        egui::TopBottomPanel::top("top_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.strong("Monica");
                ui.label(RichText::new("AI Chat Assistant").color(Color32::GRAY));
                ui.separator();
                ui.label(RichText::new(status_label).color(status_color));
                if self.is_busy {
                    ui.separator();
                    ui.spinner();
                }
            });
        });
    }

    fn render_left_panel(&mut self, ctx: &egui::Context) {
        let mut chosen_model: Option<&'static str> = None;
        let mut clear_clicked = false;

        egui::SidePanel::left("tools_panel")
            .resizable(true)
            .show(ctx, |ui| {
                ui.heading("🤖 AI Model");
                for model in MODELS.iter() {
                    let selected = self.selected_model == model.id;
                    let response = ui.add_enabled(
                        !self.is_busy,
                        egui::SelectableLabel::new(selected, format!("{} {}", model.icon, model.name)),
                    );
                    if response.on_hover_text(model.description).clicked() && !selected {
                        chosen_model = Some(model.id);
                    }
                }

                ui.separator();
                ui.heading("🛠 Tools");
                clear_clicked = ui
                    .add_enabled(
                        !self.is_busy && !self.transcript.is_empty(),
                        egui::Button::new("🗑 Clear chat"),
                    )
                    .clicked();

                ui.separator();
                egui::CollapsingHeader::new("Diagnostics")
                    .default_open(false)
                    .show(ui, |ui| {
                        ScrollArea::vertical()
                            .id_salt("diagnostics_log")
                            .max_height(240.0)
                            .stick_to_bottom(true)
                            .show(ui, |ui| {
                                for entry in &self.diagnostics_log {
                                    ui.label(RichText::new(entry).small());
                                }
                            });
                    });
            });

        if let Some(model) = chosen_model {
            if self.controller.select_model(model) {
                self.selected_model = model.to_string();
            }
        }
        if clear_clicked {
            self.clear_chat(ctx);
        }
    }

    fn render_transcript(&self, ui: &mut egui::Ui) -> Option<TurnAction> {
        let mut action = None;

        if self.transcript.is_empty() && !self.is_busy {
            ui.vertical_centered(|ui| {
                ui.add_space(40.0);
                ui.heading("🤖 Hi! How can I help you today?");
                ui.label(RichText::new("Pick a model on the left to answer").color(Color32::GRAY));
            });
            return None;
        }

        for message in &self.transcript {
            ui.group(|ui| {
                ui.horizontal(|ui| {
                    let header = match message.role {
                        Role::User => "You".to_string(),
                        Role::Assistant => models::turn_label(
                            message.model.as_deref(),
                            message.is_text_extraction.unwrap_or(false),
                        ),
                    };
                    ui.strong(header);
                    ui.label(
                        RichText::new(message.timestamp.clock_label())
                            .small()
                            .color(Color32::GRAY),
                    );
                });

                if let Some(image) = &message.image {
                    ui.horizontal(|ui| {
                        let size = if image.file.is_empty() {
                            "file unavailable".to_string()
                        } else {
                            format!("{} bytes", image.file.size())
                        };
                        ui.label(format!("🖼 {} ({size})", image.file.name));
                        if message.role == Role::User
                            && ui
                                .add_enabled(!self.is_busy, egui::Button::new("📝 Extract text"))
                                .clicked()
                        {
                            action = Some(TurnAction::ExtractText(image.clone()));
                        }
                    });
                }

                ui.label(&message.content);

                if message.role == Role::Assistant
                    && ui
                        .add_enabled(
                            !message.content.trim().is_empty(),
                            egui::Button::new("🔊 Speak").small(),
                        )
                        .clicked()
                {
                    action = Some(TurnAction::Speak {
                        message_id: message.id.clone(),
                        text: message.content.clone(),
                    });
                }
            });
        }

        if self.is_busy {
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label(RichText::new("Thinking...").color(Color32::GRAY));
            });
        }

        action
    }

    fn render_loading(&self, ui: &mut egui::Ui) {
        ui.vertical_centered(|ui| {
            ui.add_space(80.0);
            ui.spinner();
            let stage = if !self.hydration_settled {
                "Initializing..."
            } else {
                "Loading AI system..."
            };
            ui.label(stage);
            ui.label(RichText::new("Preparing the assistant").small().color(Color32::GRAY));
        });
    }

    fn render_center_panel(&mut self, ctx: &egui::Context) {
        let mut action = None;
        let mut send_now = false;
        let mut attach_now = false;

        egui::CentralPanel::default().show(ctx, |ui| {
            if !self.hydration_settled || self.capability_status == CapabilityStatus::Loading {
                self.render_loading(ui);
                return;
            }

            let transcript_height = (ui.available_height() - 110.0).max(120.0);
            ScrollArea::vertical()
                .id_salt("chat_transcript")
                .max_height(transcript_height)
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    action = self.render_transcript(ui);
                    if self.scroll_to_bottom {
                        ui.scroll_to_cursor(Some(egui::Align::BOTTOM));
                    }
                });
            self.scroll_to_bottom = false;

            ui.separator();
            let input_enabled = self.input_enabled();

            ui.horizontal(|ui| {
                let width = ui.available_width() - 90.0;
                ui.add_enabled(
                    input_enabled,
                    egui::TextEdit::singleline(&mut self.image_path)
                        .desired_width(width)
                        .hint_text("Image path (png, jpg, gif, webp)"),
                );
                attach_now = ui
                    .add_enabled(input_enabled && !self.attaching, egui::Button::new("📎 Attach"))
                    .clicked();
            });

            if let Some(name) = self.pending_image.as_ref().map(|image| image.file.name.clone()) {
                let mut remove = false;
                ui.horizontal(|ui| {
                    ui.label(format!("🖼 {name} ready to send"));
                    remove = ui.small_button("✖").clicked();
                });
                if remove {
                    self.pending_image = None;
                }
            }

            let hint = match self.capability_status {
                CapabilityStatus::Unavailable => "AI is unavailable",
                _ if self.is_busy => "Waiting for response...",
                _ => "Ask me anything...",
            };
            ui.horizontal(|ui| {
                let width = ui.available_width() - 70.0;
                let response = ui.add_enabled(
                    input_enabled,
                    egui::TextEdit::singleline(&mut self.input_buffer)
                        .desired_width(width)
                        .hint_text(hint),
                );
                if response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter)) {
                    send_now = true;
                }

                let has_input =
                    !self.input_buffer.trim().is_empty() || self.pending_image.is_some();
                send_now |= ui
                    .add_enabled(input_enabled && has_input, egui::Button::new("Send"))
                    .clicked();
            });
            send_now &= input_enabled;
        });

        if attach_now {
            self.attach_image(ctx);
        }
        if send_now {
            self.submit_prompt(ctx);
        }
        if let Some(action) = action {
            self.run_action(action, ctx);
        }
    }
}

async fn attach_from_path(path: PathBuf, tx: Sender<AppEvent>) {
    let event = match load_image(&path).await {
        Ok(image) => AppEvent::ImageAttached(image),
        Err(err) => AppEvent::AttachFailed(err.to_string()),
    };
    let _ = tx.send(event);
}

async fn save_speech(
    controller: &ConversationController,
    speech_dir: &Path,
    message_id: &str,
    text: &str,
) -> anyhow::Result<PathBuf> {
    let audio = controller.speak(text).await?;
    tokio::fs::create_dir_all(speech_dir).await?;
    let path = speech_dir.join(format!("{message_id}.mp3"));
    tokio::fs::write(&path, audio).await?;
    Ok(path)
}

impl eframe::App for MonicaApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events(ctx);
        self.render_top_bar(ctx);
        self.render_left_panel(ctx);
        self.render_center_panel(ctx);
    }
}
