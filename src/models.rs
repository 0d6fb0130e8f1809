pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
}

pub static MODELS: [ModelInfo; 2] = [
    ModelInfo {
        id: "claude-opus-4",
        name: "Claude Opus 4",
        description: "Most intelligent model for complex tasks",
        icon: "🧠",
    },
    ModelInfo {
        id: "claude-sonnet-4",
        name: "Claude Sonnet 4",
        description: "Optimal balance of intelligence, cost, and speed",
        icon: "⚡",
    },
];

pub fn find(id: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|model| model.id == id)
}

pub fn turn_label(model: Option<&str>, is_text_extraction: bool) -> String {
    let model = match model.and_then(find) {
        Some(info) => format!("{} {}", info.icon, info.name),
        None => model.unwrap_or("Assistant").to_string(),
    };
    if is_text_extraction {
        format!("📝 Image analysis • {model}")
    } else {
        model
    }
}
