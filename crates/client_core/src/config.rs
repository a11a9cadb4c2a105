use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Images above this size are rejected before anything is sent.
    pub max_image_bytes: usize,
    pub event_buffer: usize,
    pub image_bucket: String,
    /// Shown for senders whose profile cannot be resolved.
    pub fallback_display_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            event_buffer: DEFAULT_EVENT_BUFFER,
            image_bucket: "chat-images".into(),
            fallback_display_name: "Member".into(),
        }
    }
}
