use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discovery entry for one registered tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON Schema the params must satisfy
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result of `take_screenshot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotResult {
    /// Resolved absolute path the image was written to
    pub path: String,
    /// Size of the written file
    pub bytes: u64,
    /// Base64 image data, only when `encoded` was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Bounding box of an element in view coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementPosition {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementPosition {
    /// Point in the middle of the box (where synthesized clicks land)
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}
