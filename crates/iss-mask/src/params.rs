use crate::rle::CodecVersion;

/// Parameters controlling how payloads are built.
///
/// Defaults match the browser editor: a 12-color class palette, a
/// 1920x1080 fallback frame size, and the current blob layout.
#[derive(Debug, Clone)]
pub struct MaskParams {
    /// Blob layout written by `build()`.
    pub codec_version: CodecVersion,
    /// Class colors, indexed by `class_id % palette.len()`.
    pub palette: Vec<String>,
    /// Frame width used when the editor reports 0.
    pub fallback_width: u32,
    /// Frame height used when the editor reports 0.
    pub fallback_height: u32,
    /// Class name used when a live instance carries none.
    pub default_class_name: String,
}

impl MaskParams {
    pub fn new() -> Self {
        let palette = [
            "#FF0000", "#00FF00", "#0000FF", "#FFFF00", "#FF00FF", "#00FFFF", "#FF8000", "#8000FF",
            "#00FF80", "#FF0080", "#80FF00", "#0080FF",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();

        MaskParams {
            codec_version: CodecVersion::CURRENT,
            palette,
            fallback_width: 1920,
            fallback_height: 1080,
            default_class_name: "Unknown".into(),
        }
    }

    /// Deterministic color for a class id.
    pub fn class_color(&self, class_id: u32) -> String {
        if self.palette.is_empty() {
            return "#FFFFFF".into();
        }
        self.palette[class_id as usize % self.palette.len()].clone()
    }
}

impl Default for MaskParams {
    fn default() -> Self {
        Self::new()
    }
}
