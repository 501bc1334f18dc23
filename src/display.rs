//! Physical displays and the per-client draft configurations built against
//! them.

use crate::{ColorConversion, DisplayId, DisplayMode, ImageConfig, LayerId, PixelFormat};

/// Static description of one physical output, as reported by the hardware
/// layer. The id is stable for the lifetime of the device.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayInfo {
    pub id: DisplayId,
    /// Supported timings; the first entry is the preferred one.
    pub modes: Vec<DisplayMode>,
    pub pixel_formats: Vec<PixelFormat>,
    /// Image configs usable on cursor layers of this display.
    pub cursor_configs: Vec<ImageConfig>,
}

impl DisplayInfo {
    pub fn preferred_mode(&self) -> DisplayMode {
        self.modes.first().copied().unwrap_or_default()
    }

    pub fn supports_mode(&self, mode: &DisplayMode) -> bool {
        self.modes.contains(mode)
    }
}

/// A client's draft layout for one display. Becomes active only through
/// `apply_config`.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingConfig {
    /// Layer stack in z-order, bottom first.
    pub layers: Vec<LayerId>,
    pub mode: DisplayMode,
    pub color_conversion: ColorConversion,
}

impl PendingConfig {
    /// A fresh draft: empty stack, preferred mode, identity color
    /// conversion.
    pub fn new(display: &DisplayInfo) -> Self {
        Self {
            layers: Vec::new(),
            mode: display.preferred_mode(),
            color_conversion: ColorConversion::IDENTITY,
        }
    }
}

/// The layout currently driven to hardware for one display, per client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActiveConfig {
    pub layers: Vec<LayerId>,
    pub mode: DisplayMode,
    pub color_conversion: ColorConversion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_support() {
        let mode_a = DisplayMode {
            horizontal_resolution: 1920,
            vertical_resolution: 1080,
            refresh_rate_e2: 6000,
        };
        let mode_b = DisplayMode {
            horizontal_resolution: 1280,
            vertical_resolution: 720,
            refresh_rate_e2: 6000,
        };
        let display = DisplayInfo {
            id: 1,
            modes: vec![mode_a, mode_b],
            pixel_formats: vec![PixelFormat::from(b"AR24")],
            cursor_configs: vec![],
        };
        assert_eq!(display.preferred_mode(), mode_a);
        assert!(display.supports_mode(&mode_b));
        assert!(!display.supports_mode(&DisplayMode::default()));

        let pending = PendingConfig::new(&display);
        assert!(pending.layers.is_empty());
        assert_eq!(pending.mode, mode_a);
        assert!(pending.color_conversion.is_identity());
    }
}
