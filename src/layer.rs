//! Per-layer configuration and the pending/active image state machine.
//!
//! A layer starts empty, is given a variant configuration (primary, cursor
//! or color), and can then be attached to one display's layer stack. Image
//! content advances independently of layout: `set_image` appends to a FIFO
//! of waiting images, and each entry becomes the active image when its wait
//! fence signals (immediately when it has none). Layout only changes through
//! `apply_config`.

use std::collections::VecDeque;

use crate::{
    AlphaMode, ColorConfig, DisplayId, FenceId, Frame, ImageConfig, ImageId, Transform,
};

/// Configuration of a primary (full-featured, scannable) layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrimaryConfig {
    /// Config images applied to this layer must match exactly.
    pub image_config: ImageConfig,
    pub transform: Transform,
    /// Region of the source image to display, in image space (after
    /// `transform` is applied).
    pub src_frame: Frame,
    /// Placement on the display, in display space.
    pub dest_frame: Frame,
    pub alpha_mode: AlphaMode,
    /// Only meaningful for `AlphaMode::HwMultiply`; must be within
    /// [0.0, 1.0].
    pub alpha_value: f32,
}

impl PrimaryConfig {
    pub fn new(image_config: ImageConfig) -> Self {
        let full = Frame::new(0, 0, image_config.width, image_config.height);
        Self {
            image_config,
            transform: Transform::Identity,
            src_frame: full,
            dest_frame: full,
            alpha_mode: AlphaMode::Disable,
            alpha_value: 1.0,
        }
    }
}

/// Configuration of a cursor layer. The position may place the cursor
/// partially outside the display.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CursorConfig {
    pub image_config: ImageConfig,
    pub x: i32,
    pub y: i32,
}

/// The three layer variants.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LayerConfig {
    Primary(PrimaryConfig),
    Cursor(CursorConfig),
    Color(ColorConfig),
}

impl LayerConfig {
    /// The image config an applied image must match, or `None` for color
    /// layers, which cannot take images.
    pub fn expected_image_config(&self) -> Option<&ImageConfig> {
        match self {
            LayerConfig::Primary(primary) => Some(&primary.image_config),
            LayerConfig::Cursor(cursor) => Some(&cursor.image_config),
            LayerConfig::Color(_) => None,
        }
    }
}

/// An image waiting for its fence before becoming this layer's content.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingImage {
    pub image: ImageId,
    pub wait_fence: Option<FenceId>,
    pub signal_fence: Option<FenceId>,
}

/// The image currently shown by a layer, and the fence to fire when it
/// retires.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActiveImage {
    pub image: ImageId,
    pub signal_fence: Option<FenceId>,
}

/// Result of one image promotion: what to show, what retired, and which
/// waiting entries were skipped over and dropped.
#[derive(Debug, PartialEq)]
pub struct Promotion {
    pub activated: ImageId,
    pub retired: Option<ActiveImage>,
    pub dropped: Vec<PendingImage>,
}

/// One compositable slot.
#[derive(Debug, Default)]
pub struct Layer {
    config: Option<LayerConfig>,
    /// Display whose (pending) layer stack currently contains this layer.
    attached_to: Option<DisplayId>,
    waiting: VecDeque<PendingImage>,
    active: Option<ActiveImage>,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&LayerConfig> {
        self.config.as_ref()
    }

    pub fn config_mut(&mut self) -> Option<&mut LayerConfig> {
        self.config.as_mut()
    }

    pub fn attached_to(&self) -> Option<DisplayId> {
        self.attached_to
    }

    pub fn set_attached_to(&mut self, display: Option<DisplayId>) {
        self.attached_to = display;
    }

    pub fn active_image(&self) -> Option<&ActiveImage> {
        self.active.as_ref()
    }

    pub fn waiting_images(&self) -> impl Iterator<Item = &PendingImage> {
        self.waiting.iter()
    }

    /// (Re)configures the layer's variant. Both the waiting FIFO and the
    /// active slot are cleared, even when `config` is identical to the
    /// current one; the cleared entries are returned so the caller can
    /// settle their fence obligations.
    pub fn set_config(&mut self, config: LayerConfig) -> (Vec<PendingImage>, Option<ActiveImage>) {
        self.config = Some(config);
        let waiting = self.waiting.drain(..).collect();
        let active = self.active.take();
        (waiting, active)
    }

    /// Appends an image to the waiting FIFO. The caller has already
    /// verified the layer kind, the config match and the fence claims.
    pub fn push_image(&mut self, entry: PendingImage) {
        self.waiting.push_back(entry);
    }

    /// Index in the waiting FIFO of the entry waiting on `fence`.
    pub fn position_waiting_on(&self, fence: FenceId) -> Option<usize> {
        self.waiting
            .iter()
            .position(|entry| entry.wait_fence == Some(fence))
    }

    /// Promotes the waiting entry at `pos` to active. Entries queued before
    /// it never became visible and are dropped; entries queued after it
    /// keep waiting on their own fences.
    pub fn activate(&mut self, pos: usize) -> Promotion {
        debug_assert!(pos < self.waiting.len());
        let dropped: Vec<PendingImage> = self.waiting.drain(0..pos).collect();
        // The drain above shifted our entry to the front.
        let entry = self.waiting.pop_front().expect("activated entry must exist");
        let retired = self.active.replace(ActiveImage {
            image: entry.image,
            signal_fence: entry.signal_fence,
        });
        Promotion {
            activated: entry.image,
            retired,
            dropped,
        }
    }

    /// Whether `image` occupies the active slot or the waiting FIFO.
    pub fn references_image(&self, image: ImageId) -> bool {
        self.active.as_ref().map(|a| a.image) == Some(image)
            || self.waiting.iter().any(|entry| entry.image == image)
    }
}
