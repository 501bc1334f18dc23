//! Validation of draft configurations against hardware capabilities.
//!
//! The geometric and mode checks are done here; the composition limits of
//! the actual hardware (layer count, blending, transforms...) are behind
//! the `CompositionEngine` trait, which reports the remediation operations
//! a client must perform in software when a stack is individually legal but
//! not realizable. `SoftwareEngine` is a configurable reference
//! implementation of that trait.

use enumn::N;
use log::warn;

use crate::display::DisplayInfo;
use crate::layer::LayerConfig;
use crate::{ColorConversion, DisplayId, DisplayMode, LayerId};

/// Outcome of `check_config`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ConfigResult {
    Ok = 0,
    /// A layer's geometry or variant state is illegal regardless of
    /// hardware.
    InvalidConfig = 1,
    /// Individually legal, but the hardware cannot realize the stack; the
    /// accompanying op list describes the minimal client-side remediation.
    UnsupportedConfig = 2,
    TooManyDisplays = 3,
    UnsupportedDisplayModes = 4,
}

/// Remediation a client can apply in software to make a stack acceptable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CompositionOpcode {
    /// Compose everything into the single primary layer.
    UsePrimary = 0,
    /// This layer remains scanned out; others are merged into it. At most
    /// one layer per display may carry this.
    MergeBase = 1,
    /// Merge this layer into the merge base.
    MergeSrc = 2,
    /// Scale from the source frame to the destination frame in software.
    FrameScale = 3,
    /// Crop to the source frame in software.
    SrcFrame = 4,
    /// Apply the layer transform in software.
    Transform = 5,
    /// Apply the display's color conversion in software.
    ColorConversion = 6,
    /// Apply alpha blending in software.
    Alpha = 7,
}

/// One remediation step, targeted at one layer of one display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientCompositionOp {
    pub display_id: DisplayId,
    pub layer_id: LayerId,
    pub opcode: CompositionOpcode,
}

bitflags::bitflags! {
    /// Composition features a hardware engine may support natively.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EngineFeatures: u32 {
        const SCALING = 1 << 0;
        const CROPPING = 1 << 1;
        const TRANSFORMS = 1 << 2;
        const COLOR_CONVERSION = 1 << 3;
        const PER_LAYER_ALPHA = 1 << 4;
    }
}

/// A layer as seen by the capability predicate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerView {
    pub id: LayerId,
    pub config: LayerConfig,
}

/// One display's draft as submitted for validation.
#[derive(Debug)]
pub struct DisplayDraft<'a> {
    pub info: &'a DisplayInfo,
    pub mode: DisplayMode,
    pub color_conversion: ColorConversion,
    /// Z-ordered, bottom first.
    pub layers: Vec<LayerView>,
}

/// Black-box hardware composition predicate.
pub trait CompositionEngine: Send {
    /// Number of displays the hardware can drive at once.
    fn max_displays(&self) -> usize;

    /// Checks whether the hardware can realize `layers` on `display` as
    /// drafted. An empty return means it can; otherwise the returned ops
    /// are the remediation the client must perform, in stack order.
    fn check_stack(&self, draft: &DisplayDraft<'_>) -> Vec<ClientCompositionOp>;
}

/// Runs the capability checks over a set of drafts, in the order: display
/// count, display modes, per-layer geometry, engine predicate.
pub fn check_drafts(
    drafts: &[DisplayDraft<'_>],
    engine: &dyn CompositionEngine,
) -> (ConfigResult, Vec<ClientCompositionOp>) {
    if drafts.len() > engine.max_displays() {
        return (ConfigResult::TooManyDisplays, Vec::new());
    }

    for draft in drafts {
        if !draft.info.supports_mode(&draft.mode) {
            return (ConfigResult::UnsupportedDisplayModes, Vec::new());
        }
    }

    for draft in drafts {
        for layer in &draft.layers {
            if !layer_geometry_is_valid(draft, layer) {
                return (ConfigResult::InvalidConfig, Vec::new());
            }
        }
    }

    let mut ops = Vec::new();
    for draft in drafts {
        let mut display_ops = engine.check_stack(draft);
        enforce_single_merge_base(draft.info.id, &mut display_ops);
        ops.extend(display_ops);
    }

    if ops.is_empty() {
        (ConfigResult::Ok, ops)
    } else {
        (ConfigResult::UnsupportedConfig, ops)
    }
}

fn layer_geometry_is_valid(draft: &DisplayDraft<'_>, layer: &LayerView) -> bool {
    match &layer.config {
        LayerConfig::Primary(primary) => {
            let image = &primary.image_config;
            if primary.src_frame.is_empty() || primary.dest_frame.is_empty() {
                return false;
            }
            if !primary.src_frame.fits_within(image.width, image.height) {
                return false;
            }
            primary.dest_frame.fits_within(
                draft.mode.horizontal_resolution,
                draft.mode.vertical_resolution,
            )
        }
        LayerConfig::Cursor(cursor) => {
            // Cursor planes only accept the configs the display advertises.
            draft.info.cursor_configs.contains(&cursor.image_config)
        }
        LayerConfig::Color(color) => color.format.bytes_per_pixel().is_some(),
    }
}

/// At most one layer per display may be the merge base; extra bases
/// reported by an engine are demoted to merge sources.
fn enforce_single_merge_base(display_id: DisplayId, ops: &mut [ClientCompositionOp]) {
    let mut base_seen = false;
    for op in ops.iter_mut() {
        if op.opcode != CompositionOpcode::MergeBase {
            continue;
        }
        if base_seen {
            warn!(
                "engine reported a second merge base for display {}, demoting layer {} to merge source",
                display_id, op.layer_id
            );
            op.opcode = CompositionOpcode::MergeSrc;
        }
        base_seen = true;
    }
}

/// Reference engine with configurable limits. Stands in for real hardware
/// capability logic in tests and single-process deployments.
#[derive(Clone, Debug)]
pub struct SoftwareEngine {
    pub max_displays: usize,
    /// Layers the "hardware" can scan out per display.
    pub max_layers: usize,
    pub features: EngineFeatures,
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self {
            max_displays: 2,
            max_layers: 4,
            features: EngineFeatures::all(),
        }
    }
}

impl CompositionEngine for SoftwareEngine {
    fn max_displays(&self) -> usize {
        self.max_displays
    }

    fn check_stack(&self, draft: &DisplayDraft<'_>) -> Vec<ClientCompositionOp> {
        let mut ops = Vec::new();
        let display_id = draft.info.id;

        if draft.layers.len() > self.max_layers {
            // Keep the bottom layer on the hardware and fold the rest into
            // it.
            for (index, layer) in draft.layers.iter().enumerate() {
                ops.push(ClientCompositionOp {
                    display_id,
                    layer_id: layer.id,
                    opcode: if index == 0 {
                        CompositionOpcode::MergeBase
                    } else {
                        CompositionOpcode::MergeSrc
                    },
                });
            }
            return ops;
        }

        if !draft.color_conversion.is_identity()
            && !self.features.contains(EngineFeatures::COLOR_CONVERSION)
        {
            if let Some(bottom) = draft.layers.first() {
                ops.push(ClientCompositionOp {
                    display_id,
                    layer_id: bottom.id,
                    opcode: CompositionOpcode::ColorConversion,
                });
            }
        }

        for layer in &draft.layers {
            let primary = match &layer.config {
                LayerConfig::Primary(primary) => primary,
                _ => continue,
            };

            let scaled = primary.src_frame.width != primary.dest_frame.width
                || primary.src_frame.height != primary.dest_frame.height;
            let cropped = primary.src_frame.width != primary.image_config.width
                || primary.src_frame.height != primary.image_config.height;
            if scaled && !self.features.contains(EngineFeatures::SCALING) {
                // Scaling subsumes cropping: never report both for one
                // layer.
                ops.push(ClientCompositionOp {
                    display_id,
                    layer_id: layer.id,
                    opcode: CompositionOpcode::FrameScale,
                });
            } else if cropped && !self.features.contains(EngineFeatures::CROPPING) {
                ops.push(ClientCompositionOp {
                    display_id,
                    layer_id: layer.id,
                    opcode: CompositionOpcode::SrcFrame,
                });
            }

            if primary.transform != crate::Transform::Identity
                && !self.features.contains(EngineFeatures::TRANSFORMS)
            {
                ops.push(ClientCompositionOp {
                    display_id,
                    layer_id: layer.id,
                    opcode: CompositionOpcode::Transform,
                });
            }

            if primary.alpha_mode != crate::AlphaMode::Disable
                && !self.features.contains(EngineFeatures::PER_LAYER_ALPHA)
            {
                ops.push(ClientCompositionOp {
                    display_id,
                    layer_id: layer.id,
                    opcode: CompositionOpcode::Alpha,
                });
            }
        }

        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::PrimaryConfig;
    use crate::{Frame, ImageConfig, PixelFormat};

    fn display_info(id: DisplayId) -> DisplayInfo {
        DisplayInfo {
            id,
            modes: vec![DisplayMode {
                horizontal_resolution: 1920,
                vertical_resolution: 1080,
                refresh_rate_e2: 6000,
            }],
            pixel_formats: vec![PixelFormat::from(b"AR24")],
            cursor_configs: vec![cursor_config()],
        }
    }

    fn cursor_config() -> ImageConfig {
        ImageConfig {
            width: 64,
            height: 64,
            pixel_format: PixelFormat::from(b"AR24"),
            ..Default::default()
        }
    }

    fn primary_view(id: LayerId, src: Frame, dest: Frame) -> LayerView {
        let image_config = ImageConfig {
            width: 800,
            height: 600,
            pixel_format: PixelFormat::from(b"AR24"),
            ..Default::default()
        };
        let mut primary = PrimaryConfig::new(image_config);
        primary.src_frame = src;
        primary.dest_frame = dest;
        LayerView {
            id,
            config: LayerConfig::Primary(primary),
        }
    }

    fn draft<'a>(info: &'a DisplayInfo, layers: Vec<LayerView>) -> DisplayDraft<'a> {
        DisplayDraft {
            info,
            mode: info.preferred_mode(),
            color_conversion: ColorConversion::IDENTITY,
            layers,
        }
    }

    #[test]
    fn scaled_full_screen_layer_is_ok() {
        let info = display_info(1);
        let drafts = vec![draft(
            &info,
            vec![primary_view(
                1,
                Frame::new(0, 0, 800, 600),
                Frame::new(0, 0, 1920, 1080),
            )],
        )];
        let engine = SoftwareEngine::default();
        let (result, ops) = check_drafts(&drafts, &engine);
        assert_eq!(result, ConfigResult::Ok);
        assert!(ops.is_empty());
    }

    #[test]
    fn dest_frame_outside_display_is_invalid() {
        let info = display_info(1);
        let drafts = vec![draft(
            &info,
            vec![primary_view(
                1,
                Frame::new(0, 0, 800, 600),
                Frame::new(0, 0, 2000, 1080),
            )],
        )];
        let engine = SoftwareEngine::default();
        let (result, ops) = check_drafts(&drafts, &engine);
        assert_eq!(result, ConfigResult::InvalidConfig);
        assert!(ops.is_empty());
    }

    #[test]
    fn src_frame_outside_image_is_invalid() {
        let info = display_info(1);
        let drafts = vec![draft(
            &info,
            vec![primary_view(
                1,
                Frame::new(100, 0, 800, 600),
                Frame::new(0, 0, 800, 600),
            )],
        )];
        let (result, _) = check_drafts(&drafts, &SoftwareEngine::default());
        assert_eq!(result, ConfigResult::InvalidConfig);
    }

    #[test]
    fn unsupported_mode_is_reported() {
        let info = display_info(1);
        let mut bad = draft(&info, vec![]);
        bad.mode.horizontal_resolution = 640;
        let (result, _) = check_drafts(&[bad], &SoftwareEngine::default());
        assert_eq!(result, ConfigResult::UnsupportedDisplayModes);
    }

    #[test]
    fn too_many_displays_is_reported() {
        let info_a = display_info(1);
        let info_b = display_info(2);
        let drafts = vec![draft(&info_a, vec![]), draft(&info_b, vec![])];
        let engine = SoftwareEngine {
            max_displays: 1,
            ..Default::default()
        };
        let (result, _) = check_drafts(&drafts, &engine);
        assert_eq!(result, ConfigResult::TooManyDisplays);
    }

    #[test]
    fn overflowing_stack_yields_merge_ops() {
        let info = display_info(1);
        let full = Frame::new(0, 0, 800, 600);
        let layers = (1..=3)
            .map(|id| primary_view(id, full, full))
            .collect();
        let engine = SoftwareEngine {
            max_layers: 2,
            ..Default::default()
        };
        let (result, ops) = check_drafts(&[draft(&info, layers)], &engine);
        assert_eq!(result, ConfigResult::UnsupportedConfig);
        assert_eq!(
            ops.iter().map(|op| op.opcode).collect::<Vec<_>>(),
            vec![
                CompositionOpcode::MergeBase,
                CompositionOpcode::MergeSrc,
                CompositionOpcode::MergeSrc,
            ]
        );
        assert!(ops.iter().all(|op| op.display_id == 1));
    }

    #[test]
    fn scaling_without_support_wins_over_cropping() {
        let info = display_info(1);
        // Cropped *and* scaled: only FrameScale must be reported.
        let layers = vec![primary_view(
            7,
            Frame::new(0, 0, 400, 300),
            Frame::new(0, 0, 800, 600),
        )];
        let engine = SoftwareEngine {
            features: EngineFeatures::all() - EngineFeatures::SCALING - EngineFeatures::CROPPING,
            ..Default::default()
        };
        let (result, ops) = check_drafts(&[draft(&info, layers)], &engine);
        assert_eq!(result, ConfigResult::UnsupportedConfig);
        assert_eq!(
            ops,
            vec![ClientCompositionOp {
                display_id: 1,
                layer_id: 7,
                opcode: CompositionOpcode::FrameScale,
            }]
        );
    }

    #[test]
    fn second_merge_base_is_demoted() {
        struct TwoBases;
        impl CompositionEngine for TwoBases {
            fn max_displays(&self) -> usize {
                1
            }
            fn check_stack(&self, draft: &DisplayDraft<'_>) -> Vec<ClientCompositionOp> {
                draft
                    .layers
                    .iter()
                    .map(|layer| ClientCompositionOp {
                        display_id: draft.info.id,
                        layer_id: layer.id,
                        opcode: CompositionOpcode::MergeBase,
                    })
                    .collect()
            }
        }

        let info = display_info(1);
        let full = Frame::new(0, 0, 800, 600);
        let layers = vec![primary_view(1, full, full), primary_view(2, full, full)];
        let (result, ops) = check_drafts(&[draft(&info, layers)], &TwoBases);
        assert_eq!(result, ConfigResult::UnsupportedConfig);
        assert_eq!(ops[0].opcode, CompositionOpcode::MergeBase);
        assert_eq!(ops[1].opcode, CompositionOpcode::MergeSrc);
    }

    #[test]
    fn unadvertised_cursor_config_is_invalid() {
        let info = display_info(1);
        let mut other = cursor_config();
        other.width = 128;
        let layers = vec![LayerView {
            id: 1,
            config: LayerConfig::Cursor(crate::layer::CursorConfig {
                image_config: other,
                x: 0,
                y: 0,
            }),
        }];
        let (result, _) = check_drafts(&[draft(&info, layers)], &SoftwareEngine::default());
        assert_eq!(result, ConfigResult::InvalidConfig);
    }
}
