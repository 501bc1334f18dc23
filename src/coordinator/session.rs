//! The per-client operation surface.
//!
//! A `ClientSession` is what a transport hands to one connected client.
//! Operations come in two error tiers: `ProtocolError` returns are fatal
//! (a transport is expected to drop the session, which disconnects the
//! client), while recoverable outcomes such as import failures or
//! validation results are ordinary return values.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use super::{ClientState, CoreState, ImageRecord, Shared};
use crate::display::{ActiveConfig, DisplayInfo, PendingConfig};
use crate::fence::{FenceRecord, SyncEvent};
use crate::layer::{CursorConfig, Layer, LayerConfig, PendingImage, PrimaryConfig};
use crate::memory::{self, AllocateBufferError, SharedBuffer};
use crate::validate::{check_drafts, ClientCompositionOp, ConfigResult, DisplayDraft, LayerView};
use crate::{
    AlphaMode, ClientRole, ColorConfig, ColorConversion, DisplayId, DisplayMode, FenceId, Frame,
    ImageConfig, ImageId, ImageTiling, LayerId, PixelFormat, ProtocolError, ResourceKind,
    Transform, VirtconMode,
};

/// Recoverable import failures, reported as a status to the client.
#[derive(Debug, Error, PartialEq)]
pub enum ImportImageError {
    #[error("image config is not expressible by this device")]
    UnsupportedConfig,
    #[error("buffer of {actual} bytes cannot back the image ({required} bytes required)")]
    BufferTooSmall { required: u64, actual: u64 },
}

/// One client's handle into the coordinator. Dropping it disconnects the
/// client: its resources are torn down and its role slot frees up.
pub struct ClientSession {
    shared: Arc<Shared>,
    role: ClientRole,
}

impl ClientSession {
    pub(crate) fn new(shared: Arc<Shared>, role: ClientRole) -> Self {
        Self { shared, role }
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    fn with_client<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        let mut core = self.shared.state.lock().unwrap();
        let client = core
            .client_mut(self.role)
            .expect("a live session keeps its client slot");
        f(client)
    }

    /// Like `with_client`, for operations that can tear down watched wait
    /// fences. `f` collects candidate tokens; those still claimed by any
    /// connected client (clones of one primitive may be imported by both)
    /// stay registered, the rest are deregistered before the lock drops so
    /// no new claim can race the deregistration.
    fn with_client_sweep<R>(&self, f: impl FnOnce(&mut ClientState, &mut Vec<u64>) -> R) -> R {
        let mut core = self.shared.state.lock().unwrap();
        let mut unwatch = Vec::new();
        let client = core
            .client_mut(self.role)
            .expect("a live session keeps its client slot");
        let result = f(client, &mut unwatch);
        self.shared.unwatch_stale(&core, unwatch);
        result
    }

    /// Like `with_client`, with read access to the display topology.
    fn with_parts<R>(&self, f: impl FnOnce(&BTreeMap<DisplayId, DisplayInfo>, &mut ClientState) -> R) -> R {
        let mut core = self.shared.state.lock().unwrap();
        let CoreState {
            displays,
            primary,
            virtcon,
            ..
        } = &mut *core;
        let client = match self.role {
            ClientRole::Primary => primary,
            ClientRole::Virtcon => virtcon,
        }
        .as_mut()
        .expect("a live session keeps its client slot");
        f(displays, client)
    }

    /// Stride in pixels the service expects of a linear image of `width`.
    pub fn compute_linear_image_stride(&self, width: u32, format: PixelFormat) -> u32 {
        memory::compute_linear_image_stride(width, format)
    }

    /// Allocates a shareable buffer suitable for image import.
    pub fn allocate_vmo(&self, size: u64) -> Result<SharedBuffer, AllocateBufferError> {
        SharedBuffer::allocate(size)
    }

    /// Imports `buffer` as an image of `config`, returning the new image
    /// id. The buffer must be large enough to back the config.
    pub fn import_vmo_image(
        &self,
        config: ImageConfig,
        buffer: SharedBuffer,
    ) -> Result<ImageId, ImportImageError> {
        if config.tiling != ImageTiling::Linear {
            return Err(ImportImageError::UnsupportedConfig);
        }
        let required =
            memory::required_size_bytes(&config).ok_or(ImportImageError::UnsupportedConfig)?;
        if buffer.size() < required {
            return Err(ImportImageError::BufferTooSmall {
                required,
                actual: buffer.size(),
            });
        }

        Ok(self.with_client(move |client| {
            let id = client.allocate_image_id();
            let record = ImageRecord {
                config,
                buffer,
                released: false,
            };
            client
                .images
                .insert(id, record)
                .expect("allocated image ids are unbound");
            debug!("imported {}x{} image as id {}", config.width, config.height, id);
            id
        }))
    }

    /// Releases an image id. Teardown is deferred while any layer still
    /// references the image, but the id is gone for future operations
    /// either way.
    pub fn release_image(&self, image: ImageId) -> Result<(), ProtocolError> {
        self.with_client_sweep(|client, unwatch| {
            client.images.get_mut(image)?.released = true;
            client.sweep(unwatch);
            Ok(())
        })
    }

    /// Imports a signaling primitive under the client-chosen id `id`.
    /// Importing the same primitive under a second id is fatal.
    pub fn import_event(&self, event: SyncEvent, id: FenceId) -> Result<(), ProtocolError> {
        self.with_client(|client| {
            let token = event.token();
            if let Some(&existing) = client.fence_tokens.get(&token) {
                return Err(ProtocolError::PrimitiveAlreadyImported(existing));
            }
            client.fences.insert(id, FenceRecord::new(event))?;
            client.fence_tokens.insert(token, id);
            Ok(())
        })
    }

    /// Releases a fence id. Waits and signals already scheduled on it
    /// still complete; teardown happens once both sides are quiet.
    pub fn release_event(&self, id: FenceId) -> Result<(), ProtocolError> {
        self.with_client_sweep(|client, unwatch| {
            client.fences.get_mut(id)?.released = true;
            client.sweep(unwatch);
            Ok(())
        })
    }

    /// Creates an unconfigured layer and returns its id.
    pub fn create_layer(&self) -> Result<LayerId, ProtocolError> {
        self.with_client(|client| {
            let id = client.allocate_layer_id();
            client.layers.insert(id, Layer::new())?;
            Ok(id)
        })
    }

    /// Destroys a layer. Fatal while the layer is part of any display's
    /// pending or active layer stack.
    pub fn destroy_layer(&self, layer_id: LayerId) -> Result<(), ProtocolError> {
        self.with_client_sweep(|client, unwatch| {
            let attached = client.layers.get(layer_id)?.attached_to().is_some();
            let in_active = client
                .active
                .values()
                .any(|config| config.layers.contains(&layer_id));
            if attached || in_active {
                return Err(ProtocolError::ResourceInUse(ResourceKind::Layer, layer_id));
            }

            let layer = client.layers.remove(layer_id)?;
            let waiting: Vec<PendingImage> = layer.waiting_images().copied().collect();
            let active = layer.active_image().copied();
            client.drop_entries(waiting, unwatch);
            if let Some(active) = active {
                client.retire_active(active);
            }
            client.sweep(unwatch);
            Ok(())
        })
    }

    /// Drafts a display mode change. Whether the display supports the mode
    /// is decided at validation, not here.
    pub fn set_display_mode(
        &self,
        display_id: DisplayId,
        mode: DisplayMode,
    ) -> Result<(), ProtocolError> {
        self.with_parts(|displays, client| {
            pending_entry(displays, client, display_id)?.mode = mode;
            client.bump_version();
            Ok(())
        })
    }

    pub fn set_display_color_conversion(
        &self,
        display_id: DisplayId,
        color_conversion: ColorConversion,
    ) -> Result<(), ProtocolError> {
        self.with_parts(|displays, client| {
            pending_entry(displays, client, display_id)?.color_conversion = color_conversion;
            client.bump_version();
            Ok(())
        })
    }

    /// Drafts `layers` as the z-ordered (bottom first) stack of
    /// `display_id`. Layers leaving the stack detach; entering ones attach.
    pub fn set_display_layers(
        &self,
        display_id: DisplayId,
        layers: Vec<LayerId>,
    ) -> Result<(), ProtocolError> {
        self.with_parts(|displays, client| {
            if !displays.contains_key(&display_id) {
                return Err(ProtocolError::UnknownId(ResourceKind::Display, display_id));
            }
            for (index, &layer_id) in layers.iter().enumerate() {
                if layers[..index].contains(&layer_id) {
                    return Err(ProtocolError::DuplicateId(ResourceKind::Layer, layer_id));
                }
                let layer = client.layers.get(layer_id)?;
                if layer.attached_to().is_some_and(|d| d != display_id) {
                    return Err(ProtocolError::LayerOnOtherDisplay(layer_id));
                }
            }

            let old: Vec<LayerId> = client
                .pending
                .get(&display_id)
                .map(|pending| pending.layers.clone())
                .unwrap_or_default();
            for &layer_id in &old {
                if !layers.contains(&layer_id) {
                    if let Ok(layer) = client.layers.get_mut(layer_id) {
                        layer.set_attached_to(None);
                    }
                }
            }
            for &layer_id in &layers {
                if let Ok(layer) = client.layers.get_mut(layer_id) {
                    layer.set_attached_to(Some(display_id));
                }
            }

            pending_entry(displays, client, display_id)?.layers = layers;
            client.bump_version();
            Ok(())
        })
    }

    /// (Re)configures a layer as a primary layer showing images of
    /// `image_config`. Transform, frames and alpha reset to their
    /// full-frame defaults; any queued or active image is dropped.
    pub fn set_layer_primary_config(
        &self,
        layer_id: LayerId,
        image_config: ImageConfig,
    ) -> Result<(), ProtocolError> {
        self.configure_layer(
            layer_id,
            LayerConfig::Primary(PrimaryConfig::new(image_config)),
        )
    }

    /// Adjusts a primary layer's transform and frames without touching its
    /// image pipeline.
    pub fn set_layer_primary_position(
        &self,
        layer_id: LayerId,
        transform: Transform,
        src_frame: Frame,
        dest_frame: Frame,
    ) -> Result<(), ProtocolError> {
        self.with_client(|client| {
            match client.layers.get_mut(layer_id)?.config_mut() {
                Some(LayerConfig::Primary(primary)) => {
                    primary.transform = transform;
                    primary.src_frame = src_frame;
                    primary.dest_frame = dest_frame;
                }
                _ => return Err(ProtocolError::WrongLayerKind(layer_id)),
            }
            client.bump_version();
            Ok(())
        })
    }

    pub fn set_layer_primary_alpha(
        &self,
        layer_id: LayerId,
        alpha_mode: AlphaMode,
        alpha_value: f32,
    ) -> Result<(), ProtocolError> {
        // NaN fails the range check as well.
        if !(0.0..=1.0).contains(&alpha_value) {
            return Err(ProtocolError::InvalidAlphaValue(alpha_value));
        }
        self.with_client(|client| {
            match client.layers.get_mut(layer_id)?.config_mut() {
                Some(LayerConfig::Primary(primary)) => {
                    primary.alpha_mode = alpha_mode;
                    primary.alpha_value = alpha_value;
                }
                _ => return Err(ProtocolError::WrongLayerKind(layer_id)),
            }
            client.bump_version();
            Ok(())
        })
    }

    /// (Re)configures a layer as a cursor layer. The position resets to
    /// the origin; any queued or active image is dropped.
    pub fn set_layer_cursor_config(
        &self,
        layer_id: LayerId,
        image_config: ImageConfig,
    ) -> Result<(), ProtocolError> {
        self.configure_layer(
            layer_id,
            LayerConfig::Cursor(CursorConfig {
                image_config,
                x: 0,
                y: 0,
            }),
        )
    }

    /// Moves a cursor layer. This is a content-cadence operation: it does
    /// not invalidate a previous validation.
    pub fn set_layer_cursor_position(
        &self,
        layer_id: LayerId,
        x: i32,
        y: i32,
    ) -> Result<(), ProtocolError> {
        self.with_client(|client| {
            match client.layers.get_mut(layer_id)?.config_mut() {
                Some(LayerConfig::Cursor(cursor)) => {
                    cursor.x = x;
                    cursor.y = y;
                    Ok(())
                }
                _ => Err(ProtocolError::WrongLayerKind(layer_id)),
            }
        })
    }

    /// (Re)configures a layer as a solid color layer. Color layers take no
    /// images; any queued or active image is dropped.
    pub fn set_layer_color_config(
        &self,
        layer_id: LayerId,
        color: ColorConfig,
    ) -> Result<(), ProtocolError> {
        self.configure_layer(layer_id, LayerConfig::Color(color))
    }

    fn configure_layer(
        &self,
        layer_id: LayerId,
        config: LayerConfig,
    ) -> Result<(), ProtocolError> {
        self.with_client_sweep(|client, unwatch| {
            let (waiting, active) = client.layers.get_mut(layer_id)?.set_config(config);
            client.drop_entries(waiting, unwatch);
            if let Some(active) = active {
                client.retire_active(active);
            }
            client.bump_version();
            client.sweep(unwatch);
            Ok(())
        })
    }

    /// Queues `image` as the layer's next content. It becomes visible when
    /// `wait_fence` signals, or immediately without one; `signal_fence`
    /// fires when the image later retires. Queued entries skipped over by
    /// a later promotion are dropped without ever showing.
    pub fn set_layer_image(
        &self,
        layer_id: LayerId,
        image: ImageId,
        wait_fence: Option<FenceId>,
        signal_fence: Option<FenceId>,
    ) -> Result<(), ProtocolError> {
        let mut watch = None;
        let result = self.with_client_sweep(|client, unwatch| {
            let expected = client
                .layers
                .get(layer_id)?
                .config()
                .and_then(|config| config.expected_image_config())
                .copied()
                .ok_or(ProtocolError::WrongLayerKind(layer_id))?;

            let record = client.images.get(image)?;
            if record.released {
                return Err(ProtocolError::UnknownId(ResourceKind::Image, image));
            }
            if record.config != expected {
                return Err(ProtocolError::ImageConfigMismatch(layer_id));
            }
            if client
                .layers
                .iter()
                .any(|(&id, layer)| id != layer_id && layer.references_image(image))
            {
                return Err(ProtocolError::ResourceInUse(ResourceKind::Image, image));
            }

            // A fence already signaled when the image is queued behaves as
            // if no wait was requested.
            let mut deferred = None;
            if let Some(fence_id) = wait_fence {
                let fence = client.fences.get(fence_id)?;
                if fence.released {
                    return Err(ProtocolError::UnknownId(ResourceKind::Fence, fence_id));
                }
                if fence.claimed {
                    return Err(ProtocolError::FenceAlreadyClaimed(fence_id));
                }
                if !fence.signaled {
                    deferred = Some((fence_id, fence.event().clone()));
                }
            }
            if let Some(fence_id) = signal_fence {
                let fence = client.fences.get(fence_id)?;
                if fence.released {
                    return Err(ProtocolError::UnknownId(ResourceKind::Fence, fence_id));
                }
            }

            // All checks passed; commit.
            if let Some(fence_id) = signal_fence {
                client.fences.get_mut(fence_id)?.pending_signals += 1;
            }
            let entry = PendingImage {
                image,
                wait_fence,
                signal_fence,
            };
            match deferred {
                None => {
                    let promotion = {
                        let layer = client.layers.get_mut(layer_id)?;
                        layer.push_image(entry);
                        let pos = layer.waiting_images().count() - 1;
                        layer.activate(pos)
                    };
                    client.settle_promotion(wait_fence, promotion, unwatch);
                }
                Some((fence_id, event)) => {
                    client.fences.get_mut(fence_id)?.claimed = true;
                    client.layers.get_mut(layer_id)?.push_image(entry);
                    watch = Some(event);
                }
            }
            client.sweep(unwatch);
            Ok(())
        });
        if let Some(event) = watch {
            if let Err(e) = self.shared.watcher.watch(event) {
                warn!("could not watch wait fence for image {}: {}", image, e);
            }
        }
        result
    }

    /// Validates the drafted configurations of every display the client
    /// has touched. With `discard` set nothing is recorded and the call is
    /// free of side effects; otherwise a passing result arms the next
    /// `apply_config`.
    pub fn check_config(&self, discard: bool) -> (ConfigResult, Vec<ClientCompositionOp>) {
        let engine = &*self.shared.engine;
        self.with_parts(|displays, client| {
            let mut drafts = Vec::new();
            for (display_id, pending) in &client.pending {
                let Some(info) = displays.get(display_id) else {
                    continue;
                };
                let mut layers = Vec::new();
                for &layer_id in &pending.layers {
                    match client.layers.get(layer_id).ok().and_then(Layer::config) {
                        Some(config) => layers.push(LayerView {
                            id: layer_id,
                            config: *config,
                        }),
                        // An unconfigured layer cannot be realized.
                        None => return (ConfigResult::InvalidConfig, Vec::new()),
                    }
                }
                drafts.push(DisplayDraft {
                    info,
                    mode: pending.mode,
                    color_conversion: pending.color_conversion,
                    layers,
                });
            }

            let (result, ops) = check_drafts(&drafts, engine);
            if !discard {
                client.validated = Some((client.pending_version, result));
                debug!(
                    "validated config version {} as {:?}",
                    client.pending_version, result
                );
            }
            (result, ops)
        })
    }

    /// Promotes the drafted configurations to active. Silently does
    /// nothing unless the last non-discarded validation passed and no
    /// layout mutation happened since.
    pub fn apply_config(&self) {
        self.with_client(|client| {
            match client.validated {
                Some((version, ConfigResult::Ok)) if version == client.pending_version => {}
                _ => {
                    debug!("ignoring apply without a passing validation");
                    return;
                }
            }
            for (display_id, pending) in &client.pending {
                let next = ActiveConfig {
                    layers: pending.layers.clone(),
                    mode: pending.mode,
                    color_conversion: pending.color_conversion,
                };
                let active = client.active.entry(*display_id).or_default();
                if *active != next {
                    debug!("display {}: new configuration applied", display_id);
                    *active = next;
                }
            }
        })
    }

    /// Turns vsync event delivery for this client on or off.
    pub fn enable_vsync(&self, enable: bool) -> Result<(), ProtocolError> {
        self.with_client(|client| {
            client.vsync_enabled = enable;
            Ok(())
        })
    }

    /// Chooses how ownership is arbitrated between the virtcon and the
    /// primary client. Restricted to the virtcon client.
    pub fn set_virtcon_mode(&self, mode: VirtconMode) -> Result<(), ProtocolError> {
        if self.role != ClientRole::Virtcon {
            return Err(ProtocolError::RoleRestricted(self.role));
        }
        let mut core = self.shared.state.lock().unwrap();
        info!("virtcon mode set to {:?}", mode);
        core.virtcon_mode = mode;
        core.recompute_ownership();
        Ok(())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let mut unwatch = Vec::new();
        let mut core = self.shared.state.lock().unwrap();
        core.disconnect(self.role, &mut unwatch);
        // The surviving client may wait on clones of this client's
        // primitives; only tokens with no live claim leave the watch set.
        self.shared.unwatch_stale(&core, unwatch);
    }
}

fn pending_entry<'a>(
    displays: &BTreeMap<DisplayId, DisplayInfo>,
    client: &'a mut ClientState,
    display_id: DisplayId,
) -> Result<&'a mut PendingConfig, ProtocolError> {
    let info = displays
        .get(&display_id)
        .ok_or(ProtocolError::UnknownId(ResourceKind::Display, display_id))?;
    Ok(client
        .pending
        .entry(display_id)
        .or_insert_with(|| PendingConfig::new(info)))
}
