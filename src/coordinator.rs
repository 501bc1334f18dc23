//! Process-wide coordination between client sessions, fences and displays.
//!
//! One `Coordinator` exists per service. It owns the shared state (display
//! topology, both client slots, virtcon mode) behind a single mutex, the
//! `CompositionEngine` consulted during validation, and the fence watcher
//! thread whose readiness callbacks drive asynchronous image promotion.
//! Client sessions are handles into that shared state; all their operations
//! serialize on the same lock, which is what the exclusivity invariants
//! (ids, ownership, per-layer active slots) rely on.

pub mod session;

pub use session::ClientSession;

use std::collections::BTreeMap;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};
use thiserror::Error;

use crate::display::{ActiveConfig, DisplayInfo, PendingConfig};
use crate::fence::watcher::FenceWatcher;
use crate::fence::FenceRecord;
use crate::layer::{ActiveImage, Layer, PendingImage, Promotion};
use crate::memory::SharedBuffer;
use crate::registry::Registry;
use crate::validate::{CompositionEngine, ConfigResult};
use crate::{
    ClientRole, DisplayId, FenceId, ImageConfig, ImageId, LayerId, ResourceKind, VirtconMode,
};

/// Notifications pushed to a client, in issue order.
#[derive(Debug, PartialEq)]
pub enum ClientEvent {
    /// Sent on connect with the full topology, then on every hardware
    /// topology change.
    DisplaysChanged {
        added: Vec<DisplayInfo>,
        removed: Vec<DisplayId>,
    },
    /// Sent per hardware vsync to clients that enabled vsync delivery.
    /// `images` is the set of this client's images active on the display.
    Vsync {
        display_id: DisplayId,
        timestamp_ns: u64,
        images: Vec<ImageId>,
    },
    /// Sent whenever output ownership is recomputed and this client's side
    /// of it changed.
    OwnershipChange { has_ownership: bool },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("a {0} client is already connected")]
    AlreadyConnected(ClientRole),
}

/// An imported image and its backing buffer.
#[derive(Debug)]
pub(crate) struct ImageRecord {
    pub(crate) config: ImageConfig,
    /// Keeps the backing memory alive for as long as the image exists.
    #[allow(dead_code)]
    pub(crate) buffer: SharedBuffer,
    /// The client released the id; tear down once unreferenced.
    pub(crate) released: bool,
}

/// Everything tracked on behalf of one connected client.
pub(crate) struct ClientState {
    role: ClientRole,
    pub(crate) images: Registry<ImageRecord>,
    pub(crate) layers: Registry<Layer>,
    pub(crate) fences: Registry<FenceRecord>,
    /// Primitive token -> fence id, for watcher dispatch and to reject
    /// binding one primitive under two ids.
    pub(crate) fence_tokens: BTreeMap<u64, FenceId>,
    pub(crate) pending: BTreeMap<DisplayId, PendingConfig>,
    pub(crate) active: BTreeMap<DisplayId, ActiveConfig>,
    next_image_id: ImageId,
    next_layer_id: LayerId,
    /// Bumped by every layout mutation; validation results are stamped
    /// against it.
    pub(crate) pending_version: u64,
    pub(crate) validated: Option<(u64, ConfigResult)>,
    pub(crate) vsync_enabled: bool,
    has_ownership: bool,
    events: Sender<ClientEvent>,
}

impl ClientState {
    fn new(role: ClientRole, events: Sender<ClientEvent>) -> Self {
        Self {
            role,
            images: Registry::new(ResourceKind::Image),
            layers: Registry::new(ResourceKind::Layer),
            fences: Registry::new(ResourceKind::Fence),
            fence_tokens: BTreeMap::new(),
            pending: BTreeMap::new(),
            active: BTreeMap::new(),
            next_image_id: 1,
            next_layer_id: 1,
            pending_version: 0,
            validated: None,
            vsync_enabled: false,
            has_ownership: false,
            events,
        }
    }

    pub(crate) fn allocate_image_id(&mut self) -> ImageId {
        let id = self.next_image_id;
        self.next_image_id += 1;
        id
    }

    pub(crate) fn allocate_layer_id(&mut self) -> LayerId {
        let id = self.next_layer_id;
        self.next_layer_id += 1;
        id
    }

    /// Any layout mutation makes the previous validation result stale.
    pub(crate) fn bump_version(&mut self) {
        self.pending_version += 1;
        self.validated = None;
    }

    pub(crate) fn send_event(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            warn!("{} client dropped its event receiver", self.role);
        }
    }

    /// Settles the fence obligations of images that were dropped without
    /// ever becoming active: wait claims are lifted and signal fences fire
    /// immediately. Wait fences that were still being watched are queued
    /// for deregistration.
    pub(crate) fn drop_entries(&mut self, entries: Vec<PendingImage>, unwatch: &mut Vec<u64>) {
        for entry in entries {
            if let Some(fence_id) = entry.wait_fence {
                if let Ok(record) = self.fences.get_mut(fence_id) {
                    record.claimed = false;
                    if !record.signaled {
                        unwatch.push(record.token());
                    }
                }
            }
            if let Some(fence_id) = entry.signal_fence {
                self.fire_signal(fence_id);
            }
            debug!("dropping never-presented image {}", entry.image);
        }
    }

    /// Retires a previously active image; scan-out bookkeeping is out of
    /// scope, so its signal fence fires right away.
    pub(crate) fn retire_active(&mut self, retired: ActiveImage) {
        if let Some(fence_id) = retired.signal_fence {
            self.fire_signal(fence_id);
        }
    }

    fn fire_signal(&mut self, fence_id: FenceId) {
        match self.fences.get_mut(fence_id) {
            Ok(record) => {
                if let Err(e) = record.fire_signal() {
                    warn!("could not fire signal fence {}: {}", fence_id, e);
                }
            }
            Err(_) => warn!("signal fence {} disappeared before firing", fence_id),
        }
    }

    /// Applies the side effects of one image promotion.
    pub(crate) fn settle_promotion(
        &mut self,
        wait_fence: Option<FenceId>,
        promotion: Promotion,
        unwatch: &mut Vec<u64>,
    ) {
        if let Some(fence_id) = wait_fence {
            if let Ok(record) = self.fences.get_mut(fence_id) {
                record.claimed = false;
            }
        }
        if let Some(retired) = promotion.retired {
            self.retire_active(retired);
        }
        self.drop_entries(promotion.dropped, unwatch);
        debug!("image {} is now active", promotion.activated);
    }

    /// Resolves a signaled fence: promotes the image waiting on it, if any
    /// still is.
    pub(crate) fn handle_fence_signaled(&mut self, fence_id: FenceId, unwatch: &mut Vec<u64>) {
        match self.fences.get_mut(fence_id) {
            Ok(record) => record.signaled = true,
            // Swept after its waiting image was dropped; nothing to do.
            Err(_) => return,
        }

        let mut promotion = None;
        for (_, layer) in self.layers.iter_mut() {
            if let Some(pos) = layer.position_waiting_on(fence_id) {
                promotion = Some(layer.activate(pos));
                break;
            }
        }
        if let Some(promotion) = promotion {
            self.settle_promotion(Some(fence_id), promotion, unwatch);
        }
        self.sweep(unwatch);
    }

    /// Deferred-teardown pass: drops released images no layer references
    /// anymore, and released fences with no outstanding wait or signal.
    pub(crate) fn sweep(&mut self, unwatch: &mut Vec<u64>) {
        let layers = &self.layers;
        self.images.sweep(
            |id, image| image.released && !layers.iter().any(|(_, l)| l.references_image(*id)),
            |id, _| debug!("tearing down released image {}", id),
        );

        let fence_tokens = &mut self.fence_tokens;
        self.fences.sweep(
            |_, fence| fence.can_teardown(),
            |id, fence| {
                debug!("tearing down released fence {}", id);
                fence_tokens.remove(&fence.token());
                if !fence.signaled {
                    unwatch.push(fence.token());
                }
            },
        );
    }

    /// This client's images currently active on `display_id`.
    fn active_images(&self, display_id: DisplayId) -> Vec<ImageId> {
        let Some(active) = self.active.get(&display_id) else {
            return Vec::new();
        };
        active
            .layers
            .iter()
            .filter_map(|layer_id| self.layers.get(*layer_id).ok())
            .filter_map(|layer| layer.active_image())
            .map(|active| active.image)
            .collect()
    }
}

/// State shared by both sessions and the fence watcher callback.
pub(crate) struct CoreState {
    pub(crate) displays: BTreeMap<DisplayId, DisplayInfo>,
    pub(crate) primary: Option<ClientState>,
    pub(crate) virtcon: Option<ClientState>,
    pub(crate) virtcon_mode: VirtconMode,
}

impl CoreState {
    pub(crate) fn client_mut(&mut self, role: ClientRole) -> Option<&mut ClientState> {
        match role {
            ClientRole::Primary => self.primary.as_mut(),
            ClientRole::Virtcon => self.virtcon.as_mut(),
        }
    }

    fn connected_clients_mut(&mut self) -> impl Iterator<Item = &mut ClientState> {
        self.primary.iter_mut().chain(self.virtcon.iter_mut())
    }

    /// Recomputes which client owns the output and notifies every client
    /// whose side of the answer changed.
    pub(crate) fn recompute_ownership(&mut self) {
        let virtcon_selected = match self.virtcon_mode {
            VirtconMode::Forced => self.virtcon.is_some(),
            VirtconMode::Inactive => false,
            VirtconMode::Fallback => self.primary.is_none() && self.virtcon.is_some(),
        };

        for client in self.connected_clients_mut() {
            let owns = match client.role {
                ClientRole::Primary => !virtcon_selected,
                ClientRole::Virtcon => virtcon_selected,
            };
            if owns != client.has_ownership {
                client.has_ownership = owns;
                info!("{} client ownership changed to {}", client.role, owns);
                client.send_event(ClientEvent::OwnershipChange {
                    has_ownership: owns,
                });
            }
        }
    }

    fn on_fence_signaled(&mut self, token: u64, unwatch: &mut Vec<u64>) {
        // Both clients may have imported clones of the same primitive.
        for client in self.connected_clients_mut() {
            if let Some(&fence_id) = client.fence_tokens.get(&token) {
                client.handle_fence_signaled(fence_id, unwatch);
            }
        }
    }

    /// Whether any connected client still holds an unresolved wait claim
    /// on the primitive behind `token`. Clones of one primitive may be
    /// imported by both clients, so a watch must outlive every claim, not
    /// just the one of the client that queued the deregistration.
    fn token_claim_live(&self, token: u64) -> bool {
        self.primary
            .iter()
            .chain(self.virtcon.iter())
            .any(|client| match client.fence_tokens.get(&token) {
                Some(&fence_id) => client
                    .fences
                    .get(fence_id)
                    .map(|fence| fence.claimed)
                    .unwrap_or(false),
                None => false,
            })
    }

    fn disconnect(&mut self, role: ClientRole, unwatch: &mut Vec<u64>) {
        let slot = match role {
            ClientRole::Primary => &mut self.primary,
            ClientRole::Virtcon => &mut self.virtcon,
        };
        if let Some(client) = slot.take() {
            info!("{} client disconnected", role);
            for (&token, _) in client.fence_tokens.iter() {
                unwatch.push(token);
            }
        }
        self.recompute_ownership();
    }
}

pub(crate) struct Shared {
    pub(crate) state: Arc<Mutex<CoreState>>,
    pub(crate) engine: Box<dyn CompositionEngine + Sync>,
    pub(crate) watcher: FenceWatcher,
}

impl Shared {
    /// Deregisters fence tokens collected during an operation, skipping
    /// any that another connected client still waits on through a clone of
    /// the same primitive. Must run with `core` still locked so no new
    /// claim can slip in between the check and the deregistration.
    pub(crate) fn unwatch_stale(&self, core: &CoreState, tokens: Vec<u64>) {
        for token in tokens {
            if core.token_claim_live(token) {
                continue;
            }
            if let Err(e) = self.watcher.unwatch(token) {
                warn!("could not deregister fence token {}: {}", token, e);
            }
        }
    }
}

/// The service core. One per process; hardware shims feed it topology and
/// vsync ticks, transports connect client sessions to it.
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Creates the coordinator with an initial display topology and the
    /// capability predicate of the hardware it fronts.
    pub fn new(
        engine: Box<dyn CompositionEngine + Sync>,
        displays: Vec<DisplayInfo>,
    ) -> io::Result<Self> {
        let state = Arc::new(Mutex::new(CoreState {
            displays: displays.into_iter().map(|d| (d.id, d)).collect(),
            primary: None,
            virtcon: None,
            virtcon_mode: VirtconMode::Inactive,
        }));

        let state_weak: Weak<Mutex<CoreState>> = Arc::downgrade(&state);
        let watcher = FenceWatcher::start(move |token| {
            let Some(state) = state_weak.upgrade() else {
                return;
            };
            let mut unwatch = Vec::new();
            state.lock().unwrap().on_fence_signaled(token, &mut unwatch);
            // Stale registrations are dropped lazily: the watcher already
            // deregistered this token, and tokens in `unwatch` belong to
            // fences that either signal later (and resolve to nothing) or
            // never signal.
            let _ = unwatch;
        })?;

        Ok(Self {
            shared: Arc::new(Shared {
                state,
                engine,
                watcher,
            }),
        })
    }

    /// Connects a client in `role`. At most one client per role may be
    /// connected at a time. The returned receiver carries the client's
    /// notifications, starting with the current display topology.
    pub fn connect(
        &self,
        role: ClientRole,
    ) -> Result<(ClientSession, Receiver<ClientEvent>), ConnectError> {
        let (tx, rx) = mpsc::channel();
        {
            let mut core = self.shared.state.lock().unwrap();
            let slot = match role {
                ClientRole::Primary => &mut core.primary,
                ClientRole::Virtcon => &mut core.virtcon,
            };
            if slot.is_some() {
                return Err(ConnectError::AlreadyConnected(role));
            }
            let client = ClientState::new(role, tx);
            client.send_event(ClientEvent::DisplaysChanged {
                added: core.displays.values().cloned().collect(),
                removed: Vec::new(),
            });
            *match role {
                ClientRole::Primary => &mut core.primary,
                ClientRole::Virtcon => &mut core.virtcon,
            } = Some(client);
            info!("{} client connected", role);
            core.recompute_ownership();
        }
        Ok((ClientSession::new(Arc::clone(&self.shared), role), rx))
    }

    /// Reports a new display to all connected clients.
    pub fn add_display(&self, display: DisplayInfo) {
        let mut core = self.shared.state.lock().unwrap();
        info!("display {} added", display.id);
        core.displays.insert(display.id, display.clone());
        for client in core.connected_clients_mut() {
            client.send_event(ClientEvent::DisplaysChanged {
                added: vec![display.clone()],
                removed: Vec::new(),
            });
        }
    }

    /// Removes a display: every client's configuration for it is dropped,
    /// its layers detach, and the topology change is fanned out.
    pub fn remove_display(&self, display_id: DisplayId) {
        let mut core = self.shared.state.lock().unwrap();
        if core.displays.remove(&display_id).is_none() {
            warn!("removal of unknown display {}", display_id);
            return;
        }
        info!("display {} removed", display_id);
        for client in core.connected_clients_mut() {
            client.pending.remove(&display_id);
            client.active.remove(&display_id);
            for (_, layer) in client.layers.iter_mut() {
                if layer.attached_to() == Some(display_id) {
                    layer.set_attached_to(None);
                }
            }
            client.bump_version();
            client.send_event(ClientEvent::DisplaysChanged {
                added: Vec::new(),
                removed: vec![display_id],
            });
        }
    }

    /// Reports a hardware vsync tick on `display_id`. Fans the tick out to
    /// every vsync-enabled client with that client's own active images,
    /// regardless of which client owns the output.
    pub fn on_vsync(&self, display_id: DisplayId, timestamp_ns: u64) {
        let mut core = self.shared.state.lock().unwrap();
        if !core.displays.contains_key(&display_id) {
            warn!("vsync for unknown display {}", display_id);
            return;
        }
        for client in core.connected_clients_mut() {
            if !client.vsync_enabled {
                continue;
            }
            let images = client.active_images(display_id);
            client.send_event(ClientEvent::Vsync {
                display_id,
                timestamp_ns,
                images,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::SoftwareEngine;
    use crate::DisplayMode;
    use std::sync::mpsc::TryRecvError;

    pub(crate) fn test_display(id: DisplayId) -> DisplayInfo {
        DisplayInfo {
            id,
            modes: vec![DisplayMode {
                horizontal_resolution: 1920,
                vertical_resolution: 1080,
                refresh_rate_e2: 6000,
            }],
            pixel_formats: vec![crate::PixelFormat::from(b"AR24")],
            cursor_configs: vec![ImageConfig {
                width: 64,
                height: 64,
                pixel_format: crate::PixelFormat::from(b"AR24"),
                ..Default::default()
            }],
        }
    }

    pub(crate) fn test_coordinator() -> Coordinator {
        let _ = env_logger::builder().is_test(true).try_init();
        Coordinator::new(Box::<SoftwareEngine>::default(), vec![test_display(1)]).unwrap()
    }

    fn expect_displays_changed(rx: &Receiver<ClientEvent>) -> (Vec<DisplayId>, Vec<DisplayId>) {
        match rx.try_recv().expect("expected a DisplaysChanged event") {
            ClientEvent::DisplaysChanged { added, removed } => {
                (added.iter().map(|d| d.id).collect(), removed)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn connect_reports_topology_and_enforces_single_role() {
        let coordinator = test_coordinator();
        let (_session, rx) = coordinator.connect(ClientRole::Primary).unwrap();
        let (added, removed) = expect_displays_changed(&rx);
        assert_eq!(added, vec![1]);
        assert!(removed.is_empty());

        assert!(matches!(
            coordinator.connect(ClientRole::Primary),
            Err(ConnectError::AlreadyConnected(ClientRole::Primary))
        ));
        // The other role is still free.
        let (_virtcon, _) = coordinator.connect(ClientRole::Virtcon).unwrap();
    }

    #[test]
    fn role_slot_frees_up_on_disconnect() {
        let coordinator = test_coordinator();
        let (session, _rx) = coordinator.connect(ClientRole::Primary).unwrap();
        drop(session);
        assert!(coordinator.connect(ClientRole::Primary).is_ok());
    }

    #[test]
    fn fallback_ownership_moves_with_primary_lifetime() {
        let coordinator = test_coordinator();
        let (virtcon, virtcon_rx) = coordinator.connect(ClientRole::Virtcon).unwrap();
        expect_displays_changed(&virtcon_rx);

        virtcon.set_virtcon_mode(VirtconMode::Fallback).unwrap();
        assert_eq!(
            virtcon_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: true
            })
        );

        // A primary connecting takes ownership away from the fallback.
        let (primary, primary_rx) = coordinator.connect(ClientRole::Primary).unwrap();
        expect_displays_changed(&primary_rx);
        assert_eq!(
            primary_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: true
            })
        );
        assert_eq!(
            virtcon_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: false
            })
        );

        // ... and returns it when it goes away.
        drop(primary);
        assert_eq!(
            virtcon_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: true
            })
        );
    }

    #[test]
    fn forced_mode_overrides_connected_primary() {
        let coordinator = test_coordinator();
        let (_primary, primary_rx) = coordinator.connect(ClientRole::Primary).unwrap();
        let (virtcon, virtcon_rx) = coordinator.connect(ClientRole::Virtcon).unwrap();
        expect_displays_changed(&primary_rx);
        expect_displays_changed(&virtcon_rx);
        assert_eq!(
            primary_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: true
            })
        );

        virtcon.set_virtcon_mode(VirtconMode::Forced).unwrap();
        assert_eq!(
            virtcon_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: true
            })
        );
        assert_eq!(
            primary_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: false
            })
        );

        virtcon.set_virtcon_mode(VirtconMode::Inactive).unwrap();
        assert_eq!(
            primary_rx.try_recv(),
            Ok(ClientEvent::OwnershipChange {
                has_ownership: true
            })
        );
    }

    #[test]
    fn primary_cannot_set_virtcon_mode() {
        let coordinator = test_coordinator();
        let (primary, _rx) = coordinator.connect(ClientRole::Primary).unwrap();
        assert_eq!(
            primary.set_virtcon_mode(VirtconMode::Forced),
            Err(crate::ProtocolError::RoleRestricted(ClientRole::Primary))
        );
    }

    #[test]
    fn vsync_goes_only_to_enabled_clients() {
        let coordinator = test_coordinator();
        let (primary, primary_rx) = coordinator.connect(ClientRole::Primary).unwrap();
        let (_virtcon, virtcon_rx) = coordinator.connect(ClientRole::Virtcon).unwrap();
        expect_displays_changed(&primary_rx);
        expect_displays_changed(&virtcon_rx);
        let _ = primary_rx.try_recv(); // initial ownership

        primary.enable_vsync(true).unwrap();
        coordinator.on_vsync(1, 1_000);
        assert_eq!(
            primary_rx.try_recv(),
            Ok(ClientEvent::Vsync {
                display_id: 1,
                timestamp_ns: 1_000,
                images: vec![],
            })
        );
        assert_eq!(virtcon_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn display_removal_detaches_and_notifies() {
        let coordinator = test_coordinator();
        let (primary, primary_rx) = coordinator.connect(ClientRole::Primary).unwrap();
        expect_displays_changed(&primary_rx);
        let _ = primary_rx.try_recv(); // initial ownership

        let layer = primary.create_layer().unwrap();
        primary
            .set_layer_color_config(
                layer,
                crate::ColorConfig {
                    format: crate::PixelFormat::from(b"AR24"),
                    bytes: [0; 8],
                },
            )
            .unwrap();
        primary.set_display_layers(1, vec![layer]).unwrap();
        // The layer is attached; destroying it must fail...
        assert_eq!(
            primary.destroy_layer(layer),
            Err(crate::ProtocolError::ResourceInUse(ResourceKind::Layer, layer))
        );

        coordinator.remove_display(1);
        let (added, removed) = expect_displays_changed(&primary_rx);
        assert!(added.is_empty());
        assert_eq!(removed, vec![1]);

        // ... but removal of its display detached it.
        assert!(primary.destroy_layer(layer).is_ok());
        coordinator.on_vsync(1, 2_000); // unknown display now, ignored
        assert_eq!(primary_rx.try_recv(), Err(TryRecvError::Empty));
    }
}
