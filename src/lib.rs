//! Core of a display controller service.
//!
//! This library mediates between up to two clients (a primary compositor and
//! an optional virtcon fallback) and display hardware. It tracks the
//! resources a client builds up - images, layers, synchronization fences,
//! per-display layer stacks - and runs the two-phase protocol (validate then
//! apply) that turns a requested composition into the configuration driven
//! to hardware:
//!
//! * The `registry`, `fence`, `layer` and `display` modules hold the
//!   per-resource state machines.
//! * The `validate` module checks a draft configuration against hardware
//!   capabilities, reported through the `CompositionEngine` trait.
//! * The `coordinator` module owns the process-wide state and exposes the
//!   per-client operation surface that a transport layer would serve.
//!
//! Actual scan-out programming, buffer allocation back ends (beyond a
//! memfd-based shim) and RPC marshalling are out of scope and only appear
//! here as trait boundaries or opaque handles.

pub mod coordinator;
pub mod display;
pub mod fence;
pub mod layer;
pub mod memory;
pub mod registry;
pub mod validate;

use std::fmt;
use std::fmt::{Debug, Display};

use enumn::N;
use thiserror::Error;

/// Identifier for a physical display output.
pub type DisplayId = u64;
/// Identifier for an imported image, allocated by the service on import.
pub type ImageId = u64;
/// Identifier for a compositable layer, allocated by the service.
pub type LayerId = u64;
/// Client-chosen identifier for an imported synchronization event.
pub type FenceId = u64;

/// Reserved id value. No resource may ever be bound to it.
pub const INVALID_ID: u64 = 0;

/// The two client roles that may be connected at the same time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientRole {
    Primary,
    Virtcon,
}

impl Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Requested behavior of the virtcon client with respect to output
/// ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum VirtconMode {
    /// The virtcon never owns the output.
    Inactive = 0,
    /// The virtcon owns the output only while no primary client is
    /// connected.
    Fallback = 1,
    /// The virtcon always owns the output.
    Forced = 2,
}

/// A Fourcc pixel format. It can be converted back and forth from a 32-bit
/// integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Returns the size of one pixel in bytes, or `None` if the format is
    /// not one this service knows how to lay out linearly.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match &self.to_fourcc() {
            b"AR24" | b"XR24" | b"AB24" | b"XB24" => Some(4),
            b"BG24" | b"RG24" => Some(3),
            b"RG16" => Some(2),
            b"GREY" | b"R8  " => Some(1),
            _ => None,
        }
    }
}

impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string literal (e.g. `b"AR24"`) into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use dispctl::PixelFormat;
/// let argb = b"AR24";
/// let f = PixelFormat::from(argb);
/// assert_eq!(&f.to_fourcc(), argb);
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Memory layout of an imported image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ImageTiling {
    Linear = 0,
    Tiled = 1,
}

impl Default for ImageTiling {
    fn default() -> Self {
        ImageTiling::Linear
    }
}

/// Description of an imported image. `set_image` requires an exact match
/// between the image's config and the config of the layer it is applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ImageConfig {
    /// Width of the image in pixels.
    pub width: u32,
    /// Height of the image in pixels.
    pub height: u32,
    /// Format each pixel is encoded in.
    pub pixel_format: PixelFormat,
    pub tiling: ImageTiling,
}

/// An axis-aligned rectangle, used both for source crops (image space) and
/// destination placement (display space).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Frame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether this frame lies entirely within a `width` x `height` area
    /// anchored at the origin.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}), {}x{}", self.x, self.y, self.width, self.height)
    }
}

/// One display timing, from the display's supported set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DisplayMode {
    pub horizontal_resolution: u32,
    pub vertical_resolution: u32,
    /// Refresh rate in centihertz, e.g. 6000 for 60Hz.
    pub refresh_rate_e2: u32,
}

/// Rotation/reflection applied to a primary layer's source before scaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum Transform {
    Identity = 0,
    ReflectX = 1,
    ReflectY = 2,
    Rot90 = 3,
    Rot180 = 4,
    Rot270 = 5,
    Rot90ReflectX = 6,
    Rot90ReflectY = 7,
}

impl Default for Transform {
    fn default() -> Self {
        Transform::Identity
    }
}

/// Per-layer alpha blending mode.
#[derive(Clone, Copy, Debug, PartialEq, N)]
#[repr(u32)]
pub enum AlphaMode {
    Disable = 0,
    Premultiplied = 1,
    HwMultiply = 2,
}

impl Default for AlphaMode {
    fn default() -> Self {
        AlphaMode::Disable
    }
}

/// 3x3 color correction applied at scan-out, with pre/post channel offsets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorConversion {
    pub preoffsets: [f32; 3],
    pub coefficients: [[f32; 3]; 3],
    pub postoffsets: [f32; 3],
}

impl ColorConversion {
    pub const IDENTITY: ColorConversion = ColorConversion {
        preoffsets: [0.0; 3],
        coefficients: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        postoffsets: [0.0; 3],
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for ColorConversion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Constant fill for a color layer. `bytes` holds one pixel in `format`,
/// least significant byte first; unused trailing bytes must be zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorConfig {
    pub format: PixelFormat,
    pub bytes: [u8; 8],
}

/// The kinds of resources tracked on behalf of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Image,
    Layer,
    Fence,
    Display,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Protocol violations. Any of these indicates that the client has lost
/// track of its own state; the session that triggered one must be torn down,
/// no recovery is attempted.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("id {1} is already bound to a {0}, or is the reserved invalid id")]
    DuplicateId(ResourceKind, u64),
    #[error("no {0} is bound to id {1}")]
    UnknownId(ResourceKind, u64),
    #[error("{0} {1} is still referenced by a configuration")]
    ResourceInUse(ResourceKind, u64),
    #[error("event primitive is already imported under id {0}")]
    PrimitiveAlreadyImported(FenceId),
    #[error("layer {0} is not of the kind required by this operation")]
    WrongLayerKind(LayerId),
    #[error("image config does not match the config of layer {0}")]
    ImageConfigMismatch(LayerId),
    #[error("wait fence {0} is already claimed by a not-yet-presented image")]
    FenceAlreadyClaimed(FenceId),
    #[error("layer {0} is already part of another display's layer stack")]
    LayerOnOtherDisplay(LayerId),
    #[error("alpha value {0} is out of the [0.0, 1.0] range")]
    InvalidAlphaValue(f32),
    #[error("operation is not permitted for the {0} client")]
    RoleRestricted(ClientRole),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_fourcc_round_trip() {
        let f = PixelFormat::from(b"AR24");
        assert_eq!(f.to_fourcc(), *b"AR24");
        assert_eq!(f.to_string(), "AR24");
        assert_eq!(PixelFormat::from(f.to_u32()), f);
        assert_eq!(f.bytes_per_pixel(), Some(4));
        assert_eq!(PixelFormat::from(b"....").bytes_per_pixel(), None);
    }

    #[test]
    fn frame_bounds() {
        let frame = Frame::new(100, 50, 800, 600);
        assert!(!frame.is_empty());
        assert!(frame.fits_within(900, 650));
        assert!(!frame.fits_within(899, 650));
        assert!(Frame::new(0, 0, 0, 600).is_empty());
        // Position + size close to u32::MAX must not wrap around.
        assert!(!Frame::new(u32::MAX, 0, 2, 2).fits_within(u32::MAX, u32::MAX));
    }

    #[test]
    fn color_conversion_identity() {
        assert!(ColorConversion::default().is_identity());
        let mut cc = ColorConversion::IDENTITY;
        cc.coefficients[0][0] = 0.5;
        assert!(!cc.is_identity());
    }
}
