//! memfd-backed shared buffers, standing in for the GPU/DMA allocation
//! back end at its interface boundary.
//!
//! The service only needs to hand out sized, fd-backed buffers and to
//! verify on image import that a buffer is large enough for the image
//! config claimed for it; how the buffer is filled is none of its business.

use std::ffi::CString;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use log::debug;
use thiserror::Error;

use crate::{ImageConfig, PixelFormat};

/// Rows of linear images are padded to this many bytes.
pub const STRIDE_ALIGNMENT_BYTES: u32 = 64;

/// Allocation failures are reported as a status, never as a protocol
/// violation: they can stem from transient resource exhaustion.
#[derive(Debug, Error)]
pub enum AllocateBufferError {
    #[error("cannot allocate a zero-sized buffer")]
    ZeroSize,
    #[error("buffer allocation failed")]
    OsError(#[from] std::io::Error),
}

/// An owned, sized, fd-backed chunk of memory that can be shared with the
/// client and with the scan-out hardware.
#[derive(Debug)]
pub struct SharedBuffer {
    fd: OwnedFd,
    size: u64,
}

impl SharedBuffer {
    /// Allocates `size` bytes of anonymous shared memory.
    pub fn allocate(size: u64) -> Result<Self, AllocateBufferError> {
        if size == 0 {
            return Err(AllocateBufferError::ZeroSize);
        }

        let name = CString::new("dispctl-image").unwrap();
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        nix::unistd::ftruncate(&fd, size as libc::off_t)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

        debug!("allocated {} byte shared buffer", size);
        Ok(Self { fd, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AsFd for SharedBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SharedBuffer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Stride in pixels of a linear image of `width`, with rows padded to
/// `STRIDE_ALIGNMENT_BYTES`. Returns 0 for unknown formats, zero widths, or
/// widths whose row size does not fit in 32 bits.
pub fn compute_linear_image_stride(width: u32, format: PixelFormat) -> u32 {
    let bpp = match format.bytes_per_pixel() {
        Some(bpp) => bpp as u64,
        None => return 0,
    };
    if width == 0 {
        return 0;
    }

    let align = STRIDE_ALIGNMENT_BYTES as u64;
    let row_bytes = (width as u64 * bpp + align - 1) / align * align;
    // Round up so the stride covers the padded row even when the pixel size
    // does not divide the alignment.
    let stride = (row_bytes + bpp - 1) / bpp;
    u32::try_from(stride).unwrap_or(0)
}

/// Bytes a buffer must provide to back an image of `config`, or `None` if
/// the config is not expressible (unknown format, zero dimension,
/// overflow).
pub fn required_size_bytes(config: &ImageConfig) -> Option<u64> {
    let stride = compute_linear_image_stride(config.width, config.pixel_format);
    if stride == 0 || config.height == 0 {
        return None;
    }
    let bpp = config.pixel_format.bytes_per_pixel()? as u64;
    (stride as u64)
        .checked_mul(bpp)
        .and_then(|row| row.checked_mul(config.height as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_aligned() {
        let argb = PixelFormat::from(b"AR24");
        // 800 * 4 = 3200 bytes, already 64-byte aligned.
        assert_eq!(compute_linear_image_stride(800, argb), 800);
        // 801 * 4 = 3204, padded to 3264 bytes = 816 pixels.
        assert_eq!(compute_linear_image_stride(801, argb), 816);
        assert_eq!(compute_linear_image_stride(0, argb), 0);
        assert_eq!(compute_linear_image_stride(800, PixelFormat::from(b"????")), 0);
    }

    #[test]
    fn required_size_covers_padded_rows() {
        let config = ImageConfig {
            width: 801,
            height: 10,
            pixel_format: PixelFormat::from(b"AR24"),
            ..Default::default()
        };
        assert_eq!(required_size_bytes(&config), Some(816 * 4 * 10));
        let unknown = ImageConfig {
            pixel_format: PixelFormat::from(b"????"),
            ..config
        };
        assert_eq!(required_size_bytes(&unknown), None);
    }

    #[test]
    fn allocate_and_query_size() {
        let buffer = SharedBuffer::allocate(4096).unwrap();
        assert_eq!(buffer.size(), 4096);
        assert!(buffer.as_raw_fd() >= 0);
        assert!(matches!(
            SharedBuffer::allocate(0),
            Err(AllocateBufferError::ZeroSize)
        ));
    }
}
