// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    backend::{ComputeBackend, ExportMode},
    buffer::{Buffer, MemoryKind},
    error::{Error, Result},
    plane::Plane,
    pool::{BufferPool, PooledBuffer},
};
use core::fmt;
use std::sync::Arc;
use tracing::debug;

/// Pixel formats with a fixed plane layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// RGB 24-bit packed (8 bits per channel, no alpha)
    Rgb,
    /// RGBA 32-bit packed (8 bits per channel, with alpha)
    Rgba,
    /// 4:2:0 semi-planar, Y plane followed by interleaved UV
    Nv12,
    /// 4:2:0 semi-planar, Y plane followed by interleaved VU
    Nv21,
    /// 4:2:0 planar, separate Y, U and V planes
    Yuv420,
    /// Planar Y, U and V with quarter size chroma planes, identical in
    /// layout to [`PixelFormat::Yuv420`]
    Yuv422,
}

/// Geometry of one plane of an image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes.
    pub stride: usize,
}

impl PlaneLayout {
    const fn new(width: u32, height: u32, stride: usize) -> Self {
        Self {
            width,
            height,
            stride,
        }
    }

    /// Bytes needed to hold the plane, saturating at `usize::MAX`. Layouts
    /// returned by [`PixelFormat::plane_layout`] never saturate.
    pub const fn size(&self) -> usize {
        self.stride.saturating_mul(self.height as usize)
    }
}

impl PixelFormat {
    pub const fn plane_count(self) -> usize {
        match self {
            PixelFormat::Rgb | PixelFormat::Rgba => 1,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::Yuv420 | PixelFormat::Yuv422 => 3,
        }
    }

    /// Whether chroma is stored at half resolution, which requires even
    /// image dimensions.
    pub const fn is_subsampled(self) -> bool {
        !matches!(self, PixelFormat::Rgb | PixelFormat::Rgba)
    }

    pub const fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb => *b"RGB3",
            PixelFormat::Rgba => *b"RGBA",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Nv21 => *b"NV21",
            PixelFormat::Yuv420 => *b"YU12",
            PixelFormat::Yuv422 => *b"422P",
        }
    }

    /// Plane geometry for an image of `width` x `height` pixels.
    ///
    /// | Format        | Plane 0       | Plane 1                      | Plane 2       |
    /// |---------------|---------------|------------------------------|---------------|
    /// | RGB / RGBA    | w×h, 3/4 B/px |                              |               |
    /// | NV12 / NV21   | w×h, 1 B/px   | w/2×h/2 interleaved, 2 B/px  |               |
    /// | YUV420/422    | w×h, 1 B/px   | w/2×h/2, 1 B/px              | w/2×h/2       |
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for zero dimensions, odd dimensions
    /// on a subsampled format, or an image too large to address.
    pub fn plane_layout(self, width: u32, height: u32) -> Result<Vec<PlaneLayout>> {
        if width == 0 || height == 0 {
            return Err(Error::invalid(format!(
                "image dimensions {}x{} must be non-zero",
                width, height
            )));
        }
        if self.is_subsampled() && (width % 2 != 0 || height % 2 != 0) {
            return Err(Error::invalid(format!(
                "{} requires even dimensions, got {}x{}",
                self, width, height
            )));
        }

        let w = width as usize;
        let overflow =
            || Error::invalid(format!("{} image {}x{} overflows", self, width, height));
        let luma = PlaneLayout::new(width, height, w);
        let layout = match self {
            PixelFormat::Rgb => {
                let stride = w.checked_mul(3).ok_or_else(overflow)?;
                vec![PlaneLayout::new(width, height, stride)]
            }
            PixelFormat::Rgba => {
                let stride = w.checked_mul(4).ok_or_else(overflow)?;
                vec![PlaneLayout::new(width, height, stride)]
            }
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                vec![luma, PlaneLayout::new(width / 2, height / 2, w)]
            }
            PixelFormat::Yuv420 | PixelFormat::Yuv422 => {
                let chroma = PlaneLayout::new(width / 2, height / 2, w / 2);
                vec![luma, chroma, chroma]
            }
        };
        layout.iter().try_fold(0usize, |total, plane| {
            plane
                .stride
                .checked_mul(plane.height as usize)
                .and_then(|size| total.checked_add(size))
                .ok_or_else(overflow)
        })?;
        Ok(layout)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&fourcc))
    }
}

/// A multi-plane image over pooled or caller supplied buffers.
///
/// The plane count and per-plane geometry depend only on the format and
/// dimensions; see [`PixelFormat::plane_layout`]. Images built from a pool
/// hold the buffer leases and return them to the pool when dropped.
///
/// # Example
///
/// ```ignore
/// use edgefirst_imgpool::image::{Image, PixelFormat};
///
/// let img = Image::from_pool(PixelFormat::Nv12, 640, 480, &pool)?;
/// assert_eq!(img.planes().len(), 2);
/// assert_eq!(img.planes()[1].width(), 320);
/// ```
pub struct Image {
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
    leases: Vec<PooledBuffer>,
}

impl Image {
    /// Builds an image whose planes are host buffers checked out of `pool`.
    ///
    /// # Errors
    ///
    /// Propagates layout validation and pool failures. Buffers checked out
    /// before a failure are returned to the pool.
    pub fn from_pool<B: ComputeBackend>(
        format: PixelFormat,
        width: u32,
        height: u32,
        pool: &BufferPool<B>,
    ) -> Result<Self> {
        let layout = format.plane_layout(width, height)?;
        let mut planes = Vec::with_capacity(layout.len());
        let mut leases = Vec::with_capacity(layout.len());
        for plane in layout {
            let lease = pool.get_buffer(MemoryKind::Host, plane.size())?;
            planes.push(Plane::new(
                plane.width,
                plane.height,
                plane.stride,
                lease.buffer().clone(),
            )?);
            leases.push(lease);
        }
        debug!("image {}x{} {} built from pool", width, height, format);
        Ok(Self {
            format,
            width,
            height,
            planes,
            leases,
        })
    }

    /// Builds an image over caller supplied buffers, one per plane in table
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the buffer count does not match
    /// the format's plane count or a buffer is too small for its plane.
    pub fn from_buffers(
        format: PixelFormat,
        width: u32,
        height: u32,
        buffers: Vec<Arc<Buffer>>,
    ) -> Result<Self> {
        let layout = format.plane_layout(width, height)?;
        if buffers.len() != layout.len() {
            return Err(Error::invalid(format!(
                "{} needs {} buffers, got {}",
                format,
                layout.len(),
                buffers.len()
            )));
        }
        let planes = layout
            .into_iter()
            .zip(buffers)
            .map(|(plane, buffer)| Plane::new(plane.width, plane.height, plane.stride, buffer))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            format,
            width,
            height,
            planes,
            leases: Vec::new(),
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Total bytes across all planes.
    pub fn size(&self) -> usize {
        self.planes.iter().map(Plane::len).sum()
    }

    /// Whether the planes are leased from a pool.
    pub fn is_pooled(&self) -> bool {
        !self.leases.is_empty()
    }

    /// Looks up (or creates) the backend handle of every plane through the
    /// pool's handle cache, in plane order.
    pub fn gpu_handles<B: ComputeBackend>(
        &self,
        pool: &BufferPool<B>,
        mode: ExportMode,
    ) -> Result<Vec<B::Handle>> {
        self.planes
            .iter()
            .map(|plane| pool.get_handle_from_plane(plane, mode))
            .collect()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} {} planes:{}",
            self.width,
            self.height,
            self.format,
            self.planes.len()
        )
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("planes", &self.planes)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
