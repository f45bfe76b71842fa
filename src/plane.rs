// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    backend::{ComputeBackend, ExportMode},
    buffer::Buffer,
    error::{Error, Result},
};
use core::fmt;
use std::{ptr::NonNull, sync::Arc};
use tracing::trace;

/// A 2D view of `height` rows of `stride` bytes over a shared [`Buffer`].
///
/// The plane never allocates; it only borrows the geometry over memory owned
/// by the buffer. `stride * height` is guaranteed to fit inside the buffer.
#[derive(Clone, Debug)]
pub struct Plane {
    width: u32,
    height: u32,
    stride: usize,
    buffer: Arc<Buffer>,
}

impl Plane {
    /// Wraps `buffer` as a plane of `width` x `height` pixels with rows of
    /// `stride` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if any dimension is zero or the rows
    /// do not fit in the buffer.
    pub fn new(width: u32, height: u32, stride: usize, buffer: Arc<Buffer>) -> Result<Self> {
        if width == 0 || height == 0 || stride == 0 {
            return Err(Error::invalid(format!(
                "plane geometry {}x{} stride {} must be non-zero",
                width, height, stride
            )));
        }
        let len = stride
            .checked_mul(height as usize)
            .ok_or_else(|| Error::invalid("plane size overflows"))?;
        if len > buffer.size() {
            return Err(Error::invalid(format!(
                "plane needs {} bytes but buffer holds {}",
                len,
                buffer.size()
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            buffer,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of bytes covered by the plane, `stride * height`. Never zero.
    pub fn len(&self) -> usize {
        self.stride * self.height as usize
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Runs `f` over the plane's bytes.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let len = self.len();
        self.buffer.read(|bytes| f(&bytes[..len]))
    }

    /// Runs `f` over the plane's bytes, mutably.
    pub fn write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let len = self.len();
        self.buffer.write(|bytes| f(&mut bytes[..len]))
    }

    /// Creates a backend memory handle covering this plane.
    ///
    /// With [`ExportMode::ZeroCopyDma`] and a DMA imported buffer the
    /// descriptor itself is imported; every other combination wraps the host
    /// visible pointer. Nothing is cached here, see
    /// [`BufferPool::get_handle_from_plane`](crate::pool::BufferPool::get_handle_from_plane).
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleCreationFailure`] if the backend refuses.
    pub fn to_gpu_handle<B: ComputeBackend>(
        &self,
        backend: &B,
        mode: ExportMode,
    ) -> Result<B::Handle> {
        let len = self.len();
        let handle = match (mode, self.buffer.fd()) {
            (ExportMode::ZeroCopyDma, Some(fd)) => {
                trace!("importing fd {:?} ({} bytes) for {}", fd, len, self);
                backend.import_dma_handle(fd, len)
            }
            _ => {
                let ptr = NonNull::new(self.buffer.as_ptr()).ok_or_else(|| {
                    Error::HandleCreationFailure("plane data is not mapped".into())
                })?;
                trace!("wrapping host pointer ({} bytes) for {}", len, self);
                backend.create_host_handle(ptr, len)
            }
        };
        handle.map_err(Error::HandleCreationFailure)
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} stride:{} [{}]",
            self.width, self.height, self.stride, self.buffer
        )
    }
}
