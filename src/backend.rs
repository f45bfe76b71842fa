// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{error::Error, fmt::Debug, os::fd::BorrowedFd, ptr::NonNull};

/// Error reported by a compute backend when it refuses a handle.
pub type BackendError = Box<dyn Error + Send + Sync>;

/// How a plane's memory is handed to the compute backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ExportMode {
    /// Wrap the host-visible pointer of the buffer.
    #[default]
    Host,
    /// Import the DMA descriptor itself, without a host side copy. Buffers
    /// that are not DMA imported fall back to [`ExportMode::Host`] behaviour.
    ZeroCopyDma,
}

/// The GPU compute backend that owns contexts, queues and kernel dispatch.
///
/// This crate only produces and caches the memory handles the backend needs;
/// an OpenCL implementation would map the two create calls onto
/// `clCreateBuffer(CL_MEM_USE_HOST_PTR)` and a vendor fd import, and
/// `release_handle` onto `clReleaseMemObject`.
pub trait ComputeBackend: Send + Sync {
    /// Backend memory object. Clones must refer to the same object.
    type Handle: Clone + PartialEq + Debug + Send + Sync;

    /// Creates a handle over `len` bytes of host-visible memory at `ptr`.
    ///
    /// The memory stays valid for as long as the owning buffer is alive.
    fn create_host_handle(&self, ptr: NonNull<u8>, len: usize)
        -> Result<Self::Handle, BackendError>;

    /// Imports `len` bytes of a DMA descriptor without copying.
    fn import_dma_handle(&self, fd: BorrowedFd<'_>, len: usize)
        -> Result<Self::Handle, BackendError>;

    /// Releases a handle previously returned by one of the create calls.
    fn release_handle(&self, handle: Self::Handle);
}
