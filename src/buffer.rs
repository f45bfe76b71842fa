// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::error::{Error, Result};
use core::fmt;
use dma_buf::DmaBuf;
use libc::{
    lseek, mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE, SEEK_CUR, SEEK_END,
    SEEK_SET,
};
use parking_lot::RwLock;
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ffi::c_void,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{debug, warn};

/// Physical memory domain backing a [`Buffer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Heap memory owned by the buffer.
    Host,
    /// A shared mapping over a driver supplied DMA descriptor.
    DmaImported,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryKind::Host => write!(f, "host"),
            MemoryKind::DmaImported => write!(f, "dma"),
        }
    }
}

enum Backing {
    Host(Layout),
    Dma(OwnedFd),
}

/// A single physical memory segment, either heap allocated or mapped from a
/// DMA descriptor.
///
/// Construction either yields a fully usable buffer or an error; there is no
/// partially mapped state. The memory is released exactly once when the
/// buffer is dropped, which for shared buffers (`Arc<Buffer>`) happens when the
/// last owner lets go.
///
/// CPU access goes through [`Buffer::read`] and [`Buffer::write`], which hold
/// a per-buffer reader/writer lock for the duration of the closure.
///
/// # Example
///
/// ```no_run
/// use edgefirst_imgpool::buffer::Buffer;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let buf = Buffer::host(640 * 480)?;
/// buf.write(|bytes| bytes.fill(0x80));
/// assert!(buf.read(|bytes| bytes.iter().all(|b| *b == 0x80)));
/// # Ok(())
/// # }
/// ```
pub struct Buffer {
    ptr: NonNull<u8>,
    size: usize,
    backing: Backing,
    access: RwLock<()>,
}

// SAFETY: the pointer is owned by the buffer (heap) or by the mapping it
// created (DMA); it is never aliased outside of `read`/`write`, which are
// serialised by `access`.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Creates a buffer of `size` bytes of the requested kind.
    ///
    /// `Host` buffers must not be given a descriptor and are zero filled.
    /// `DmaImported` buffers require a descriptor, which is duplicated so the
    /// caller keeps ownership of the original, and map `size` bytes read/write
    /// shared with the descriptor's backing memory.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size, a kind/descriptor
    ///   mismatch or a descriptor shorter than `size`
    /// - [`Error::AllocationFailure`] when host memory is exhausted
    /// - [`Error::MappingFailure`] when the descriptor cannot be sized or the
    ///   kernel rejects the mapping
    pub fn new(kind: MemoryKind, size: usize, fd: Option<BorrowedFd<'_>>) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid("buffer size must be non-zero"));
        }
        match (kind, fd) {
            (MemoryKind::Host, None) => Self::alloc_host(size),
            (MemoryKind::DmaImported, Some(fd)) => Self::map_dma(fd.try_clone_to_owned()?, size),
            (MemoryKind::Host, Some(_)) => Err(Error::invalid(
                "host buffers cannot be created over a DMA descriptor",
            )),
            (MemoryKind::DmaImported, None) => {
                Err(Error::invalid("DMA buffers require a descriptor"))
            }
        }
    }

    /// Allocates a zero filled host buffer.
    pub fn host(size: usize) -> Result<Self> {
        Self::new(MemoryKind::Host, size, None)
    }

    /// Maps `size` bytes of an already open DMA descriptor.
    pub fn import_dma(fd: BorrowedFd<'_>, size: usize) -> Result<Self> {
        Self::new(MemoryKind::DmaImported, size, Some(fd))
    }

    fn alloc_host(size: usize) -> Result<Self> {
        let layout =
            Layout::array::<u8>(size).map_err(|_| Error::AllocationFailure { size })?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(Error::AllocationFailure { size })?;
        debug!("host buffer alloc'd {} bytes", size);
        Ok(Self {
            ptr,
            size,
            backing: Backing::Host(layout),
            access: RwLock::new(()),
        })
    }

    fn map_dma(fd: OwnedFd, size: usize) -> Result<Self> {
        // pages past the end of the object fault with SIGBUS on access
        let len =
            descriptor_len(fd.as_fd()).map_err(|source| Error::MappingFailure { size, source })?;
        if size as u64 > len {
            return Err(Error::invalid(format!(
                "descriptor fd:{} holds {} bytes, {} requested",
                fd.as_raw_fd(),
                len,
                size
            )));
        }
        let ptr = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(Error::MappingFailure {
                size,
                source: io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::MappingFailure {
            size,
            source: io::Error::other("mmap returned null"),
        })?;
        debug!("DMA buffer mapped {} bytes fd:{}", size, fd.as_raw_fd());
        Ok(Self {
            ptr,
            size,
            backing: Backing::Dma(fd),
            access: RwLock::new(()),
        })
    }

    pub fn kind(&self) -> MemoryKind {
        match self.backing {
            Backing::Host(_) => MemoryKind::Host,
            Backing::Dma(_) => MemoryKind::DmaImported,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The buffer's own duplicate of the DMA descriptor, `None` for host
    /// buffers.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.backing {
            Backing::Host(_) => None,
            Backing::Dma(fd) => Some(fd.as_fd()),
        }
    }

    /// Raw pointer to the first byte, valid for `size()` bytes for as long as
    /// the buffer is alive.
    ///
    /// Intended for handing the memory to FFI. Concurrent use together with
    /// [`Buffer::write`] is the caller's responsibility.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Runs `f` over the buffer contents while holding the read lock.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let _guard = self.access.read();
        f(unsafe { from_raw_parts(self.ptr.as_ptr(), self.size) })
    }

    /// Runs `f` over the mutable buffer contents while holding the write lock.
    pub fn write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let _guard = self.access.write();
        f(unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.size) })
    }

    /// Wraps a duplicate of the DMA descriptor for access bracketed by the
    /// driver's cache synchronisation ioctls. Returns `None` for host buffers.
    pub fn dmabuf(&self) -> Result<Option<DmaBuf>> {
        match &self.backing {
            Backing::Host(_) => Ok(None),
            Backing::Dma(fd) => Ok(Some(DmaBuf::from(fd.try_clone()?))),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Host(layout) => {
                unsafe { dealloc(self.ptr.as_ptr(), *layout) };
                debug!("host buffer freed {} bytes", self.size);
            }
            Backing::Dma(fd) => {
                // unmap before the descriptor is closed
                if unsafe { munmap(self.ptr.as_ptr().cast::<c_void>(), self.size) } != 0 {
                    warn!(
                        "unmap of fd:{} failed: {}",
                        fd.as_raw_fd(),
                        io::Error::last_os_error()
                    );
                } else {
                    debug!("DMA buffer unmapped {} bytes fd:{}", self.size, fd.as_raw_fd());
                }
            }
        }
    }
}

/// Length of the object behind `fd`. DMA-BUF exporters report it through
/// `lseek(SEEK_END)` only, and only allow seeking back to offset 0.
fn descriptor_len(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let raw = fd.as_raw_fd();
    let pos = unsafe { lseek(raw, 0, SEEK_CUR) };
    let end = unsafe { lseek(raw, 0, SEEK_END) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    // the offset is shared with the caller's descriptor
    unsafe { lseek(raw, pos.max(0), SEEK_SET) };
    Ok(end as u64)
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.backing {
            Backing::Host(_) => write!(f, "{} {}", self.size, self.kind()),
            Backing::Dma(fd) => write!(f, "{} {} fd:{}", self.size, self.kind(), fd.as_raw_fd()),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("kind", &self.kind())
            .field("size", &self.size)
            .field("fd", &self.fd().map(|fd| fd.as_raw_fd()))
            .finish()
    }
}
