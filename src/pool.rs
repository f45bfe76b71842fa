// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    backend::{ComputeBackend, ExportMode},
    buffer::{Buffer, MemoryKind},
    config::PoolConfig,
    error::{Error, Result},
    plane::Plane,
};
use core::fmt;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, trace, warn};

struct Slot {
    buffer: Arc<Buffer>,
    generation: u32,
    in_use: bool,
}

/// Arena of every buffer the pool has ever created or adopted. Slot indices
/// are stable for the lifetime of the pool.
#[derive(Default)]
struct Buckets {
    slots: Vec<Slot>,
    by_size: HashMap<usize, Vec<usize>>,
}

#[derive(Default)]
struct Registry {
    buckets: Mutex<Buckets>,
}

impl Registry {
    fn release(&self, index: usize, generation: u32) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let slot = buckets
            .slots
            .get_mut(index)
            .ok_or_else(|| Error::invalid(format!("slot {} is not owned by this pool", index)))?;
        if !slot.in_use || slot.generation != generation {
            return Err(Error::invalid(format!(
                "stale lease for slot {} (generation {} != {})",
                index, generation, slot.generation
            )));
        }
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        trace!("slot {} returned", index);
        Ok(())
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// The lease is the only token that can hand the buffer back, so a buffer
/// cannot be returned twice. Dropping a lease that was not passed to
/// [`BufferPool::return_buffer`] returns it implicitly.
pub struct PooledBuffer {
    buffer: Arc<Buffer>,
    index: usize,
    generation: u32,
    registry: Option<Arc<Registry>>,
}

impl PooledBuffer {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Stable arena index of the buffer inside its pool.
    pub fn slot(&self) -> usize {
        self.index
    }
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            if let Err(e) = registry.release(self.index, self.generation) {
                warn!("dropping lease: {}", e);
            }
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("slot", &self.index)
            .field("generation", &self.generation)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Geometry key for the handle cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub mode: ExportMode,
}

impl HandleKey {
    pub fn new(plane: &Plane, mode: ExportMode) -> Self {
        Self {
            width: plane.width(),
            height: plane.height(),
            stride: plane.stride(),
            mode,
        }
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} stride:{} {:?}",
            self.width, self.height, self.stride, self.mode
        )
    }
}

/// Snapshot of pool occupancy and cache effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of size classes.
    pub buckets: usize,
    /// Buffers owned by the pool, free or in use.
    pub buffers: usize,
    /// Buffers currently checked out.
    pub in_use: usize,
    /// Handles currently held by the cache.
    pub cached_handles: usize,
    /// Backend handle creations performed by the cache.
    pub handle_creations: u64,
    /// Lookups answered from the cache.
    pub cache_hits: u64,
}

/// A cached handle together with the buffer it was created over. Holding the
/// buffer keeps the memory behind `handle` mapped for as long as the entry
/// lives.
struct CachedHandle<H> {
    buffer: Arc<Buffer>,
    handle: H,
}

type HandleCell<H> = Arc<Mutex<Option<CachedHandle<H>>>>;

/// Size-keyed buffer registry with a geometry-keyed cache of backend handles.
///
/// Buffers are bucketed by their exact byte size; sizes are never rounded, so
/// callers only benefit from reuse when they request consistent sizes. Buffers
/// and handles live until the pool is dropped or the handle is explicitly
/// returned; there is no eviction policy. A cached handle keeps the buffer it
/// was created over alive, and a free buffer is only handed out again once
/// nothing outside the pool references it.
///
/// The buffer arena and the handle map are protected by two independent
/// locks that are never held together. Each handle key additionally owns a
/// reservation cell; the backend call runs while holding only that cell, so
/// a slow driver stalls lookups of the same geometry and nothing else. A cell
/// may take the map lock, the map lock never waits on a cell.
///
/// # Example
///
/// ```ignore
/// use edgefirst_imgpool::{backend::ExportMode, buffer::MemoryKind, pool::BufferPool};
///
/// let pool = BufferPool::new(backend, &[640 * 480]);
/// let buf = pool.get_buffer(MemoryKind::Host, 640 * 480)?;
/// let plane = Plane::new(640, 480, 640, buf.buffer().clone())?;
/// let handle = pool.get_handle_from_plane(&plane, ExportMode::Host)?;
/// // ... dispatch a kernel with `handle` ...
/// pool.return_handle(&plane, handle, ExportMode::Host)?;
/// pool.return_buffer(buf)?;
/// ```
pub struct BufferPool<B: ComputeBackend> {
    backend: B,
    registry: Arc<Registry>,
    handles: Mutex<HashMap<HandleKey, HandleCell<B::Handle>>>,
    cached: AtomicUsize,
    creations: AtomicU64,
    hits: AtomicU64,
}

impl<B: ComputeBackend> BufferPool<B> {
    /// Creates a pool with an empty bucket for each declared size.
    pub fn new(backend: B, sizes: &[usize]) -> Self {
        let mut buckets = Buckets::default();
        for size in sizes {
            buckets.by_size.entry(*size).or_default();
        }
        debug!("buffer pool created with {} size classes", buckets.by_size.len());
        Self {
            backend,
            registry: Arc::new(Registry {
                buckets: Mutex::new(buckets),
            }),
            handles: Mutex::new(HashMap::new()),
            cached: AtomicUsize::new(0),
            creations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Creates a pool from `config`, pre-seeding `config.prealloc` free host
    /// buffers for every declared size.
    /// Repeated sizes are reserved once.
    pub fn with_config(backend: B, config: &PoolConfig) -> Result<Self> {
        let mut sizes = config.sizes.clone();
        sizes.sort_unstable();
        sizes.dedup();
        let pool = Self::new(backend, &sizes);
        for size in sizes {
            pool.reserve(size, config.prealloc)?;
        }
        Ok(pool)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Allocates `count` additional free host buffers of `size` bytes.
    pub fn reserve(&self, size: usize, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let fresh = (0..count)
            .map(|_| Buffer::host(size).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let mut buckets = self.registry.buckets.lock();
        for buffer in fresh {
            insert(&mut buckets, buffer, false);
        }
        debug!("reserved {} host buffers of {} bytes", count, size);
        Ok(())
    }

    /// Registers an externally created buffer, typically a DMA import, as a
    /// free member of the bucket matching its size.
    pub fn adopt(&self, buffer: Buffer) {
        debug!("adopting {}", buffer);
        let mut buckets = self.registry.buckets.lock();
        insert(&mut buckets, Arc::new(buffer), false);
    }

    /// Checks out a buffer of exactly `size` bytes and the requested kind.
    ///
    /// A free buffer from the matching bucket is reused when available,
    /// otherwise a new host buffer is allocated and added to the bucket. Free
    /// buffers still referenced elsewhere, by a plane or clone that outlived
    /// its lease or by a cached handle, are skipped until released. The
    /// pool never creates DMA descriptors, so `DmaImported` requests can only
    /// be served from buffers previously registered with [`BufferPool::adopt`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size or a `DmaImported` request
    ///   with no free adopted buffer
    /// - [`Error::AllocationFailure`] if a new host buffer cannot be allocated
    pub fn get_buffer(&self, kind: MemoryKind, size: usize) -> Result<PooledBuffer> {
        if size == 0 {
            return Err(Error::invalid("buffer size must be non-zero"));
        }
        let mut buckets = self.registry.buckets.lock();
        let Buckets { slots, by_size } = &mut *buckets;
        let bucket = by_size.entry(size).or_default();

        let free = bucket.iter().copied().find(|&index| {
            let slot = &slots[index];
            !slot.in_use && slot.buffer.kind() == kind && Arc::strong_count(&slot.buffer) == 1
        });
        let index = match free {
            Some(index) => {
                slots[index].in_use = true;
                trace!("reusing slot {} ({} bytes)", index, size);
                index
            }
            None => {
                if kind == MemoryKind::DmaImported {
                    return Err(Error::invalid(format!(
                        "no unreferenced DMA buffer of {} bytes, adopt one first",
                        size
                    )));
                }
                let buffer = Arc::new(Buffer::new(kind, size, None)?);
                let index = insert(&mut buckets, buffer, true);
                debug!("slot {} allocated ({} bytes)", index, size);
                index
            }
        };

        let slot = &buckets.slots[index];
        Ok(PooledBuffer {
            buffer: slot.buffer.clone(),
            index,
            generation: slot.generation,
            registry: Some(self.registry.clone()),
        })
    }

    /// Marks a checked out buffer free for reuse. The buffer is not destroyed.
    ///
    /// Clones of the buffer that outlive the lease keep it out of circulation
    /// until they are dropped, so they can never alias the next holder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the lease belongs to a different
    /// pool; that lease is then handed back to its own pool on drop.
    pub fn return_buffer(&self, mut buffer: PooledBuffer) -> Result<()> {
        match &buffer.registry {
            Some(registry) if Arc::ptr_eq(registry, &self.registry) => {}
            _ => {
                warn!("rejected foreign buffer slot {}", buffer.index);
                return Err(Error::invalid("buffer is not owned by this pool"));
            }
        }
        let registry = buffer.registry.take();
        match registry {
            Some(registry) => registry.release(buffer.index, buffer.generation),
            None => Err(Error::invalid("buffer was already returned")),
        }
    }

    /// Returns the cached backend handle for the plane's geometry, creating
    /// it on the first request.
    ///
    /// The cache is keyed by `(width, height, stride, mode)` only: a later
    /// plane of identical geometry receives the handle created for the first
    /// one, regardless of which buffer it wraps. The entry holds on to the
    /// first plane's buffer until the handle is returned or the pool dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleCreationFailure`] if the backend refuses. The
    /// key stays uncached so a later call retries.
    pub fn get_handle_from_plane(&self, plane: &Plane, mode: ExportMode) -> Result<B::Handle> {
        let key = HandleKey::new(plane, mode);
        loop {
            let cell = self.handles.lock().entry(key).or_default().clone();

            let mut slot = cell.lock();
            if let Some(cached) = slot.as_ref() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!("handle cache hit {}", key);
                return Ok(cached.handle.clone());
            }
            if !self.is_current(&key, &cell) {
                // evicted while waiting on the cell
                continue;
            }

            let handle = match plane.to_gpu_handle(&self.backend, mode) {
                Ok(handle) => handle,
                Err(e) => {
                    self.evict(&key, &cell);
                    return Err(e);
                }
            };
            *slot = Some(CachedHandle {
                buffer: plane.buffer().clone(),
                handle: handle.clone(),
            });
            self.cached.fetch_add(1, Ordering::Relaxed);
            self.creations.fetch_add(1, Ordering::Relaxed);
            debug!("handle cache miss {}, created {:?}", key, handle);
            return Ok(handle);
        }
    }

    /// Evicts the cache entry for the plane's geometry, releases the handle
    /// with the backend and drops the entry's hold on its buffer.
    ///
    /// `mode` must be the export mode the handle was requested with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if nothing is cached for the key or
    /// `handle` is not the cached one; the cache is left untouched.
    pub fn return_handle(&self, plane: &Plane, handle: B::Handle, mode: ExportMode) -> Result<()> {
        let key = HandleKey::new(plane, mode);
        let cell = self
            .handles
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("no cached handle for {}", key)))?;

        let mut slot = cell.lock();
        let cached = match slot.take() {
            Some(cached) if cached.handle == handle => cached,
            other => {
                let msg = match &other {
                    Some(_) => format!("handle {:?} is not the one cached for {}", handle, key),
                    None => format!("no cached handle for {}", key),
                };
                *slot = other;
                return Err(Error::InvalidArgument(msg));
            }
        };
        self.evict(&key, &cell);
        drop(slot);

        debug!("releasing handle {:?} for {}", cached.handle, key);
        self.release(cached);
        Ok(())
    }

    /// Releases every cached handle and empties the cache.
    pub fn clear_handles(&self) {
        let cells: Vec<_> = self
            .handles
            .lock()
            .iter()
            .map(|(key, cell)| (*key, cell.clone()))
            .collect();
        for (key, cell) in cells {
            let mut slot = cell.lock();
            let cached = slot.take();
            self.evict(&key, &cell);
            drop(slot);
            if let Some(cached) = cached {
                self.release(cached);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (buckets, buffers, in_use) = {
            let buckets = self.registry.buckets.lock();
            (
                buckets.by_size.len(),
                buckets.slots.len(),
                buckets.slots.iter().filter(|slot| slot.in_use).count(),
            )
        };
        PoolStats {
            buckets,
            buffers,
            in_use,
            cached_handles: self.cached.load(Ordering::Relaxed),
            handle_creations: self.creations.load(Ordering::Relaxed),
            cache_hits: self.hits.load(Ordering::Relaxed),
        }
    }

    fn is_current(&self, key: &HandleKey, cell: &HandleCell<B::Handle>) -> bool {
        self.handles
            .lock()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
    }

    /// Drops `cell` from the map unless it was already replaced. Callers hold
    /// the cell lock so no lookup can fill it afterwards.
    fn evict(&self, key: &HandleKey, cell: &HandleCell<B::Handle>) {
        let mut handles = self.handles.lock();
        if handles.get(key).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            handles.remove(key);
        }
    }

    /// Releases the handle with the backend, then lets go of its buffer.
    fn release(&self, cached: CachedHandle<B::Handle>) {
        let CachedHandle { buffer, handle } = cached;
        self.cached.fetch_sub(1, Ordering::Relaxed);
        self.backend.release_handle(handle);
        drop(buffer);
    }
}

impl<B: ComputeBackend> Drop for BufferPool<B> {
    fn drop(&mut self) {
        let mut released = 0;
        for (_, cell) in self.handles.get_mut().drain() {
            if let Some(CachedHandle { buffer, handle }) = cell.lock().take() {
                self.backend.release_handle(handle);
                drop(buffer);
                released += 1;
            }
        }
        debug!("buffer pool dropped, released {} handles", released);
    }
}

fn insert(buckets: &mut Buckets, buffer: Arc<Buffer>, in_use: bool) -> usize {
    let index = buckets.slots.len();
    buckets
        .by_size
        .entry(buffer.size())
        .or_default()
        .push(index);
    buckets.slots.push(Slot {
        buffer,
        generation: 0,
        in_use,
    });
    index
}
