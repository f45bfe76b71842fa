// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Image Pool
//!
//! Pooled buffer, plane and image management across three memory domains:
//! ordinary host memory, DMA memory mapped from a driver supplied descriptor,
//! and GPU compute handles exported from either. It avoids per-frame
//! allocation churn and redundant handle creation when the same set of image
//! sizes and pixel formats is processed repeatedly.
//!
//! ## Components
//!
//! - [`buffer::Buffer`]: one physical memory segment, heap allocated or
//!   mapped over a DMA descriptor, released exactly once on drop.
//! - [`plane::Plane`]: a width/height/stride view over a shared buffer that
//!   can be exported to a [`backend::ComputeBackend`].
//! - [`image::Image`]: a pixel format aware set of planes built from a pool
//!   or from caller supplied buffers.
//! - [`pool::BufferPool`]: exact size-class buffer reuse plus a
//!   geometry-keyed cache of backend handles.
//!
//! ## Example
//!
//! ```ignore
//! use edgefirst_imgpool::{
//!     backend::ExportMode,
//!     config::PoolConfig,
//!     image::{Image, PixelFormat},
//!     pool::BufferPool,
//! };
//!
//! let config = PoolConfig::for_image(PixelFormat::Nv12, 1920, 1080)?.with_prealloc(2);
//! let pool = BufferPool::with_config(backend, &config)?;
//!
//! let img = Image::from_pool(PixelFormat::Nv12, 1920, 1080, &pool)?;
//! let handles = img.gpu_handles(&pool, ExportMode::Host)?;
//! // hand `handles` to the compute dispatch, then drop `img` to return its
//! // buffers to the pool
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: DMA buffers are mapped with `mmap(MAP_SHARED)` over DMA-BUF
//!   descriptors exported by a driver (V4L2, DMA heaps, GPU drivers).
//!
//! ## Safety
//!
//! This library uses `unsafe` code for host allocation and DMA mapping. All
//! unsafe operations are isolated in [`buffer`] and wrapped with safe APIs.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod image;
pub mod plane;
pub mod pool;

pub use error::{Error, Result};
