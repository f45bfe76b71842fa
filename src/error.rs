// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::io;
use thiserror::Error;

/// Error type returned by the buffer, plane, image and pool operations.
///
/// Every failure is local to the call that produced it; none of them leave a
/// partially constructed object behind.
#[derive(Error, Debug)]
pub enum Error {
    /// Host memory for a buffer could not be allocated.
    #[error("failed to allocate {size} bytes of host memory")]
    AllocationFailure { size: usize },

    /// A DMA descriptor could not be mapped into the process.
    #[error("failed to map {size} bytes of DMA memory: {source}")]
    MappingFailure {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Bad kind/descriptor combination, geometry or ownership.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The compute backend refused to create or import a memory handle.
    #[error("failed to create GPU handle: {0}")]
    HandleCreationFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
