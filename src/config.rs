// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{error::Result, image::PixelFormat};
use clap::Args;

/// Buffer pool configuration.
///
/// Derives [`clap::Args`] so a host application can flatten it into its own
/// command line, with every option also readable from the environment.
///
/// ```bash
/// export IMGPOOL_SIZES=307200,76800
/// export IMGPOOL_PREALLOC=4
/// ```
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolConfig {
    /// Buffer sizes in bytes declared when the pool is created
    #[arg(long = "pool-sizes", env = "IMGPOOL_SIZES", value_delimiter = ',')]
    pub sizes: Vec<usize>,

    /// Free host buffers pre-allocated for every declared size
    #[arg(long = "pool-prealloc", env = "IMGPOOL_PREALLOC", default_value_t = 0)]
    pub prealloc: usize,
}

impl PoolConfig {
    /// Declares the plane sizes needed by images of the given format and
    /// dimensions.
    pub fn for_image(format: PixelFormat, width: u32, height: u32) -> Result<Self> {
        let mut sizes: Vec<usize> = format
            .plane_layout(width, height)?
            .iter()
            .map(|plane| plane.size())
            .collect();
        sizes.dedup();
        Ok(Self { sizes, prealloc: 0 })
    }

    pub fn with_prealloc(mut self, prealloc: usize) -> Self {
        self.prealloc = prealloc;
        self
    }
}
