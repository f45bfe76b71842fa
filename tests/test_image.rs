// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use common::{mappings_of, memfd, TestBackend};
use edgefirst_imgpool::{
    backend::ExportMode,
    buffer::Buffer,
    config::PoolConfig,
    image::{Image, PixelFormat},
    pool::BufferPool,
    Error,
};
use serial_test::serial;
use std::{error::Error as StdError, os::fd::AsFd, sync::Arc};

#[test]
fn test_formats() -> Result<(), Box<dyn StdError>> {
    let pool = BufferPool::new(TestBackend::default(), &[]);

    let mut img = Image::from_pool(PixelFormat::Nv12, 1920, 1080, &pool)?;
    println!("{}", img);
    assert_eq!(img.size(), 3110400);

    img = Image::from_pool(PixelFormat::Yuv420, 1920, 1080, &pool)?;
    println!("{}", img);
    assert_eq!(img.size(), 3110400);

    img = Image::from_pool(PixelFormat::Rgb, 1920, 1080, &pool)?;
    println!("{}", img);
    assert_eq!(img.size(), 6220800);

    img = Image::from_pool(PixelFormat::Rgba, 1920, 1080, &pool)?;
    println!("{}", img);
    assert_eq!(img.size(), 8294400);

    Ok(())
}

#[test]
fn test_nv12_planes() -> Result<(), Box<dyn StdError>> {
    let pool = BufferPool::new(TestBackend::default(), &[]);
    let img = Image::from_pool(PixelFormat::Nv12, 640, 480, &pool)?;
    let planes = img.planes();

    assert_eq!(planes.len(), 2);
    assert_eq!((planes[0].width(), planes[0].height()), (640, 480));
    assert_eq!(planes[0].stride(), 640);
    assert_eq!((planes[1].width(), planes[1].height()), (320, 240));
    assert_eq!(planes[1].stride(), 320 * 2);

    Ok(())
}

/// Building and dropping the same image repeatedly must settle on one set of
/// buffers rather than allocating a new set per frame.
#[test]
fn test_cleanup() -> Result<(), Box<dyn StdError>> {
    let config = PoolConfig::for_image(PixelFormat::Rgba, 1920, 1080)?;
    let pool = BufferPool::with_config(TestBackend::default(), &config)?;
    for _ in 0..100 {
        let img = Image::from_pool(PixelFormat::Rgba, 1920, 1080, &pool)?;
        assert_eq!(img.size(), 8294400);
    }
    let stats = pool.stats();
    assert_eq!(stats.buffers, 1);
    assert_eq!(stats.in_use, 0);

    Ok(())
}

#[test]
fn test_4k() -> Result<(), Box<dyn StdError>> {
    let pool = BufferPool::new(TestBackend::default(), &[]);
    let img1 = Image::from_pool(PixelFormat::Rgba, 3840, 2160, &pool)?;
    let img2 = Image::from_pool(PixelFormat::Rgba, 3840, 2160, &pool)?;

    assert_eq!(img1.size(), 33177600);
    assert_eq!(img2.size(), 33177600);
    assert_eq!(pool.stats().in_use, 2);

    println!("{} {}", img1, img2);

    Ok(())
}

#[test]
fn test_mismatched_buffers() -> Result<(), Box<dyn StdError>> {
    let only = vec![Arc::new(Buffer::host(640 * 480)?)];
    let err = Image::from_buffers(PixelFormat::Yuv420, 640, 480, only).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    Ok(())
}

#[test]
#[serial]
fn test_dma_image() -> Result<(), Box<dyn StdError>> {
    let luma = memfd(c"imgpool-nv12-y", 640 * 480);
    let chroma = memfd(c"imgpool-nv12-uv", 640 * 240);
    let buffers = vec![
        Arc::new(Buffer::import_dma(luma.as_fd(), 640 * 480)?),
        Arc::new(Buffer::import_dma(chroma.as_fd(), 640 * 240)?),
    ];
    let img = Image::from_buffers(PixelFormat::Nv12, 640, 480, buffers)?;
    img.planes()[0].write(|bytes| bytes.fill(16));
    img.planes()[1].write(|bytes| bytes.fill(128));

    let pool = BufferPool::new(TestBackend::default(), &[]);
    let handles = img.gpu_handles(&pool, ExportMode::ZeroCopyDma)?;
    assert!(handles.iter().all(|h| h.dma));
    assert_eq!(handles[1].len, 640 * 240);

    // a second view over the same descriptor sees the writes
    let view = Buffer::import_dma(chroma.as_fd(), 640 * 240)?;
    assert!(view.read(|bytes| bytes.iter().all(|b| *b == 128)));
    drop(view);

    // the cached handles still reference both planes
    drop(img);
    assert_eq!(mappings_of("imgpool-nv12-y"), 1);
    assert_eq!(mappings_of("imgpool-nv12-uv"), 1);

    pool.clear_handles();
    assert_eq!(mappings_of("imgpool-nv12-y"), 0);
    assert_eq!(mappings_of("imgpool-nv12-uv"), 0);

    Ok(())
}

#[test]
#[serial]
#[ignore = "DMA heap test is disabled by default (run with --include-ignored to enable)"]
fn test_dma_heap() -> Result<(), Box<dyn StdError>> {
    use dma_heap::{Heap, HeapKind};

    let heap = Heap::new(HeapKind::Cma)?;
    let layout = PixelFormat::Nv12.plane_layout(1920, 1080)?;
    let fds = layout
        .iter()
        .map(|plane| heap.allocate(plane.size()))
        .collect::<Result<Vec<_>, _>>()?;
    let buffers = fds
        .iter()
        .zip(&layout)
        .map(|(fd, plane)| Buffer::import_dma(fd.as_fd(), plane.size()).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    let img = Image::from_buffers(PixelFormat::Nv12, 1920, 1080, buffers)?;
    println!("{}", img);
    for plane in img.planes() {
        assert!(plane.buffer().dmabuf()?.is_some());
        plane.write(|bytes| bytes.fill(0x80));
    }

    let pool = BufferPool::new(TestBackend::default(), &[]);
    let handles = img.gpu_handles(&pool, ExportMode::ZeroCopyDma)?;
    assert_eq!(handles.len(), 2);

    Ok(())
}
