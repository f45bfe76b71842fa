// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

#![allow(dead_code)]

use edgefirst_imgpool::backend::{BackendError, ComputeBackend};
use std::{
    ffi::CStr,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub struct TestHandle {
    pub id: u64,
    pub len: usize,
    pub dma: bool,
}

/// Backend that records every call. Creations of `block_len` bytes park
/// until [`TestBackend::open`] is called.
#[derive(Default)]
pub struct TestBackend {
    next: AtomicU64,
    pub creates: AtomicUsize,
    pub released: Arc<Mutex<Vec<TestHandle>>>,
    pub block_len: Option<usize>,
    pub entered: AtomicBool,
    gate: Mutex<bool>,
    cond: Condvar,
}

impl TestBackend {
    pub fn blocking(len: usize) -> Self {
        Self {
            block_len: Some(len),
            ..Default::default()
        }
    }

    pub fn open(&self) {
        *self.gate.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    fn create(&self, len: usize, dma: bool) -> Result<TestHandle, BackendError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.block_len == Some(len) {
            self.entered.store(true, Ordering::SeqCst);
            let mut open = self.gate.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }
        Ok(TestHandle {
            id: self.next.fetch_add(1, Ordering::SeqCst),
            len,
            dma,
        })
    }
}

impl ComputeBackend for TestBackend {
    type Handle = TestHandle;

    fn create_host_handle(&self, _ptr: NonNull<u8>, len: usize) -> Result<TestHandle, BackendError> {
        self.create(len, false)
    }

    fn import_dma_handle(&self, _fd: BorrowedFd<'_>, len: usize) -> Result<TestHandle, BackendError> {
        self.create(len, true)
    }

    fn release_handle(&self, handle: TestHandle) {
        self.released.lock().unwrap().push(handle);
    }
}

/// Anonymous shared memory standing in for a driver exported DMA-BUF.
pub fn memfd(name: &CStr, size: usize) -> OwnedFd {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    assert!(fd >= 0, "memfd_create failed");
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    assert_eq!(
        unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) },
        0
    );
    fd
}

/// Number of mappings of the named memfd in this process.
pub fn mappings_of(name: &str) -> usize {
    std::fs::read_to_string("/proc/self/maps")
        .unwrap()
        .lines()
        .filter(|line| line.contains(&format!("/memfd:{}", name)))
        .count()
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
