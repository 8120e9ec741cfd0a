// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Physical memory and the allocator seam.
//!
//! A [`Memory`] is one physical buffer set of a data object: one [`Plane`] per
//! storage plane (image planes, pyramid levels, the element store of an
//! array). Planes come from an [`Allocator`], the opaque provider of
//! addressable, fd-exportable memory.
//!
//! [`HeapAllocator`] is the default provider. It keeps freed planes in fixed
//! size buckets for reuse:
//! - fixed size buckets (by byte count)
//! - bounded buffers per bucket
//! - every plane gets a synthetic export descriptor

use crate::error::{Result, VisionError};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// One contiguous storage plane.
#[derive(Debug)]
pub struct Plane {
    pub data: BytesMut,
    /// Export descriptor of the plane.
    pub fd: Option<i32>,
    /// Imported planes belong to the application and are not returned to the allocator.
    pub imported: bool,
}

impl Plane {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What the application hands in when importing memory.
#[derive(Debug)]
pub enum Import {
    /// Host memory owned by the application.
    Host(BytesMut),
    /// An exported descriptor plus its byte size.
    Fd { fd: i32, size: usize },
}

/// A complete physical buffer set.
#[derive(Debug, Default)]
pub struct Memory {
    pub planes: Vec<Plane>,
    /// Number of valid items (arrays only).
    pub num_items: usize,
}

/// Physical memory shared between a data object, its clones and running kernels.
pub type SharedMemory = Arc<Mutex<Memory>>;

impl Memory {
    /// Allocates one plane per entry of `sizes`, releasing every plane already
    /// obtained if a later one fails.
    ///
    /// # Errors
    ///
    /// Returns `NoResources` if the allocator refuses any plane.
    pub fn allocate(allocator: &dyn Allocator, sizes: &[usize]) -> Result<Self> {
        let mut planes = Vec::with_capacity(sizes.len());
        for &size in sizes {
            match allocator.alloc(size) {
                Ok(plane) => planes.push(plane),
                Err(err) => {
                    tracing::error!(size, allocated = planes.len(), "plane allocation failed, rolling back");
                    for plane in planes {
                        allocator.free(plane);
                    }
                    return Err(err);
                },
            }
        }
        Ok(Self { planes, num_items: 0 })
    }

    /// Builds memory from imported planes.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if any import fails.
    pub fn import(allocator: &dyn Allocator, sources: Vec<Import>) -> Result<Self> {
        let planes = sources.into_iter().map(|src| allocator.import(src)).collect::<Result<_>>()?;
        Ok(Self { planes, num_items: 0 })
    }

    /// Returns every plane to the allocator. Imported planes are dropped.
    pub fn free(self, allocator: &dyn Allocator) {
        for plane in self.planes {
            if !plane.imported {
                allocator.free(plane);
            }
        }
    }

    pub fn into_shared(self) -> SharedMemory {
        Arc::new(Mutex::new(self))
    }

    pub fn fds(&self) -> Vec<Option<i32>> {
        self.planes.iter().map(|p| p.fd).collect()
    }
}

/// Provider of physical planes.
pub trait Allocator: Send + Sync {
    /// # Errors
    ///
    /// Returns `NoResources` if the memory cannot be provided.
    fn alloc(&self, size: usize) -> Result<Plane>;

    fn free(&self, plane: Plane);

    /// # Errors
    ///
    /// Returns `InvalidParameters` if the import source is unusable.
    fn import(&self, source: Import) -> Result<Plane>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub allocated: u64,
    pub freed: u64,
    pub hits: u64,
    pub misses: u64,
}

impl AllocatorStats {
    /// Planes currently handed out.
    pub const fn live(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }
}

struct Buckets {
    bucket_sizes: Vec<usize>,
    buckets: Vec<Vec<BytesMut>>,
}

impl Buckets {
    fn index_for_min_len(&self, min_len: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&size| size >= min_len)
    }

    fn index_for_storage_len(&self, storage_len: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&size| size == storage_len)
    }
}

/// Heap-backed allocator with bucketed reuse of freed planes.
pub struct HeapAllocator {
    inner: Mutex<Buckets>,
    max_per_bucket: usize,
    /// Optional ceiling on planes handed out at once.
    max_live: Option<u64>,
    next_fd: AtomicI32,
    allocated: AtomicU64,
    freed: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::with_buckets(vec![4 * 1024, 64 * 1024, 1024 * 1024, 8 * 1024 * 1024], 16)
    }
}

impl HeapAllocator {
    /// `bucket_sizes` are sorted and deduplicated.
    pub fn with_buckets(mut bucket_sizes: Vec<usize>, max_per_bucket: usize) -> Self {
        bucket_sizes.sort_unstable();
        bucket_sizes.dedup();
        let buckets = (0..bucket_sizes.len()).map(|_| Vec::new()).collect();
        Self {
            inner: Mutex::new(Buckets { bucket_sizes, buckets }),
            max_per_bucket,
            max_live: None,
            next_fd: AtomicI32::new(1000),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Refuses allocations once `max_live` planes are outstanding.
    #[must_use]
    pub const fn with_limit(mut self, max_live: u64) -> Self {
        self.max_live = Some(max_live);
        self
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn take_storage(&self, size: usize) -> BytesMut {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(idx) = guard.index_for_min_len(size) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return BytesMut::zeroed(size);
        };
        let bucket_size = guard.bucket_sizes[idx];
        if let Some(mut storage) = guard.buckets[idx].pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            drop(guard);
            storage.clear();
            storage.resize(size, 0);
            return storage;
        }
        drop(guard);
        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut storage = BytesMut::zeroed(bucket_size);
        storage.truncate(size);
        storage
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Result<Plane> {
        if let Some(max_live) = self.max_live {
            if self.stats().live() >= max_live {
                return Err(VisionError::NoResources(format!(
                    "allocator limit of {max_live} planes reached"
                )));
            }
        }
        let data = self.take_storage(size);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        Ok(Plane { data, fd: Some(fd), imported: false })
    }

    fn free(&self, plane: Plane) {
        self.freed.fetch_add(1, Ordering::Relaxed);
        let storage = plane.data;
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(idx) = guard.index_for_storage_len(storage.capacity()) {
            if guard.buckets[idx].len() < self.max_per_bucket {
                guard.buckets[idx].push(storage);
            }
        }
    }

    fn import(&self, source: Import) -> Result<Plane> {
        match source {
            Import::Host(data) => Ok(Plane { data, fd: None, imported: true }),
            Import::Fd { fd, size } => {
                if fd < 0 {
                    return Err(VisionError::InvalidParameters(format!("invalid fd {fd}")));
                }
                Ok(Plane { data: BytesMut::zeroed(size), fd: Some(fd), imported: true })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_counts() {
        let allocator = HeapAllocator::default();
        let memory = Memory::allocate(&allocator, &[64, 32]).unwrap();
        assert_eq!(memory.planes.len(), 2);
        assert_eq!(memory.planes[0].len(), 64);
        assert_eq!(allocator.stats().live(), 2);
        memory.free(&allocator);
        assert_eq!(allocator.stats().live(), 0);
    }

    #[test]
    fn test_failed_allocation_rolls_back() {
        let allocator = HeapAllocator::default().with_limit(2);
        let err = Memory::allocate(&allocator, &[16, 16, 16]).unwrap_err();
        assert!(matches!(err, VisionError::NoResources(_)));
        let stats = allocator.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_freed_storage_is_reused() {
        let allocator = HeapAllocator::with_buckets(vec![128], 4);
        Memory::allocate(&allocator, &[100]).unwrap().free(&allocator);
        let again = Memory::allocate(&allocator, &[120]).unwrap();
        assert_eq!(again.planes[0].len(), 120);
        assert_eq!(allocator.stats().hits, 1);
    }

    #[test]
    fn test_imported_planes_are_not_freed() {
        let allocator = HeapAllocator::default();
        let memory = Memory::import(
            &allocator,
            vec![Import::Host(BytesMut::zeroed(8)), Import::Fd { fd: 7, size: 8 }],
        )
        .unwrap();
        assert_eq!(memory.fds(), vec![None, Some(7)]);
        memory.free(&allocator);
        assert_eq!(allocator.stats().freed, 0);
    }

    #[test]
    fn test_negative_fd_rejected() {
        let allocator = HeapAllocator::default();
        assert!(allocator.import(Import::Fd { fd: -1, size: 4 }).is_err());
    }
}
