// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Buffer rotation for streaming execution.
//!
//! A data object backed by more than one physical buffer hands its buffers to
//! one of the managers in this module. The managers are generic over the
//! resource they rotate (`R`), which for data objects is the per-buffer clone.
//!
//! # Slot ring
//!
//! [`SlotManager`] owns a fixed ring of resources. Each element moves through
//!
//! ```text
//!   NoLock ──wait_and_get_empty_res_and_wr_lk──▶ WriteLock
//!     ▲                                              │
//!     │                            set_filled_res_and_rd_lk(demand)
//!     │                                              ▼
//!     └──── last put_filled_res (demand met) ──── ReadLock
//! ```
//!
//! A writer blocks until an element is in `NoLock`. A filled element is only
//! recycled once every declared reader has taken and released it, which is the
//! backpressure that bounds the number of frames in flight.
//!
//! # Queues
//!
//! [`InputQueueManager`] holds buffers the application pushed, each tagged with
//! its own frame id; consumed buffers move to a done pool the application pops.
//! [`OutputQueueManager`] holds empty buffers the application lent; the
//! producer fills them and they move to a done pool together with a validity
//! flag.

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

/// Strategy backing a data object's physical storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Not allocated yet.
    #[default]
    None,
    /// One buffer for the object's whole life.
    Solid,
    /// A ring of buffers rotated per frame.
    Slot,
    /// Application-pushed buffers consumed by the graph.
    InputQueue,
    /// Application-lent buffers filled by the graph.
    OutputQueue,
}

impl ResourceKind {
    pub const fn is_queue(self) -> bool {
        matches!(self, Self::InputQueue | Self::OutputQueue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    NoLock,
    WriteLock,
    ReadLock,
}

#[derive(Debug)]
struct SlotElement<R> {
    resource: R,
    lock: LockState,
    frame_id: u64,
    demand_number: u32,
    read_ref_count: u32,
    demand_count: u32,
    valid: bool,
}

impl<R> SlotElement<R> {
    const fn read_complete(&self) -> bool {
        self.read_ref_count == 0 && self.demand_count >= self.demand_number
    }

    fn reset(&mut self) {
        self.lock = LockState::NoLock;
        self.frame_id = 0;
        self.demand_number = 0;
        self.read_ref_count = 0;
        self.demand_count = 0;
        self.valid = false;
    }
}

/// A resource handed to a reader or writer together with its ring index.
#[derive(Debug, Clone)]
pub struct Acquired<R> {
    pub index: usize,
    pub resource: R,
    /// Whether the producer reported the content as valid. Always `true` for writers.
    pub valid: bool,
}

/// Ring of `N` resources with a readers/writer discipline per element.
pub struct SlotManager<R> {
    name: String,
    elements: Mutex<Vec<SlotElement<R>>>,
    notify: Notify,
}

impl<R: Clone> SlotManager<R> {
    pub fn new(name: impl Into<String>, resources: Vec<R>) -> Self {
        let elements = resources
            .into_iter()
            .map(|resource| SlotElement {
                resource,
                lock: LockState::NoLock,
                frame_id: 0,
                demand_number: 0,
                read_ref_count: 0,
                demand_count: 0,
                valid: false,
            })
            .collect();
        Self { name: name.into(), elements: Mutex::new(elements), notify: Notify::new() }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resources(&self) -> Vec<R> {
        self.lock().iter().map(|e| e.resource.clone()).collect()
    }

    pub fn lock_state(&self, index: usize) -> Option<LockState> {
        self.lock().get(index).map(|e| e.lock)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SlotElement<R>>> {
        self.elements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write-locks a free element for `frame_id` if one exists.
    pub fn try_get_empty_res_and_wr_lk(&self, frame_id: u64) -> Option<Acquired<R>> {
        let mut elements = self.lock();
        let (index, element) =
            elements.iter_mut().enumerate().find(|(_, e)| e.lock == LockState::NoLock)?;
        element.lock = LockState::WriteLock;
        element.frame_id = frame_id;
        element.valid = true;
        Some(Acquired { index, resource: element.resource.clone(), valid: true })
    }

    /// Write-locks a free element for `frame_id`, waiting until a reader
    /// recycles one if the ring is full.
    pub async fn wait_and_get_empty_res_and_wr_lk(&self, frame_id: u64) -> Acquired<R> {
        loop {
            let notified = self.notify.notified();
            if let Some(acquired) = self.try_get_empty_res_and_wr_lk(frame_id) {
                return acquired;
            }
            tracing::trace!(manager = %self.name, frame_id, "slot ring full, waiting for a reader");
            notified.await;
        }
    }

    /// Publishes the element written for `frame_id`; it is recycled after
    /// `demand_number` reads.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` if no element is write-locked for `frame_id`.
    pub fn set_filled_res_and_rd_lk(&self, frame_id: u64, demand_number: u32, valid: bool) -> Result<()> {
        let mut elements = self.lock();
        let element = elements
            .iter_mut()
            .find(|e| e.lock == LockState::WriteLock && e.frame_id == frame_id)
            .ok_or_else(|| {
                VisionError::InvalidParameters(format!(
                    "{}: no slot is being written for frame {frame_id}",
                    self.name
                ))
            })?;
        element.lock = LockState::ReadLock;
        element.demand_number = demand_number;
        element.read_ref_count = 0;
        element.demand_count = 0;
        element.valid = valid;
        if element.read_complete() {
            element.reset();
            drop(elements);
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Takes a shared read of the element filled for `frame_id`.
    ///
    /// # Errors
    ///
    /// Returns `NoResources` if that frame has not been published.
    pub fn get_filled_res(&self, frame_id: u64) -> Result<Acquired<R>> {
        let mut elements = self.lock();
        let (index, element) = elements
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.lock == LockState::ReadLock && e.frame_id == frame_id)
            .ok_or_else(|| {
                VisionError::NoResources(format!("{}: frame {frame_id} is not filled", self.name))
            })?;
        element.read_ref_count += 1;
        Ok(Acquired { index, resource: element.resource.clone(), valid: element.valid })
    }

    /// Releases a read taken with [`get_filled_res`](Self::get_filled_res).
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` if no read is outstanding for `frame_id`.
    pub fn put_filled_res(&self, frame_id: u64) -> Result<()> {
        let mut elements = self.lock();
        let element = elements
            .iter_mut()
            .find(|e| e.lock == LockState::ReadLock && e.frame_id == frame_id && e.read_ref_count > 0)
            .ok_or_else(|| {
                VisionError::InvalidParameters(format!(
                    "{}: no read outstanding for frame {frame_id}",
                    self.name
                ))
            })?;
        element.read_ref_count -= 1;
        element.demand_count += 1;
        if element.read_complete() {
            element.reset();
            drop(elements);
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Drops every lock, returning the ring to its initial state.
    pub fn reset(&self) {
        self.lock().iter_mut().for_each(SlotElement::reset);
        self.notify.notify_waiters();
    }
}

#[derive(Debug)]
enum QueueState {
    Filled { frame_id: u64, demand_number: u32, read_ref_count: u32, demand_count: u32 },
    Done,
}

#[derive(Debug)]
struct QueueElement<R> {
    index: usize,
    resource: R,
    state: QueueState,
}

/// Application-fed queue consumed by the graph.
pub struct InputQueueManager<R> {
    name: String,
    capacity: usize,
    elements: Mutex<VecDeque<QueueElement<R>>>,
    notify: Notify,
}

impl<R: Clone> InputQueueManager<R> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self { name: name.into(), capacity, elements: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueueElement<R>>> {
        self.elements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a filled buffer for `frame_id`, readable `demand_number` times.
    ///
    /// # Errors
    ///
    /// Returns `NoResources` when the queue holds `capacity` buffers.
    pub fn push(&self, index: usize, resource: R, frame_id: u64, demand_number: u32) -> Result<()> {
        let mut elements = self.lock();
        if elements.len() >= self.capacity {
            return Err(VisionError::NoResources(format!(
                "{}: input queue is full ({} buffers)",
                self.name, self.capacity
            )));
        }
        let state = if demand_number == 0 {
            QueueState::Done
        } else {
            QueueState::Filled { frame_id, demand_number, read_ref_count: 0, demand_count: 0 }
        };
        elements.push_back(QueueElement { index, resource, state });
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NoResources` if nothing was pushed for `frame_id`.
    pub fn get_filled_res(&self, frame_id: u64) -> Result<Acquired<R>> {
        let mut elements = self.lock();
        for element in elements.iter_mut() {
            if let QueueState::Filled { frame_id: f, read_ref_count, .. } = &mut element.state {
                if *f == frame_id {
                    *read_ref_count += 1;
                    return Ok(Acquired {
                        index: element.index,
                        resource: element.resource.clone(),
                        valid: true,
                    });
                }
            }
        }
        Err(VisionError::NoResources(format!("{}: frame {frame_id} was not pushed", self.name)))
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` if no read is outstanding for `frame_id`.
    pub fn put_filled_res(&self, frame_id: u64) -> Result<()> {
        let mut elements = self.lock();
        let mut completed = None;
        for element in elements.iter_mut() {
            if let QueueState::Filled { frame_id: f, demand_number, read_ref_count, demand_count } =
                &mut element.state
            {
                if *f == frame_id && *read_ref_count > 0 {
                    *read_ref_count -= 1;
                    *demand_count += 1;
                    completed = Some(*read_ref_count == 0 && *demand_count >= *demand_number);
                    if completed == Some(true) {
                        element.state = QueueState::Done;
                    }
                    break;
                }
            }
        }
        drop(elements);
        match completed {
            Some(true) => {
                self.notify.notify_waiters();
                Ok(())
            },
            Some(false) => Ok(()),
            None => Err(VisionError::InvalidParameters(format!(
                "{}: no read outstanding for frame {frame_id}",
                self.name
            ))),
        }
    }

    /// Returns the oldest consumed buffer to the application.
    pub fn pop(&self) -> Option<(usize, R)> {
        let mut elements = self.lock();
        let pos = elements.iter().position(|e| matches!(e.state, QueueState::Done))?;
        elements.remove(pos).map(|e| (e.index, e.resource))
    }

    pub async fn wait_and_pop(&self) -> (usize, R) {
        loop {
            let notified = self.notify.notified();
            if let Some(done) = self.pop() {
                return done;
            }
            notified.await;
        }
    }

    /// Marks every queued buffer consumed.
    pub fn reset(&self) {
        self.lock().iter_mut().for_each(|e| e.state = QueueState::Done);
        self.notify.notify_waiters();
    }
}

/// Application-lent buffers filled by the graph.
pub struct OutputQueueManager<R> {
    name: String,
    capacity: usize,
    state: Mutex<OutputQueueState<R>>,
    notify: Notify,
}

struct OutputQueueState<R> {
    free: VecDeque<(usize, R)>,
    writing: Vec<(u64, usize, R)>,
    done: VecDeque<(usize, R, bool)>,
}

impl<R> OutputQueueState<R> {
    fn len(&self) -> usize {
        self.free.len() + self.writing.len() + self.done.len()
    }
}

impl<R: Clone> OutputQueueManager<R> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(OutputQueueState {
                free: VecDeque::new(),
                writing: Vec::new(),
                done: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutputQueueState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lends an empty buffer to the producer.
    ///
    /// # Errors
    ///
    /// Returns `NoResources` when the queue already tracks `capacity` buffers.
    pub fn push(&self, index: usize, resource: R) -> Result<()> {
        let mut state = self.lock();
        if state.len() >= self.capacity {
            return Err(VisionError::NoResources(format!(
                "{}: output queue is full ({} buffers)",
                self.name, self.capacity
            )));
        }
        state.free.push_back((index, resource));
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn try_get_empty(&self, frame_id: u64) -> Option<Acquired<R>> {
        let mut state = self.lock();
        let (index, resource) = state.free.pop_front()?;
        state.writing.push((frame_id, index, resource.clone()));
        Some(Acquired { index, resource, valid: true })
    }

    /// Takes an empty buffer for `frame_id`, waiting for the application to lend one.
    pub async fn wait_and_get_empty(&self, frame_id: u64) -> Acquired<R> {
        loop {
            let notified = self.notify.notified();
            if let Some(acquired) = self.try_get_empty(frame_id) {
                return acquired;
            }
            tracing::trace!(manager = %self.name, frame_id, "output queue empty, waiting for a buffer");
            notified.await;
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidParameters` if no buffer is being written for `frame_id`.
    pub fn set_filled_res(&self, frame_id: u64, valid: bool) -> Result<()> {
        let mut state = self.lock();
        let pos = state.writing.iter().position(|(f, _, _)| *f == frame_id).ok_or_else(|| {
            VisionError::InvalidParameters(format!(
                "{}: no buffer is being written for frame {frame_id}",
                self.name
            ))
        })?;
        let (_, index, resource) = state.writing.remove(pos);
        state.done.push_back((index, resource, valid));
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Returns the oldest filled buffer and its validity.
    pub fn pop(&self) -> Option<(usize, R, bool)> {
        self.lock().done.pop_front()
    }

    pub async fn wait_and_pop(&self) -> (usize, R, bool) {
        loop {
            let notified = self.notify.notified();
            if let Some(done) = self.pop() {
                return done;
            }
            notified.await;
        }
    }

    /// Returns buffers that were mid-write to the free pool.
    pub fn reset(&self) {
        let mut state = self.lock();
        let writing = std::mem::take(&mut state.writing);
        state.free.extend(writing.into_iter().map(|(_, index, resource)| (index, resource)));
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_slot_write_read_recycle() {
        let ring = SlotManager::new("ring", vec![10, 11]);
        let w = ring.try_get_empty_res_and_wr_lk(1).unwrap();
        assert_eq!(ring.lock_state(w.index), Some(LockState::WriteLock));
        ring.set_filled_res_and_rd_lk(1, 2, true).unwrap();
        assert_eq!(ring.lock_state(w.index), Some(LockState::ReadLock));

        let r1 = ring.get_filled_res(1).unwrap();
        let r2 = ring.get_filled_res(1).unwrap();
        assert_eq!(r1.resource, w.resource);
        assert!(r2.valid);
        ring.put_filled_res(1).unwrap();
        // One of two demanded readers is still outstanding.
        assert_eq!(ring.lock_state(w.index), Some(LockState::ReadLock));
        ring.put_filled_res(1).unwrap();
        assert_eq!(ring.lock_state(w.index), Some(LockState::NoLock));
    }

    #[test]
    fn test_unfilled_frame_is_not_readable() {
        let ring = SlotManager::new("ring", vec![0]);
        ring.try_get_empty_res_and_wr_lk(3).unwrap();
        assert!(matches!(ring.get_filled_res(3), Err(VisionError::NoResources(_))));
        assert!(ring.put_filled_res(3).is_err());
    }

    #[test]
    fn test_zero_demand_recycles_immediately() {
        let ring = SlotManager::new("ring", vec![0]);
        ring.try_get_empty_res_and_wr_lk(1).unwrap();
        ring.set_filled_res_and_rd_lk(1, 0, true).unwrap();
        assert_eq!(ring.lock_state(0), Some(LockState::NoLock));
    }

    #[test]
    fn test_invalid_content_is_reported_to_readers() {
        let ring = SlotManager::new("ring", vec![0]);
        ring.try_get_empty_res_and_wr_lk(1).unwrap();
        ring.set_filled_res_and_rd_lk(1, 1, false).unwrap();
        assert!(!ring.get_filled_res(1).unwrap().valid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_ring_blocks_writer_until_reader_releases() {
        const N: usize = 3;
        let ring = Arc::new(SlotManager::new("ring", (0..N).collect::<Vec<_>>()));

        let mut held = Vec::new();
        for frame in 1..=N as u64 {
            let acquired = ring.wait_and_get_empty_res_and_wr_lk(frame).await;
            held.push(acquired.index);
        }
        held.sort_unstable();
        assert_eq!(held, vec![0, 1, 2]);

        let writer = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.wait_and_get_empty_res_and_wr_lk(N as u64 + 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished(), "the extra writer must block on a full ring");

        ring.set_filled_res_and_rd_lk(2, 1, true).unwrap();
        let read = ring.get_filled_res(2).unwrap();
        ring.put_filled_res(2).unwrap();

        let acquired = tokio::time::timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(acquired.index, read.index);
        // Frames 1 and 3 are still write-locked and were not handed out again.
        assert_eq!(ring.lock_state(acquired.index), Some(LockState::WriteLock));
        let locked = (0..N).filter(|i| ring.lock_state(*i) == Some(LockState::WriteLock)).count();
        assert_eq!(locked, N);
    }

    #[test]
    fn test_input_queue_cycle() {
        let queue = InputQueueManager::new("in", 2);
        queue.push(0, "a", 1, 1).unwrap();
        queue.push(1, "b", 2, 1).unwrap();
        assert!(matches!(queue.push(2, "c", 3, 1), Err(VisionError::NoResources(_))));

        assert!(queue.pop().is_none());
        let read = queue.get_filled_res(2).unwrap();
        assert_eq!(read.resource, "b");
        queue.put_filled_res(2).unwrap();
        assert_eq!(queue.pop(), Some((1, "b")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_output_queue_cycle() {
        let queue = OutputQueueManager::new("out", 4);
        assert!(queue.try_get_empty(1).is_none());
        queue.push(0, "x").unwrap();
        queue.push(1, "y").unwrap();
        let a = queue.try_get_empty(1).unwrap();
        let b = queue.try_get_empty(2).unwrap();
        queue.set_filled_res(2, false).unwrap();
        queue.set_filled_res(1, true).unwrap();
        assert_eq!(queue.pop(), Some((b.index, "y", false)));
        assert_eq!(queue.pop(), Some((a.index, "x", true)));
        assert!(queue.set_filled_res(1, true).is_err());
    }

    #[tokio::test]
    async fn test_output_queue_waits_for_lent_buffer() {
        let queue = Arc::new(OutputQueueManager::new("out", 4));
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_and_get_empty(7).await })
        };
        tokio::task::yield_now().await;
        queue.push(3, 42u32).unwrap();
        let acquired = tokio::time::timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert_eq!((acquired.index, acquired.resource), (3, 42));
    }
}
