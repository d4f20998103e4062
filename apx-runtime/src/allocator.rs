// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Process-wide message-buffer allocator with background reclamation.
//!
//! Producer threads allocate short-lived buffers that travel to the I/O
//! side; freeing happens on a dedicated thread so the fast path never
//! contends with reclamation. Sizes up to the slab limit come from the
//! small-object pool, larger ones from the global heap.

use crate::soa::{Soa, SMALL_OBJECT_MAX_SIZE};
use apx_core::ApxError;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const DEFAULT_MAX_PENDING: usize = 1024;
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct FreeQueue {
    slots: Vec<(usize, u32)>,
    head: usize,
    len: usize,
}

impl FreeQueue {
    fn with_capacity(capacity: usize) -> Self {
        FreeQueue { slots: vec![(0, 0); capacity], head: 0, len: 0 }
    }

    fn push(&mut self, entry: (usize, u32)) -> bool {
        if self.len == self.slots.len() {
            return false;
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = entry;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<(usize, u32)> {
        if self.len == 0 {
            return None;
        }
        let entry = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        Some(entry)
    }
}

struct State {
    soa: Soa,
    queue: FreeQueue,
    running: bool,
}

struct Inner {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Inner {
    /// Release one block immediately, under the lock for slab sizes.
    fn release_now(&self, ptr: usize, size: u32) {
        if size as usize <= SMALL_OBJECT_MAX_SIZE {
            let mut state = self.state.lock().expect("allocator lock");
            release_locked(&mut state, ptr, size);
        } else {
            release_heap(ptr, size);
        }
    }
}

/// Reclaim one block while the state lock is held.
fn release_locked(state: &mut State, ptr: usize, size: u32) {
    if size as usize <= SMALL_OBJECT_MAX_SIZE {
        if let Some(nn) = NonNull::new(ptr as *mut u8) {
            state.soa.free(nn, size as usize);
        }
    } else {
        release_heap(ptr, size);
    }
}

fn release_heap(ptr: usize, size: u32) {
    if ptr != 0 {
        unsafe { dealloc(ptr as *mut u8, heap_layout(size as usize)) };
    }
}

fn heap_layout(size: usize) -> Layout {
    Layout::from_size_align(size, 1).expect("heap layout")
}

/// Owning handle to one allocated buffer. Dropping it enqueues the block on
/// the reclamation queue.
pub struct AllocBlock {
    ptr: NonNull<u8>,
    size: usize,
    inner: Arc<Inner>,
}

unsafe impl Send for AllocBlock {}

impl Deref for AllocBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

impl DerefMut for AllocBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for AllocBlock {
    fn drop(&mut self) {
        enqueue_free(&self.inner, self.ptr.as_ptr() as usize, self.size as u32);
    }
}

fn enqueue_free(inner: &Arc<Inner>, ptr: usize, size: u32) {
    let mut state = inner.state.lock().expect("allocator lock");
    if state.running && state.queue.push((ptr, size)) {
        drop(state);
        inner.wakeup.notify_one();
    } else {
        // Queue full or worker already gone: reclaim inline.
        release_locked(&mut state, ptr, size);
    }
}

pub struct Allocator {
    inner: Arc<Inner>,
    worker: Mutex<Option<(JoinHandle<()>, mpsc::Receiver<()>)>>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                soa: Soa::default(),
                queue: FreeQueue::with_capacity(max_pending.max(2)),
                running: false,
            }),
            wakeup: Condvar::new(),
        });
        Allocator { inner, worker: Mutex::new(None) }
    }

    /// Spawn the reclamation thread. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker lock");
        if worker.is_some() {
            return;
        }
        self.inner.state.lock().expect("allocator lock").running = true;
        let inner = Arc::clone(&self.inner);
        let (done_tx, done_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("apx-allocator".into())
            .spawn(move || {
                reclaim_loop(&inner);
                let _ = done_tx.send(());
            })
            .expect("spawn allocator thread");
        *worker = Some((handle, done_rx));
    }

    /// Send the shutdown sentinel and join the reclamation thread, waiting
    /// at most five seconds.
    pub fn stop(&self) {
        let taken = self.worker.lock().expect("worker lock").take();
        let Some((handle, done_rx)) = taken else { return };
        {
            let mut state = self.inner.state.lock().expect("allocator lock");
            state.running = false;
            // A null pointer wakes the worker and tells it to exit. When the
            // queue is full, reclaim pending entries inline to make room.
            while !state.queue.push((0, 0)) {
                match state.queue.pop() {
                    Some((ptr, size)) => release_locked(&mut state, ptr, size),
                    None => break,
                }
            }
        }
        self.inner.wakeup.notify_one();
        match done_rx.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) => {
                let _ = handle.join();
            }
            Err(_) => {
                tracing::error!("timeout while joining allocator worker");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().expect("allocator lock").running
    }

    /// Allocate a zeroed buffer of `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<AllocBlock, ApxError> {
        if size == 0 {
            return Err(ApxError::InvalidArgument);
        }
        let ptr = if size <= SMALL_OBJECT_MAX_SIZE {
            let mut state = self.inner.state.lock().expect("allocator lock");
            state.soa.alloc(size)
        } else {
            NonNull::new(unsafe { alloc_zeroed(heap_layout(size)) }).ok_or(ApxError::MemError)?
        };
        Ok(AllocBlock { ptr, size, inner: Arc::clone(&self.inner) })
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reclaim_loop(inner: &Arc<Inner>) {
    loop {
        let entry = {
            let mut state = inner.state.lock().expect("allocator lock");
            loop {
                if let Some(entry) = state.queue.pop() {
                    break entry;
                }
                state = inner.wakeup.wait(state).expect("allocator lock");
            }
        };
        let (ptr, size) = entry;
        if ptr == 0 && size == 0 {
            return;
        }
        inner.release_now(ptr, size);
    }
}
