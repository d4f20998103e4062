// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Small-object slab pool.
//!
//! One fixed-size allocator per size class 1..=32 bytes. Each chunk carries
//! up to 255 blocks and threads its free list through the first byte of the
//! free blocks themselves, so an empty chunk costs nothing beyond its raw
//! storage.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

pub const SMALL_OBJECT_MAX_SIZE: usize = 32;
const BLOCKS_PER_CHUNK: usize = 255;

struct Chunk {
    data: *mut u8,
    first_free: u8,
    free_blocks: u8,
}

// Chunks are only reached through the owning allocator's lock.
unsafe impl Send for Chunk {}

impl Chunk {
    fn new(block_size: usize) -> Self {
        let layout = Self::layout(block_size);
        let data = unsafe { alloc_zeroed(layout) };
        assert!(!data.is_null(), "slab chunk allocation failed");
        // Free block i stores the index of the next free block in byte 0.
        for i in 0..BLOCKS_PER_CHUNK {
            unsafe { *data.add(i * block_size) = (i + 1) as u8 };
        }
        Chunk { data, first_free: 0, free_blocks: BLOCKS_PER_CHUNK as u8 }
    }

    fn layout(block_size: usize) -> Layout {
        Layout::from_size_align(block_size * BLOCKS_PER_CHUNK, 1).expect("slab layout")
    }

    fn alloc(&mut self, block_size: usize) -> Option<NonNull<u8>> {
        if self.free_blocks == 0 {
            return None;
        }
        let offset = usize::from(self.first_free) * block_size;
        let ptr = unsafe { self.data.add(offset) };
        self.first_free = unsafe { *ptr };
        self.free_blocks -= 1;
        unsafe { std::ptr::write_bytes(ptr, 0, block_size) };
        NonNull::new(ptr)
    }

    fn free(&mut self, ptr: *mut u8, block_size: usize) {
        let offset = (ptr as usize) - (self.data as usize);
        debug_assert_eq!(offset % block_size, 0);
        let index = offset / block_size;
        debug_assert!(index < BLOCKS_PER_CHUNK);
        unsafe { *ptr = self.first_free };
        self.first_free = index as u8;
        self.free_blocks += 1;
    }

    fn contains(&self, ptr: *mut u8, block_size: usize) -> bool {
        let start = self.data as usize;
        let end = start + block_size * BLOCKS_PER_CHUNK;
        let p = ptr as usize;
        p >= start && p < end
    }
}

/// All chunks of one size class.
struct FixedSizeAllocator {
    block_size: usize,
    chunks: Vec<Chunk>,
    alloc_hint: usize,
    dealloc_hint: usize,
}

impl FixedSizeAllocator {
    fn new(block_size: usize) -> Self {
        FixedSizeAllocator { block_size, chunks: Vec::new(), alloc_hint: 0, dealloc_hint: 0 }
    }

    fn alloc(&mut self) -> NonNull<u8> {
        if let Some(chunk) = self.chunks.get_mut(self.alloc_hint) {
            if let Some(ptr) = chunk.alloc(self.block_size) {
                return ptr;
            }
        }
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            if chunk.free_blocks > 0 {
                self.alloc_hint = i;
                return chunk.alloc(self.block_size).expect("free block");
            }
        }
        // All chunks full: grow by one.
        self.chunks.push(Chunk::new(self.block_size));
        self.alloc_hint = self.chunks.len() - 1;
        self.chunks.last_mut().expect("chunk").alloc(self.block_size).expect("fresh chunk")
    }

    /// Free `ptr`, locating the owning chunk via the cached hint first.
    fn free(&mut self, ptr: *mut u8) {
        if let Some(chunk) = self.chunks.get_mut(self.dealloc_hint) {
            if chunk.contains(ptr, self.block_size) {
                chunk.free(ptr, self.block_size);
                return;
            }
        }
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            if chunk.contains(ptr, self.block_size) {
                self.dealloc_hint = i;
                chunk.free(ptr, self.block_size);
                return;
            }
        }
        panic!("pointer does not belong to this slab pool");
    }

    fn owns(&self, ptr: *mut u8) -> bool {
        self.chunks.iter().any(|c| c.contains(ptr, self.block_size))
    }
}

impl Drop for FixedSizeAllocator {
    fn drop(&mut self) {
        let layout = Chunk::layout(self.block_size);
        for chunk in &mut self.chunks {
            unsafe { dealloc(chunk.data, layout) };
        }
        self.chunks.clear();
    }
}

/// Small-object allocator covering every size class up to
/// `SMALL_OBJECT_MAX_SIZE`. Size classes materialize on first use.
pub struct Soa {
    fsa: [Option<FixedSizeAllocator>; SMALL_OBJECT_MAX_SIZE],
}

impl Default for Soa {
    fn default() -> Self {
        Soa { fsa: std::array::from_fn(|_| None) }
    }
}

impl Soa {
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        assert!(size > 0 && size <= SMALL_OBJECT_MAX_SIZE);
        self.fsa[size - 1]
            .get_or_insert_with(|| FixedSizeAllocator::new(size))
            .alloc()
    }

    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        assert!(size > 0 && size <= SMALL_OBJECT_MAX_SIZE);
        let fsa = self.fsa[size - 1].as_mut().expect("size class never allocated");
        fsa.free(ptr.as_ptr());
    }

    #[cfg(test)]
    fn owns(&self, ptr: NonNull<u8>, size: usize) -> bool {
        self.fsa[size - 1].as_ref().map(|f| f.owns(ptr.as_ptr())).unwrap_or(false)
    }
}
