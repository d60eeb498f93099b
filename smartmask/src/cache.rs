//! Owns all persistent K/V storage and produces [`KVSlot`] handles per
//! (layer, head).
//!
//! Buffers are sized for `cache_len_decode` (the larger of the two cache
//! lengths) so that the in-place rearrange never needs to reallocate.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::Error;
use crate::shape::ModelShape;

/// Minimum alignment for cache and arena buffers. The design calls for
/// `max(accelerator requirement, 64 bytes)`; this crate has no way to learn
/// an accelerator-specific requirement from the out-of-scope runtime
/// collaborator, so 64 is used directly.
pub const MIN_ALIGN: usize = 64;

/// A heap allocation with a caller-chosen alignment, zero-initialized at
/// creation. Exists because `Vec<u8>` only guarantees `align_of::<u8>() ==
/// 1`, and the accelerator requires buffers aligned to at least
/// [`MIN_ALIGN`].
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: `AlignedBuffer` owns its allocation exclusively; it's safe to
// transfer that ownership across threads, and shared references only ever
// hand out `&[u8]`/`&mut [u8]` through `&self`/`&mut self`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn zeroed(len: usize, align: usize) -> Result<Self, Error> {
        let align = align.max(MIN_ALIGN);
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;
        // SAFETY: `layout` has non-zero size by construction above.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::AllocationFailed(format!(
                "OS allocation of {len} bytes (align {align}) failed"
            ))
        })?;
        Ok(AlignedBuffer { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` is valid for `len` bytes and uniquely borrowed here.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: `layout` is exactly the layout used in the matching `alloc_zeroed`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

/// Persistent input buffer plus transient output (scratch) buffer for one
/// of K or V, for one (layer, head).
#[derive(Debug)]
pub struct CacheBuffer {
    /// Persistent cache storage, bound to the graph's cache-input tensor.
    pub input: AlignedBuffer,
    /// Per-step scratch storage, bound to the graph's cache-output tensor.
    pub output: AlignedBuffer,
}

/// K and V cache buffers for a single (layer, head).
#[derive(Debug)]
pub struct KVSlot {
    pub k: CacheBuffer,
    pub v: CacheBuffer,
}

/// Owns every [`KVSlot`] for the model, indexed `[layer][head]`.
#[derive(Debug)]
pub struct CacheAllocator {
    slots: Vec<Vec<KVSlot>>,
}

impl CacheAllocator {
    /// Allocate and zero-initialize all K/V storage for `shape`.
    pub fn new(shape: &ModelShape) -> Result<Self, Error> {
        let cache_len_decode = shape.cache_len_decode();
        let k_in_bytes = shape.head_dim * cache_len_decode;
        let k_out_bytes = shape.head_dim * shape.ar_prefill;
        let v_in_bytes = cache_len_decode * shape.head_dim;
        let v_out_bytes = shape.ar_prefill * shape.head_dim;

        let mut slots = Vec::with_capacity(shape.num_layers);
        for _layer in 0..shape.num_layers {
            let mut heads = Vec::with_capacity(shape.num_heads);
            for _head in 0..shape.num_heads {
                heads.push(KVSlot {
                    k: CacheBuffer {
                        input: AlignedBuffer::zeroed(k_in_bytes, MIN_ALIGN)?,
                        output: AlignedBuffer::zeroed(k_out_bytes, MIN_ALIGN)?,
                    },
                    v: CacheBuffer {
                        input: AlignedBuffer::zeroed(v_in_bytes, MIN_ALIGN)?,
                        output: AlignedBuffer::zeroed(v_out_bytes, MIN_ALIGN)?,
                    },
                });
            }
            slots.push(heads);
        }

        log::debug!(
            "allocated KV cache: {} layers x {} heads, {:.2} MiB total",
            shape.num_layers,
            shape.num_heads,
            Self::total_bytes(shape) as f64 / (1024.0 * 1024.0)
        );

        Ok(CacheAllocator { slots })
    }

    pub fn slot(&self, layer: usize, head: usize) -> &KVSlot {
        &self.slots[layer][head]
    }

    pub fn slot_mut(&mut self, layer: usize, head: usize) -> &mut KVSlot {
        &mut self.slots[layer][head]
    }

    pub fn num_layers(&self) -> usize {
        self.slots.len()
    }

    pub fn num_heads(&self) -> usize {
        self.slots.first().map_or(0, |heads| heads.len())
    }

    /// Total bytes this allocator will request for `shape`:
    /// `2 * num_layers * num_heads * head_dim * (cache_len_decode + ar_prefill)`.
    pub fn total_bytes(shape: &ModelShape) -> usize {
        2 * shape.num_layers
            * shape.num_heads
            * shape.head_dim
            * (shape.cache_len_decode() + shape.ar_prefill)
    }
}
