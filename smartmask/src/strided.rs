//! Typed, bounds-checked views over raw byte buffers, used in place of raw
//! pointer arithmetic. Cache elements are opaque quantized bytes, so these
//! views are byte-granular rather than generic over an element type.

/// An immutable strided view over a byte buffer: `len` rows of `row_bytes`
/// bytes each, `stride` bytes apart.
#[derive(Debug, Clone, Copy)]
pub struct StridedView<'a> {
    data: &'a [u8],
    pub row_bytes: usize,
    pub stride: usize,
    pub len: usize,
}

impl<'a> StridedView<'a> {
    pub fn new(data: &'a [u8], row_bytes: usize, stride: usize, len: usize) -> Self {
        debug_assert!(
            len == 0 || (len - 1) * stride + row_bytes <= data.len(),
            "strided view out of bounds: len={len} stride={stride} row_bytes={row_bytes} data.len()={}",
            data.len()
        );
        StridedView {
            data,
            row_bytes,
            stride,
            len,
        }
    }

    pub fn row(&self, i: usize) -> &[u8] {
        let start = i * self.stride;
        &self.data[start..start + self.row_bytes]
    }
}

/// A mutable strided view over a byte buffer.
pub struct StridedViewMut<'a> {
    data: &'a mut [u8],
    pub row_bytes: usize,
    pub stride: usize,
    pub len: usize,
}

impl<'a> StridedViewMut<'a> {
    pub fn new(data: &'a mut [u8], row_bytes: usize, stride: usize, len: usize) -> Self {
        debug_assert!(
            len == 0 || (len - 1) * stride + row_bytes <= data.len(),
            "strided view out of bounds: len={len} stride={stride} row_bytes={row_bytes} data.len()={}",
            data.len()
        );
        StridedViewMut {
            data,
            row_bytes,
            stride,
            len,
        }
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [u8] {
        let start = i * self.stride;
        &mut self.data[start..start + self.row_bytes]
    }
}

/// Encapsulates the single most error-prone operation in this crate: a
/// strided, dimension-by-dimension copy between two byte buffers with
/// independent row strides. Used by the K-cache writeback and the
/// rearrange step.
pub struct StridedWriter<'s, 'd> {
    src: &'s [u8],
    dst: &'d mut [u8],
    pub row_bytes: usize,
    pub rows: usize,
    pub row_stride_src: usize,
    pub row_stride_dst: usize,
}

impl<'s, 'd> StridedWriter<'s, 'd> {
    pub fn new(
        src: &'s [u8],
        dst: &'d mut [u8],
        row_bytes: usize,
        rows: usize,
        row_stride_src: usize,
        row_stride_dst: usize,
    ) -> Self {
        StridedWriter {
            src,
            dst,
            row_bytes,
            rows,
            row_stride_src,
            row_stride_dst,
        }
    }

    /// Copy `row_bytes` bytes per row, from `src[row * row_stride_src ..]`
    /// into `dst[row * row_stride_dst ..]`, for every `row in 0..rows`.
    pub fn copy_forward(&mut self) {
        for row in 0..self.rows {
            let src_off = row * self.row_stride_src;
            let dst_off = row * self.row_stride_dst;
            self.dst[dst_off..dst_off + self.row_bytes]
                .copy_from_slice(&self.src[src_off..src_off + self.row_bytes]);
        }
    }
}

/// In-place, single-buffer restride used by the K-cache rearrange.
/// Iterates dimensions from highest to lowest since `stride_to >
/// stride_from` makes destination offsets larger than source offsets; a
/// forward loop would overwrite data not yet read.
pub fn restride_in_place(
    buf: &mut [u8],
    dims: usize,
    bytes_per_dim: usize,
    stride_from: usize,
    stride_to: usize,
) {
    debug_assert!(stride_to >= stride_from);
    debug_assert!(bytes_per_dim <= stride_from);
    debug_assert!((dims.saturating_sub(1)) * stride_to + bytes_per_dim <= buf.len());

    for d in (0..dims).rev() {
        let src_off = d * stride_from;
        let dst_off = d * stride_to;
        // `copy_within` is memmove semantics: safe even when the ranges
        // overlap, which they do whenever stride_to - stride_from < bytes_per_dim.
        buf.copy_within(src_off..src_off + bytes_per_dim, dst_off);
    }
}
