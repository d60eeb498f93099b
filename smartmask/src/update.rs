//! Moves data between the per-graph output scratch buffers and the
//! persistent K/V cache input buffers, restrides the K cache between the
//! prefill and decode layouts, and picks the next token from quantized
//! logits.

use crate::cache::KVSlot;
use crate::strided::{restride_in_place, StridedWriter};

/// The count of valid positions the prefill graph actually filled for a
/// right-aligned prompt: a prompt of `N <= ar_prefill` tokens uses
/// `n_update = N`; for `N > ar_prefill` the trailing partial window has
/// `1 + ((N-1) mod ar_prefill)` tokens. The graph's own output convention
/// places this many valid positions at the *front* of each output tensor
/// (column/row 0), independent of where the mask places the new tokens.
pub fn n_update(num_prompt_tokens: usize, ar_prefill: usize) -> usize {
    1 + (num_prompt_tokens - 1) % ar_prefill
}

/// Copy the valid leading `n_update` positions of one (layer, head)'s
/// prefill output into its persistent input buffer at row `n_past`.
///
/// Both V (sequential) and K (strided, `[head_dim, ar_prefill]`) use the
/// *prefill* cache stride here — the buffer is sized for
/// `cache_len_decode` but not yet rearranged, so the prefill graph's
/// writeback must address it with `cache_len_prefill` stride.
pub fn writeback_prefill(
    slot: &mut KVSlot,
    head_dim: usize,
    ar_prefill: usize,
    cache_len_prefill: usize,
    n_past: usize,
    n_update: usize,
) {
    let v_src = &slot.v.output.as_slice()[..n_update * head_dim];
    let v_dst_start = n_past * head_dim;
    let v_dst = &mut slot.v.input.as_mut_slice()[v_dst_start..v_dst_start + n_update * head_dim];
    v_dst.copy_from_slice(v_src);

    let k_src = slot.k.output.as_slice();
    let k_dst = &mut slot.k.input.as_mut_slice()[n_past..];
    StridedWriter::new(k_src, k_dst, n_update, head_dim, ar_prefill, cache_len_prefill)
        .copy_forward();
}

/// Re-stride one (layer, head)'s K cache in place, from `cache_len_prefill`
/// to `cache_len_decode`. The V cache needs no work: its layout is
/// sequential, so trailing unused bytes simply stay zero.
pub fn rearrange_k_cache(slot: &mut KVSlot, head_dim: usize, cache_len_prefill: usize, cache_len_decode: usize) {
    restride_in_place(
        slot.k.input.as_mut_slice(),
        head_dim,
        cache_len_prefill,
        cache_len_prefill,
        cache_len_decode,
    );
}

/// Copy one (layer, head)'s decode-step output (a single new K/V position)
/// into its persistent input buffer at row/column `pos`.
pub fn writeback_decode(slot: &mut KVSlot, head_dim: usize, cache_len_decode: usize, pos: usize) {
    let v_dst_start = pos * head_dim;
    slot.v.input.as_mut_slice()[v_dst_start..v_dst_start + head_dim]
        .copy_from_slice(&slot.v.output.as_slice()[..head_dim]);

    let k_src = slot.k.output.as_slice();
    let k_dst = &mut slot.k.input.as_mut_slice()[pos..];
    StridedWriter::new(k_src, k_dst, 1, head_dim, 1, cache_len_decode).copy_forward();
}

/// Argmax over one row of quantized uint16 logits, shape `[rows,
/// vocab_size]`. Ties are broken by lowest token id. Dequantization is
/// unnecessary: affine quantization is monotonic, so ordering over the raw
/// quantized values matches ordering over the dequantized ones.
pub fn argmax_row(logits: &[u16], row: usize, vocab_size: usize) -> u32 {
    let start = row * vocab_size;
    let row_values = &logits[start..start + vocab_size];
    let mut best_id = 0u32;
    let mut best_value = row_values[0];
    for (id, &value) in row_values.iter().enumerate().skip(1) {
        if value > best_value {
            best_value = value;
            best_id = id as u32;
        }
    }
    best_id
}
