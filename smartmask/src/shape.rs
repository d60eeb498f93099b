//! Derives [`ModelShape`] from per-graph tensor metadata supplied by the
//! (out-of-scope) graph-metadata collaborator.

use crate::error::Error;
use crate::tensor::{DType, TensorDesc};

/// Immutable shape parameters discovered once, up front, and threaded
/// through every other component.
///
/// Invariant: `ar_decode <= ar_prefill < context_len` and
/// `cache_len_decode > cache_len_prefill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ModelShape {
    pub context_len: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub ar_prefill: usize,
    pub ar_decode: usize,
    pub vocab_size: usize,
}

impl ModelShape {
    /// K/V cache capacity as the prefill graph sees it.
    pub fn cache_len_prefill(&self) -> usize {
        self.context_len - self.ar_prefill
    }

    /// K/V cache capacity as the decode graph sees it. This is the larger of
    /// the two cache lengths and is therefore the one the allocator sizes
    /// buffers for.
    pub fn cache_len_decode(&self) -> usize {
        self.context_len - self.ar_decode
    }

    fn validate(self) -> Result<Self, Error> {
        if !(self.ar_decode <= self.ar_prefill && self.ar_prefill < self.context_len) {
            return Err(Error::ShapeDiscoveryFailed(format!(
                "expected ar_decode ({}) <= ar_prefill ({}) < context_len ({})",
                self.ar_decode, self.ar_prefill, self.context_len
            )));
        }
        if !(self.cache_len_decode() > self.cache_len_prefill()) {
            return Err(Error::ShapeDiscoveryFailed(format!(
                "expected cache_len_decode ({}) > cache_len_prefill ({})",
                self.cache_len_decode(),
                self.cache_len_prefill()
            )));
        }
        if self.num_layers == 0 || self.num_heads == 0 || self.head_dim == 0 {
            return Err(Error::ShapeDiscoveryFailed(
                "num_layers, num_heads and head_dim must all be non-zero".into(),
            ));
        }
        Ok(self)
    }
}

fn is_attention_mask_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("atten_mask") || lower.contains("attn_mask")
}

fn is_args_name(name: &str) -> bool {
    name.to_ascii_lowercase().contains("_args_")
}

/// Find `(ar, context_len)` from the attention-mask input of one graph:
/// the first input whose name contains `atten_mask`/`attn_mask`
/// (case-insensitive) and has rank >= 2; then `ar = dims[rank-2]`,
/// `context_len = dims[rank-1]`.
fn infer_ar_and_context_len(inputs: &[TensorDesc]) -> Result<(usize, usize), Error> {
    inputs
        .iter()
        .find(|t| is_attention_mask_name(&t.name) && t.dims.len() >= 2)
        .map(|t| {
            let rank = t.dims.len();
            (t.dims[rank - 2], t.dims[rank - 1])
        })
        .ok_or_else(|| {
            Error::ShapeDiscoveryFailed(
                "no attention-mask input of rank >= 2 found in graph".into(),
            )
        })
}

/// Find `head_dim` from any rank-3 `_args_` input.
fn infer_head_dim(inputs: &[TensorDesc]) -> Result<usize, Error> {
    inputs
        .iter()
        .find(|t| is_args_name(&t.name) && t.dims.len() == 3)
        .map(|t| t.dims[2])
        .ok_or_else(|| {
            Error::ShapeDiscoveryFailed("no rank-3 `_args_` input found to derive head_dim".into())
        })
}

/// Count rank-3 `_args_` inputs; this is `2 * num_layers * num_heads`
/// (one K-slot and one V-slot per (layer, head)).
fn count_kv_slot_inputs(inputs: &[TensorDesc]) -> usize {
    inputs
        .iter()
        .filter(|t| is_args_name(&t.name) && t.dims.len() == 3)
        .count()
}

/// Find `vocab_size` from any float or uint16-quantized output whose last
/// dimension exceeds 10,000.
fn infer_vocab_size(outputs: &[TensorDesc]) -> Result<usize, Error> {
    outputs
        .iter()
        .filter(|t| matches!(t.dtype, DType::Float32 | DType::UInt16))
        .filter_map(|t| t.dims.last().copied())
        .find(|&last_dim| last_dim > 10_000)
        .ok_or_else(|| {
            Error::ShapeDiscoveryFailed(
                "no float/uint16 output with last dim > 10_000 found to derive vocab_size".into(),
            )
        })
}

/// Discover [`ModelShape`] from the prefill and decode graphs' tensor
/// metadata. `num_layers_hint` is a configuration hint (default 16) since
/// `num_layers` cannot be derived from tensor metadata alone.
pub fn discover_shape(
    prefill_inputs: &[TensorDesc],
    prefill_outputs: &[TensorDesc],
    decode_inputs: &[TensorDesc],
    decode_outputs: &[TensorDesc],
    num_layers_hint: usize,
) -> Result<ModelShape, Error> {
    let (ar_prefill, context_len_p) = infer_ar_and_context_len(prefill_inputs)?;
    let (ar_decode, context_len_d) = infer_ar_and_context_len(decode_inputs)?;
    if context_len_p != context_len_d {
        return Err(Error::ShapeDiscoveryFailed(format!(
            "prefill context_len ({context_len_p}) != decode context_len ({context_len_d})"
        )));
    }

    let head_dim = infer_head_dim(prefill_inputs).or_else(|_| infer_head_dim(decode_inputs))?;

    let n_prefill = count_kv_slot_inputs(prefill_inputs);
    let n_decode = count_kv_slot_inputs(decode_inputs);
    if n_prefill != n_decode {
        return Err(Error::ShapeDiscoveryFailed(format!(
            "prefill graph has {n_prefill} K/V-slot inputs but decode graph has {n_decode}"
        )));
    }
    if num_layers_hint == 0 || n_prefill % (2 * num_layers_hint) != 0 {
        return Err(Error::ShapeDiscoveryFailed(format!(
            "{n_prefill} K/V-slot inputs not evenly divisible by 2 * num_layers_hint ({num_layers_hint})"
        )));
    }
    let num_heads = n_prefill / (2 * num_layers_hint);

    let vocab_size =
        infer_vocab_size(prefill_outputs).or_else(|_| infer_vocab_size(decode_outputs))?;

    ModelShape {
        context_len: context_len_p,
        head_dim,
        num_layers: num_layers_hint,
        num_heads,
        ar_prefill,
        ar_decode,
        vocab_size,
    }
    .validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn desc(name: &str, dtype: DType, dims: &[usize]) -> TensorDesc {
        TensorDesc {
            name: name.to_string(),
            dtype,
            dims: dims.to_vec(),
            nbytes: dims.iter().product::<usize>() * dtype.elem_size(),
            quant: None,
        }
    }

    fn kv_slot_inputs(num_layers: usize, num_heads: usize, head_dim: usize) -> Vec<TensorDesc> {
        let mut inputs = Vec::new();
        let mut idx = 0;
        for _layer in 0..num_layers {
            for _head in 0..num_heads {
                inputs.push(desc(
                    &format!("input_{idx}_args_v"),
                    DType::UInt8,
                    &[1, 7, head_dim],
                ));
                idx += 1;
                inputs.push(desc(
                    &format!("input_{idx}_args_k"),
                    DType::UInt8,
                    &[1, head_dim, 7],
                ));
                idx += 1;
            }
        }
        inputs
    }

    #[test]
    fn discovers_consistent_shape() {
        let num_layers = 2;
        let num_heads = 3;
        let head_dim = 4;
        let ar_prefill = 8;
        let context_len = 16;

        let mut prefill_inputs = kv_slot_inputs(num_layers, num_heads, head_dim);
        prefill_inputs.push(desc(
            "atten_mask",
            DType::UInt16,
            &[ar_prefill, context_len],
        ));

        let mut decode_inputs = kv_slot_inputs(num_layers, num_heads, head_dim);
        decode_inputs.push(desc("atten_mask", DType::UInt16, &[1, context_len]));

        let outputs = vec![desc("logits_squeeze", DType::UInt16, &[ar_prefill, 128_256])];

        let shape = discover_shape(
            &prefill_inputs,
            &outputs,
            &decode_inputs,
            &outputs,
            num_layers,
        )
        .expect("shape discovery should succeed");

        assert_eq!(shape.num_layers, num_layers);
        assert_eq!(shape.num_heads, num_heads);
        assert_eq!(shape.head_dim, head_dim);
        assert_eq!(shape.ar_prefill, ar_prefill);
        assert_eq!(shape.ar_decode, 1);
        assert_eq!(shape.context_len, context_len);
        assert_eq!(shape.vocab_size, 128_256);
        assert_eq!(shape.cache_len_prefill(), context_len - ar_prefill);
        assert_eq!(shape.cache_len_decode(), context_len - 1);
    }

    #[test]
    fn missing_attention_mask_fails() {
        let inputs = vec![desc("token_ids_input", DType::Int32, &[1, 1])];
        let outputs = vec![desc("logits", DType::UInt16, &[1, 128_256])];
        let err = discover_shape(&inputs, &outputs, &inputs, &outputs, 16).unwrap_err();
        assert!(matches!(err, Error::ShapeDiscoveryFailed(_)));
    }
}
