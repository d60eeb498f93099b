//! Orchestrates one prefill execution and the subsequent decode loop:
//! fills graph inputs, calls into the [`Runtime`], and drives the Update
//! Engine and argmax sampling between steps.

use crate::arena::Arena;
use crate::binding::{BindingPlan, BindingTarget, CacheKind, CacheSide, TensorBindingSpec};
use crate::cache::CacheAllocator;
use crate::error::Error;
use crate::mask;
use crate::metrics::Metrics;
use crate::runtime::{ContextId, GraphId, Runtime, TensorBinding};
use crate::shape::ModelShape;
use crate::tensor::TensorRole;
use crate::update::{argmax_row, n_update, rearrange_k_cache, writeback_decode, writeback_prefill};

/// Where generation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decoding,
}

/// The live state of one `generate` call: the token sequence produced so
/// far (prompt + generated continuation), how many cache positions are
/// populated, and the current phase.
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub tokens: Vec<i32>,
    pub n_past: usize,
    pub phase: Phase,
    pub metrics: Metrics,
}

/// Tunables for one `generate` call.
#[derive(Debug, Clone, Copy)]
pub struct GenerateConfig {
    pub max_gen: usize,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        GenerateConfig { max_gen: 100 }
    }
}

/// The two graphs a `generate` call drives, already restored from their
/// context binary by the (out-of-scope) runtime collaborator.
pub struct Graphs {
    pub context: ContextId,
    pub prefill: GraphId,
    pub decode: GraphId,
}

/// Write `values` into a scratch i32 tensor starting at its front, zeroing
/// the remainder. The front of the AR window carries live data for a
/// single-chunk prefill, mirroring the input side against the writeback's
/// `n_update`-from-the-front reads.
fn fill_i32_front_aligned(buf: &mut [u8], values: &[i32]) {
    buf.fill(0);
    for (i, &v) in values.iter().enumerate() {
        let off = i * 4;
        buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
    }
}

fn shared_slice_mut<'a>(
    cache: &'a mut CacheAllocator,
    layer_head: crate::tensor::LayerHead,
    kind: CacheKind,
    side: CacheSide,
) -> &'a mut [u8] {
    let (layer, head) = layer_head;
    let slot = cache.slot_mut(layer, head);
    let buf = match kind {
        CacheKind::K => &mut slot.k,
        CacheKind::V => &mut slot.v,
    };
    match side {
        CacheSide::Input => buf.input.as_mut_slice(),
        CacheSide::Output => buf.output.as_mut_slice(),
    }
}

/// Resolve every binding in `specs` to a raw `(ptr, len)` pair, pulling
/// bytes from either the cache allocator or the arena depending on the
/// target. Splitting this into raw pointers (rather than keeping borrowed
/// slices around) lets the following loop hand out independent mutable
/// views into `cache` and `arena` without the borrow checker concluding
/// they might alias — they never do, since every (layer, head, kind, side)
/// combination and every arena byte range is assigned to at most one
/// tensor per graph.
fn resolve_all(
    specs: &[TensorBindingSpec],
    cache: &mut CacheAllocator,
    arena: &mut Arena,
) -> Vec<(*mut u8, usize)> {
    specs
        .iter()
        .map(|spec| match spec.target {
            BindingTarget::Scratch { .. } => {
                let slice = arena
                    .slice_mut(&spec.desc.name)
                    .expect("binding plan and arena layout must agree on tensor names");
                (slice.as_mut_ptr(), slice.len())
            }
            BindingTarget::Shared { layer_head, kind, side } => {
                let slice = shared_slice_mut(cache, layer_head, kind, side);
                // The shared buffer is allocated for the larger of the two
                // graphs' needs (cache_len_decode for cache inputs,
                // ar_prefill for cache outputs); this graph's tensor may be
                // smaller (e.g. the decode graph's ar=1 output, or the
                // prefill graph's cache_len_prefill-wide input), so only
                // the tensor's own declared byte size at the front of the
                // buffer is handed to the runtime.
                (slice.as_mut_ptr(), spec.desc.nbytes)
            }
        })
        .collect()
}

fn make_bindings<'a>(
    specs: &'a [TensorBindingSpec],
    raw: &[(*mut u8, usize)],
) -> Vec<TensorBinding<'a>> {
    specs
        .iter()
        .zip(raw.iter())
        .map(|(spec, &(ptr, len))| {
            // SAFETY: `ptr`/`len` were just derived from a live `&mut [u8]`
            // into either the cache allocator or the arena, both of which
            // outlive this function call and are not touched again until
            // the resulting bindings are dropped.
            let data = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
            TensorBinding::new(&spec.desc.name, spec.desc.dtype, &spec.desc.dims, spec.desc.quant, data)
        })
        .collect()
}

fn execute_graph_with_plan<R: Runtime>(
    runtime: &mut R,
    graph: GraphId,
    plan: &mut BindingPlan,
    cache: &mut CacheAllocator,
) -> Result<(), Error> {
    let input_raw = resolve_all(&plan.inputs, cache, &mut plan.arena);
    let output_raw = resolve_all(&plan.outputs, cache, &mut plan.arena);

    let inputs = make_bindings(&plan.inputs, &input_raw);
    let mut outputs = make_bindings(&plan.outputs, &output_raw);

    runtime.execute_graph(graph, &inputs, &mut outputs)
}

fn for_each_slot<F: FnMut(usize, usize)>(shape: &ModelShape, mut f: F) {
    for layer in 0..shape.num_layers {
        for head in 0..shape.num_heads {
            f(layer, head);
        }
    }
}

/// Run one prefill execution and the full decode loop for `prompt_tokens`,
/// returning the final [`GenerationState`]. `should_cancel` is polled once
/// before each decode step.
#[allow(clippy::too_many_arguments)]
pub fn generate<R: Runtime>(
    runtime: &mut R,
    graphs: &Graphs,
    shape: &ModelShape,
    prefill_plan: &mut BindingPlan,
    decode_plan: &mut BindingPlan,
    cache: &mut CacheAllocator,
    prompt_tokens: &[i32],
    config: &GenerateConfig,
    mut should_cancel: impl FnMut() -> bool,
) -> Result<GenerationState, Error> {
    if prompt_tokens.is_empty() {
        return Err(Error::InvariantViolation("prompt_tokens must be non-empty".into()));
    }
    if prompt_tokens.len() > shape.ar_prefill {
        return Err(Error::InvariantViolation(format!(
            "prompt has {} tokens, exceeding single-shot prefill window ar_prefill={}",
            prompt_tokens.len(),
            shape.ar_prefill
        )));
    }

    let mut state = GenerationState {
        tokens: prompt_tokens.to_vec(),
        n_past: 0,
        phase: Phase::Prefill,
        metrics: Metrics::new(),
    };

    let nu = n_update(prompt_tokens.len(), shape.ar_prefill);

    let token_name: String = prefill_plan
        .inputs
        .iter()
        .find(|b| b.role == TensorRole::TokenInput)
        .ok_or_else(|| Error::BindingMissing("prefill graph has no TokenInput tensor".into()))?
        .desc
        .name
        .clone();
    fill_i32_front_aligned(
        prefill_plan.arena.slice_mut(&token_name).expect("token tensor is scratch"),
        prompt_tokens,
    );

    if let Some(pos_spec) = prefill_plan
        .inputs
        .iter()
        .find(|b| b.role == TensorRole::PositionInput)
    {
        let positions: Vec<i32> = (0..prompt_tokens.len() as i32).collect();
        let name = pos_spec.desc.name.clone();
        fill_i32_front_aligned(
            prefill_plan.arena.slice_mut(&name).expect("position tensor is scratch"),
            &positions,
        );
    }

    let mask_name = prefill_plan
        .inputs
        .iter()
        .find(|b| b.role == TensorRole::AttentionMask)
        .ok_or_else(|| Error::BindingMissing("prefill graph has no AttentionMask tensor".into()))?
        .desc
        .name
        .clone();
    mask::build_prefill(
        prefill_plan.arena.slice_mut(&mask_name).expect("mask tensor is scratch"),
        shape.ar_prefill,
        shape.context_len,
        0,
        nu,
    );

    let prefill_start = std::time::Instant::now();
    execute_graph_with_plan(runtime, graphs.prefill, prefill_plan, cache)?;
    state.metrics.record(Phase::Prefill, prefill_start.elapsed());

    for_each_slot(shape, |layer, head| {
        let slot = cache.slot_mut(layer, head);
        writeback_prefill(slot, shape.head_dim, shape.ar_prefill, shape.cache_len_prefill(), 0, nu);
    });
    for_each_slot(shape, |layer, head| {
        let slot = cache.slot_mut(layer, head);
        rearrange_k_cache(slot, shape.head_dim, shape.cache_len_prefill(), shape.cache_len_decode());
    });

    let prefill_logits_name = prefill_plan
        .outputs
        .iter()
        .find(|b| b.role == TensorRole::Logits)
        .ok_or_else(|| Error::BindingMissing("prefill graph has no Logits tensor".into()))?
        .desc
        .name
        .clone();
    let prefill_logits = prefill_plan
        .arena
        .slice(&prefill_logits_name)
        .expect("logits tensor is scratch");
    let logits_u16 = bytes_as_u16(prefill_logits);
    let mut next_token = argmax_row(logits_u16, nu - 1, shape.vocab_size) as i32;

    state.phase = Phase::Decoding;
    state.n_past = nu;
    state.tokens.push(next_token);

    let decode_token_name = decode_plan
        .inputs
        .iter()
        .find(|b| b.role == TensorRole::TokenInput)
        .ok_or_else(|| Error::BindingMissing("decode graph has no TokenInput tensor".into()))?
        .desc
        .name
        .clone();
    let decode_pos_name = decode_plan
        .inputs
        .iter()
        .find(|b| b.role == TensorRole::PositionInput)
        .map(|b| b.desc.name.clone());
    let decode_mask_name = decode_plan
        .inputs
        .iter()
        .find(|b| b.role == TensorRole::AttentionMask)
        .ok_or_else(|| Error::BindingMissing("decode graph has no AttentionMask tensor".into()))?
        .desc
        .name
        .clone();
    let decode_logits_name = decode_plan
        .outputs
        .iter()
        .find(|b| b.role == TensorRole::Logits)
        .ok_or_else(|| Error::BindingMissing("decode graph has no Logits tensor".into()))?
        .desc
        .name
        .clone();

    let mut step = 0usize;
    while step + 1 < config.max_gen && state.n_past + 1 < shape.cache_len_decode() {
        if should_cancel() {
            break;
        }

        fill_i32_front_aligned(
            decode_plan.arena.slice_mut(&decode_token_name).expect("token tensor is scratch"),
            &[next_token],
        );
        if let Some(name) = &decode_pos_name {
            fill_i32_front_aligned(
                decode_plan.arena.slice_mut(name).expect("position tensor is scratch"),
                &[state.n_past as i32],
            );
        }
        mask::build_decode(
            decode_plan.arena.slice_mut(&decode_mask_name).expect("mask tensor is scratch"),
            shape.context_len,
            state.n_past,
        );

        let decode_start = std::time::Instant::now();
        execute_graph_with_plan(runtime, graphs.decode, decode_plan, cache)?;
        state.metrics.record(Phase::Decoding, decode_start.elapsed());

        for_each_slot(shape, |layer, head| {
            let slot = cache.slot_mut(layer, head);
            writeback_decode(slot, shape.head_dim, shape.cache_len_decode(), state.n_past);
        });

        let logits = decode_plan
            .arena
            .slice(&decode_logits_name)
            .expect("logits tensor is scratch");
        next_token = argmax_row(bytes_as_u16(logits), 0, shape.vocab_size) as i32;

        state.tokens.push(next_token);
        state.n_past += 1;
        step += 1;
    }

    Ok(state)
}

fn bytes_as_u16(bytes: &[u8]) -> &[u16] {
    debug_assert_eq!(bytes.len() % 2, 0);
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<u16>(), 0);
    // SAFETY: arena allocations are aligned to at least 64 bytes (see
    // `crate::cache::MIN_ALIGN`), which satisfies u16's 2-byte alignment,
    // and `bytes.len()` is always an exact multiple of the tensor's
    // element size.
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u16, bytes.len() / 2) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::plan_graph;
    use crate::cache::CacheAllocator;
    use crate::classify::classify_graph;
    use crate::testing::{MockRuntime, ScriptedStep};
    use crate::tensor::{DType, TensorDesc};

    fn desc(name: &str, dtype: DType, dims: &[usize]) -> TensorDesc {
        TensorDesc {
            name: name.to_string(),
            dtype,
            dims: dims.to_vec(),
            nbytes: dims.iter().product::<usize>() * dtype.elem_size(),
            quant: None,
        }
    }

    fn u16_bytes(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    /// One layer, one head, `ar_prefill = 2`, a 2-token prompt that exactly
    /// fills the prefill window, then one decode step. Exercises the full
    /// prefill -> writeback -> rearrange -> argmax -> decode loop against a
    /// scripted runtime, with no real accelerator involved.
    #[test]
    fn generate_runs_one_prefill_and_one_decode_step() {
        let shape = ModelShape {
            context_len: 6,
            head_dim: 2,
            num_layers: 1,
            num_heads: 1,
            ar_prefill: 2,
            ar_decode: 1,
            vocab_size: 8,
        };
        let cache_len_prefill = shape.cache_len_prefill();
        let cache_len_decode = shape.cache_len_decode();

        let prefill_inputs = vec![
            desc("token_ids_input", DType::Int32, &[1, shape.ar_prefill]),
            desc(
                "atten_mask",
                DType::UInt16,
                &[shape.ar_prefill, shape.context_len],
            ),
            desc(
                "input_0_args_v",
                DType::UInt8,
                &[1, cache_len_prefill, shape.head_dim],
            ),
            desc(
                "input_1_args_k",
                DType::UInt8,
                &[1, shape.head_dim, cache_len_prefill],
            ),
        ];
        let prefill_outputs = vec![
            desc(
                "output_0_aten_view_copy_default",
                DType::UInt8,
                &[1, shape.ar_prefill, shape.head_dim],
            ),
            desc(
                "output_1_aten_permute_copy_default",
                DType::UInt8,
                &[1, shape.head_dim, shape.ar_prefill],
            ),
            desc(
                "logits_squeeze",
                DType::UInt16,
                &[shape.ar_prefill, shape.vocab_size],
            ),
        ];

        let decode_inputs = vec![
            desc("token_ids_input", DType::Int32, &[1, 1]),
            desc("atten_mask", DType::UInt16, &[1, shape.context_len]),
            desc(
                "input_0_args_v",
                DType::UInt8,
                &[1, cache_len_decode, shape.head_dim],
            ),
            desc(
                "input_1_args_k",
                DType::UInt8,
                &[1, shape.head_dim, cache_len_decode],
            ),
        ];
        let decode_outputs = vec![
            desc(
                "output_0_aten_view_copy_default",
                DType::UInt8,
                &[1, 1, shape.head_dim],
            ),
            desc(
                "output_1_aten_permute_copy_default",
                DType::UInt8,
                &[1, shape.head_dim, 1],
            ),
            desc("logits_squeeze", DType::UInt16, &[1, shape.vocab_size]),
        ];

        let (prefill_classified_in, prefill_classified_out) = classify_graph(
            &prefill_inputs,
            &prefill_outputs,
            &shape,
            cache_len_prefill,
            shape.ar_prefill,
        )
        .unwrap();
        let (decode_classified_in, decode_classified_out) = classify_graph(
            &decode_inputs,
            &decode_outputs,
            &shape,
            cache_len_decode,
            shape.ar_decode,
        )
        .unwrap();

        let mut prefill_plan = plan_graph(&prefill_classified_in, &prefill_classified_out).unwrap();
        let mut decode_plan = plan_graph(&decode_classified_in, &decode_classified_out).unwrap();
        let mut cache = CacheAllocator::new(&shape).unwrap();

        let mut prefill_logits = vec![0u16; shape.ar_prefill * shape.vocab_size];
        prefill_logits[shape.vocab_size + 4] = 999; // row 1 (n_update - 1), token id 4
        let prefill_step = ScriptedStep::new()
            .with_output(
                "output_0_aten_view_copy_default",
                vec![1u8, 2, 3, 4],
            )
            .with_output(
                "output_1_aten_permute_copy_default",
                vec![5u8, 6, 7, 8],
            )
            .with_output("logits_squeeze", u16_bytes(&prefill_logits));

        let mut decode_logits = vec![0u16; shape.vocab_size];
        decode_logits[2] = 777; // token id 2
        let decode_step = ScriptedStep::new()
            .with_output("output_0_aten_view_copy_default", vec![9u8, 10])
            .with_output("output_1_aten_permute_copy_default", vec![11u8, 12])
            .with_output("logits_squeeze", u16_bytes(&decode_logits));

        let mut runtime = MockRuntime::new(vec![prefill_step, decode_step]);
        let graphs = Graphs {
            context: ContextId(0),
            prefill: GraphId(0),
            decode: GraphId(1),
        };
        let config = GenerateConfig { max_gen: 2 };

        let state = generate(
            &mut runtime,
            &graphs,
            &shape,
            &mut prefill_plan,
            &mut decode_plan,
            &mut cache,
            &[10, 11],
            &config,
            || false,
        )
        .unwrap();

        assert_eq!(state.tokens, vec![10, 11, 4, 2]);
        assert_eq!(state.phase, Phase::Decoding);
        assert_eq!(state.n_past, 3);
        assert_eq!(runtime.calls_made(), 2);

        let prefill_recorded = &runtime.recorded_inputs[0];
        let token_bytes = &prefill_recorded["token_ids_input"];
        assert_eq!(
            &token_bytes[0..4],
            &10i32.to_ne_bytes(),
            "prompt token 0 should be front-aligned"
        );
        assert_eq!(&token_bytes[4..8], &11i32.to_ne_bytes());

        let decode_recorded = &runtime.recorded_inputs[1];
        assert_eq!(
            &decode_recorded["token_ids_input"][0..4],
            &4i32.to_ne_bytes(),
            "decode step should feed back the sampled token"
        );
    }

    #[test]
    fn generate_rejects_a_prompt_longer_than_the_prefill_window() {
        let shape = ModelShape {
            context_len: 6,
            head_dim: 2,
            num_layers: 1,
            num_heads: 1,
            ar_prefill: 2,
            ar_decode: 1,
            vocab_size: 8,
        };
        let mut cache = CacheAllocator::new(&shape).unwrap();
        let mut runtime = MockRuntime::new(vec![]);
        let graphs = Graphs {
            context: ContextId(0),
            prefill: GraphId(0),
            decode: GraphId(1),
        };

        // A validly-classified pair of plans (one layer, one head).
        // `generate` must reject the oversized prompt before either plan
        // is ever used.
        let cache_len_prefill = shape.cache_len_prefill();
        let inputs = vec![
            desc("token_ids_input", DType::Int32, &[1, shape.ar_prefill]),
            desc(
                "atten_mask",
                DType::UInt16,
                &[shape.ar_prefill, shape.context_len],
            ),
            desc(
                "input_0_args_v",
                DType::UInt8,
                &[1, cache_len_prefill, shape.head_dim],
            ),
            desc(
                "input_1_args_k",
                DType::UInt8,
                &[1, shape.head_dim, cache_len_prefill],
            ),
        ];
        let outputs = vec![
            desc(
                "output_0_aten_view_copy_default",
                DType::UInt8,
                &[1, shape.ar_prefill, shape.head_dim],
            ),
            desc(
                "output_1_aten_permute_copy_default",
                DType::UInt8,
                &[1, shape.head_dim, shape.ar_prefill],
            ),
            desc(
                "logits_squeeze",
                DType::UInt16,
                &[shape.ar_prefill, shape.vocab_size],
            ),
        ];
        let (classified_in, classified_out) =
            classify_graph(&inputs, &outputs, &shape, cache_len_prefill, shape.ar_prefill).unwrap();
        let mut prefill_plan = plan_graph(&classified_in, &classified_out).unwrap();
        let mut decode_plan = plan_graph(&classified_in, &classified_out).unwrap();

        let err = generate(
            &mut runtime,
            &graphs,
            &shape,
            &mut prefill_plan,
            &mut decode_plan,
            &mut cache,
            &[1, 2, 3],
            &GenerateConfig::default(),
            || false,
        )
        .unwrap_err();

        assert!(matches!(err, Error::InvariantViolation(_)));
    }
}
