//! Decides, for each tensor of one graph, whether the accelerator should
//! read/write it directly inside a persistent cache slot (`Shared`, the
//! zero-copy path) or inside a per-graph scratch arena (`Scratch`).

use crate::arena::Arena;
use crate::error::Error;
use crate::tensor::{ClassifiedTensor, LayerHead, TensorDesc, TensorRole};

/// Which of K or V a cache-role tensor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    K,
    V,
}

/// Whether a cache-role tensor is the persistent input slot or the
/// per-step output (scratch-but-shared) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSide {
    Input,
    Output,
}

/// Where a tensor's backing storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingTarget {
    /// Bound directly to a [`crate::cache::KVSlot`] buffer; no copy needed.
    Shared {
        layer_head: LayerHead,
        kind: CacheKind,
        side: CacheSide,
    },
    /// Bound to a byte range inside the graph's [`Arena`].
    Scratch { offset: usize, nbytes: usize },
}

/// The resolved binding for a single named tensor, carrying the static
/// metadata an `execute_graph` call needs alongside it.
#[derive(Debug, Clone)]
pub struct TensorBindingSpec {
    pub desc: TensorDesc,
    pub role: TensorRole,
    pub target: BindingTarget,
}

/// A complete plan for one graph: every input and output tensor's binding
/// target, plus the scratch arena backing all `Scratch` targets.
#[derive(Debug)]
pub struct BindingPlan {
    pub inputs: Vec<TensorBindingSpec>,
    pub outputs: Vec<TensorBindingSpec>,
    pub arena: Arena,
}

impl BindingPlan {
    pub fn input(&self, name: &str) -> Option<&TensorBindingSpec> {
        self.inputs.iter().find(|b| b.desc.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorBindingSpec> {
        self.outputs.iter().find(|b| b.desc.name == name)
    }
}

fn require_role(
    tensors: &[TensorBindingSpec],
    role: TensorRole,
    label: &str,
) -> Result<(), Error> {
    if tensors.iter().any(|b| b.role == role) {
        Ok(())
    } else {
        Err(Error::BindingMissing(format!(
            "no tensor classified as {label} found in this graph's binding plan"
        )))
    }
}

fn bind_one(t: &ClassifiedTensor, side: CacheSide) -> Option<BindingTarget> {
    match t.role {
        TensorRole::KCacheInput(lh) => Some(BindingTarget::Shared {
            layer_head: lh,
            kind: CacheKind::K,
            side,
        }),
        TensorRole::VCacheInput(lh) => Some(BindingTarget::Shared {
            layer_head: lh,
            kind: CacheKind::V,
            side,
        }),
        TensorRole::KCacheOutput(lh) => Some(BindingTarget::Shared {
            layer_head: lh,
            kind: CacheKind::K,
            side,
        }),
        TensorRole::VCacheOutput(lh) => Some(BindingTarget::Shared {
            layer_head: lh,
            kind: CacheKind::V,
            side,
        }),
        _ => None,
    }
}

/// Build the [`BindingPlan`] for one graph's classified inputs and outputs.
///
/// Every `KCacheInput`/`VCacheInput`/`KCacheOutput`/`VCacheOutput` tensor is
/// bound `Shared` directly into the matching [`crate::cache::KVSlot`]
/// buffer. Every other tensor (`TokenInput`, `PositionInput`,
/// `AttentionMask`, `Logits`, `Opaque`) is laid out `Scratch` inside a
/// fresh per-graph arena, at an offset aligned to at least 64 bytes.
pub fn plan_graph(
    inputs: &[ClassifiedTensor],
    outputs: &[ClassifiedTensor],
) -> Result<BindingPlan, Error> {
    let mut scratch_entries: Vec<(String, usize)> = Vec::new();

    for t in inputs.iter().chain(outputs.iter()) {
        let is_shared = matches!(
            t.role,
            TensorRole::KCacheInput(_)
                | TensorRole::VCacheInput(_)
                | TensorRole::KCacheOutput(_)
                | TensorRole::VCacheOutput(_)
        );
        if !is_shared {
            scratch_entries.push((t.desc.name.clone(), t.desc.nbytes));
        }
    }

    let arena = Arena::build(&scratch_entries)?;

    let resolve = |t: &ClassifiedTensor, side: CacheSide| -> Result<TensorBindingSpec, Error> {
        let target = if let Some(target) = bind_one(t, side) {
            target
        } else {
            let (offset, nbytes) = arena.offset_of(&t.desc.name).ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "scratch tensor {} missing from arena layout",
                    t.desc.name
                ))
            })?;
            BindingTarget::Scratch { offset, nbytes }
        };
        Ok(TensorBindingSpec {
            desc: t.desc.clone(),
            role: t.role,
            target,
        })
    };

    let bound_inputs = inputs
        .iter()
        .map(|t| resolve(t, CacheSide::Input))
        .collect::<Result<Vec<_>, _>>()?;
    let bound_outputs = outputs
        .iter()
        .map(|t| resolve(t, CacheSide::Output))
        .collect::<Result<Vec<_>, _>>()?;

    require_role(&bound_inputs, TensorRole::TokenInput, "TokenInput")?;
    require_role(&bound_inputs, TensorRole::AttentionMask, "AttentionMask")?;
    require_role(&bound_outputs, TensorRole::Logits, "Logits")?;

    Ok(BindingPlan {
        inputs: bound_inputs,
        outputs: bound_outputs,
        arena,
    })
}
