//! Assigns each input/output tensor of a graph a [`TensorRole`], and
//! derives (layer, head) coordinates for the four per-(layer,head) cache
//! roles.

use crate::error::Error;
use crate::shape::ModelShape;
use crate::tensor::{ClassifiedTensor, DType, TensorDesc, TensorRole};

fn lower_contains(name: &str, needle: &str) -> bool {
    name.to_ascii_lowercase().contains(needle)
}

/// Predicate table, evaluated in order; first match wins. `cache_len` is
/// `cache_len_prefill` or `cache_len_decode` depending on
/// which graph `desc` belongs to, and `ar` is that graph's AR length.
fn classify_one(desc: &TensorDesc, cache_len: usize, ar: usize) -> TensorRole {
    let name = desc.name.to_ascii_lowercase();

    if lower_contains(&name, "token") && lower_contains(&name, "input") && desc.dtype == DType::Int32 {
        return TensorRole::TokenInput;
    }
    if lower_contains(&name, "pos") && desc.dtype == DType::Int32 {
        return TensorRole::PositionInput;
    }
    if lower_contains(&name, "atten_mask") || lower_contains(&name, "attn_mask") {
        return TensorRole::AttentionMask;
    }
    if desc.rank() == 3 && desc.dims[0] == 1 && desc.dims[1] == cache_len {
        // dims = [1, cache_len, head_dim]
        return TensorRole::VCacheInput((0, 0)); // layer/head filled in by assign_layer_head
    }
    if desc.rank() == 3 && desc.dims[0] == 1 && desc.dims[2] == cache_len {
        // dims = [1, head_dim, cache_len]
        return TensorRole::KCacheInput((0, 0));
    }
    if desc.rank() == 3
        && lower_contains(&name, "view_copy")
        && desc.dims.len() == 3
        && desc.dims[1] == ar
    {
        // dims = [1, ar, head_dim]
        return TensorRole::VCacheOutput((0, 0));
    }
    if desc.rank() == 3
        && lower_contains(&name, "permute_copy")
        && desc.dims.len() == 3
        && desc.dims[2] == ar
    {
        // dims = [1, head_dim, ar]
        return TensorRole::KCacheOutput((0, 0));
    }
    if lower_contains(&name, "squeeze") || lower_contains(&name, "logit") {
        return TensorRole::Logits;
    }
    TensorRole::Opaque
}

/// Extract the integer following the first occurrence of `input_` or
/// `output_` in `name`, used as the layer/head ordering key.
fn extract_index(name: &str) -> Option<usize> {
    for prefix in ["input_", "output_"] {
        if let Some(pos) = name.find(prefix) {
            let start = pos + prefix.len();
            let digits: String = name[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !digits.is_empty() {
                return digits.parse().ok();
            }
        }
    }
    None
}

/// Assign (layer, head) coordinates to every V-role and K-role tensor in
/// `tensors`, in place, by walking tensors in index order and maintaining
/// one running counter for V-roles and one for K-roles.
fn assign_layer_head(tensors: &mut [(TensorDesc, TensorRole)], num_heads: usize) {
    let mut order: Vec<usize> = (0..tensors.len()).collect();
    order.sort_by_key(|&i| extract_index(&tensors[i].0.name).unwrap_or(usize::MAX));

    let mut v_counter = 0usize;
    let mut k_counter = 0usize;
    for &i in &order {
        let role = tensors[i].1;
        let assigned = match role {
            TensorRole::VCacheInput(_) | TensorRole::VCacheOutput(_) => {
                let lh = (v_counter / num_heads, v_counter % num_heads);
                v_counter += 1;
                Some(lh)
            }
            TensorRole::KCacheInput(_) | TensorRole::KCacheOutput(_) => {
                let lh = (k_counter / num_heads, k_counter % num_heads);
                k_counter += 1;
                Some(lh)
            }
            _ => None,
        };
        if let Some(lh) = assigned {
            tensors[i].1 = match role {
                TensorRole::VCacheInput(_) => TensorRole::VCacheInput(lh),
                TensorRole::VCacheOutput(_) => TensorRole::VCacheOutput(lh),
                TensorRole::KCacheInput(_) => TensorRole::KCacheInput(lh),
                TensorRole::KCacheOutput(_) => TensorRole::KCacheOutput(lh),
                other => other,
            };
        }
    }
}

fn check_invariants(
    inputs: &[(TensorDesc, TensorRole)],
    outputs: &[(TensorDesc, TensorRole)],
    shape: &ModelShape,
) -> Result<(), Error> {
    let count = |tensors: &[(TensorDesc, TensorRole)], matcher: fn(&TensorRole) -> bool| {
        tensors.iter().filter(|(_, r)| matcher(r)).count()
    };
    let expected = shape.num_layers * shape.num_heads;

    let n_k_in = count(inputs, |r| matches!(r, TensorRole::KCacheInput(_)));
    let n_v_in = count(inputs, |r| matches!(r, TensorRole::VCacheInput(_)));
    let n_k_out = count(outputs, |r| matches!(r, TensorRole::KCacheOutput(_)));
    let n_v_out = count(outputs, |r| matches!(r, TensorRole::VCacheOutput(_)));

    if n_k_in != expected || n_v_in != expected || n_k_out != expected || n_v_out != expected {
        return Err(Error::ClassificationMismatch(format!(
            "expected {expected} of each cache role (num_layers * num_heads), got K-in={n_k_in} V-in={n_v_in} K-out={n_k_out} V-out={n_v_out}"
        )));
    }

    let mut seen_k_in = vec![false; expected];
    let mut seen_v_in = vec![false; expected];
    for (_, role) in inputs {
        match role {
            TensorRole::KCacheInput((l, h)) => seen_k_in[l * shape.num_heads + h] = true,
            TensorRole::VCacheInput((l, h)) => seen_v_in[l * shape.num_heads + h] = true,
            _ => {}
        }
    }
    if seen_k_in.iter().any(|&seen| !seen) || seen_v_in.iter().any(|&seen| !seen) {
        return Err(Error::ClassificationMismatch(
            "every (layer, head) pair must have exactly one K-cache input and one V-cache input"
                .into(),
        ));
    }

    Ok(())
}

/// Classify every input and output tensor of one graph, assign (layer,
/// head) coordinates to cache tensors, and verify every (layer, head) pair
/// has exactly one tensor of each cache role.
///
/// `cache_len` and `ar` are the cache length and AR length *of this graph*
/// (e.g. `cache_len_prefill`/`ar_prefill` when classifying the prefill
/// graph).
pub fn classify_graph(
    inputs: &[TensorDesc],
    outputs: &[TensorDesc],
    shape: &ModelShape,
    cache_len: usize,
    ar: usize,
) -> Result<(Vec<ClassifiedTensor>, Vec<ClassifiedTensor>), Error> {
    let mut classified_inputs: Vec<(TensorDesc, TensorRole)> = inputs
        .iter()
        .map(|d| (d.clone(), classify_one(d, cache_len, ar)))
        .collect();
    let mut classified_outputs: Vec<(TensorDesc, TensorRole)> = outputs
        .iter()
        .map(|d| (d.clone(), classify_one(d, cache_len, ar)))
        .collect();

    assign_layer_head(&mut classified_inputs, shape.num_heads);
    assign_layer_head(&mut classified_outputs, shape.num_heads);

    check_invariants(&classified_inputs, &classified_outputs, shape)?;

    let inputs = classified_inputs
        .into_iter()
        .map(|(desc, role)| ClassifiedTensor { desc, role })
        .collect();
    let outputs = classified_outputs
        .into_iter()
        .map(|(desc, role)| ClassifiedTensor { desc, role })
        .collect();
    Ok((inputs, outputs))
}
