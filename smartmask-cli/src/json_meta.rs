//! The graph-metadata JSON collaborator: parses the
//! `forward_<i>_json.json` sidecar next to each shard binary into the
//! ordered `TensorDesc` lists the core crate classifies.
//!
//! This format is not vendor-documented; the schema below is a
//! reconstruction from the accelerator driver's field names (tensor
//! fields `name`/`data_type`/`dims`, optional
//! `quant_scale`/`quant_offset`/`quant_encoding`, grouped per named graph
//! under a top-level `graphs` array).

use std::fs;
use std::path::Path;

use serde::Deserialize;
use smartmask::{DType, Error, QuantParams, TensorDesc};

#[derive(Debug, Deserialize)]
struct JsonFile {
    graphs: Vec<JsonGraph>,
}

#[derive(Debug, Deserialize)]
struct JsonGraph {
    graph: String,
    inputs: Vec<JsonTensor>,
    outputs: Vec<JsonTensor>,
}

#[derive(Debug, Deserialize)]
struct JsonTensor {
    name: String,
    data_type: String,
    dims: Vec<usize>,
    #[serde(default)]
    nbytes: Option<u64>,
    #[serde(default)]
    quant_scale: Option<f32>,
    #[serde(default)]
    quant_offset: Option<i32>,
}

/// One graph's parsed input/output tensor lists.
pub struct GraphMeta {
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

fn parse_dtype(data_type: &str) -> Result<DType, Error> {
    let upper = data_type.to_ascii_uppercase();
    if upper.contains("INT_32") {
        Ok(DType::Int32)
    } else if upper.contains("UFIXED_POINT_16") || upper.contains("UINT_16") {
        Ok(DType::UInt16)
    } else if upper.contains("UFIXED_POINT_8") || upper.contains("UINT_8") {
        Ok(DType::UInt8)
    } else if upper.contains("FLOAT_32") {
        Ok(DType::Float32)
    } else {
        Err(Error::ShapeDiscoveryFailed(format!(
            "unsupported tensor data_type `{data_type}`"
        )))
    }
}

fn convert_tensor(t: JsonTensor) -> Result<TensorDesc, Error> {
    let dtype = parse_dtype(&t.data_type)?;
    let elem_count: usize = t.dims.iter().product();
    let nbytes = t
        .nbytes
        .map(|n| n as usize)
        .unwrap_or(elem_count * dtype.elem_size());
    let quant = match (t.quant_scale, t.quant_offset) {
        (Some(scale), Some(offset)) => Some(QuantParams { scale, offset }),
        _ => None,
    };
    Ok(TensorDesc {
        name: t.name,
        dtype,
        dims: t.dims,
        nbytes,
        quant,
    })
}

/// Parse one shard's JSON sidecar into a map of graph name to its tensor
/// metadata.
pub fn parse(json_path: &Path) -> Result<std::collections::HashMap<String, GraphMeta>, Error> {
    let text = fs::read_to_string(json_path).map_err(|e| {
        Error::ShapeDiscoveryFailed(format!("failed to read {}: {e}", json_path.display()))
    })?;
    let file: JsonFile = serde_json::from_str(&text).map_err(|e| {
        Error::ShapeDiscoveryFailed(format!("failed to parse {}: {e}", json_path.display()))
    })?;

    let mut graphs = std::collections::HashMap::with_capacity(file.graphs.len());
    for g in file.graphs {
        let inputs = g
            .inputs
            .into_iter()
            .map(convert_tensor)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = g
            .outputs
            .into_iter()
            .map(convert_tensor)
            .collect::<Result<Vec<_>, _>>()?;
        graphs.insert(g.graph, GraphMeta { inputs, outputs });
    }
    Ok(graphs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_graph_json() {
        let dir = std::env::temp_dir().join(format!(
            "smartmask-json-meta-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("forward_0_json.json");
        std::fs::write(
            &path,
            r#"{
                "graphs": [
                    {
                        "graph": "prefill_forward",
                        "inputs": [
                            { "name": "token_ids_input", "data_type": "INT_32", "dims": [1, 4] },
                            { "name": "atten_mask", "data_type": "UFIXED_POINT_16", "dims": [4, 16] }
                        ],
                        "outputs": [
                            { "name": "logits_squeeze", "data_type": "UFIXED_POINT_16", "dims": [4, 128256], "quant_scale": 0.001, "quant_offset": -128 }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        let graphs = parse(&path).unwrap();
        let prefill = graphs.get("prefill_forward").unwrap();
        assert_eq!(prefill.inputs.len(), 2);
        assert_eq!(prefill.outputs[0].quant.unwrap().offset, -128);

        std::fs::remove_dir_all(&dir).ok();
    }
}
