//! Tensor metadata and the [`TensorRole`] sum type classification assigns
//! tensors to. A tagged enum is used here instead of repeated substring
//! matching on tensor names at every call site.

/// Element type of a tensor, as reported by the graph-metadata collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DType {
    Int32,
    UInt16,
    UInt8,
    Float32,
}

impl DType {
    pub fn elem_size(self) -> usize {
        match self {
            DType::Int32 => 4,
            DType::UInt16 => 2,
            DType::UInt8 => 1,
            DType::Float32 => 4,
        }
    }
}

/// Affine quantization parameters for a quantized tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QuantParams {
    pub scale: f32,
    pub offset: i32,
}

/// A single named input or output tensor of a graph, as supplied by the
/// (out of scope) graph-metadata collaborator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TensorDesc {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub nbytes: usize,
    pub quant: Option<QuantParams>,
}

impl TensorDesc {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

/// (layer, head) coordinates, shared by all four per-(layer,head) roles.
pub type LayerHead = (usize, usize);

/// The role a tensor plays in the generation loop. Assigned once by the
/// Tensor Classifier and threaded through the rest of the pipeline instead
/// of re-matching tensor names repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TensorRole {
    TokenInput,
    PositionInput,
    AttentionMask,
    KCacheInput(LayerHead),
    VCacheInput(LayerHead),
    KCacheOutput(LayerHead),
    VCacheOutput(LayerHead),
    Logits,
    Opaque,
}

impl TensorRole {
    pub fn layer_head(self) -> Option<LayerHead> {
        match self {
            TensorRole::KCacheInput(lh)
            | TensorRole::VCacheInput(lh)
            | TensorRole::KCacheOutput(lh)
            | TensorRole::VCacheOutput(lh) => Some(lh),
            _ => None,
        }
    }
}

/// A classified tensor: its static metadata paired with the role assigned
/// by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedTensor {
    pub desc: TensorDesc,
    pub role: TensorRole,
}
