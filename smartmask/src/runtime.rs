//! The accelerator-runtime collaborator. Loading shared libraries,
//! creating the backend/device/context, and retrieving/executing graphs
//! on real hardware are all left to a concrete implementation; this module
//! only defines the narrow contract such an implementation must satisfy.

use std::path::Path;

use crate::error::Error;
use crate::tensor::{DType, QuantParams};

/// Opaque handle to a restored context (one per shard binary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub usize);

/// Opaque handle to a graph retrieved from a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(pub usize);

/// One tensor binding passed across the `execute_graph` boundary: a name,
/// static metadata, and a raw pointer + length into a host buffer. Rather
/// than an owned/borrowed Rust slice, this is pointer-based because the
/// same `execute_graph` call receives bindings whose underlying storage
/// comes from disjoint parts of the same cache allocator (distinct
/// (layer, head) slots) — expressing that via ordinary borrow-checked
/// references would require holding multiple `&mut` borrows into the
/// allocator simultaneously, which the borrow checker cannot verify are
/// non-overlapping even though they always are in practice.
#[derive(Debug)]
pub struct TensorBinding<'a> {
    pub name: &'a str,
    pub dtype: DType,
    pub dims: &'a [usize],
    pub quant: Option<QuantParams>,
    ptr: *mut u8,
    len: usize,
}

impl<'a> TensorBinding<'a> {
    /// Construct a binding over `data`. `data` must stay valid and
    /// unaliased for as long as the binding is used.
    pub fn new(
        name: &'a str,
        dtype: DType,
        dims: &'a [usize],
        quant: Option<QuantParams>,
        data: &mut [u8],
    ) -> Self {
        TensorBinding {
            name,
            dtype,
            dims,
            quant,
            ptr: data.as_mut_ptr(),
            len: data.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the bytes behind this binding.
    ///
    /// # Safety
    /// The caller must ensure the buffer this binding was constructed from
    /// is still valid and not concurrently mutated.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// Write the bytes behind this binding.
    ///
    /// # Safety
    /// The caller must ensure the buffer this binding was constructed from
    /// is still valid and not concurrently read or written elsewhere.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// The abstract accelerator runtime contract. A concrete implementation
/// binds these operations to a specific vendor SDK.
pub trait Runtime {
    fn load(&mut self, backend_lib: &Path, system_lib: &Path) -> Result<(), Error>;
    fn create_backend_and_device(&mut self) -> Result<(), Error>;
    fn create_context_from_binary(&mut self, bytes: &[u8]) -> Result<ContextId, Error>;
    fn retrieve_graph(&mut self, ctx: ContextId, name: &str) -> Result<GraphId, Error>;
    fn execute_graph(
        &mut self,
        graph: GraphId,
        inputs: &[TensorBinding<'_>],
        outputs: &mut [TensorBinding<'_>],
    ) -> Result<(), Error>;
}
