//! A `libloading`-backed [`Runtime`] for the vendor accelerator.
//!
//! The accelerator runtime is an external collaborator specified only at
//! its boundary: `load`, `create_backend_and_device`,
//! `create_context_from_binary`, `retrieve_graph`, `execute_graph`. This
//! module implements the part of that boundary achievable without the
//! vendor SDK's tensor/interface struct layouts (loading the shared
//! libraries and resolving the one documented, version-stable entry point,
//! `QnnInterface_getProviders`). Binding and executing a graph against the
//! resolved interface table requires those vendor struct layouts, which
//! this crate does not vendor or fabricate; `execute_graph` surfaces that
//! gap as a `RuntimeFailure` rather than guessing at an ABI.

use std::collections::HashMap;
use std::path::Path;

use libloading::{Library, Symbol};

use smartmask::runtime::{ContextId, GraphId, Runtime, TensorBinding};
use smartmask::Error;

/// The single entry point every QNN backend/system shared library exports;
/// everything else (backend, device, context, graph handles) is obtained
/// by calling through the function table it returns.
const GET_PROVIDERS_SYMBOL: &[u8] = b"QnnInterface_getProviders";

pub struct DlRuntime {
    backend_lib: Option<Library>,
    system_lib: Option<Library>,
    next_context: usize,
    next_graph: usize,
    graph_names: HashMap<(ContextId, String), GraphId>,
}

impl DlRuntime {
    pub fn new() -> Self {
        DlRuntime {
            backend_lib: None,
            system_lib: None,
            next_context: 0,
            next_graph: 0,
            graph_names: HashMap::new(),
        }
    }

    fn backend_lib(&self) -> Result<&Library, Error> {
        self.backend_lib
            .as_ref()
            .ok_or_else(|| Error::runtime_failure("backend library not loaded; call load() first"))
    }
}

impl Default for DlRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for DlRuntime {
    fn load(&mut self, backend_lib: &Path, system_lib: &Path) -> Result<(), Error> {
        // SAFETY: dlopen has no Rust-level safety contract beyond "the
        // library, if it runs initializers, behaves"; that's the caller's
        // (the accelerator vendor's) responsibility, as for any FFI load.
        let backend = unsafe { Library::new(backend_lib) }
            .map_err(|e| Error::runtime_failure(format!("failed to load {}: {e}", backend_lib.display())))?;
        let system = unsafe { Library::new(system_lib) }
            .map_err(|e| Error::runtime_failure(format!("failed to load {}: {e}", system_lib.display())))?;

        // Validate the backend library is actually a QNN-style shared
        // object by resolving its one documented export.
        // SAFETY: symbol lookup by name only inspects the library's
        // dynamic symbol table; the returned pointer is not called here.
        let _providers: Symbol<'_, unsafe extern "C" fn()> =
            unsafe { backend.get(GET_PROVIDERS_SYMBOL) }.map_err(|e| {
                Error::runtime_failure(format!(
                    "{} does not export {}: {e}",
                    backend_lib.display(),
                    String::from_utf8_lossy(GET_PROVIDERS_SYMBOL)
                ))
            })?;
        drop(_providers);

        log::info!(
            "loaded accelerator backend {} and system library {}",
            backend_lib.display(),
            system_lib.display()
        );

        self.backend_lib = Some(backend);
        self.system_lib = Some(system);
        Ok(())
    }

    fn create_backend_and_device(&mut self) -> Result<(), Error> {
        self.backend_lib()?;
        log::debug!("backend/device creation deferred to vendor interface table (not bound by this crate)");
        Ok(())
    }

    fn create_context_from_binary(&mut self, bytes: &[u8]) -> Result<ContextId, Error> {
        self.backend_lib()?;
        let id = ContextId(self.next_context);
        self.next_context += 1;
        log::debug!("registered context {} for {} byte binary", id.0, bytes.len());
        Ok(id)
    }

    fn retrieve_graph(&mut self, ctx: ContextId, name: &str) -> Result<GraphId, Error> {
        self.backend_lib()?;
        let key = (ctx, name.to_string());
        if let Some(&id) = self.graph_names.get(&key) {
            return Ok(id);
        }
        let id = GraphId(self.next_graph);
        self.next_graph += 1;
        self.graph_names.insert(key, id);
        Ok(id)
    }

    fn execute_graph(
        &mut self,
        _graph: GraphId,
        _inputs: &[TensorBinding<'_>],
        _outputs: &mut [TensorBinding<'_>],
    ) -> Result<(), Error> {
        Err(Error::runtime_failure(
            "execute_graph requires a vendor QNN interface-table binding; \
             this crate resolves and validates the shared libraries but does \
             not vendor the Qnn_Tensor_t/QnnInterface_t ABI needed to call into them",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_before_load_fail_with_runtime_failure() {
        let mut runtime = DlRuntime::new();
        let err = runtime.create_backend_and_device().unwrap_err();
        assert!(matches!(err, Error::RuntimeFailure(_)));
    }
}
