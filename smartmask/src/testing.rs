//! A scripted [`Runtime`] double for exercising [`crate::generate::generate`]
//! without a real accelerator, in the style of `rten-generate`'s
//! `FakeModel` test fixture: each call to `execute_graph` is satisfied by
//! the next entry in a pre-recorded script of named output byte buffers.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Error;
use crate::runtime::{ContextId, GraphId, Runtime, TensorBinding};

/// One scripted `execute_graph` call: the bytes to write into each named
/// output tensor.
#[derive(Debug, Default, Clone)]
pub struct ScriptedStep {
    pub outputs: HashMap<String, Vec<u8>>,
}

impl ScriptedStep {
    pub fn new() -> Self {
        ScriptedStep::default()
    }

    pub fn with_output(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.outputs.insert(name.to_string(), bytes);
        self
    }
}

/// A [`Runtime`] that never touches real hardware: `load`,
/// `create_backend_and_device`, and `create_context_from_binary` always
/// succeed; `retrieve_graph` hands out a stable [`GraphId`] per distinct
/// name; `execute_graph` copies the next [`ScriptedStep`]'s bytes into the
/// matching output bindings and records the input bytes it was given, so
/// tests can assert on what the generation loop wrote.
pub struct MockRuntime {
    steps: Vec<ScriptedStep>,
    call_count: usize,
    graph_ids: HashMap<String, GraphId>,
    pub recorded_inputs: Vec<HashMap<String, Vec<u8>>>,
}

impl MockRuntime {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        MockRuntime {
            steps,
            call_count: 0,
            graph_ids: HashMap::new(),
            recorded_inputs: Vec::new(),
        }
    }

    pub fn calls_made(&self) -> usize {
        self.call_count
    }
}

impl Runtime for MockRuntime {
    fn load(&mut self, _backend_lib: &Path, _system_lib: &Path) -> Result<(), Error> {
        Ok(())
    }

    fn create_backend_and_device(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn create_context_from_binary(&mut self, _bytes: &[u8]) -> Result<ContextId, Error> {
        Ok(ContextId(0))
    }

    fn retrieve_graph(&mut self, _ctx: ContextId, name: &str) -> Result<GraphId, Error> {
        let next_id = self.graph_ids.len();
        Ok(*self
            .graph_ids
            .entry(name.to_string())
            .or_insert(GraphId(next_id)))
    }

    fn execute_graph(
        &mut self,
        _graph: GraphId,
        inputs: &[TensorBinding<'_>],
        outputs: &mut [TensorBinding<'_>],
    ) -> Result<(), Error> {
        let mut snapshot = HashMap::with_capacity(inputs.len());
        for binding in inputs {
            // SAFETY: the caller's binding buffers are valid for the
            // duration of this call.
            snapshot.insert(binding.name.to_string(), unsafe { binding.as_slice() }.to_vec());
        }
        self.recorded_inputs.push(snapshot);

        let step = self.steps.get(self.call_count).ok_or_else(|| {
            Error::runtime_failure(format!(
                "MockRuntime has no scripted step for call {}",
                self.call_count
            ))
        })?;

        for binding in outputs.iter_mut() {
            if let Some(bytes) = step.outputs.get(binding.name) {
                // SAFETY: same as above; exclusive access for this call.
                let dst = unsafe { binding.as_mut_slice() };
                assert_eq!(
                    dst.len(),
                    bytes.len(),
                    "scripted output {} has {} bytes but the binding expects {}",
                    binding.name,
                    bytes.len(),
                    dst.len()
                );
                dst.copy_from_slice(bytes);
            }
        }

        self.call_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieve_graph_is_stable_per_name() {
        let mut runtime = MockRuntime::new(vec![]);
        let a1 = runtime.retrieve_graph(ContextId(0), "prefill").unwrap();
        let b1 = runtime.retrieve_graph(ContextId(0), "decode").unwrap();
        let a2 = runtime.retrieve_graph(ContextId(0), "prefill").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b1);
    }

    #[test]
    fn execute_graph_writes_scripted_bytes_and_records_inputs() {
        let step = ScriptedStep::new().with_output("logits", vec![1, 2, 3, 4]);
        let mut runtime = MockRuntime::new(vec![step]);
        let graph = runtime.retrieve_graph(ContextId(0), "prefill").unwrap();

        let mut in_buf = [7u8, 8, 9, 10];
        let inputs = vec![TensorBinding::new(
            "token_ids",
            crate::tensor::DType::UInt8,
            &[4],
            None,
            &mut in_buf,
        )];
        let mut out_buf = [0u8; 4];
        let mut outputs = vec![TensorBinding::new(
            "logits",
            crate::tensor::DType::UInt8,
            &[4],
            None,
            &mut out_buf,
        )];

        runtime.execute_graph(graph, &inputs, &mut outputs).unwrap();
        drop(inputs);
        drop(outputs);

        assert_eq!(out_buf, [1, 2, 3, 4]);
        assert_eq!(runtime.recorded_inputs[0]["token_ids"], vec![7, 8, 9, 10]);
    }

    #[test]
    fn exhausting_scripted_steps_is_a_runtime_failure() {
        let mut runtime = MockRuntime::new(vec![]);
        let graph = runtime.retrieve_graph(ContextId(0), "prefill").unwrap();
        let err = runtime.execute_graph(graph, &[], &mut []).unwrap_err();
        assert!(matches!(err, Error::RuntimeFailure(_)));
    }
}
