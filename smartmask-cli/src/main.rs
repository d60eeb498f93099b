//! Driver binary: tokenize a prompt, run one prefill step, then decode
//! greedily until `max_gen` tokens have been produced.
//!
//! Everything this binary does beyond calling into the `smartmask` crate
//! is wiring to external collaborators outside the core engine's scope:
//! the shard directory layout, the graph-metadata JSON, the tokenizer,
//! and the accelerator runtime.

mod args;
mod json_meta;
mod runtime_dl;
mod shard;

use std::fs;
use std::process::ExitCode;

use smartmask::binding::plan_graph;
use smartmask::cache::CacheAllocator;
use smartmask::classify::classify_graph;
use smartmask::generate::{generate, GenerateConfig, Graphs};
use smartmask::runtime::Runtime;
use smartmask::shape::discover_shape;
use smartmask::Error;

use json_meta::GraphMeta;
use runtime_dl::DlRuntime;

const PREFILL_GRAPH_NAME: &str = "prefill_forward";
const DECODE_GRAPH_NAME: &str = "kv_forward";

fn init_logging(log_level: u8) {
    let filter = match log_level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(filter).init();
}

/// Parse every shard's JSON sidecar and index the resulting graphs by
/// name, remembering which shard each graph's binary lives in.
fn load_graph_metadata(
    ctx_dir: &std::path::Path,
) -> Result<(Vec<shard::Shard>, std::collections::HashMap<String, (usize, GraphMeta)>), Error> {
    let shards = shard::scan(ctx_dir).map_err(|e| {
        Error::ShapeDiscoveryFailed(format!("failed to scan {}: {e}", ctx_dir.display()))
    })?;
    if shards.is_empty() {
        return Err(Error::ShapeDiscoveryFailed(format!(
            "no forward_<i>.bin / forward_<i>_json.json shard pairs found in {}",
            ctx_dir.display()
        )));
    }

    let mut by_name = std::collections::HashMap::new();
    for shard in &shards {
        let graphs = json_meta::parse(&shard.json_path)?;
        for (name, meta) in graphs {
            by_name.insert(name, (shard.index, meta));
        }
    }
    Ok((shards, by_name))
}

fn run(args: args::Args) -> Result<(), Error> {
    init_logging(args.log_level);

    let (shards, graphs_by_name) = load_graph_metadata(&args.ctx_dir)?;

    let prefill_meta = graphs_by_name.get(PREFILL_GRAPH_NAME).ok_or_else(|| {
        Error::ShapeDiscoveryFailed(format!("no `{PREFILL_GRAPH_NAME}` graph found in any shard"))
    })?;
    let decode_meta = graphs_by_name.get(DECODE_GRAPH_NAME).ok_or_else(|| {
        Error::ShapeDiscoveryFailed(format!("no `{DECODE_GRAPH_NAME}` graph found in any shard"))
    })?;

    let shape = discover_shape(
        &prefill_meta.1.inputs,
        &prefill_meta.1.outputs,
        &decode_meta.1.inputs,
        &decode_meta.1.outputs,
        args.num_layers,
    )?;
    log::info!(
        "discovered shape: {} layers x {} heads, head_dim={}, context_len={}, ar_prefill={}, ar_decode={}, vocab_size={}",
        shape.num_layers, shape.num_heads, shape.head_dim, shape.context_len,
        shape.ar_prefill, shape.ar_decode, shape.vocab_size,
    );

    let (prefill_in, prefill_out) = classify_graph(
        &prefill_meta.1.inputs,
        &prefill_meta.1.outputs,
        &shape,
        shape.cache_len_prefill(),
        shape.ar_prefill,
    )?;
    let (decode_in, decode_out) = classify_graph(
        &decode_meta.1.inputs,
        &decode_meta.1.outputs,
        &shape,
        shape.cache_len_decode(),
        shape.ar_decode,
    )?;

    let mut prefill_plan = plan_graph(&prefill_in, &prefill_out)?;
    let mut decode_plan = plan_graph(&decode_in, &decode_out)?;
    let mut cache = CacheAllocator::new(&shape)?;

    let tokenizer = smartmask_text::Tokenizer::from_file(&args.tokenizer)
        .map_err(Error::runtime_failure)?;
    let prompt_tokens = tokenizer
        .encode(&args.prompt, true, true)
        .map_err(Error::runtime_failure)?;
    log::debug!("encoded prompt into {} tokens", prompt_tokens.len());

    let mut runtime = DlRuntime::new();
    runtime.load(&args.backend_so, &args.system_so)?;
    runtime.create_backend_and_device()?;

    let prefill_shard = shards
        .iter()
        .find(|s| s.index == prefill_meta.0)
        .expect("shard index came from this shard list");
    let prefill_bin = fs::read(&prefill_shard.bin_path).map_err(|e| {
        Error::runtime_failure(format!("failed to read {}: {e}", prefill_shard.bin_path.display()))
    })?;
    let prefill_ctx = runtime.create_context_from_binary(&prefill_bin)?;
    let prefill_graph = runtime.retrieve_graph(prefill_ctx, PREFILL_GRAPH_NAME)?;

    let decode_ctx = if decode_meta.0 == prefill_meta.0 {
        prefill_ctx
    } else {
        let decode_shard = shards
            .iter()
            .find(|s| s.index == decode_meta.0)
            .expect("shard index came from this shard list");
        let decode_bin = fs::read(&decode_shard.bin_path).map_err(|e| {
            Error::runtime_failure(format!("failed to read {}: {e}", decode_shard.bin_path.display()))
        })?;
        runtime.create_context_from_binary(&decode_bin)?
    };
    let decode_graph = runtime.retrieve_graph(decode_ctx, DECODE_GRAPH_NAME)?;

    let graphs = Graphs {
        context: prefill_ctx,
        prefill: prefill_graph,
        decode: decode_graph,
    };
    let config = GenerateConfig {
        max_gen: args.max_gen,
    };

    let state = generate(
        &mut runtime,
        &graphs,
        &shape,
        &mut prefill_plan,
        &mut decode_plan,
        &mut cache,
        &prompt_tokens,
        &config,
        || false,
    )?;

    log::debug!(
        "prefill took {:?}, {} decode steps totaling {:?}",
        state.metrics.prefill_duration().unwrap_or_default(),
        state.metrics.steps.len().saturating_sub(1),
        state.metrics.total_decode_duration(),
    );

    let text = tokenizer.decode(&state.tokens).map_err(Error::runtime_failure)?;
    println!("{text}");

    Ok(())
}

fn main() -> ExitCode {
    let args = match args::parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err}", err.kind());
            ExitCode::FAILURE
        }
    }
}
