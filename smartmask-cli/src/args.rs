//! CLI argument parsing.

use std::path::PathBuf;

/// Parsed command-line arguments for the `smartmask` binary.
pub struct Args {
    pub ctx_dir: PathBuf,
    pub tokenizer: PathBuf,
    pub prompt: String,
    pub max_gen: usize,
    pub backend_so: PathBuf,
    pub system_so: PathBuf,
    pub log_level: u8,
    pub num_layers: usize,
}

fn usage(bin_name: &str) -> String {
    format!(
        "Drive a precompiled prefill/decode accelerator graph pair.

Usage: {bin_name} --ctx_dir DIR --tokenizer PATH --prompt STR \\
    --backend_so PATH --system_so PATH [--max_gen N] [--log_level 0..5] [--num-layers N]

Options:
  --ctx_dir DIR       directory of forward_<i>.bin / forward_<i>_json.json shard pairs
  --tokenizer PATH    tokenizer.json path
  --prompt STR        prompt text to generate from
  --max_gen N         maximum number of tokens to generate (default 100)
  --backend_so PATH   accelerator backend shared library
  --system_so PATH    accelerator system shared library
  --log_level N       0 (silent) through 5 (trace), default 3
  --num-layers N      number of transformer layers, needed to split the K/V
                      cache slot count into (layer, head) pairs (default 16)
  --help              print this message"
    )
}

pub fn parse() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut ctx_dir = None;
    let mut tokenizer = None;
    let mut prompt = None;
    let mut max_gen = 100usize;
    let mut backend_so = None;
    let mut system_so = None;
    let mut log_level = 3u8;
    let mut num_layers = 16usize;

    let mut parser = lexopt::Parser::from_env();
    let bin_name = parser.bin_name().unwrap_or("smartmask").to_string();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("ctx_dir") => ctx_dir = Some(PathBuf::from(parser.value()?)),
            Long("tokenizer") => tokenizer = Some(PathBuf::from(parser.value()?)),
            Long("prompt") => prompt = Some(parser.value()?.string()?),
            Long("max_gen") => max_gen = parser.value()?.parse()?,
            Long("backend_so") => backend_so = Some(PathBuf::from(parser.value()?)),
            Long("system_so") => system_so = Some(PathBuf::from(parser.value()?)),
            Long("log_level") => log_level = parser.value()?.parse()?,
            Long("num-layers") => num_layers = parser.value()?.parse()?,
            Long("help") => {
                println!("{}", usage(&bin_name));
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    Ok(Args {
        ctx_dir: ctx_dir.ok_or("missing required --ctx_dir")?,
        tokenizer: tokenizer.ok_or("missing required --tokenizer")?,
        prompt: prompt.ok_or("missing required --prompt")?,
        max_gen,
        backend_so: backend_so.ok_or("missing required --backend_so")?,
        system_so: system_so.ok_or("missing required --system_so")?,
        log_level,
        num_layers,
    })
}
