// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! `mind-xcall`: inspect the bridge from the command line.

use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;

use mind_xcall::ffi::header::generate_header;
use mind_xcall::handler::{NativeLibrary, Signature};
use mind_xcall::partition::ShardingRule;
use mind_xcall::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "mind-xcall", version, about = "MIND foreign-call bridge tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the C header for native handler authors.
    Header,
    /// Print the effective bridge configuration as TOML.
    Config {
        /// Read this file instead of `MIND_XCALL_CONFIG`.
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Parse a sharding rule and check it against shapes.
    Rule {
        /// Rule text, e.g. "i k, k j -> i j".
        rule: String,
        /// Operand shape such as `4x8`; `-` is a scalar. Repeat per operand.
        #[arg(long = "operand", value_name = "SHAPE")]
        operands: Vec<String>,
        /// Result shape; repeat per result.
        #[arg(long = "result", value_name = "SHAPE")]
        results: Vec<String>,
        /// Size of a factor that only appears inside a compound, `name=size`.
        #[arg(long = "size", value_name = "NAME=SIZE")]
        sizes: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Load a shared library and register one exported handler.
    Load {
        #[arg(value_name = "LIBRARY")]
        library: PathBuf,
        /// Exported symbol.
        #[arg(long)]
        symbol: String,
        /// Target name; defaults to the symbol.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "host")]
        platform: String,
        /// The symbol takes a stream as its first argument.
        #[arg(long)]
        stream: bool,
    },
    /// Register a negation handler and run it once.
    Selftest,
}

fn main() {
    mind_xcall::logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli.command) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Header => print!("{}", generate_header()),
        Command::Config { file } => {
            let config = match file {
                Some(path) => BridgeConfig::load(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => BridgeConfig::from_env()?,
            };
            print!("{}", config.to_toml()?);
        }
        Command::Rule {
            rule,
            operands,
            results,
            sizes,
            json,
        } => rule_command(&rule, &operands, &results, &sizes, json)?,
        Command::Load {
            library,
            symbol,
            name,
            platform,
            stream,
        } => {
            let signature = if stream {
                Signature::Stream
            } else {
                Signature::Host
            };
            let capsule = unsafe {
                let lib = NativeLibrary::load(&library)?;
                lib.capsule(&symbol, signature, API_VERSION)?
            };
            let name = name.unwrap_or(symbol);
            Registry::global().register(&name, platform.as_str(), capsule)?;
            for (target, platform) in Registry::global().targets() {
                println!("{target}\t{platform}");
            }
        }
        Command::Selftest => selftest()?,
    }
    Ok(())
}

fn parse_shape(text: &str) -> anyhow::Result<Vec<usize>> {
    if text == "-" {
        return Ok(Vec::new());
    }
    text.split('x')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("bad dimension '{d}' in shape '{text}'"))
        })
        .collect()
}

fn parse_size(text: &str) -> anyhow::Result<(String, usize)> {
    let Some((name, size)) = text.split_once('=') else {
        bail!("expected NAME=SIZE, got '{text}'");
    };
    let size = size
        .parse()
        .map_err(|_| anyhow!("bad size '{size}' for factor '{name}'"))?;
    Ok((name.to_string(), size))
}

fn rule_command(
    src: &str,
    operands: &[String],
    results: &[String],
    sizes: &[String],
    as_json: bool,
) -> anyhow::Result<()> {
    let sizes = sizes
        .iter()
        .map(|s| parse_size(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let rule = ShardingRule::with_sizes(src, sizes)?;
    if operands.is_empty() && results.is_empty() {
        println!("{rule}");
        return Ok(());
    }
    let operand_shapes = operands
        .iter()
        .map(|s| parse_shape(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let result_shapes = results
        .iter()
        .map(|s| parse_shape(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mapping = rule.check_shapes(&operand_shapes, &result_shapes)?;

    let factors: Vec<_> = mapping
        .factors()
        .iter()
        .enumerate()
        .map(|(i, name)| {
            json!({
                "name": name,
                "size": mapping.size(name),
                "reduction": mapping.is_reduction(i),
            })
        })
        .collect();
    if as_json {
        let report = json!({
            "rule": rule.to_string(),
            "factors": factors,
            "operands": (0..operand_shapes.len()).map(|i| mapping.operand(i)).collect::<Vec<_>>(),
            "results": (0..result_shapes.len()).map(|i| mapping.result(i)).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{rule}");
        for (i, name) in mapping.factors().iter().enumerate() {
            let size = mapping
                .size(name)
                .map_or_else(|| "?".to_string(), |s| s.to_string());
            let kind = if mapping.is_reduction(i) {
                " (reduction)"
            } else {
                ""
            };
            println!("  {name} = {size}{kind}");
        }
    }
    Ok(())
}

fn selftest() -> anyhow::Result<()> {
    let registry = Registry::new();
    registry.register(
        "selftest_neg",
        "host",
        Capsule::from_fn(|frame| {
            let (inputs, results) = frame.io_mut();
            let x = inputs[0].typed::<f32>()?;
            for (o, v) in results[0].typed_mut::<f32>()?.iter_mut().zip(x) {
                *o = -v;
            }
            Ok(())
        })
        .with_binding(Binding::new().arg(DType::F32).ret(DType::F32)),
    )?;
    let site = CallSite::builder("selftest_neg", vec![ShapeDType::new(DType::F32, &[4])])
        .registry(&registry)
        .build()?;
    let x = HostArray::from_vec(vec![1.0f32, -2.0, 3.0, 0.0]);
    let out = site.call(&[&x], Attributes::new())?;
    let got = out[0].to_vec::<f32>()?;
    if got != [-1.0, 2.0, -3.0, -0.0] {
        bail!("negation returned {got:?}");
    }
    println!("ok: selftest_neg {:?} -> {got:?}", x.to_vec::<f32>()?);
    Ok(())
}
