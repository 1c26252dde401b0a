//! Command-line driver for offline maximum activation searches.
//!
//! Examples:
//!   maxact-cli run outputs.json batches.jsonl
//!   maxact-cli run outputs.json batches.jsonl --top-n 10 --save search.bin
//!   maxact-cli show search.bin
//!
//! `outputs.json` lists the monitored outputs and, optionally, a config:
//!
//! ```json
//! { "outputs": [ { "name": "fc1", "dims": { "kind": "dense", "units": 4 } } ],
//!   "config": { "top_n": 10 } }
//! ```
//!
//! Each line of `batches.jsonl` maps every output name to a tensor:
//! `{ "fc1": { "shape": [2, 4], "data": [ ... ] } }`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process;

use maxact::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct OutputsFile {
    outputs: Vec<MonitoredOutput>,
    #[serde(default)]
    config: SearchConfig,
}

#[derive(Debug, Deserialize)]
struct TensorJson {
    shape: Vec<usize>,
    data: Vec<f32>,
}

struct RunArgs {
    outputs: String,
    batches: String,
    top_n: Option<usize>,
    save: Option<String>,
}

fn usage() -> ! {
    eprintln!(
        "usage:\n  maxact-cli run <outputs.json> <batches.jsonl> [--top-n N] [--save image.bin]\n  maxact-cli show <image.bin>"
    );
    process::exit(2);
}

fn parse_run_args(args: &[String]) -> Result<RunArgs, String> {
    let mut positional = Vec::new();
    let mut top_n = None;
    let mut save = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--top-n" => {
                let v = args.get(i + 1).ok_or("--top-n needs a value")?;
                top_n = Some(
                    v.parse::<usize>()
                        .map_err(|_| format!("--top-n must be a positive number, got {v}"))?,
                );
                i += 2;
            }
            "--save" => {
                save = Some(args.get(i + 1).ok_or("--save needs a path")?.clone());
                i += 2;
            }
            _ => {
                positional.push(args[i].clone());
                i += 1;
            }
        }
    }
    if positional.len() != 2 {
        return Err("run needs <outputs.json> and <batches.jsonl>".into());
    }
    let batches = positional.pop().unwrap_or_default();
    let outputs = positional.pop().unwrap_or_default();
    Ok(RunArgs {
        outputs,
        batches,
        top_n,
        save,
    })
}

fn run(args: RunArgs) -> Result<(), String> {
    let file = File::open(&args.outputs).map_err(|e| format!("open {}: {e}", args.outputs))?;
    let OutputsFile {
        outputs,
        mut config,
    } = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| format!("parse {}: {e}", args.outputs))?;
    if let Some(top_n) = args.top_n {
        config = config.with_top_n(top_n);
    }

    let mut search =
        MaximumActivationSearch::new(outputs, &(), config).map_err(|e| format!("setup: {e}"))?;
    info!(
        outputs = search.records().len(),
        top_n = search.top_n(),
        "search ready"
    );

    let file = File::open(&args.batches).map_err(|e| format!("open {}: {e}", args.batches))?;
    let mut steps = 0usize;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("read {}: {e}", args.batches))?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: HashMap<String, TensorJson> = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {e}", args.batches, lineno + 1))?;

        let mut tensors = Vec::with_capacity(raw.len());
        for (name, t) in raw {
            let tensor = Tensor::from_vec(&t.shape, t.data)
                .map_err(|e| format!("{}:{}: {name}: {e}", args.batches, lineno + 1))?;
            tensors.push((name, tensor));
        }
        let mut batch = ActivationBatch::new();
        for (name, tensor) in &tensors {
            if search.record(name).is_none() {
                warn!(output = %name, line = lineno + 1, "ignoring unmonitored output");
                continue;
            }
            batch.insert(name, tensor);
        }

        search
            .step(&batch)
            .map_err(|e| format!("{}:{}: {e}", args.batches, lineno + 1))?;
        steps += 1;
    }
    info!(
        steps,
        stream_position = search.stream_position(),
        "stream consumed"
    );

    if let Some(path) = &args.save {
        let file = File::create(path).map_err(|e| format!("create {path}: {e}"))?;
        let mut w = BufWriter::new(file);
        search
            .save_image_to(&mut w)
            .and_then(|_| w.flush())
            .map_err(|e| format!("save {path}: {e}"))?;
        info!(path = %path, "image saved");
    }

    print_snapshot(&search)
}

fn show(path: &str) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("open {path}: {e}"))?;
    let search = MaximumActivationSearch::load_image_from(&mut BufReader::new(file))
        .map_err(|e| format!("load {path}: {e}"))?;
    print_snapshot(&search)
}

fn print_snapshot(search: &MaximumActivationSearch) -> Result<(), String> {
    let json = SearchAdapter::new(search)
        .snapshot()
        .to_json()
        .map_err(|e| format!("serialize: {e}"))?;
    println!("{json}");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let make_error = |msg: &str| -> ! {
        eprintln!("{}", msg);
        process::exit(1);
    };

    let result = match args[0].as_str() {
        "run" => {
            let run_args = parse_run_args(&args[1..]).unwrap_or_else(|e| make_error(&e));
            run(run_args)
        }
        "show" => {
            if args.len() != 2 {
                usage();
            }
            show(&args[1])
        }
        _ => usage(),
    };

    if let Err(e) = result {
        make_error(&e);
    }
}
