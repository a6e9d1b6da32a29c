// joshsim: agent-based ecological simulation engine.
//
// Copyright (C) 2026  The JoshSim Authors
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

use std::env;
use std::fs;
use std::io::{stdout, Write};
use std::process::exit;
use std::sync::Arc;

use joshsim::compiler::compile_source;
use joshsim::error::EngineResult;
use joshsim::export::{CsvExporter, Exporter, JsonLinesExporter, WireWriter};
use joshsim::external::JshcConfig;
use joshsim::scheduler::{run_replicates, Collaborators, RunOptions, Threading};

struct Args {
    script: String,
    simulation: Option<String>,
    config: Option<String>,
    seed: u64,
    replicates: u32,
    parallel: bool,
    format: Format,
}

#[derive(PartialEq)]
enum Format {
    Csv,
    Json,
    Wire,
}

fn usage() -> ! {
    eprintln!(
        "usage: josh <script.josh> [simulation] [--config file.jshc] \
         [--seed N] [--replicates N] [--parallel] [--json | --stream]"
    );
    exit(2);
}

fn parse_args() -> Args {
    let mut args = Args {
        script: String::new(),
        simulation: None,
        config: None,
        seed: 0,
        replicates: 1,
        parallel: false,
        format: Format::Csv,
    };
    let mut positional = Vec::new();
    let mut argv = env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--config" => args.config = Some(argv.next().unwrap_or_else(|| usage())),
            "--seed" => {
                let raw = argv.next().unwrap_or_else(|| usage());
                args.seed = raw.parse().unwrap_or_else(|_| usage());
            }
            "--replicates" => {
                let raw = argv.next().unwrap_or_else(|| usage());
                args.replicates = raw.parse().unwrap_or_else(|_| usage());
            }
            "--parallel" => args.parallel = true,
            "--json" => args.format = Format::Json,
            "--stream" => args.format = Format::Wire,
            "--help" | "-h" => usage(),
            _ => positional.push(arg),
        }
    }
    match positional.len() {
        1 => args.script = positional.remove(0),
        2 => {
            args.script = positional.remove(0);
            args.simulation = Some(positional.remove(0));
        }
        _ => usage(),
    }
    args
}

fn run(args: &Args) -> EngineResult<()> {
    let source = fs::read_to_string(&args.script)?;
    let program = compile_source(&source)?;

    let simulation = match &args.simulation {
        Some(name) => name.clone(),
        None => match program.simulations.first() {
            Some(name) => name.clone(),
            None => {
                return Err(joshsim::error::JoshError::UnknownAttribute(
                    "no simulation stanza in script".to_string(),
                ))
            }
        },
    };

    let mut collaborators = Collaborators::default();
    if let Some(path) = &args.config {
        let text = fs::read_to_string(path)?;
        collaborators.config = Arc::new(JshcConfig::parse(&text)?);
    }

    let options = RunOptions {
        seed: args.seed,
        replicate: 0,
        threading: if args.parallel {
            Threading::Parallel
        } else {
            Threading::Single
        },
        ..RunOptions::default()
    };

    let out = stdout();
    let mut exporter: Box<dyn Exporter> = match args.format {
        Format::Csv => Box::new(CsvExporter::new(out.lock())),
        Format::Json => Box::new(JsonLinesExporter::new(out.lock())),
        Format::Wire => Box::new(WireWriter::new(out.lock())),
    };
    run_replicates(
        &program,
        &simulation,
        collaborators,
        options,
        args.replicates,
        exporter.as_mut(),
    )?;

    if args.format == Format::Wire {
        let mut wire = WireWriter::new(out.lock());
        for replicate in 0..args.replicates.max(1) {
            wire.end(replicate)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = parse_args();
    if let Err(error) = run(&args) {
        if args.format == Format::Wire {
            let mut wire = WireWriter::new(stdout().lock());
            let _ = wire.error(&error.to_string());
        }
        eprintln!("josh: {}", error);
        let _ = stdout().flush();
        exit(1);
    }
}
