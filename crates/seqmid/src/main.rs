//! sequence to MIDI converter binary

// SPDX-FileCopyrightText: © 2023 Marcus Rowe <undisbeliever@gmail.com>
//
// SPDX-License-Identifier: MIT

use clap::{Args, Parser, Subcommand};

use engine::byte_source::ByteSource;
use engine::config::ConversionOptions;
use engine::engine::SequenceEngine;
use engine::formats::sqb::SqbDecoder;
use engine::smf::write_midi_file;
use engine::Conversion;

use std::fs;
use std::path::PathBuf;

macro_rules! error {
    ($($arg:tt)*) => {{
        eprintln!($($arg)*);
        std::process::exit(1);
    }};
}

#[derive(Parser)]
#[command(author, version)]
#[command(about = "seqmid sequence to MIDI converter")]
#[command(arg_required_else_help = true)]
struct ArgParser {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a sequence to a Standard MIDI File
    Convert(ConvertArgs),

    /// Dump the labeled item tree as JSON
    Items(ItemsArgs),
}

#[derive(Args)]
struct InputArgs {
    #[arg(value_name = "BIN_FILE", help = "sequence data file")]
    input: PathBuf,

    #[arg(
        long,
        value_name = "JSON_FILE",
        help = "conversion options json file"
    )]
    options: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "forever-loop repeat count")]
    loops: Option<u32>,

    #[arg(long, help = "avoid the General MIDI percussion channel")]
    skip_channel_10: bool,

    #[arg(
        long,
        value_name = "OFFSET",
        default_value = "0",
        help = "file offset of the sequence (display only)"
    )]
    base_offset: u32,
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(short = 'o', long, value_name = "FILE", help = "output midi file")]
    output: PathBuf,

    #[command(flatten)]
    input: InputArgs,
}

#[derive(Args)]
struct ItemsArgs {
    #[command(flatten)]
    input: InputArgs,
}

fn main() {
    let args = ArgParser::parse();

    match args.command {
        Command::Convert(c) => convert_command(c),
        Command::Items(i) => items_command(i),
    }
}

fn load_options(args: &InputArgs) -> ConversionOptions {
    let mut options = match &args.options {
        Some(path) => {
            let contents = match fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => error!("Cannot read {}: {}", path.display(), e),
            };
            match serde_json::from_str(&contents) {
                Ok(o) => o,
                Err(e) => error!("Cannot parse {}: {}", path.display(), e),
            }
        }
        None => ConversionOptions::default(),
    };

    if let Some(loops) = args.loops {
        options.loop_repeat_count = loops;
    }
    if args.skip_channel_10 {
        options.skip_channel_10 = true;
    }

    options
}

fn run_conversion(args: &InputArgs) -> Conversion {
    let options = load_options(args);

    let data = match fs::read(&args.input) {
        Ok(d) => d,
        Err(e) => error!("Cannot read {}: {}", args.input.display(), e),
    };
    if data.len() < options.min_sequence_size as usize {
        error!(
            "{} is too small to be a sequence ({} bytes)",
            args.input.display(),
            data.len()
        );
    }

    let source = ByteSource::new(data, args.base_offset);
    let engine = match SequenceEngine::new(&source, SqbDecoder::new(), &options) {
        Ok(e) => e,
        Err(e) => error!("{}: {}", args.input.display(), e),
    };

    let conversion = engine.convert();
    for f in &conversion.failures {
        eprintln!("warning: {}", f);
    }
    conversion
}

fn convert_command(args: ConvertArgs) {
    let conversion = run_conversion(&args.input);

    let bytes = write_midi_file(&conversion.midi);
    match fs::write(&args.output, bytes) {
        Ok(()) => (),
        Err(why) => error!("Error writing {}: {}", args.output.display(), why),
    }
}

fn items_command(args: ItemsArgs) {
    let conversion = run_conversion(&args.input);

    let tracks: Vec<Vec<serde_json::Value>> = conversion
        .items
        .iter()
        .map(|track| {
            track
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "offset": r.offset,
                        "length": r.length,
                        "label": r.label,
                        "description": r.description,
                        "color": r.color(),
                        "kind": r.kind,
                    })
                })
                .collect()
        })
        .collect();

    let dump = serde_json::json!({
        "name": conversion.name,
        "stop_time": conversion.stop_time.value(),
        "instruments": conversion.instruments_referenced,
        "tracks": tracks,
    });

    match serde_json::to_string_pretty(&dump) {
        Ok(s) => println!("{}", s),
        Err(e) => error!("Cannot serialise items: {}", e),
    }
}
