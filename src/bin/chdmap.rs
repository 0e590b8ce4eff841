use chdmap::bench::KeyCorpus;
use chdmap::{ChdMap, ChdMapBuilder};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Info(args) => run_info(args),
        Command::Build(args) => run_build(args),
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "chdmap utility for creating and inspecting chdmap files",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect a chdmap file and print basic information
    Info(InfoArgs),
    /// Build a chdmap file from a newline-separated key file
    Build(BuildArgs),
}

#[derive(clap::Args)]
struct InfoArgs {
    /// Path to the chdmap binary file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Optional key to look up in the chdmap
    #[arg(short, long)]
    key: Option<String>,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Path to the key file, one key per line
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Path to the chdmap binary file to produce
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Optional file with one decimal value per key; defaults to key ordinals
    #[arg(long, value_name = "FILE")]
    values: Option<PathBuf>,

    /// Optional override for the hash seed
    #[arg(long, value_name = "SEED", default_value_t = 0)]
    hash_seed: u64,

    /// Average number of keys per bucket
    #[arg(long, value_name = "LAMBDA", default_value_t = 5)]
    lambda: u32,

    /// Ratio of keys to slots, in (0, 1]
    #[arg(long, value_name = "RATIO", default_value_t = 1.0)]
    load_factor: f64,

    /// Bits of key signature stored to reject absent keys
    #[arg(long, value_name = "BITS", default_value_t = 0)]
    signature_width: u32,

    /// Logarithm of the target number of keys per chunk
    #[arg(long, value_name = "LOG2", default_value_t = 16)]
    log2_chunk_size: u32,

    /// Optional override for writer buffer size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 16 << 20)]
    buffer_size: usize,
}

fn run_info(args: InfoArgs) -> Result<()> {
    let file = File::open(&args.input)?;
    let map = ChdMap::open(&file)?;

    let json = serde_json::to_string_pretty(&map.info())
        .map_err(|e| Error::other(format!("Failed to format JSON: {e}")))?;
    println!("{}", json);

    if let Some(key) = args.key {
        println!(
            "{}: query = {}, get = {:?}",
            key,
            map.query(key.as_bytes()),
            map.get(key.as_bytes())
        );
    }

    Ok(())
}

fn run_build(args: BuildArgs) -> Result<()> {
    let corpus = KeyCorpus::read(&args.input, None).map_err(Error::other)?;
    let values = match &args.values {
        Some(path) => load_values(path, corpus.len())?,
        None => (0..corpus.len() as u64).collect(),
    };
    let writer = File::create(&args.output)?;

    let info = ChdMapBuilder::default()
        .with_hash_seed(args.hash_seed)
        .with_lambda(args.lambda)
        .with_load_factor(args.load_factor)
        .with_signature_width(args.signature_width)
        .with_log2_chunk_size(args.log2_chunk_size)
        .with_writer_buffer_size(args.buffer_size)
        .build(&writer, corpus.iter().zip(values))?;

    let json = serde_json::to_string_pretty(&info)
        .map_err(|e| Error::other(format!("Failed to format JSON: {e}")))?;
    println!("{}", json);

    Ok(())
}

fn load_values(path: &Path, expected: usize) -> Result<Vec<u64>> {
    let text = std::fs::read_to_string(path)?;
    // Records are split exactly like the key file: on runs of LF and CR.
    let values = text
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| {
            line.parse::<u64>().map_err(|e| {
                invalid_input(format!("value {index} ({line:?}) is not a u64: {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() != expected {
        return Err(invalid_input(format!(
            "{} values for {} keys",
            values.len(),
            expected
        )));
    }
    Ok(values)
}

fn invalid_input(message: String) -> Error {
    Error::new(ErrorKind::InvalidInput, message)
}
