use chdmap::bench::{self, BenchError, KeyCorpus};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Time lookups of every key of a corpus against a chdmap file.
#[derive(Parser)]
#[command(author, version, about, arg_required_else_help = true)]
struct Args {
    /// Path to the chdmap binary file
    #[arg(value_name = "MAP")]
    map: PathBuf,

    /// Path to the key file, one key per line
    #[arg(value_name = "KEYS")]
    keys: PathBuf,

    /// Number of keys to read from the key file; defaults to all of them
    #[arg(short = 'n', long = "keys", value_name = "N")]
    key_count: Option<usize>,

    /// Number of timed passes over the keys
    #[arg(short, long, value_name = "T", default_value_t = 10)]
    trials: usize,

    /// Print a JSON summary instead of the per-trial report
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), BenchError> {
    let map = bench::open_map(&args.map)?;
    info!(
        keys = map.len(),
        bits_per_key = map.bits_per_key(),
        "Loaded {}",
        args.map.display()
    );

    let corpus = KeyCorpus::read(&args.keys, args.key_count)?;
    info!(keys = corpus.len(), "Read {}", args.keys.display());

    let report = bench::run_trials_with(&map, &corpus, args.trials, |_, stats| {
        if !args.json {
            println!("{stats}");
        }
    });
    info!(checksum = report.checksum, "Finished {} trials", args.trials);

    if args.json {
        let json = serde_json::to_string_pretty(&report.summary())
            .map_err(|e| std::io::Error::other(format!("Failed to format JSON: {e}")))?;
        println!("{json}");
    } else {
        println!("\n{}", report.average_line());
    }
    Ok(())
}
