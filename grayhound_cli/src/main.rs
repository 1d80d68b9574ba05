use grayhound_core::config::GrayhoundConfig;
use grayhound_core::fuzzer::{FuzzReport, Fuzzer};
use grayhound_core::trace_point;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Built-in target to fuzz.
    #[clap(short, long, value_enum, default_value_t = Target::Xz)]
    target: Target,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    duration_secs: Option<u64>,
    /// RNG seed of the run.
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Show the default panic message of every panicking execution.
    #[clap(long)]
    show_panics: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    /// Fails on any `x` directly followed by `z`.
    Xz,
    /// Panics once parentheses nest five deep.
    Parens,
    /// Fails on the prefix `fuzz`.
    Keyword,
}

type Harness = fn(&str) -> Result<(), String>;

impl Target {
    fn harness(self) -> Harness {
        match self {
            Target::Xz => xz_harness,
            Target::Parens => parens_harness,
            Target::Keyword => keyword_harness,
        }
    }

    fn default_seed(self) -> &'static str {
        match self {
            Target::Xz => "ab",
            Target::Parens => "()",
            Target::Keyword => "hello",
        }
    }
}

fn xz_harness(input: &str) -> Result<(), String> {
    trace_point!();
    let mut previous = None;
    for c in input.chars() {
        match (previous, c) {
            (Some('x'), 'z') => {
                trace_point!();
                return Err(format!("found xz at char {}", input.find("xz").unwrap_or(0)));
            }
            (_, 'x') => trace_point!(),
            (_, c) if c.is_ascii_lowercase() => trace_point!(),
            _ => trace_point!(),
        }
        previous = Some(c);
    }
    Ok(())
}

fn parens_harness(input: &str) -> Result<(), String> {
    let mut depth = 0usize;
    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                match depth {
                    1 => trace_point!("open-1"),
                    2 => trace_point!("open-2"),
                    3 => trace_point!("open-3"),
                    4 => trace_point!("open-4"),
                    _ => panic!("nesting depth {depth} exceeded"),
                }
            }
            ')' if depth == 0 => {
                trace_point!("unbalanced");
                return Err("unbalanced ')'".to_string());
            }
            ')' => {
                trace_point!("close");
                depth -= 1;
            }
            _ => trace_point!("text"),
        }
    }
    Ok(())
}

fn keyword_harness(input: &str) -> Result<(), String> {
    let mut chars = input.chars();
    trace_point!();
    if chars.next() == Some('f') {
        trace_point!();
        if chars.next() == Some('u') {
            trace_point!();
            if chars.next() == Some('z') {
                trace_point!();
                if chars.next() == Some('z') {
                    return Err("reached fuzz".to_string());
                }
            }
        }
    }
    trace_point!();
    Ok(())
}

fn print_report(report: &FuzzReport) {
    let stats = &report.stats;
    println!("Fuzz loop finished in {:.2?}.", stats.elapsed);
    println!(
        "Iterations: {}, Executions: {}, Mutations: {}",
        stats.iterations, stats.executions, stats.mutations_applied
    );
    println!(
        "Population: {}, Distinct signatures: {}, Covered grams: {}",
        stats.population, stats.distinct_signatures, stats.covered_grams
    );
    println!(
        "Failures: {} ({} unique)",
        stats.failures, stats.unique_failures
    );
    for failure in &report.failures {
        println!("\n!!! FAILURE (path {}) !!!", failure.path_id);
        println!("  Input: {:?}", failure.input);
        println!("  Failure: {}", failure.failure);
        println!("  Hash: {}", failure.input_hash);
        match failure.iteration {
            Some(iteration) => println!("  Iteration: {iteration}"),
            None => println!("  Iteration: initial corpus"),
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            log::info!("Loading configuration from specified path: {config_path:?}");
            GrayhoundConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("grayhound.toml");
            if default_config_path.exists() {
                log::info!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                GrayhoundConfig::load_from_file(&default_config_path)?
            } else {
                log::info!(
                    "No config file specified and default 'grayhound.toml' not found, using built-in defaults."
                );
                GrayhoundConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if let Some(secs) = cli.duration_secs {
        config.fuzzer.max_duration_ms = Some(secs.saturating_mul(1000));
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.rng_seed = seed;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.executor.timeout_ms = Some(timeout_ms);
    }
    if config.corpus.seeds.is_empty() && config.corpus.initial_seed_paths.is_none() {
        log::info!(
            "No seeds configured, starting from {:?}",
            cli.target.default_seed()
        );
        config.corpus.seeds.push(cli.target.default_seed().to_string());
    }
    config.validate()?;
    log::debug!("Effective configuration: {config:#?}");

    if !cli.show_panics {
        std::panic::set_hook(Box::new(|_| {}));
    }

    let executor = config.build_executor(cli.target.harness())?;
    let mut fuzzer = Fuzzer::from_config(&config, executor)?;
    let report = fuzzer.run(config.budget())?;

    print_report(&report);
    Ok(())
}
