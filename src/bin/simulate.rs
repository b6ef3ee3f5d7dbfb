//! Command-line front end for a single in-process protocol run.
//!
//! Spins up `--clients` simulated parties, walks them through the four
//! rounds, optionally dropping clients at configured boundaries, and prints
//! the protocol output next to the plaintext mean of the survivors.
//!
//! ```bash
//! cargo run --bin simulate -- --clients 8 --threshold 4 --drop 1:0 --drop 1:3
//! ```

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use secure_aggregation::driver::Driver;

#[derive(Parser, Debug)]
#[command(
    about = "Simulated secure aggregation run with configurable dropouts",
    author,
    version
)]
struct Cli {
    /// Number of participating clients
    #[arg(long = "clients", default_value_t = 8)]
    clients: usize,

    /// Reconstruction threshold (between 2 and the number of clients)
    #[arg(long = "threshold", default_value_t = 4)]
    threshold: usize,

    /// Explicit client secrets (repeat flag; defaults to random values)
    #[arg(long = "secret")]
    secrets: Vec<f64>,

    /// Master seed for all randomness in the run
    #[arg(long = "seed", default_value_t = 42)]
    seed: u64,

    /// Dropouts as ROUND:INDEX, applied after the given round (repeat flag).
    /// ROUND is 0..=2; e.g. `--drop 1:0` drops client 0 after round 1.
    #[arg(long = "drop", value_parser = parse_drop)]
    drops: Vec<(u8, usize)>,
}

fn parse_drop(value: &str) -> Result<(u8, usize), String> {
    let (round, index) = value
        .split_once(':')
        .ok_or_else(|| format!("expected ROUND:INDEX, got '{}'", value))?;
    let round: u8 = round.parse().map_err(|_| format!("bad round '{}'", round))?;
    if round > 2 {
        return Err(format!("round {} has no later round to drop before", round));
    }
    let index: usize = index.parse().map_err(|_| format!("bad index '{}'", index))?;
    Ok((round, index))
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let secrets = if cli.secrets.is_empty() {
        let mut rng = ChaCha20Rng::seed_from_u64(cli.seed ^ 0x5ec4e7);
        (0..cli.clients)
            .map(|_| rng.gen_range(-1000.0..1000.0))
            .collect()
    } else {
        cli.secrets.clone()
    };

    if let Err(e) = run(&secrets, cli.threshold, cli.seed, &cli.drops) {
        eprintln!("Aggregation run failed: {e}");
        std::process::exit(1);
    }
}

fn run(
    secrets: &[f64],
    threshold: usize,
    seed: u64,
    drops: &[(u8, usize)],
) -> Result<(), secure_aggregation::AggError> {
    for &(_, index) in drops {
        if index >= secrets.len() {
            return Err(secure_aggregation::AggError::InvalidParameter(format!(
                "dropout index {} out of range for {} clients",
                index,
                secrets.len()
            )));
        }
    }

    let mut driver = Driver::new(secrets, threshold, seed)?;

    let rounds: [fn(&mut Driver) -> Result<(), secure_aggregation::AggError>; 3] =
        [Driver::round0, Driver::round1, Driver::round2];
    for (round, step) in rounds.iter().enumerate() {
        step(&mut driver)?;
        for &(after, index) in drops {
            if usize::from(after) == round {
                println!("client #{index} dropped after round {round}");
                driver.put_down(index);
            }
        }
    }
    let mean = driver.round3()?;

    println!("clients:        {}", secrets.len());
    println!("threshold:      {threshold}");
    println!("protocol mean:  {mean:.4}");
    println!("plaintext mean: {:.4}", driver.aggregate_without_secrecy());
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
