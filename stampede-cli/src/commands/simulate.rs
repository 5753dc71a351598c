//! Simulate command - fires a thundering herd at a coalescer.
//!
//! Each round releases `callers x keys` concurrent requests at once against a
//! slow factory, then reports how many factory runs actually happened.

use crate::error::CliError;
use clap::Args;
use stampede::{CoalesceError, CoalescerConfig, CoalescerStats, RequestCoalescer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tracing::info;

/// Arguments for the simulate command.
#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Concurrent callers per key in each round
    #[arg(long, default_value = "50")]
    pub callers: usize,

    /// Number of distinct keys requested in each round
    #[arg(long, default_value = "1")]
    pub keys: usize,

    /// Number of sequential rounds
    #[arg(long, default_value = "1")]
    pub rounds: usize,

    /// Simulated backend latency per factory run
    #[arg(long, default_value = "100")]
    pub latency_ms: u64,

    /// Make every factory run fail
    #[arg(long)]
    pub fail: bool,

    /// Factory timeout (disabled when not set)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl SimulateArgs {
    fn validate(&self) -> Result<(), CliError> {
        if self.callers == 0 {
            return Err(CliError::InvalidArgs("--callers must be at least 1".into()));
        }
        if self.keys == 0 {
            return Err(CliError::InvalidArgs("--keys must be at least 1".into()));
        }
        if self.rounds == 0 {
            return Err(CliError::InvalidArgs("--rounds must be at least 1".into()));
        }
        Ok(())
    }

    fn config(&self) -> CoalescerConfig {
        match self.timeout_ms {
            Some(ms) => CoalescerConfig::new().with_factory_timeout(Duration::from_millis(ms)),
            None => CoalescerConfig::new(),
        }
    }
}

/// Error produced by the simulated backend.
#[derive(Debug, thiserror::Error)]
#[error("simulated backend failure for {key}")]
pub struct SimError {
    key: String,
}

/// Outcome of a simulation.
#[derive(Debug)]
pub struct SimulationReport {
    /// Requests issued across all rounds
    pub requests: u64,
    /// Factory bodies that actually executed
    pub factory_runs: u64,
    /// Requests that resolved to a value
    pub successes: u64,
    /// Requests that resolved to a factory error
    pub failures: u64,
    /// Requests that resolved to a timeout or cancellation
    pub aborted: u64,
    /// Coalescer statistics at the end of the run
    pub stats: CoalescerStats,
    /// Wall-clock duration of the whole run
    pub elapsed: Duration,
}

impl SimulationReport {
    /// Factory runs beyond the computations that were actually claimed.
    ///
    /// A caller arriving after a computation settled claims a new one, so the
    /// run count alone may exceed `keys * rounds` without any duplicate work.
    pub fn excess_runs(&self) -> u64 {
        self.factory_runs.saturating_sub(self.stats.new_requests)
    }
}

/// Runs the simulation described by `args`.
pub async fn run_simulation(args: &SimulateArgs) -> SimulationReport {
    let coalescer: RequestCoalescer<String, u64, SimError> =
        RequestCoalescer::with_config(args.config());
    let factory_runs = Arc::new(AtomicU64::new(0));
    let latency = Duration::from_millis(args.latency_ms);
    let started = Instant::now();

    let (mut successes, mut failures, mut aborted) = (0u64, 0u64, 0u64);

    for round in 0..args.rounds {
        let barrier = Arc::new(Barrier::new(args.callers * args.keys));
        let mut handles = Vec::with_capacity(args.callers * args.keys);

        for key_index in 0..args.keys {
            for _ in 0..args.callers {
                let coalescer = coalescer.clone();
                let barrier = Arc::clone(&barrier);
                let runs = Arc::clone(&factory_runs);
                let fail = args.fail;
                let key = format!("key:{}", key_index);

                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    let factory_key = key.clone();
                    coalescer
                        .get_or_run(key, move || async move {
                            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
                            tokio::time::sleep(latency).await;
                            if fail {
                                Err(SimError { key: factory_key })
                            } else {
                                Ok(run)
                            }
                        })
                        .await
                }));
            }
        }

        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok(Ok(_)) => successes += 1,
                Ok(Err(CoalesceError::Factory(_))) => failures += 1,
                Ok(Err(_)) | Err(_) => aborted += 1,
            }
        }

        info!(
            round = round + 1,
            factory_runs = factory_runs.load(Ordering::SeqCst),
            "Simulation round complete"
        );
    }

    coalescer.log_stats();

    SimulationReport {
        requests: (args.callers * args.keys * args.rounds) as u64,
        factory_runs: factory_runs.load(Ordering::SeqCst),
        successes,
        failures,
        aborted,
        stats: coalescer.stats(),
        elapsed: started.elapsed(),
    }
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> Result<(), CliError> {
    args.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    info!(
        callers = args.callers,
        keys = args.keys,
        rounds = args.rounds,
        latency_ms = args.latency_ms,
        fail = args.fail,
        "Starting stampede simulation"
    );

    let report = runtime.block_on(run_simulation(&args));
    print_report(&report);

    if report.excess_runs() > 0 {
        return Err(CliError::DuplicateWork {
            expected: report.stats.new_requests,
            actual: report.factory_runs,
        });
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("Stampede simulation");
    println!("  Requests:        {}", report.requests);
    println!("  Factory runs:    {}", report.factory_runs);
    println!("  Successes:       {}", report.successes);
    println!("  Failures:        {}", report.failures);
    println!("  Timed out/cancelled: {}", report.aborted);
    println!(
        "  Coalesced:       {} ({:.1}%)",
        report.stats.coalesced_requests,
        report.stats.coalescing_ratio() * 100.0
    );
    println!("  Elapsed:         {:.2?}", report.elapsed);
}
