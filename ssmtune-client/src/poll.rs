use anyhow::{Context, Result};
use clap::Args;
use log::{info, warn};
use ssmtune_poller_lib::{load_parameters, PollerConfig, PollingWorker, QueryCoalescer, Reading, WorkerEvent};
use ssmtune_protocol_lib::{Protocol, TcpTransport};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How long to block on the event queue before checking the clock
const EVENT_WAIT: Duration = Duration::from_millis(100);

#[derive(Args, Debug)]
pub struct PollArgs {
    /// Parameter definitions (JSON)
    parameters: PathBuf,

    /// Poller config (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to poll for (0 = run forever)
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Interval between stats printouts in seconds
    #[arg(short, long, default_value = "1")]
    interval: f64,

    /// Ask the ECU to stream responses
    #[arg(long)]
    continuous: bool,

    /// Print every reading
    #[arg(short, long)]
    verbose: bool,
}

struct Stats {
    responses: u64,
    errors: u64,
    min_elapsed: Duration,
    max_elapsed: Duration,
    rate_hz: f64,
    interval_responses: u64,
    interval_errors: u64,
    interval_start: Instant,
    last: Vec<Reading>,
}

impl Stats {
    fn new() -> Self {
        Self {
            responses: 0,
            errors: 0,
            min_elapsed: Duration::MAX,
            max_elapsed: Duration::ZERO,
            rate_hz: 0.0,
            interval_responses: 0,
            interval_errors: 0,
            interval_start: Instant::now(),
            last: Vec::new(),
        }
    }

    fn record_success(&mut self, elapsed: Duration, rate_hz: f64, readings: Vec<Reading>) {
        self.responses += 1;
        self.interval_responses += 1;
        // The first response has no predecessor
        if !elapsed.is_zero() {
            self.min_elapsed = self.min_elapsed.min(elapsed);
            self.max_elapsed = self.max_elapsed.max(elapsed);
        }
        self.rate_hz = rate_hz;
        self.last = readings;
    }

    fn record_error(&mut self) {
        self.errors += 1;
        self.interval_errors += 1;
    }

    fn print_interval(&mut self, verbose: bool) {
        if verbose {
            println!(
                "  {:.1} Hz | {} responses | {} errors",
                self.rate_hz, self.interval_responses, self.interval_errors
            );
        } else {
            print!(
                "\r  {:.1} Hz | {} total | {} errors | {}",
                self.rate_hz,
                self.responses,
                self.errors,
                format_readings(&self.last)
            );
            std::io::stdout().flush().ok();
        }

        self.interval_responses = 0;
        self.interval_errors = 0;
        self.interval_start = Instant::now();
    }

    fn print_summary(&self, total_elapsed: Duration) {
        println!("\n\n=== Polling Summary ===");
        println!("Total time:      {:.2}s", total_elapsed.as_secs_f64());
        println!("Total responses: {}", self.responses);
        println!("Total errors:    {}", self.errors);

        if self.responses > 1 {
            println!("Query rate:      {:.1} Hz", self.rate_hz);
            println!("Min interval:    {:.3}ms", self.min_elapsed.as_secs_f64() * 1000.0);
            println!("Max interval:    {:.3}ms", self.max_elapsed.as_secs_f64() * 1000.0);
        }
    }
}

fn format_readings(readings: &[Reading]) -> String {
    readings
        .iter()
        .map(|r| format!("{}={}", r.id, r.value))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn run(address: &str, args: &PollArgs) -> Result<()> {
    let mut config = args
        .config
        .as_deref()
        .map_or_else(PollerConfig::default, PollerConfig::load_or_default);
    config.continuous |= args.continuous;
    config.validate();

    let mut parameters = load_parameters(&args.parameters)
        .with_context(|| format!("loading parameters from {}", args.parameters.display()))?;
    let mut coalescer = QueryCoalescer::new();
    let addresses = coalescer.rebuild(&parameters).context("building query")?;
    let query = coalescer.query(config.continuous).context("building query")?;
    info!(
        "Polling {} parameters over {addresses} addresses",
        parameters.iter().filter(|p| p.enabled).count()
    );

    let transport = TcpTransport::connect(address, config.request_timeout())
        .with_context(|| format!("connecting to {address}"))?;
    let protocol = Protocol::new(transport, config.endpoint, config.request_timeout());
    let handle = PollingWorker::spawn(protocol, config).context("starting poller")?;
    handle.update_query(query);

    println!(
        "Polling{}...\n",
        if args.duration > 0 {
            format!(" for {}s", args.duration)
        } else {
            " (press Ctrl+C to stop)".to_string()
        }
    );

    let mut stats = Stats::new();
    let start = Instant::now();
    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let interval = Duration::from_secs_f64(args.interval.max(0.1));

    loop {
        if duration.is_some_and(|d| start.elapsed() >= d) {
            break;
        }

        match handle.recv_timeout(EVENT_WAIT) {
            Some(WorkerEvent::Init {
                protocol,
                endpoint,
                identifier,
                ..
            }) => println!("Connected to {endpoint} over {protocol}, ROM ID {identifier}"),
            Some(WorkerEvent::QueryResponse { elapsed, rate_hz, raw }) => {
                match coalescer.extract(&raw, &mut parameters) {
                    Ok(readings) => {
                        if args.verbose {
                            println!("{}", format_readings(&readings));
                        }
                        stats.record_success(elapsed, rate_hz, readings);
                    }
                    Err(e) => {
                        warn!("Discarding response: {e}");
                        stats.record_error();
                    }
                }
            }
            Some(WorkerEvent::Exception { error }) => {
                warn!("Poller: {error}");
                stats.record_error();
            }
            None => {}
        }

        if stats.interval_start.elapsed() >= interval {
            stats.print_interval(args.verbose);
        }
    }

    if handle.stop().is_none() {
        warn!("Poller thread did not shut down cleanly");
    }
    stats.print_summary(start.elapsed());
    Ok(())
}
