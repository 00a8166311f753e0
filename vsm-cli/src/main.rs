use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use vsm_core::capture::{read_capture, CaptureRecord, CaptureWriter};
use vsm_core::compiler;
use vsm_core::engine::PolicyEngine;
use vsm_core::events::OutputEvent;
use vsm_core::sched::RateTransform;
use vsm_core::signals::SignalMap;
use vsm_core::types::{SignalId, Timestamp, Value};
use vsm_core::wire::{self, Input};

/// Rule-driven vehicle signal manager: reads `name = value` updates,
/// evaluates the rule set, and emits derived signals.
#[derive(Parser, Debug)]
#[command(name = "vsm", version, about)]
struct Args {
    /// Rule configuration file (YAML).
    #[arg(long, short = 'r')]
    rules: PathBuf,

    /// Signal-number mapping file (`name id` lines).
    #[arg(long)]
    signals: Option<PathBuf>,

    /// Record the signal stream to this capture log (CSV).
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Replay a capture log instead of reading stdin.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Replay rate percentage: 100 = real time, 50 = half speed.
    #[arg(long, default_value_t = 100.0)]
    replay_rate: f64,

    /// Echo received inputs to stdout with a `>` prefix.
    #[arg(long)]
    echo: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let rate = RateTransform::new(args.replay_rate)
        .ok_or_else(|| anyhow!("replay rate must be in (0, 10000], got {}", args.replay_rate))?;

    let map = match &args.signals {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading signal map {}", path.display()))?;
            Some(
                SignalMap::parse(&text)
                    .with_context(|| format!("loading signal map {}", path.display()))?,
            )
        }
        None => None,
    };

    let rules_text = fs::read_to_string(&args.rules)
        .with_context(|| format!("reading rules {}", args.rules.display()))?;
    let program = compiler::compile(&rules_text, map.as_ref())
        .with_context(|| format!("loading rules {}", args.rules.display()))?;

    tracing::info!(
        rules = %args.rules.display(),
        version = %hex(&program.version),
        nodes = program.nodes.len(),
        "rules compiled"
    );

    let capture = match &args.capture {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("creating capture log {}", path.display()))?;
            Some(CaptureWriter::new(file))
        }
        None => None,
    };

    let mut driver = Driver {
        engine: PolicyEngine::new(program, map),
        capture,
        echo: args.echo,
        rate,
        start: Instant::now(),
    };

    let startup = driver.engine.start(0);
    driver.dispatch(startup);

    match &args.replay {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading capture log {}", path.display()))?;
            let records = read_capture(&text)
                .with_context(|| format!("loading capture log {}", path.display()))?;
            tracing::info!(events = records.len(), rate = rate.percent(), "replaying");
            run_replay(&mut driver, records).await
        }
        None => run_interactive(&mut driver).await,
    }?;

    if let Some(capture) = driver.capture.as_mut() {
        capture.flush().context("flushing capture log")?;
    }
    Ok(())
}

// ─── Driver ───────────────────────────────────────────────────

/// Single-threaded driver: the sole mutator of the engine. Blocks on the
/// earlier of the next input and the next timer deadline; logical time is
/// wall time through the rate transform.
struct Driver {
    engine: PolicyEngine,
    capture: Option<CaptureWriter<fs::File>>,
    echo: bool,
    rate: RateTransform,
    start: Instant,
}

impl Driver {
    fn now(&self) -> Timestamp {
        self.rate.to_logical(self.start.elapsed().as_millis() as u64)
    }

    fn wall_instant(&self, at: Timestamp) -> Instant {
        self.start + Duration::from_millis(self.rate.to_wall(at))
    }

    /// Parse, translate, and feed one input line. Transport errors are
    /// logged and the event dropped.
    fn handle_line(&mut self, line: &str) {
        let input = match wire::parse_input_line(line) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(error = %e, "input dropped");
                return;
            }
        };
        let (name, id, value) = match input {
            Input::Named { name, value } => {
                let id = self.engine.signal_map().and_then(|m| m.id_of(&name));
                (name, id, value)
            }
            Input::Numbered { id, value } => {
                match self.engine.signal_map().and_then(|m| m.name_of(id)) {
                    Some(name) => (name.to_string(), Some(id), value),
                    None => {
                        tracing::warn!(id, "unknown signal id, dropped");
                        return;
                    }
                }
            }
        };
        let now = self.now();
        self.feed(&name, id, value, now);
    }

    fn feed(&mut self, name: &str, id: Option<SignalId>, value: Value, now: Timestamp) {
        if self.echo {
            println!("{}", wire::format_echo(now, name, id, &value));
        }
        self.record(now, name, id, &value);
        let events = self.engine.inject(name, value, now);
        self.dispatch(events);
    }

    fn dispatch(&mut self, events: Vec<OutputEvent>) {
        for event in events {
            match event {
                OutputEvent::Emission(e) => {
                    println!("{}", wire::format_emission(&e));
                    self.record(e.at, &e.name, e.id, &e.value);
                }
                OutputEvent::Violation(v) => {
                    tracing::warn!(wall = %chrono::Utc::now().to_rfc3339(), "{}", v);
                }
            }
        }
        let _ = std::io::stdout().flush();
    }

    fn record(&mut self, at: Timestamp, name: &str, id: Option<SignalId>, value: &Value) {
        if let Some(capture) = self.capture.as_mut() {
            let rec = CaptureRecord {
                at,
                name: name.to_string(),
                id,
                value: value.clone(),
            };
            if let Err(e) = capture.record(&rec) {
                tracing::warn!(error = %e, "capture write failed");
            }
        }
    }
}

// ─── Interactive mode ─────────────────────────────────────────

async fn run_interactive(driver: &mut Driver) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let next = driver.engine.next_deadline();
        let deadline_wall = next.map(|at| driver.wall_instant(at));

        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            driver.handle_line(line.trim());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin error");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline_wall.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if deadline_wall.is_some() => {
                let now = next.unwrap_or_default();
                let events = driver.engine.advance(now);
                driver.dispatch(events);
            }
        }
    }

    // EOF: run out the pending timers (delayed emissions, monitors).
    while let Some(at) = driver.engine.next_deadline() {
        tokio::time::sleep_until(driver.wall_instant(at)).await;
        let events = driver.engine.advance(at);
        driver.dispatch(events);
    }
    Ok(())
}

// ─── Replay mode ──────────────────────────────────────────────

async fn run_replay(driver: &mut Driver, records: Vec<CaptureRecord>) -> Result<()> {
    let mut queue = records.into_iter().peekable();

    loop {
        let next_timer = driver.engine.next_deadline();
        let next_event = queue.peek().map(|r| r.at);
        let wake = match (next_timer, next_event) {
            (None, None) => break,
            (Some(t), None) => t,
            (None, Some(e)) => e,
            (Some(t), Some(e)) => t.min(e),
        };

        tokio::time::sleep_until(driver.wall_instant(wake)).await;

        // Input-driven transitions before timer-driven ones in a tick.
        while queue.peek().map_or(false, |r| r.at <= wake) {
            let CaptureRecord { at, name, id, value } = queue.next().unwrap();
            driver.feed(&name, id, value, at);
        }
        let events = driver.engine.advance(wake);
        driver.dispatch(events);
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_driver(rate: f64) -> Driver {
        Driver {
            engine: PolicyEngine::new(compiler::compile("[]", None).unwrap(), None),
            capture: None,
            echo: false,
            rate: RateTransform::new(rate).unwrap(),
            start: Instant::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn logical_clock_follows_rate_transform() {
        let driver = test_driver(50.0);
        assert_eq!(driver.now(), 0);
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(driver.now(), 1000);
        assert_eq!(
            driver.wall_instant(1000),
            driver.start + Duration::from_millis(2000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn real_time_rate_is_identity() {
        let driver = test_driver(100.0);
        tokio::time::advance(Duration::from_millis(750)).await;
        assert_eq!(driver.now(), 750);
        assert_eq!(
            driver.wall_instant(750),
            driver.start + Duration::from_millis(750)
        );
    }
}
