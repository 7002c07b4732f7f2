//! gdbridge-sim: drives the gdbridge engine against a simulated GDB target.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use gdbridge_core::gdb::mock::{MockGdb, MockLauncher};
use gdbridge_core::{BreakpointLocation, BreakpointRequest, Condition, Engine, EngineConfig, EngineEvent, FrameInfoFlags, PassCount};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};

const STOP_WAIT: Duration = Duration::from_millis(200);
const RUN_WAIT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Executable the simulated GDB loads
    #[arg(long, default_value = "/tmp/app")]
    exe: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cross a breakpoint repeatedly and report which crossings stop
    PassCount {
        /// Source line in file.c
        #[arg(long, default_value_t = 10)]
        line: u32,
        /// none, equal:N, at-least:N or every:N
        #[arg(long, default_value = "none")]
        policy: String,
        /// Number of crossings to simulate
        #[arg(long, default_value_t = 5)]
        crossings: u32,
        /// Simulate a GDB that reports every crossing
        #[arg(long)]
        no_ignore: bool,
    },
    /// Stop only on crossings where `x` changed; values are its successive results
    WhenChanged {
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Break a running target
    BreakAll {
        /// Interrupts the target swallows before stopping
        #[arg(long, default_value_t = 0)]
        dropped: u32,
    },
    /// List threads and the frames of each
    Threads {
        /// Threads in the simulated target
        #[arg(long, default_value_t = 2)]
        count: u32,
    },
}

fn parse_policy(policy: &str) -> Result<PassCount> {
    if policy == "none" {
        return Ok(PassCount::None);
    }
    let (kind, value) = policy
        .split_once(':')
        .with_context(|| format!("Malformed policy '{policy}', expected kind:N"))?;
    let value: u32 = value.parse().with_context(|| format!("Invalid count in '{policy}'"))?;
    match kind {
        "equal" => Ok(PassCount::Equal(value)),
        "at-least" => Ok(PassCount::EqualOrGreater(value)),
        "every" => Ok(PassCount::Modulo(value)),
        other => bail!("Unknown policy '{other}'"),
    }
}

/// Wait for the next stop presented to the IDE.
fn next_stop(rx: &mut broadcast::Receiver<EngineEvent>, wait: Duration) -> Option<EngineEvent> {
    let deadline = Instant::now() + wait;
    loop {
        match rx.try_recv() {
            Ok(event) if event.is_stop() => return Some(event),
            Ok(event) => info!("{event:?}"),
            Err(TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Lagged(missed)) => warn!("Missed {missed} events"),
            Err(TryRecvError::Closed) => return None,
        }
    }
}

struct Simulation {
    engine: Engine,
    gdb: Arc<MockGdb>,
    events: broadcast::Receiver<EngineEvent>,
}

impl Simulation {
    fn new(config: EngineConfig) -> Self {
        let (launcher, gdb) = MockLauncher::new();
        let engine = Engine::new(config, Arc::new(launcher));
        let events = engine.subscribe();
        Self { engine, gdb, events }
    }

    fn launch(&self, exe: &str) -> Result<()> {
        self.engine.launch_suspended(&format!("exe={exe}"))?;
        Ok(())
    }

    /// Cross breakpoint `gdb_id` once and describe what happened.
    fn cross(&mut self, gdb_id: u32) -> Result<String> {
        if !self.gdb.wait_for_running(true, RUN_WAIT) {
            bail!("Target did not resume");
        }
        if !self.gdb.hit_breakpoint(gdb_id, 1) {
            return Ok("skipped by GDB".to_string());
        }
        match next_stop(&mut self.events, STOP_WAIT) {
            Some(EngineEvent::BreakpointHit { hit_count, .. }) => {
                self.engine.continue_execution()?;
                Ok(format!("stopped, hit count {hit_count}"))
            }
            Some(other) => bail!("Unexpected stop {other:?}"),
            None => Ok("resumed by engine".to_string()),
        }
    }

    fn bind(&self, request: BreakpointRequest) -> Result<u32> {
        let pending = self.engine.create_pending_breakpoint(request)?;
        self.engine.resume_process()?;
        let bound = pending.enum_bound_breakpoints().pop().context("Breakpoint was not bound")?;
        bound.gdb_id().context("Bound breakpoint has no GDB id")
    }
}

fn run_pass_count(sim: &mut Simulation, line: u32, policy: PassCount, crossings: u32) -> Result<()> {
    let gdb_id = sim.bind(
        BreakpointRequest::new(BreakpointLocation::file_line("file.c", line)).with_pass_count(policy),
    )?;
    for crossing in 1..=crossings {
        println!("crossing {crossing}: {}", sim.cross(gdb_id)?);
    }
    if let Some(bound) = sim.engine.registry().find_by_gdb_id(gdb_id) {
        println!("hit count: {}", sim.engine.hit_count(&bound)?);
    }
    Ok(())
}

fn run_when_changed(sim: &mut Simulation, values: &[String]) -> Result<()> {
    let values: Vec<&str> = values.iter().map(String::as_str).collect();
    sim.gdb.script_values("x", &values);
    let gdb_id = sim.bind(
        BreakpointRequest::new(BreakpointLocation::file_line("file.c", 20))
            .with_condition(Condition::WhenChanged("x".to_string())),
    )?;
    for (crossing, value) in values.iter().enumerate() {
        println!("crossing {} (x = {value}): {}", crossing + 1, sim.cross(gdb_id)?);
    }
    Ok(())
}

fn run_break_all(sim: &mut Simulation, dropped: u32) -> Result<()> {
    sim.engine.resume_process()?;
    sim.gdb.drop_interrupts(dropped);
    let started = Instant::now();
    sim.engine.cause_break()?;
    let stop = next_stop(&mut sim.events, RUN_WAIT).context("No stop after break")?;
    println!(
        "{stop:?} after {} interrupt(s) in {:?}",
        sim.gdb.count_commands("-exec-interrupt"),
        started.elapsed()
    );
    Ok(())
}

fn run_threads(sim: &Simulation, count: u32) -> Result<()> {
    for id in 2..=count {
        sim.gdb.add_thread(id, &format!("worker-{id}"), "worker.c", id * 10);
    }
    for thread in sim.engine.enum_threads()? {
        let props = thread.properties();
        let marker = if props.current { '*' } else { ' ' };
        println!("{marker} {} {} [{}] {}", props.id, props.name, props.state, props.location.unwrap_or_default());
        for frame in sim.engine.enum_frame_info(props.id, FrameInfoFlags::ALL)?.iter() {
            println!(
                "    #{} 0x{:08x} {}",
                frame.level,
                frame.address.unwrap_or_default(),
                frame.function_name.as_deref().unwrap_or("??")
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    info!("Starting simulation with {config:?}");

    let mut sim = Simulation::new(config);
    sim.launch(&cli.exe)?;

    match cli.command {
        Commands::PassCount { line, policy, crossings, no_ignore } => {
            let policy = parse_policy(&policy)?;
            sim.gdb.set_honor_ignore_counts(!no_ignore);
            run_pass_count(&mut sim, line, policy, crossings)?;
        }
        Commands::WhenChanged { values } => run_when_changed(&mut sim, &values)?,
        Commands::BreakAll { dropped } => run_break_all(&mut sim, dropped)?,
        Commands::Threads { count } => run_threads(&sim, count)?,
    }

    sim.engine.terminate()?;
    Ok(())
}
