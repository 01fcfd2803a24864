use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use silicon_traffic::backend::sumo::{SumoBackend, SumoOptions};
use silicon_traffic::simulation::{
    Engine, EngineOptions, MovementClass, StateSnapshot, DEFAULT_HALTING_SPEED,
};

#[derive(Parser)]
#[command(name = "silicon_traffic")]
#[command(about = "Run a SUMO scenario headless through the unified traffic engine")]
struct Cli {
    /// SUMO configuration file (.sumocfg)
    #[arg(long)]
    config: PathBuf,

    /// Number of simulation steps to run
    #[arg(long, default_value = "1000")]
    steps: usize,

    /// Launch sumo-gui instead of sumo
    #[arg(long)]
    gui: bool,

    /// Random seed passed to SUMO
    #[arg(long)]
    seed: Option<u64>,

    /// Step length in seconds (defaults to the scenario's)
    #[arg(long)]
    tick: Option<f64>,

    /// Print a summary every this many steps
    #[arg(long, default_value = "100")]
    summary_every: usize,

    /// Path to the SUMO binary
    #[arg(long)]
    sumo_binary: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut options = EngineOptions::default().with_gui(cli.gui);
    if let Some(seed) = cli.seed {
        options = options.with_seed(seed);
    }
    if let Some(tick) = cli.tick {
        let tick = Duration::try_from_secs_f64(tick).context("Invalid --tick value")?;
        options = options.with_tick_duration(tick);
    }

    let backend = SumoBackend::new(SumoOptions {
        binary: cli.sumo_binary,
        ..SumoOptions::default()
    });
    let mut engine = Engine::new(backend, &cli.config, options);

    let initial = engine.reset().context("Failed to start the SUMO scenario")?;
    let network = engine.network()?;
    println!("Loaded {network}");
    println!(
        "Tick: {:.3}s, running {} steps",
        engine.tick_duration().as_secs_f64(),
        cli.steps
    );
    print_summary(&engine, &initial);

    let every = cli.summary_every.max(1);
    for step in 1..=cli.steps {
        let snapshot = engine
            .step()
            .with_context(|| format!("Simulation failed at step {step}"))?;
        if step % every == 0 || step == cli.steps {
            println!("--- After step {} ({:.1}s simulated time) ---", step, snapshot.time_secs());
            print_summary(&engine, &snapshot);
        }
    }

    engine.terminate();
    info!("Run complete");
    Ok(())
}

fn print_summary(engine: &Engine<SumoBackend>, snapshot: &StateSnapshot) {
    let halted = snapshot
        .vehicles
        .values()
        .filter(|v| v.is_halted(DEFAULT_HALTING_SPEED))
        .count();
    println!(
        "Vehicles: {} ({} halted), signals: {}",
        snapshot.vehicle_count(),
        halted,
        snapshot.traffic_lights.len()
    );

    // Facts need a predecessor snapshot, so the initial summary has none
    if let Ok(facts) = engine.movement_facts() {
        println!(
            "Movements: {} through, {} left, {} right, {} u-turn, {} lane change, {} unclassified",
            facts.count(MovementClass::Through),
            facts.count(MovementClass::Left),
            facts.count(MovementClass::Right),
            facts.count(MovementClass::UTurn),
            facts.count(MovementClass::LaneChange),
            facts.count(MovementClass::Unclassified),
        );
        let contested: usize = facts.conflicts.values().map(|c| c.contested.len()).sum();
        if contested > 0 {
            println!("Contested conflict pairs: {contested}");
        }
    }
}
