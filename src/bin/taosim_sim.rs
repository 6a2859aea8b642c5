//! CLI entry point (§6): `--config-file` XOR `--checkpoint-file`. Exit
//! 0 on a clean run, non-zero on any error (scheduler misrouting,
//! config parse failure, or I/O).

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use taosim_exchange::collaborators::{CheckpointStore, ConfigLoader, FileCheckpointStore, JsonConfigLoader, NoopTransport, RngSource};
use taosim_exchange::config::{AgentConfig, SimulationConfig};
use taosim_exchange::error::EngineError;
use taosim_exchange::exchange::{BookConfig, MultiBookExchange};
use taosim_exchange::ids::{AgentId, Timestamp};
use taosim_exchange::simulation::{Simulation, SimulationManager};

#[derive(Parser, Debug)]
#[command(name = "taosim-sim", about = "Deterministic multi-book exchange simulator")]
struct Args {
    /// Start from a fresh configuration document.
    #[arg(long)]
    config_file: Option<PathBuf>,
    /// Resume from a previously saved checkpoint.
    #[arg(long)]
    checkpoint_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), EngineError> {
    let config = load_config(&args)?;
    taosim_exchange::logging::init(config.debug);

    let mut manager = build_manager(&config)?;
    let steps = if config.step == 0 { 0 } else { config.duration / config.step };
    let transport = NoopTransport;

    for _ in 0..steps {
        manager.step_all(|states| transport.publish_state(&states).unwrap_or_default());
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<SimulationConfig, EngineError> {
    match (&args.config_file, &args.checkpoint_file) {
        (Some(path), None) => {
            let bytes = std::fs::read(path).map_err(|e| EngineError::Io(e.to_string()))?;
            JsonConfigLoader.load(&bytes)
        }
        (None, Some(path)) => Ok(FileCheckpointStore::new(path.clone()).load()?.config),
        (Some(_), Some(_)) | (None, None) => Err(EngineError::Config("exactly one of --config-file or --checkpoint-file is required".to_string())),
    }
}

fn agent_ids_by_name(agents: &[AgentConfig]) -> HashMap<String, AgentId> {
    agents.iter().enumerate().map(|(i, a)| (a.name.clone(), AgentId(-(i as i64 + 1)))).collect()
}

/// Builds `config.manager.blockCount` independent simulation blocks,
/// each configured identically from the same document, matching
/// `SimulationManager::fromConfig`'s one-`Simulation`-per-block loop.
fn build_manager(config: &SimulationConfig) -> Result<SimulationManager, EngineError> {
    let block_dim = config.books.instance_count;
    let agent_ids = agent_ids_by_name(&config.agents);
    let overrides = config.fee_policy.resolved_overrides(&agent_ids);

    let mut simulations = Vec::new();
    for block_idx in 0..config.manager.block_count {
        let params = config.exchange.to_params(config.books.max_open_orders);
        let book_configs: Vec<BookConfig> = (0..block_dim)
            .map(|_| BookConfig { price_decimals: config.exchange.price_decimals, volume_decimals: config.exchange.volume_decimals, params })
            .collect();

        let mut exchange = MultiBookExchange::new(book_configs, config.fee_policy.tiers(), config.fee_policy.window);
        for tier in &overrides {
            exchange.fees_mut().set_override(tier.0, tier.1);
        }

        let mut rng = taosim_exchange::collaborators::CounterRng::default();
        if let Some(seed) = config.seed {
            rng.seed(seed.wrapping_add(block_idx as u64));
        }
        for agent in &config.agents {
            let Some(&agent_id) = agent_ids.get(&agent.name) else { continue };
            let initial = config.balances.generate(block_dim as usize, &mut rng);
            exchange.register_agent(agent.name.clone(), agent_id, &initial);
        }

        simulations.push(Simulation::new(block_idx, exchange, Timestamp(config.start), config.step.max(1), 0));
    }

    Ok(SimulationManager::new(simulations, block_dim))
}
