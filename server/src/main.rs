use clap::Parser;
use log::{error, info};
use server::hooks::WorldContext;
use server::opcode::{default_catalog, Opcode, RateBudgetTable};
use server::rate_limit::{BanScope, RateLimitPolicy};
use server::registry::SessionRegistry;
use server::scheduler::Scheduler;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Tick period from a ticks-per-second rate; never zero, since a zero
/// interval period panics.
fn tick_period(tick_rate: u64) -> Duration {
    Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32)
}

fn parse_flood_policy(
    policy: &str,
    ban_scope: &str,
    ban_seconds: u64,
) -> Result<RateLimitPolicy, String> {
    match policy {
        "log" => Ok(RateLimitPolicy::Log),
        "disconnect" => Ok(RateLimitPolicy::Disconnect),
        "ban" => {
            let scope = match ban_scope {
                "account" => BanScope::Account,
                "address" => BanScope::Address,
                other => return Err(format!("unknown ban scope '{}'", other)),
            };
            Ok(RateLimitPolicy::Ban {
                scope,
                seconds: ban_seconds,
            })
        }
        other => Err(format!("unknown flood policy '{}'", other)),
    }
}

fn parse_budget_overrides(entries: &[String]) -> Result<RateBudgetTable, String> {
    let mut budgets: HashMap<Opcode, u32> = HashMap::new();
    for entry in entries {
        let (opcode, budget) = entry
            .split_once('=')
            .ok_or_else(|| format!("budget '{}' is not OPCODE=N", entry))?;
        let opcode = opcode.strip_prefix("0x").unwrap_or(opcode);
        let opcode = Opcode::from_str_radix(opcode, 16)
            .map_err(|_| format!("bad opcode in budget '{}'", entry))?;
        let budget: u32 = budget
            .parse()
            .map_err(|_| format!("bad budget in '{}'", entry))?;
        budgets.insert(opcode, budget);
    }
    Ok(RateBudgetTable { budgets })
}

/// Main-method of the application.
/// Parses command-line arguments, then runs the world tick loop until a
/// shutdown signal arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Tick rate (world updates per second)
        #[clap(short, long, default_value = "30")]
        tick_rate: u64,
        /// Concurrent players served before logins queue
        #[clap(short, long, default_value = "1000")]
        player_limit: usize,
        /// Response to packet flooding: log, disconnect, or ban
        #[clap(short, long, default_value = "log")]
        flood_policy: String,
        /// Ban duration in seconds when the flood policy is ban
        #[clap(long, default_value = "600")]
        ban_seconds: u64,
        /// Ban principal when the flood policy is ban: account or address
        #[clap(long, default_value = "account")]
        ban_scope: String,
        /// Per-opcode budget overrides, e.g. --budget 00EE=150
        #[clap(long = "budget")]
        budgets: Vec<String>,
    }

    let args = Args::parse();

    let policy = match parse_flood_policy(&args.flood_policy, &args.ban_scope, args.ban_seconds) {
        Ok(policy) => policy,
        Err(message) => {
            error!("{}", message);
            return Err(message.into());
        }
    };

    let mut catalog = default_catalog();
    match parse_budget_overrides(&args.budgets) {
        Ok(table) => catalog.apply_budgets(&table),
        Err(message) => {
            error!("{}", message);
            return Err(message.into());
        }
    }

    info!(
        "Starting worldgate server (protocol {}): {} ticks/s, player limit {}, flood policy {:?}",
        shared::PROTOCOL_VERSION,
        args.tick_rate,
        args.player_limit,
        policy
    );

    let ctx = WorldContext::new(Arc::new(catalog), policy);
    let registry = SessionRegistry::new(args.player_limit);
    let scheduler = Scheduler::new(registry, ctx);

    // The transport layer hands sessions and secondary links in through
    // these; they stay alive for the life of the process.
    let _session_intake = scheduler.session_intake();
    let _link_intake = scheduler.link_intake();

    let tick_duration = tick_period(args.tick_rate);

    tokio::select! {
        _ = scheduler.run(tick_duration) => {
            error!("Scheduler loop ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
