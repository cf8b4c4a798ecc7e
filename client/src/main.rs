use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;

use client::engine::QueryEngine;
use client::events::LogSink;
use client::filter::ServerFilter;
use client::network::QueryRunner;
use shared::config::keys;
use shared::{NetAddress, TableConfig};

/// Game server browser: discover servers on the LAN or via a master
/// directory, ping and query them, and print the filtered result.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Flat JSON config file (string keys and scalar values)
    #[clap(short, long)]
    config: Option<String>,

    /// Master server entries, "<region>:<host>:<port>"; overrides config
    #[clap(short, long)]
    master: Vec<String>,

    /// Game/LAN port to broadcast on
    #[clap(short, long, default_value = "28000")]
    port: u16,

    /// Game type filter ("any" disables)
    #[clap(long, default_value = "any")]
    game_type: String,

    /// Mission type filter ("any" disables)
    #[clap(long, default_value = "any")]
    mission_type: String,

    #[clap(long, default_value = "0")]
    min_players: u8,

    #[clap(long, default_value = "255")]
    max_players: u8,

    #[clap(long, default_value = "16")]
    max_bots: u8,

    #[clap(long, default_value = "4294967295")]
    region_mask: u32,

    /// Reject servers slower than this round trip, in ms (0 disables)
    #[clap(long, default_value = "0")]
    max_ping: u32,

    #[clap(long, default_value = "0")]
    min_cpu: u16,

    /// Only accept dedicated servers
    #[clap(long)]
    dedicated: bool,

    /// Only accept servers without a password
    #[clap(long)]
    no_password: bool,

    /// Forward pings/queries through the masters for NAT'd servers
    #[clap(long)]
    hole_punching: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast on the LAN only
    Lan {
        /// Apply the filter options to LAN results too
        #[clap(long)]
        use_filters: bool,
    },
    /// Fetch the list from a master directory (plus the LAN broadcast)
    Master,
    /// Ping the bookmarked favorites
    Favorites,
    /// Refresh a single server
    Single { address: String },
    /// Fetch the game/mission type catalogue from a master
    GameTypes,
}

fn build_config(args: &Args) -> Result<TableConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => TableConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => TableConfig::new(),
    };
    for (i, master) in args.master.iter().take(10).enumerate() {
        config.set(format!("{}{}", keys::MASTER_PREFIX, i), master.clone());
    }
    Ok(config)
}

fn build_filter(args: &Args) -> ServerFilter {
    use shared::packet::{FILTER_FLAG_DEDICATED, FILTER_FLAG_NOT_PASSWORDED};
    let mut filter_flags = 0;
    if args.dedicated {
        filter_flags |= FILTER_FLAG_DEDICATED;
    }
    if args.no_password {
        filter_flags |= FILTER_FLAG_NOT_PASSWORDED;
    }
    ServerFilter {
        game_type: args.game_type.clone(),
        mission_type: args.mission_type.clone(),
        min_players: args.min_players,
        max_players: args.max_players,
        max_bots: args.max_bots,
        region_mask: args.region_mask,
        max_ping: args.max_ping,
        min_cpu: args.min_cpu,
        filter_flags,
        ..ServerFilter::default()
    }
}

fn print_results(engine: &QueryEngine) {
    println!("{} server(s):", engine.server_count());
    for si in engine.servers() {
        println!(
            "  {:21} {:24} {:10} {:>3}/{:<3} {:>4}ms{}{}",
            si.address.to_string(),
            si.name,
            si.game_type,
            si.num_players,
            si.max_players,
            si.ping,
            if si.is_local { " [lan]" } else { "" },
            if si.status.timed_out() { " [timed out]" } else { "" },
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let config = build_config(&args)?;
    let filter = build_filter(&args);

    let mut runner = QueryRunner::bind(Box::new(config), Box::new(LogSink)).await?;
    runner.engine_mut().set_hole_punching(args.hole_punching);

    match &args.command {
        Command::Lan { use_filters } => {
            let now = runner.now();
            runner
                .engine_mut()
                .query_lan_servers(now, args.port, filter, *use_filters);
            runner.run_to_completion().await;
            print_results(runner.engine());
        }
        Command::Master => {
            let now = runner.now();
            runner
                .engine_mut()
                .query_master_server(now, args.port, filter, Vec::new());
            runner.run_to_completion().await;
            print_results(runner.engine());
        }
        Command::Favorites => {
            let now = runner.now();
            runner.engine_mut().query_favorite_servers(now);
            runner.run_to_completion().await;
            print_results(runner.engine());
        }
        Command::Single { address } => {
            let addr: NetAddress = address.parse()?;
            let now = runner.now();
            runner.engine_mut().query_single_server(now, &addr);
            runner.run_to_completion().await;
            print_results(runner.engine());
        }
        Command::GameTypes => {
            let now = runner.now();
            runner.engine_mut().query_master_game_types(now);
            info!("Waiting for the game type catalogue...");
            runner.run_for(Duration::from_secs(3)).await;
        }
    }

    Ok(())
}
