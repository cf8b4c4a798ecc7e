use clap::Parser;
use log::info;

use server::heartbeat::Authenticator;
use server::network::ServerRunner;
use shared::config::keys;
use shared::TableConfig;

/// Discovery responder for a game server: answers LAN and directory
/// queries and keeps the server registered with its masters.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Flat JSON config file (string keys and scalar values)
    #[clap(short, long)]
    config: Option<String>,

    /// Master server entries, "<region>:<host>:<port>"; overrides config
    #[clap(short, long)]
    master: Vec<String>,

    /// Game port to answer queries on
    #[clap(short, long, default_value = "28000")]
    port: u16,

    /// Published server name (clipped to 24 characters on the wire)
    #[clap(short, long, default_value = "Unnamed server")]
    name: String,

    #[clap(long, default_value = "CTF")]
    game_type: String,

    #[clap(long, default_value = "any")]
    mission_type: String,

    #[clap(long, default_value = "untitled")]
    mission_name: String,

    #[clap(long, default_value = "16")]
    max_players: u8,

    #[clap(long, default_value = "0")]
    private_slots: u8,

    #[clap(long, default_value = "0")]
    region_mask: u32,

    /// Join password; its presence sets the passworded status bit
    #[clap(long, default_value = "")]
    password: String,

    #[clap(long, default_value = "")]
    info: String,

    #[clap(long, default_value = "")]
    invite_code: String,

    #[clap(long)]
    dedicated: bool,

    /// Skip master registration and answer LAN queries only
    #[clap(long)]
    no_heartbeat: bool,
}

/// The host process vouches for authentication; this CLI always does.
struct CliAuthenticated;

impl Authenticator for CliAuthenticated {
    fn server_authenticated(&self) -> bool {
        true
    }
}

fn build_config(args: &Args) -> Result<TableConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => TableConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => TableConfig::new(),
    };
    for (i, master) in args.master.iter().take(10).enumerate() {
        config.set(format!("{}{}", keys::MASTER_PREFIX, i), master.clone());
    }
    config.set(keys::PREF_SERVER_NAME, args.name.clone());
    config.set(keys::SERVER_GAME_TYPE, args.game_type.clone());
    config.set(keys::SERVER_MISSION_TYPE, args.mission_type.clone());
    config.set(keys::SERVER_MISSION_NAME, args.mission_name.clone());
    config.set(keys::SERVER_SERVER_TYPE, "MultiPlayer");
    config.set(keys::PREF_SERVER_MAX_PLAYERS, args.max_players.to_string());
    config.set(
        keys::PREF_SERVER_PRIVATE_SLOTS,
        args.private_slots.to_string(),
    );
    config.set(keys::SERVER_REGION_MASK, args.region_mask.to_string());
    config.set(keys::PREF_SERVER_PASSWORD, args.password.clone());
    config.set(keys::PREF_SERVER_INFO, args.info.clone());
    config.set(keys::SERVER_INVITE_CODE, args.invite_code.clone());
    config.set(keys::PREF_SERVER_PORT, args.port.to_string());
    config.set(
        keys::SERVER_DEDICATED,
        if args.dedicated { "true" } else { "false" },
    );
    Ok(config)
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

    let mut runner = ServerRunner::bind(args.port, config).await?;
    if args.no_heartbeat {
        info!("Master registration disabled, serving LAN queries only");
    } else {
        runner.start_heartbeat(&CliAuthenticated);
    }
    runner.run().await;

    Ok(())
}
