//! Headless replication harness.
//!
//! Runs one server and a handful of observing clients in-process over
//! simulated lossy links, then logs what the replication layer did.

mod link;
mod sim;

use clap::Parser;
use nebula_config::{CliArgs, Config};
use tracing::{error, info, warn};

use crate::link::LinkProfile;
use crate::sim::{Session, SimSettings};

#[derive(Parser, Debug)]
#[command(name = "nebula-server", about = "Headless actor replication loopback session")]
struct Args {
    #[command(flatten)]
    common: CliArgs,

    /// Wandering actors kept alive on the server.
    #[arg(long, default_value_t = 24)]
    actors: usize,

    /// Observing clients.
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Simulated seconds to run.
    #[arg(long, default_value_t = 60.0)]
    duration: f64,

    /// One-way link latency in milliseconds.
    #[arg(long, default_value_t = 60.0)]
    latency_ms: f64,

    /// Link jitter in milliseconds.
    #[arg(long, default_value_t = 20.0)]
    jitter_ms: f64,

    /// Packet loss probability (0..=1).
    #[arg(long, default_value_t = 0.02)]
    loss: f64,

    /// RNG seed.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Write the JSON log file next to the config.
    #[arg(long)]
    log_file: bool,
}

fn main() {
    let args = Args::parse();
    let config_dir = args.common.config_dir();

    let (mut config, load_error) = match config_dir.as_deref().map(Config::load_or_create) {
        Some(Ok(config)) => (config, None),
        Some(Err(err)) => (Config::default(), Some(err.to_string())),
        None => (Config::default(), Some("no config directory".to_string())),
    };
    config.apply_cli_overrides(&args.common);

    let log_dir = config_dir.as_deref().map(|dir| dir.join("logs"));
    nebula_log::init_logging(log_dir.as_deref(), args.log_file, Some(&config));
    if let Some(err) = load_error {
        warn!(%err, "using default replication config");
    }
    if let Err(err) = config.validate() {
        error!(%err, "invalid replication config after overrides");
        std::process::exit(1);
    }

    let settings = SimSettings {
        actors: args.actors,
        clients: args.clients,
        duration: args.duration.max(0.0),
        link: LinkProfile {
            latency: args.latency_ms.max(0.0) / 1000.0,
            jitter: args.jitter_ms.max(0.0) / 1000.0,
            loss: args.loss.clamp(0.0, 1.0),
        },
        seed: args.seed,
        ..SimSettings::default()
    };
    let session = Session::new(&config, settings.clone());
    info!(
        actors = session.server().actors().count(),
        clients = settings.clients,
        duration = settings.duration,
        latency = settings.link.latency,
        loss = settings.link.loss,
        "starting loopback session"
    );

    let report = session.run();

    let server = report.server;
    info!(
        registered = server.registered,
        pose_updates = server.pose_updates,
        idle_records = server.idle_records,
        deaths = server.deaths,
        forced_deaths = server.forced_deaths,
        snapshots = server.snapshots_served,
        actor_errors = server.actor_errors,
        "server summary"
    );
    for (index, client) in report.clients.iter().enumerate() {
        info!(
            client = index,
            spawned = client.proxies_spawned,
            destroyed = client.proxies_destroyed,
            stale = client.stale_tickets,
            failures = client.spawn_failures,
            resets = client.resets,
            refreshes = client.refresh_requests,
            echoes = client.echoes_suppressed,
            "client summary"
        );
    }
    info!(
        live_proxies = report.live_proxies,
        mean_error = report.mean_error,
        max_error = report.max_error,
        down_sent = report.downlink.sent,
        down_lost = report.downlink.lost,
        down_retransmitted = report.downlink.retransmitted,
        superseded = report.superseded,
        up_sent = report.uplink.sent,
        up_lost = report.uplink.lost,
        up_retransmitted = report.uplink.retransmitted,
        "session finished"
    );
}
