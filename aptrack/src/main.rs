//! aptrack - Archipelago multiworld tracker
//!
//! Follows one or more game servers, prints noteworthy events, and answers
//! progress and hint questions from the server's save files.
//!
//! File locations follow the XDG Base Directory layout:
//! - Config: $XDG_CONFIG_HOME/aptrack/config.toml (~/.config/aptrack/config.toml)
//! - Logs: $XDG_STATE_HOME/aptrack/aptrack.log (~/.local/state/aptrack/aptrack.log)
//! - State: $XDG_DATA_HOME/aptrack/ (~/.local/share/aptrack/)

mod process_lock;

use aptrack_core::config::ServerConfig;
use aptrack_core::format::format_relative_time;
use aptrack_core::progress::display;
use aptrack_core::state::GameStatusStore;
use aptrack_core::tracker::{normalize_address, ListenerExit};
use aptrack_core::{
    Catalog, Config, LiveProgress, NotificationKind, PlayerSlot, ProgressEngine, ProgressSources,
    SlotId, SlotKind, Tracker,
};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use process_lock::acquire_track_guards;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "aptrack")]
#[command(about = "Track Archipelago multiworld servers")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow game servers and print events until every game ends
    Track {
        /// Server addresses (default: servers from the config file)
        addresses: Vec<String>,

        /// Room password
        #[arg(long)]
        password: Option<String>,

        /// Save file used to skip announcements for finished players
        #[arg(long)]
        save_file: Option<PathBuf>,
    },

    /// Completion per player from a save file
    Progress {
        #[arg(long)]
        save_file: PathBuf,

        /// Multiworld layout file (`*.archipelago`) for location totals
        #[arg(long)]
        multidata: Option<PathBuf>,

        /// Only this slot
        #[arg(long)]
        player: Option<SlotId>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Hint points and known hints for one player
    Hints {
        #[arg(long)]
        save_file: PathBuf,

        #[arg(long)]
        multidata: Option<PathBuf>,

        #[arg(long)]
        player: SlotId,
    },

    /// Show the effective configuration
    Status,

    /// List players registered in the game status file
    Games,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        aptrack_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Track {
            addresses,
            password,
            save_file,
        } => run_track(&config, addresses, password, save_file),
        Command::Progress {
            save_file,
            multidata,
            player,
            json,
        } => run_progress(&config, &save_file, multidata, player, json),
        Command::Hints {
            save_file,
            multidata,
            player,
        } => run_hints(&config, &save_file, multidata, player),
        Command::Status => run_status(&config),
        Command::Games => run_games(),
    }
}

// ============================================
// track
// ============================================

/// Servers to track: CLI addresses (merged with matching config entries)
/// or every configured server.
fn resolve_servers(
    config: &Config,
    addresses: Vec<String>,
    password: Option<String>,
    save_file: Option<PathBuf>,
) -> Result<Vec<ServerConfig>> {
    let mut servers: Vec<ServerConfig> = if addresses.is_empty() {
        config.servers.clone()
    } else {
        addresses
            .into_iter()
            .map(|address| {
                let normalized = normalize_address(&address).ok();
                config
                    .servers
                    .iter()
                    .find(|s| normalize_address(&s.address).ok() == normalized)
                    .cloned()
                    .unwrap_or_else(|| ServerConfig::for_address(address))
            })
            .collect()
    };
    if servers.is_empty() {
        anyhow::bail!(
            "no servers to track: pass an address or add [[servers]] to {}",
            Config::config_path().display()
        );
    }

    for server in &mut servers {
        if password.is_some() {
            server.password = password.clone();
        }
        if save_file.is_some() {
            server.save_file = save_file.clone();
        }
        server.address = normalize_address(&server.address)
            .with_context(|| format!("cannot track {:?}", server.address))?;
    }
    Ok(servers)
}

fn run_track(
    config: &Config,
    addresses: Vec<String>,
    password: Option<String>,
    save_file: Option<PathBuf>,
) -> Result<()> {
    let servers = resolve_servers(config, addresses, password, save_file)?;
    let addresses: Vec<String> = servers.iter().map(|s| s.address.clone()).collect();

    // One tracker process per server address.
    let guards = acquire_track_guards(&addresses).context("failed to acquire process lock")?;
    tracing::info!(servers = guards.len(), "aptrack track starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let exits = runtime.block_on(track_until_done(config, servers))?;

    let failures: Vec<&ListenerExit> = exits.iter().filter(|e| e.reason.is_failure()).collect();
    for exit in &exits {
        println!("{}: {}", exit.server, exit.reason);
    }
    if !failures.is_empty() {
        anyhow::bail!("{} of {} listener(s) failed", failures.len(), exits.len());
    }
    Ok(())
}

async fn track_until_done(
    config: &Config,
    servers: Vec<ServerConfig>,
) -> Result<Vec<ListenerExit>> {
    let (mut tracker, mut notifications) = Tracker::new(config);
    let multiple = servers.len() > 1;
    let with_save_file: Vec<ServerConfig> = servers
        .iter()
        .filter(|s| s.resolve_save_file().is_some())
        .cloned()
        .collect();
    for server in servers {
        let address = tracker
            .start(server)
            .context("failed to start listener")?;
        println!("Tracking {}", address);
    }

    let mut exits = Vec::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                print_notification(&notification, multiple);
            }
            exit = tracker.next_exit() => match exit {
                Some(exit) => exits.push(exit),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                for server in &with_save_file {
                    print_live_report(&tracker, server);
                }
                println!("Stopping...");
                exits.extend(tracker.shutdown().await);
                break;
            }
        }
    }

    // Lines queued by listeners on their way out.
    while let Ok(notification) = notifications.try_recv() {
        print_notification(&notification, multiple);
    }
    Ok(exits)
}

fn print_notification(notification: &aptrack_core::Notification, with_server: bool) {
    if with_server {
        println!("[{}] {}", notification.server, notification);
    } else {
        println!("{}", notification);
    }
}

/// Progress for one server from its save file plus this session's checks.
fn print_live_report(tracker: &Tracker, server: &ServerConfig) {
    let query = tracker.query_progress(server);
    let mut roster = query.engine.roster();
    for player in query.roster {
        roster.insert(player.id, player);
    }
    let slots: Vec<SlotId> = query
        .engine
        .slots()
        .into_iter()
        .filter(|slot| roster.get(slot).map_or(true, |p| p.kind == SlotKind::Player))
        .collect();

    println!("Progress on {}:", server.address);
    if slots.is_empty() {
        println!("  No location data available");
        return;
    }
    for line in display::render_report(&query.engine, &roster, &slots, &query.warnings) {
        println!("  {}", line);
    }
}

// ============================================
// progress / hints
// ============================================

fn load_engine(
    config: &Config,
    save_file: &Path,
    multidata: Option<PathBuf>,
) -> Result<(ProgressSources, ProgressEngine)> {
    if !save_file.exists() {
        anyhow::bail!("save file not found: {}", save_file.display());
    }
    if let Some(path) = &multidata {
        if !path.exists() {
            anyhow::bail!("multidata file not found: {}", path.display());
        }
    }
    let sources = ProgressSources {
        team: config.progress.team,
        save_file: Some(save_file.to_path_buf()),
        multidata_file: multidata,
    };
    let engine = sources.load(LiveProgress::new());
    if engine.snapshot().is_none() {
        eprintln!(
            "{} Could not read {}; no location data available",
            NotificationKind::Warning.marker(),
            save_file.display()
        );
    }
    Ok((sources, engine))
}

fn run_progress(
    config: &Config,
    save_file: &Path,
    multidata: Option<PathBuf>,
    player: Option<SlotId>,
    json: bool,
) -> Result<()> {
    let (sources, engine) = load_engine(config, save_file, multidata)?;
    let roster = engine.roster();
    let slots: Vec<SlotId> = match player {
        Some(slot) => vec![slot],
        None => engine.slots().into_iter().collect(),
    };
    let warnings = sources.warnings(
        &engine,
        &BTreeSet::new(),
        false,
        config.progress.stale_after(),
        Utc::now(),
    );

    if json {
        let progress: Vec<_> = slots
            .iter()
            .map(|slot| engine.compute_player_progress(*slot))
            .collect();
        let report = serde_json::json!({
            "players": progress,
            "warnings": warnings,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render JSON")?
        );
        return Ok(());
    }

    if slots.is_empty() {
        println!("No location data available");
        return Ok(());
    }
    for line in display::render_report(&engine, &roster, &slots, &warnings) {
        println!("{}", line);
    }
    Ok(())
}

fn run_hints(
    config: &Config,
    save_file: &Path,
    multidata: Option<PathBuf>,
    player: SlotId,
) -> Result<()> {
    let (_, engine) = load_engine(config, save_file, multidata)?;
    let roster = engine.roster();
    let name = display::player_name(&roster, player);

    for line in display::hint_lines(&name, &engine.hint_economics(player)) {
        println!("{}", line);
    }

    let hints = engine
        .snapshot()
        .map(|s| s.hints_for(config.progress.team, player))
        .unwrap_or_default();
    if hints.is_empty() {
        println!("No hints for {}", name);
        return Ok(());
    }

    let empty = Catalog::new();
    let catalog = engine.multidata().map(|m| &m.catalog).unwrap_or(&empty);
    println!("Hints:");
    for hint in hints {
        let item = catalog.item_name(&game_of(&roster, hint.receiving_player), hint.item);
        let location =
            catalog.location_name(&game_of(&roster, hint.finding_player), hint.location);
        println!(
            "  {}",
            display::hint_record_line(&roster, hint, &item, &location)
        );
    }
    Ok(())
}

fn game_of(roster: &BTreeMap<SlotId, PlayerSlot>, slot: SlotId) -> String {
    roster.get(&slot).map(|p| p.game.clone()).unwrap_or_default()
}

// ============================================
// status / games
// ============================================

fn run_status(config: &Config) -> Result<()> {
    println!("Config: {}", Config::config_path().display());
    println!("Log file: {}", Config::log_path().display());
    println!("Game status: {}", Config::game_status_path().display());
    println!();

    if config.servers.is_empty() {
        println!("Servers: none configured");
    } else {
        println!("Servers:");
        for server in &config.servers {
            let save = server
                .resolve_save_file()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "  - {} (password: {}, save file: {})",
                server.address,
                if server.password.is_some() { "yes" } else { "no" },
                save
            );
        }
    }

    let retry = &config.retry;
    println!(
        "Retry: base {}s, cap {}s, {} attempts, stable after {} messages",
        retry.base_delay_secs, retry.max_delay_secs, retry.max_attempts, retry.stability_threshold
    );
    let timeouts = &config.timeouts;
    println!(
        "Timeouts: connect {}s, handshake {}s, idle {}s, ping every {}s, pong {}s",
        timeouts.connect_secs,
        timeouts.handshake_secs,
        timeouts.idle_secs,
        timeouts.ping_interval_secs,
        timeouts.pong_timeout_secs
    );
    println!(
        "Progress: team {}, stale after {}h",
        config.progress.team, config.progress.stale_after_hours
    );
    Ok(())
}

fn run_games() -> Result<()> {
    let path = Config::game_status_path();
    let store = GameStatusStore::load(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if store.is_empty() {
        println!("No games registered");
        return Ok(());
    }
    let now = Utc::now();
    for (player, status) in store.list() {
        println!(
            "{}: {} ({}), joined {}",
            player,
            status.game,
            status.filepath.display(),
            format_relative_time(status.joined_at, now)
        );
    }
    Ok(())
}
