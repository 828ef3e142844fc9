// =============================================================================
// WallWatch — Main Entry Point
// =============================================================================
//
// Order-book wall monitor: stream supervision drives the wall detector,
// lifecycle events fan out to Telegram, commands mutate the watch list.
// `run` is the monitor; `doctor` runs the preflight checks.

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod doctor;
mod market_data;
mod notifier;
mod runtime_state;
mod telegram;
mod types;
mod wall_detector;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{
    configure_root_certificates, ensure_required_env, ensure_telegram_env, load_app_config,
    process_env_loader, resolve_log_level, AppConfig, EnvSettings,
};
use crate::doctor::{build_doctor_report, print_report};
use crate::market_data::client::{MarketDataApi, MarketDataClient};
use crate::market_data::dump::run_orderbook_dump;
use crate::market_data::manager::{ManagerConfig, MarketDataManager, SubscriptionControl};
use crate::notifier::ConsoleNotifier;
use crate::runtime_state::RuntimeState;
use crate::telegram::api::BotApi;
use crate::telegram::notifier::NotifierSettings;
use crate::telegram::{TelegramApi, TelegramCommandHandler, TelegramNotifier, TelegramPolling};

/// Heartbeat log period.
const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;

/// Grace period for draining the Telegram queue on shutdown.
const FLUSH_TIMEOUT_SECONDS: u64 = 5;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "wallwatch", about = "Order book wall monitor", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the wall monitor.
    Run(RunArgs),
    /// Run preflight checks and exit.
    Doctor(DoctorArgs),
    /// Run the monitor with Telegram delivery required (alias: tg).
    #[command(alias = "tg")]
    Telegram(RunArgs),
}

#[derive(Args, Default)]
struct RunArgs {
    /// Comma separated symbols/ISINs to watch.
    #[arg(long, default_value = "")]
    symbols: String,
    /// Order book subscription depth (overrides the config file).
    #[arg(long)]
    depth: Option<u32>,
    /// Path to the app config file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log level (default: info, env: log_level).
    #[arg(long)]
    log_level: Option<String>,
    /// Periodically fetch and log each instrument's book (seconds).
    #[arg(long)]
    orderbook_dump_seconds: Option<f64>,
    /// Force detector debug payloads on regardless of the config file.
    #[arg(long)]
    debug_walls: bool,
}

#[derive(Args, Default)]
struct DoctorArgs {
    /// Optional comma separated symbols/ISINs (default: SBER).
    #[arg(long)]
    symbols: Option<String>,
    /// Path to the app config file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_symbols_arg(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => run_monitor(args, false).await,
        Command::Doctor(args) => run_doctor(args).await,
        Command::Telegram(args) => run_monitor(args, true).await,
    }
}

// =============================================================================
// doctor
// =============================================================================

async fn run_doctor(args: DoctorArgs) -> ExitCode {
    init_logging("info");
    let symbols = args
        .symbols
        .as_deref()
        .map(parse_symbols_arg)
        .unwrap_or_default();
    let (report, fatal) = build_doctor_report(&symbols, args.config.as_deref()).await;
    print_report(&report);
    info!(checks = report.len(), fatal, "doctor_report");
    if fatal {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

// =============================================================================
// run
// =============================================================================

async fn run_monitor(args: RunArgs, require_telegram: bool) -> ExitCode {
    // ── 1. Environment & config (before logging: errors use a fallback) ──
    let mut env_loader = process_env_loader();
    let settings = match env_loader.load() {
        Ok(settings) => settings,
        Err(error) => return config_fatal(error),
    };
    let mut app_config = match load_app_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(error) => return config_fatal(error),
    };
    if require_telegram {
        app_config.telegram.enabled = true;
    }
    let log_level = match resolve_log_level(
        args.log_level.as_deref(),
        &app_config.logging.level,
        settings.log_level.as_deref(),
    ) {
        Ok(level) => level,
        Err(error) => return config_fatal(error),
    };
    init_logging(&log_level);

    if let Some(variables) = env_loader.take_deprecated() {
        warn!(variables = ?variables, "deprecated_uppercase_env");
    }
    if let Err(error) = ensure_required_env(&settings) {
        error!(error = %error, "config_error");
        return ExitCode::from(1);
    }
    if app_config.telegram.enabled {
        if let Err(error) = ensure_telegram_env(&settings) {
            error!(error = %error, "config_error");
            return ExitCode::from(1);
        }
    }
    match configure_root_certificates(&settings) {
        Ok(Some(path)) => info!(path = %path.display(), "ca_bundle_configured"),
        Ok(None) => {}
        Err(error) => {
            error!(error = %error, "config_error");
            return ExitCode::from(1);
        }
    }

    // ── 2. Effective configuration ───────────────────────────────────────
    let mut detector_config = app_config.detector_config();
    if let Some(depth) = args.depth {
        detector_config.depth = depth;
    }
    let mut symbols = parse_symbols_arg(&args.symbols);
    if symbols.len() > detector_config.max_symbols {
        warn!(
            max_symbols = detector_config.max_symbols,
            "symbol list truncated"
        );
        symbols.truncate(detector_config.max_symbols);
    }
    let debug_enabled = app_config.debug.walls_enabled || args.debug_walls;

    info!(pid = std::process::id(), symbols = ?symbols, "startup");
    info!(
        config_path = ?args.config,
        logging.level = %log_level,
        marketdata.depth = detector_config.depth,
        debug.walls_enabled = debug_enabled,
        debug.walls_interval_seconds = app_config.debug.walls_interval_seconds,
        walls.top_n_levels = app_config.walls.top_n_levels,
        walls.candidate_ratio_to_median = app_config.walls.candidate_ratio_to_median,
        walls.candidate_max_distance_ticks = app_config.walls.candidate_max_distance_ticks,
        walls.confirm_dwell_seconds = app_config.walls.confirm_dwell_seconds,
        walls.confirm_max_distance_ticks = app_config.walls.confirm_max_distance_ticks,
        walls.consume_window_seconds = app_config.walls.consume_window_seconds,
        walls.consume_drop_pct = app_config.walls.consume_drop_pct,
        walls.teleport_reset = app_config.walls.teleport_reset,
        telegram.enabled = app_config.telegram.enabled,
        "effective_config"
    );

    // ── 3. Shared state & collaborators ──────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    let runtime_state = Arc::new(RuntimeState::new(detector_config.depth));
    let client: Arc<dyn MarketDataApi> = Arc::new(MarketDataClient::new(
        settings.token.clone().unwrap_or_default(),
        settings.instrument_status,
        settings.stream_idle_sleep_seconds,
    ));

    let telegram_api: Option<Arc<TelegramApi>> = if app_config.telegram.enabled {
        settings
            .tg_bot_token
            .as_deref()
            .map(|token| Arc::new(TelegramApi::new(token)))
    } else {
        None
    };
    let telegram_notifier = telegram_api.as_ref().map(|api| {
        Arc::new(TelegramNotifier::new(
            NotifierSettings::from_config(&app_config.telegram, &settings.tg_parse_mode),
            settings.tg_chat_ids.clone(),
            api.clone() as Arc<dyn BotApi>,
        ))
    });

    let manager = Arc::new(MarketDataManager::new(
        ManagerConfig {
            detector: detector_config,
            debug_enabled,
            debug_interval_seconds: app_config.debug.walls_interval_seconds,
            retry_backoff_initial_seconds: settings.retry_backoff_initial_seconds,
            retry_backoff_max_seconds: settings.retry_backoff_max_seconds,
        },
        client.clone(),
        runtime_state.clone(),
        telegram_notifier.clone(),
        Arc::new(ConsoleNotifier),
        stop_rx.clone(),
    ));
    manager.start(symbols.clone());

    // ── 4. Background tasks ──────────────────────────────────────────────
    let heartbeat = tokio::spawn(run_heartbeat(
        manager.clone(),
        runtime_state.clone(),
        stop_rx.clone(),
    ));

    let mut dump_task = None;
    if let Some(interval) = args.orderbook_dump_seconds {
        match client.resolve_instruments(&manager.get_symbols()).await {
            Ok((resolved, _)) if !resolved.is_empty() => {
                dump_task = Some(tokio::spawn(run_orderbook_dump(
                    client.clone(),
                    resolved,
                    detector_config.depth,
                    interval,
                    stop_rx.clone(),
                )));
            }
            Ok(_) => warn!("orderbook dump disabled: no instruments resolved"),
            Err(error) => warn!(error = %error, "orderbook dump disabled"),
        }
    }

    let mut polling_task = None;
    if let Some(api) = &telegram_api {
        let polling_enabled = app_config.telegram.polling
            && app_config.telegram.commands_enabled
            && settings.tg_polling;
        let polling = build_polling(
            api.clone(),
            &app_config,
            &settings,
            runtime_state.clone(),
            manager.clone(),
        );
        if app_config.telegram.startup_message {
            let startup_text = format!(
                "WallWatch started: symbols={} depth={}",
                if symbols.is_empty() {
                    "none".to_string()
                } else {
                    symbols.join(", ")
                },
                detector_config.depth,
            );
            polling
                .send_startup_message(&settings.tg_chat_ids, &startup_text)
                .await;
        }
        if polling_enabled {
            polling_task = Some(tokio::spawn(polling.run(stop_rx.clone())));
        }
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
    }
    info!("shutdown_requested");
    let _ = stop_tx.send(true);

    manager.stop().await;
    if let Some(task) = polling_task {
        let _ = task.await;
    }
    if let Some(task) = dump_task {
        let _ = task.await;
    }
    let _ = heartbeat.await;
    if let Some(notifier) = &telegram_notifier {
        let _ = tokio::time::timeout(
            Duration::from_secs(FLUSH_TIMEOUT_SECONDS),
            notifier.flush(),
        )
        .await;
        notifier.close();
    }

    info!("shutdown_complete");
    ExitCode::SUCCESS
}

/// Log a pre-logging config failure through a fallback subscriber.
fn config_fatal(error: config::ConfigError) -> ExitCode {
    init_logging("info");
    error!(error = %error, "config_error");
    ExitCode::from(1)
}

fn build_polling(
    api: Arc<TelegramApi>,
    app_config: &AppConfig,
    settings: &EnvSettings,
    runtime_state: Arc<RuntimeState>,
    manager: Arc<MarketDataManager>,
) -> TelegramPolling {
    let handler = TelegramCommandHandler::new(
        runtime_state,
        manager as Arc<dyn SubscriptionControl>,
        app_config.walls.max_symbols,
        settings.tg_allowed_user_ids.iter().copied().collect(),
        app_config.telegram.include_instrument_button,
        app_config.telegram.button_text.clone(),
        app_config.telegram.append_security_share_utm,
    );
    TelegramPolling::new(
        api as Arc<dyn BotApi>,
        handler,
        Some(settings.tg_parse_mode.clone()),
        app_config.telegram.disable_web_preview,
        app_config.telegram.poll_interval_seconds,
    )
}

async fn run_heartbeat(
    manager: Arc<MarketDataManager>,
    runtime_state: Arc<RuntimeState>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS));
    // The first interval tick fires immediately; skip it so the first
    // heartbeat carries a full interval of counts.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
                continue;
            }
        }
        let (orderbooks, trades) = manager.consume_interval_counts();
        let age = manager.last_message_age_seconds();
        runtime_state.update(|s| s.set_since_last_message_seconds(age));
        let snapshot = runtime_state.snapshot();
        info!(
            stream_state = %snapshot.stream_state,
            rx_orderbooks = orderbooks,
            rx_trades = trades,
            rx_total_orderbooks = snapshot.rx_total_orderbooks,
            rx_total_trades = snapshot.rx_total_trades,
            since_last_message_seconds = ?age,
            symbols = ?snapshot.current_symbols,
            "heartbeat"
        );
    }
}
