/// main.rs – Entry point for the TradeDesk terminal.
///
/// Composition root: loads settings, seeds the view model from the REST
/// snapshot, wires the push-update feed into the dashboard and runs the
/// event loop until the user quits.
mod api;
mod backoff;
mod config;
mod dashboard;
mod dispatcher;
mod frames;
mod models;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossterm::event::EventStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use api::ApiClient;
use config::Settings;
use dashboard::KeyAction;
use dispatcher::FeedClient;
use frames::{
    market_channel, InboundFrame, Update, BACKTESTS_CHANNEL, MODULES_CHANNEL, PORTFOLIO_CHANNEL,
    STRATEGIES_CHANNEL, TRADES_CHANNEL,
};
use models::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tradedesk",
    about = "Live trading dashboard – account, positions, trades and research updates over a push feed",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Disable the interactive dashboard and log updates to stdout instead.
    #[arg(long, default_value_t = false)]
    no_dashboard: bool,

    /// Override the push-update WebSocket URL (takes precedence over config and env).
    #[arg(long)]
    feed_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config, cli.feed_url.clone())?;
    init_logging(&settings, cli.no_dashboard)?;

    info!("Feed: {}  symbols: {:?}", settings.feed.url, settings.dashboard.symbols);
    if settings.user_id.is_none() {
        warn!("TRADEDESK_USER_ID not set – connecting without an auth frame.");
    }

    let mut state = AppState {
        user_id: settings.user_id.clone(),
        started_at: Some(Utc::now()),
        feed_url: settings.feed.url.clone(),
        ..AppState::default()
    };

    // Seed from the REST snapshot before push updates start arriving
    match ApiClient::from_config(&settings.api, settings.api_token.clone())? {
        Some(api) => load_snapshot(&api, &mut state).await,
        None => info!("No api.base_url configured – skipping REST snapshot"),
    }

    // Push-update feed
    let feed = FeedClient::new(&settings.feed, settings.user_id.clone());
    let (update_tx, mut update_rx) = mpsc::channel::<Update>(settings.feed.channel_capacity);
    for channel in dashboard_channels(&settings.dashboard.symbols) {
        let tx = update_tx.clone();
        let name = channel.clone();
        feed.on_message(&channel, move |frame| forward(&tx, &name, frame));
        feed.subscribe(&channel);
    }
    let mut conn_rx = feed.state();
    feed.connect();
    state.add_log(format!("Connecting to {}", feed.url()));

    // Dashboard setup (unless --no-dashboard)
    let mut terminal = if !cli.no_dashboard {
        Some(dashboard::setup_terminal()?)
    } else {
        None
    };

    let mut dash_ticker = tokio::time::interval(settings.dashboard.refresh_interval());
    let mut event_stream = EventStream::new();

    info!("TradeDesk started.  Press 'q' to quit.");

    // -----------------------------------------------------------------------
    // Main event loop
    // -----------------------------------------------------------------------
    loop {
        if let Some(ref mut term) = terminal {
            term.draw(|f| dashboard::render(f, &state))?;
        }

        tokio::select! {
            // ── Keyboard ───────────────────────────────────────────────────
            Some(Ok(event)) = event_stream.next(), if terminal.is_some() => {
                match dashboard::handle_event(&event) {
                    KeyAction::Quit => break,
                    KeyAction::Reconnect => {
                        state.add_log("Manual reconnect requested");
                        feed.reconnect();
                    }
                    KeyAction::None => {}
                }
            }

            // ── Redraw tick ────────────────────────────────────────────────
            _ = dash_ticker.tick() => {}

            // ── Push update ────────────────────────────────────────────────
            Some(update) = update_rx.recv() => {
                if terminal.is_none() {
                    info!("{} update: {:?}", update.kind(), update);
                }
                state.apply(&update);
            }

            // ── Connection state ───────────────────────────────────────────
            Ok(()) = conn_rx.changed() => {
                let conn = *conn_rx.borrow_and_update();
                state.set_connection(conn);
            }

            _ = tokio::signal::ctrl_c(), if terminal.is_none() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------
    info!("Feed state at shutdown: {}", feed.current_state());
    feed.disconnect();
    if let Some(ref mut term) = terminal {
        dashboard::teardown_terminal(term)?;
    }

    info!(
        "Session ended – {} update(s) received, {} trade(s) seen",
        state.updates_received,
        state.recent_trades.len()
    );
    Ok(())
}

fn init_logging(settings: &Settings, no_dashboard: bool) -> Result<()> {
    // Logging – respects RUST_LOG; falls back to config
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.app.log_level.to_lowercase()));

    if no_dashboard {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        // The dashboard owns stdout; send logs to a file instead.
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.app.log_file)
            .with_context(|| format!("opening log file {}", settings.app.log_file))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }
    Ok(())
}

async fn load_snapshot(api: &ApiClient, state: &mut AppState) {
    match api.fetch_portfolio().await {
        Ok(portfolio) => state.portfolio = portfolio,
        Err(e) => {
            warn!("Account snapshot failed: {e:#}");
            state.add_log(format!("ERROR loading account: {e}"));
        }
    }
    match api.fetch_trades(50).await {
        Ok(trades) => state.recent_trades = trades.into_iter().collect(),
        Err(e) => {
            warn!("Trade history fetch failed: {e:#}");
            state.add_log(format!("ERROR loading trades: {e}"));
        }
    }
}

/// Every channel the dashboard renders.
fn dashboard_channels(symbols: &[String]) -> Vec<String> {
    symbols
        .iter()
        .map(|s| market_channel(s))
        .chain(
            [
                PORTFOLIO_CHANNEL,
                TRADES_CHANNEL,
                STRATEGIES_CHANNEL,
                BACKTESTS_CHANNEL,
                MODULES_CHANNEL,
            ]
            .into_iter()
            .map(String::from),
        )
        .collect()
}

/// Handler body: hand the update to the main loop without blocking the feed task.
fn forward(tx: &mpsc::Sender<Update>, channel: &str, frame: &InboundFrame) {
    match tx.try_send(frame.update.clone()) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!("Dropping {channel} update (dashboard queue full)");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_channels_cover_symbols_and_fixed_channels() {
        let channels = dashboard_channels(&["aapl".to_string(), "SPY".to_string()]);
        assert_eq!(channels[0], "market:AAPL");
        assert_eq!(channels[1], "market:SPY");
        assert!(channels.contains(&"portfolio".to_string()));
        assert!(channels.contains(&"modules".to_string()));
        assert_eq!(channels.len(), 7);
    }

    #[test]
    fn forward_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel::<Update>(1);
        let frame = frames::parse_frame(r#"{"type":"trade_update","data":{"id":"a"}}"#).unwrap();
        forward(&tx, "trades", &frame);
        forward(&tx, "trades", &frame);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
