/// dispatcher.rs – Push-update feed client.
///
/// Owns a single WebSocket connection, a registry of channel subscriptions
/// and one handler per channel.  The connection runs as a background tokio
/// task that re-subscribes every recorded channel after each (re)connect and
/// retries with the configured backoff until the attempt cap is reached, at
/// which point the client publishes `ConnectionState::Offline` and stops.
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::backoff::{ReconnectPolicy, Reconnector};
use crate::config::FeedConfig;
use crate::frames::{parse_frame, FrameError, InboundFrame, OutboundFrame, Update};
use crate::models::ConnectionState;

/// Per-channel callback. Invoked on the connection task, one frame at a time.
pub type Handler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Subscriptions, handlers and the writer for the live socket.
///
/// A channel counts as "open" exactly when `link` is set: frames are only
/// queued for the socket while it is.
#[derive(Default)]
pub struct Registry {
    subscriptions: Vec<String>,
    handlers: HashMap<String, Handler>,
    link: Option<mpsc::UnboundedSender<OutboundFrame>>,
}

impl Registry {
    /// Record `channel`; returns `false` if it was already recorded.
    pub fn subscribe(&mut self, channel: &str) -> bool {
        if self.subscriptions.iter().any(|c| c == channel) {
            return false;
        }
        self.subscriptions.push(channel.to_string());
        self.send(OutboundFrame::subscribe(channel));
        true
    }

    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|c| c != channel);
        if self.subscriptions.len() == before {
            return false;
        }
        self.send(OutboundFrame::unsubscribe(channel));
        true
    }

    /// Install `handler` for `channel`, returning the one it replaced.
    pub fn set_handler(&mut self, channel: &str, handler: Handler) -> Option<Handler> {
        self.handlers.insert(channel.to_string(), handler)
    }

    pub fn remove_handler(&mut self, channel: &str) -> bool {
        self.handlers.remove(channel).is_some()
    }

    pub fn handler(&self, channel: &str) -> Option<Handler> {
        self.handlers.get(channel).cloned()
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Bind a freshly opened socket: auth first (when a user id is known),
    /// then one subscribe frame per recorded channel. Returns the number of
    /// subscribe frames queued.
    pub fn attach(
        &mut self,
        link: mpsc::UnboundedSender<OutboundFrame>,
        user_id: Option<&str>,
    ) -> usize {
        self.link = Some(link);
        if let Some(uid) = user_id {
            self.send(OutboundFrame::Auth {
                user_id: uid.to_string(),
            });
        }
        let channels = self.subscriptions.clone();
        for channel in &channels {
            self.send(OutboundFrame::subscribe(channel.as_str()));
        }
        channels.len()
    }

    pub fn detach(&mut self) {
        self.link = None;
    }

    /// Forget everything: subscriptions, handlers and the socket writer.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.handlers.clear();
        self.link = None;
    }

    fn send(&self, frame: OutboundFrame) {
        if let Some(link) = &self.link {
            if link.send(frame).is_err() {
                debug!("Feed writer gone; frame dropped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FeedClient
// ---------------------------------------------------------------------------

struct Inner {
    url: String,
    user_id: Option<String>,
    ping_interval: Duration,
    policy: ReconnectPolicy,
    registry: Mutex<Registry>,
    state_tx: watch::Sender<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every connect/reconnect/disconnect. A connection task only
    /// touches shared state while its own epoch is current, so a task that is
    /// being aborted cannot clobber its successor.
    epoch: AtomicU64,
}

/// Cloneable handle to the feed connection. Construct one in the
/// application root and pass it to whatever needs updates.
#[derive(Clone)]
pub struct FeedClient {
    inner: Arc<Inner>,
}

impl FeedClient {
    pub fn new(config: &FeedConfig, user_id: Option<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: config.url.clone(),
                user_id,
                ping_interval: config.ping_interval(),
                policy: config.reconnect.policy(),
                registry: Mutex::new(Registry::default()),
                state_tx,
                task: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the connection task. No-op while one is already running.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Feed connect() ignored; connection task already running");
            return;
        }
        let epoch = self.inner.next_epoch();
        *task = Some(tokio::spawn(run_connection(Arc::clone(&self.inner), epoch)));
    }

    /// Restart the connection with a fresh attempt budget, keeping the
    /// subscription registry. This is the way out of `Offline`.
    pub fn reconnect(&self) {
        let mut task = lock(&self.inner.task);
        if let Some(handle) = task.take() {
            handle.abort();
        }
        let epoch = self.inner.next_epoch();
        lock(&self.inner.registry).detach();
        info!("Manual feed reconnect requested");
        *task = Some(tokio::spawn(run_connection(Arc::clone(&self.inner), epoch)));
    }

    /// Tear down the connection and forget all subscriptions and handlers.
    /// Cancels any pending reconnect timer.
    pub fn disconnect(&self) {
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
        }
        self.inner.next_epoch();
        lock(&self.inner.registry).clear();
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Feed disconnected");
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    // ------------------------------------------------------------------
    // Subscriptions / handlers
    // ------------------------------------------------------------------

    pub fn subscribe(&self, channel: &str) {
        if lock(&self.inner.registry).subscribe(channel) {
            debug!("Subscribed to {channel}");
        }
    }

    pub fn unsubscribe(&self, channel: &str) {
        if lock(&self.inner.registry).unsubscribe(channel) {
            debug!("Unsubscribed from {channel}");
        }
    }

    /// Register the handler for `channel`. Replaces any previous handler.
    pub fn on_message<F>(&self, channel: &str, handler: F)
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        let replaced = lock(&self.inner.registry).set_handler(channel, Arc::new(handler));
        if replaced.is_some() {
            debug!("Replaced handler for {channel}");
        }
    }

    pub fn off_message(&self, channel: &str) {
        lock(&self.inner.registry).remove_handler(channel);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner.registry).subscriptions().to_vec()
    }
}

impl Inner {
    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// State change from a connection task; ignored once the task is stale.
    fn publish(&self, epoch: u64, state: ConnectionState) {
        if self.is_current(epoch) {
            self.set_state(state);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("Feed state {prev} -> {state}");
        }
    }

    fn dispatch_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(frame) => self.dispatch(&frame),
            Err(FrameError::UnknownType(kind)) => {
                debug!("Dropping feed frame of unrecognized type '{kind}'");
            }
            Err(e) => warn!("Dropping feed frame: {e}"),
        }
    }

    fn dispatch(&self, frame: &InboundFrame) {
        if frame.kind().is_notice() {
            log_notice(frame);
            return;
        }
        let Some(channel) = frame.route() else {
            return;
        };
        let handler = lock(&self.registry).handler(channel);
        let Some(handler) = handler else {
            debug!("No handler for {channel}; dropping {}", frame.kind());
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
            error!("Handler for {channel} panicked on {} frame", frame.kind());
        }
    }
}

fn log_notice(frame: &InboundFrame) {
    match &frame.update {
        Update::Connection(n) => info!("Feed server: {}", n.summary()),
        Update::Auth(n) => info!("Feed auth: {}", n.summary()),
        Update::Subscription(n) => debug!("Feed subscription: {}", n.summary()),
        Update::Error(n) => warn!("Feed server error: {}", n.summary()),
        _ => {}
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run_connection(inner: Arc<Inner>, epoch: u64) {
    let mut reconnector = Reconnector::new(inner.policy.clone());
    loop {
        inner.publish(epoch, ConnectionState::Connecting);
        info!("Connecting to feed: {}", inner.url);

        match connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => {
                reconnector.reset();
                if let Err(e) = run_socket(&inner, epoch, ws).await {
                    warn!("Feed connection error: {e:#}");
                }
                {
                    let mut reg = lock(&inner.registry);
                    if inner.is_current(epoch) {
                        reg.detach();
                    }
                }
                inner.publish(epoch, ConnectionState::Closed);
            }
            Err(e) => {
                warn!("Feed connect failed: {e}");
                inner.publish(epoch, ConnectionState::Closed);
            }
        }

        match reconnector.next_delay() {
            Some(delay) => {
                let attempt = reconnector.attempts();
                info!(
                    "Reconnecting to feed in {:.1}s (attempt {attempt}{})",
                    delay.as_secs_f64(),
                    reconnector
                        .policy()
                        .max_attempts
                        .map(|m| format!("/{m}"))
                        .unwrap_or_default()
                );
                inner.publish(epoch, ConnectionState::ReconnectScheduled { attempt, delay });
                tokio::time::sleep(delay).await;
            }
            None => {
                let attempts = reconnector.attempts();
                error!("Feed reconnect gave up after {attempts} attempt(s); going offline");
                inner.publish(epoch, ConnectionState::Offline { attempts });
                return;
            }
        }
    }
}

/// Pump one open socket until it closes. `Ok` for a clean close.
async fn run_socket<S>(
    inner: &Inner,
    epoch: u64,
    ws: tokio_tungstenite::WebSocketStream<S>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let resent = {
        let mut reg = lock(&inner.registry);
        if !inner.is_current(epoch) {
            return Ok(());
        }
        reg.attach(link_tx, inner.user_id.as_deref())
    };
    inner.publish(epoch, ConnectionState::Open);
    info!("Feed connected; {resent} channel(s) subscribed");

    let mut keepalive =
        tokio::time::interval_at(Instant::now() + inner.ping_interval, inner.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(frame) = link_rx.recv() => {
                write
                    .send(Message::Text(frame.to_json()?))
                    .await
                    .context("sending feed frame")?;
            }

            _ = keepalive.tick() => {
                write
                    .send(Message::Text(OutboundFrame::Ping.to_json()?))
                    .await
                    .context("sending keep-alive")?;
            }

            msg = read.next() => {
                match msg {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e).context("feed read error"),
                    Some(Ok(Message::Text(text))) => inner.dispatch_text(&text),
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await.ok();
                    }
                    Some(Ok(Message::Close(reason))) => {
                        inner.publish(epoch, ConnectionState::Closing);
                        info!("Feed closed by server: {reason:?}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn attached(reg: &mut Registry, user: Option<&str>) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.attach(tx, user);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f);
        }
        out
    }

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (
            hits,
            Arc::new(move |_: &InboundFrame| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn subscribe_while_detached_is_deferred_until_attach() {
        let mut reg = Registry::default();
        assert!(reg.subscribe("portfolio"));
        assert!(reg.subscribe("market:AAPL"));
        let mut rx = attached(&mut reg, None);
        assert_eq!(
            drain(&mut rx),
            vec![
                OutboundFrame::subscribe("portfolio"),
                OutboundFrame::subscribe("market:AAPL"),
            ]
        );
    }

    #[test]
    fn auth_precedes_resubscribe() {
        let mut reg = Registry::default();
        reg.subscribe("trades");
        let mut rx = attached(&mut reg, Some("user-7"));
        let frames = drain(&mut rx);
        assert_eq!(
            frames[0],
            OutboundFrame::Auth {
                user_id: "user-7".into()
            }
        );
        assert_eq!(frames[1], OutboundFrame::subscribe("trades"));
    }

    #[test]
    fn duplicate_subscribe_sends_once() {
        let mut reg = Registry::default();
        let mut rx = attached(&mut reg, None);
        assert!(reg.subscribe("modules"));
        assert!(!reg.subscribe("modules"));
        assert_eq!(drain(&mut rx), vec![OutboundFrame::subscribe("modules")]);
        assert_eq!(reg.subscriptions(), ["modules".to_string()]);
    }

    #[test]
    fn unsubscribe_only_sends_when_open_and_known() {
        let mut reg = Registry::default();
        reg.subscribe("backtests");
        assert!(reg.unsubscribe("backtests"));
        assert!(!reg.unsubscribe("backtests"));

        reg.subscribe("backtests");
        let mut rx = attached(&mut reg, None);
        drain(&mut rx);
        reg.unsubscribe("backtests");
        assert_eq!(drain(&mut rx), vec![OutboundFrame::unsubscribe("backtests")]);
    }

    #[test]
    fn detached_registry_sends_nothing() {
        let mut reg = Registry::default();
        let mut rx = attached(&mut reg, None);
        reg.detach();
        reg.subscribe("portfolio");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn clear_forgets_subscriptions_and_handlers() {
        let mut reg = Registry::default();
        reg.subscribe("portfolio");
        let (_, h) = counter();
        reg.set_handler("portfolio", h);
        reg.clear();
        let mut rx = attached(&mut reg, None);
        assert!(drain(&mut rx).is_empty());
        assert!(reg.handler("portfolio").is_none());
    }

    #[test]
    fn replaced_handler_is_never_invoked() {
        let client = FeedClient::new(&FeedConfig::default(), None);
        let (old_hits, old) = counter();
        let (new_hits, new) = counter();
        lock(&client.inner.registry).set_handler("portfolio", old);
        lock(&client.inner.registry).set_handler("portfolio", new);

        client
            .inner
            .dispatch_text(r#"{"type":"portfolio_update","data":{"equity":10.0}}"#);
        assert_eq!(old_hits.load(Ordering::SeqCst), 0);
        assert_eq!(new_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fixed_channel_ignores_frame_channel_field() {
        let client = FeedClient::new(&FeedConfig::default(), None);
        let (portfolio_hits, p) = counter();
        let (other_hits, o) = counter();
        lock(&client.inner.registry).set_handler("portfolio", p);
        lock(&client.inner.registry).set_handler("elsewhere", o);

        client.inner.dispatch_text(
            r#"{"type":"portfolio_update","channel":"elsewhere","data":{},"timestamp":0}"#,
        );
        assert_eq!(portfolio_hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn market_data_routes_by_embedded_channel() {
        let client = FeedClient::new(&FeedConfig::default(), None);
        let (hits, h) = counter();
        lock(&client.inner.registry).set_handler("market:AAPL", h);
        client.inner.dispatch_text(
            r#"{"type":"market_data","channel":"market:AAPL","data":{"symbol":"AAPL","price":190.1}}"#,
        );
        client.inner.dispatch_text(
            r#"{"type":"market_data","channel":"market:MSFT","data":{"symbol":"MSFT","price":410.0}}"#,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_and_malformed_frames_are_dropped() {
        let client = FeedClient::new(&FeedConfig::default(), None);
        let (hits, h) = counter();
        lock(&client.inner.registry).set_handler("portfolio", h);
        client.inner.dispatch_text(r#"{"type":"weather","channel":"portfolio"}"#);
        client.inner.dispatch_text("not json");
        client
            .inner
            .dispatch_text(r#"{"type":"portfolio_update","data":{"equity":"lots"}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_handler_does_not_poison_dispatch() {
        let client = FeedClient::new(&FeedConfig::default(), None);
        client.on_message("trades", |_| panic!("boom"));
        client
            .inner
            .dispatch_text(r#"{"type":"trade_update","data":{"id":"t1"}}"#);
        let (hits, h) = counter();
        lock(&client.inner.registry).set_handler("trades", h);
        client
            .inner
            .dispatch_text(r#"{"type":"trade_update","data":{"id":"t2"}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_message_removes_handler() {
        let client = FeedClient::new(&FeedConfig::default(), None);
        let (hits, h) = counter();
        lock(&client.inner.registry).set_handler("modules", h);
        client.off_message("modules");
        client
            .inner
            .dispatch_text(r#"{"type":"module_update","data":{"id":"m1"}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disconnect_without_connect_resets_state() {
        let client = FeedClient::new(&FeedConfig::default(), None);
        client.subscribe("portfolio");
        client.disconnect();
        assert!(client.subscriptions().is_empty());
        assert_eq!(client.current_state(), ConnectionState::Disconnected);
    }
}
