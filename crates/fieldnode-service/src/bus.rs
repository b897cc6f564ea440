//! Broker session: connection, subscription and reconnection.
//!
//! A [`BusSession`] owns one [`BusTransport`] and drives it through the
//! [`ConnectionState`] machine:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Reconnecting -> Connecting -> ...
//!                                   \-> Disconnected (on stop)
//! ```
//!
//! Transport failures never end the session; it waits according to its
//! [`ReconnectPolicy`] and connects again with the same credentials until
//! stopped. Messages are handed to a [`MessageHandler`] one at a time, and
//! the next message is not pulled until the handler has returned.
//!
//! The production transport is [`MqttTransport`], backed by `rumqttc`.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use rand::Rng;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AuthMode, MqttConfig, ReconnectConfig};

/// Upper bound on each graceful shutdown step (unsubscribe, disconnect).
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 64;

/// State of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected; initial and final state.
    #[default]
    Disconnected,
    /// Connecting and subscribing.
    Connecting,
    /// Subscribed and receiving messages.
    Subscribed,
    /// Waiting before the next connection attempt.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Delay policy between connection attempts.
///
/// Retries continue forever; the policy only decides how long to wait.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Base delay before reconnecting.
    pub delay: Duration,
    /// Upper bound on the delay, jitter included.
    pub max_delay: Duration,
    /// Whether to add up to 25 % random jitter.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with a fixed delay and no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Set the base delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before the next connection attempt.
    pub fn next_delay(&self) -> Duration {
        let delay = if self.jitter {
            // Add up to 25% jitter
            let factor = 1.0 + rand::rng().random::<f64>() * 0.25;
            self.delay.mul_f64(factor)
        } else {
            self.delay
        };
        delay.min(self.max_delay)
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            delay: Duration::from_secs(config.delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            jitter: config.jitter,
        }
    }
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl BusMessage {
    /// Create a message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport-level errors. All of them lead to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The broker URL could not be parsed.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// A certificate or key file could not be read.
    #[error("Failed to read {path}: {source}")]
    Credentials {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Request could not be queued to the client.
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Network or protocol failure.
    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    /// The broker rejected a request.
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    /// An operation needed a connection that does not exist.
    #[error("Not connected")]
    NotConnected,
}

/// A publish/subscribe transport driven by [`BusSession`].
///
/// Each call may assume the previous one succeeded; after any error the
/// session calls [`connect`](BusTransport::connect) again before anything
/// else.
#[async_trait]
pub trait BusTransport: Send + 'static {
    /// Open a fresh connection, discarding any previous one.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Subscribe to `topic` and wait for the broker's acknowledgement.
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Wait for the next inbound message.
    async fn next_message(&mut self) -> Result<BusMessage, TransportError>;

    /// Remove the subscription.
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Close the connection.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Receiver of bus messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message to completion.
    async fn handle(&self, message: BusMessage);

    /// Called after [`handle`](MessageHandler::handle) panicked.
    fn on_panic(&self) {}
}

/// Settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Topic to subscribe to.
    pub topic: String,
    /// Subscription QoS.
    pub qos: QoS,
    /// Reconnect delays.
    pub policy: ReconnectPolicy,
}

impl SessionConfig {
    /// Session settings from the `[mqtt]` config section.
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            qos: qos_from_level(config.qos),
            policy: ReconnectPolicy::from(&config.reconnect),
        }
    }
}

/// Map a numeric QoS level. Values above 2 are treated as 2.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// An owned broker session. Consumed by [`start`].
pub struct BusSession<T, H> {
    config: SessionConfig,
    transport: T,
    handler: Arc<H>,
    state_tx: watch::Sender<ConnectionState>,
    stop_rx: watch::Receiver<bool>,
}

/// Handle to a running session.
///
/// Dropping the handle signals the session to stop without waiting for it.
pub struct SessionHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the session and wait for it to finish.
    ///
    /// A message being handled is processed to completion first; then the
    /// subscription is removed and the connection closed.
    pub async fn stop(mut self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!("Bus session task failed: {}", e);
        }
    }

    /// Drive `fut` to completion, then stop the session.
    ///
    /// The session is stopped gracefully even when `fut` resolves to an
    /// error, so callers can propagate that error afterwards.
    pub async fn stop_after<F: Future>(self, fut: F) -> F::Output {
        let output = fut.await;
        info!("Stopping bus session");
        self.stop().await;
        output
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// Spawn a session task and return immediately.
pub fn start<T, H>(config: SessionConfig, transport: T, handler: Arc<H>) -> SessionHandle
where
    T: BusTransport,
    H: MessageHandler,
{
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (stop_tx, stop_rx) = watch::channel(false);

    let session = BusSession {
        config,
        transport,
        handler,
        state_tx,
        stop_rx,
    };
    let task = tokio::spawn(session.run());

    SessionHandle {
        stop_tx,
        state_rx,
        task: Some(task),
    }
}

/// Resolves once a stop has been requested or the handle is gone.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

impl<T: BusTransport, H: MessageHandler> BusSession<T, H> {
    async fn run(self) {
        let BusSession {
            config,
            mut transport,
            handler,
            state_tx,
            mut stop_rx,
        } = self;

        let set_state = |state: ConnectionState| {
            state_tx.send_if_modified(|current| {
                if *current == state {
                    false
                } else {
                    debug!("Bus session {} -> {}", current, state);
                    *current = state;
                    true
                }
            });
        };

        let mut attempt: u32 = 0;

        'session: loop {
            if *stop_rx.borrow() {
                break;
            }

            attempt += 1;
            set_state(ConnectionState::Connecting);

            let established = tokio::select! {
                biased;
                _ = stopped(&mut stop_rx) => {
                    close(&mut transport, None).await;
                    break 'session;
                }
                result = establish(&mut transport, &config) => result,
            };

            match established {
                Ok(()) => {
                    info!("Subscribed to '{}' (attempt {})", config.topic, attempt);
                    attempt = 0;
                    set_state(ConnectionState::Subscribed);

                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = stopped(&mut stop_rx) => {
                                close(&mut transport, Some(&config.topic)).await;
                                break 'session;
                            }
                            next = transport.next_message() => next,
                        };

                        match next {
                            Ok(message) => dispatch(handler.as_ref(), message).await,
                            Err(e) => {
                                warn!("Bus connection lost: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to broker (attempt {}): {}", attempt, e);
                }
            }

            set_state(ConnectionState::Reconnecting);
            let delay = config.policy.next_delay();
            debug!("Reconnecting in {:?}", delay);

            tokio::select! {
                biased;
                _ = stopped(&mut stop_rx) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        set_state(ConnectionState::Disconnected);
        info!("Bus session stopped");
    }
}

async fn establish<T: BusTransport>(
    transport: &mut T,
    config: &SessionConfig,
) -> Result<(), TransportError> {
    transport.connect().await?;
    transport.subscribe(&config.topic, config.qos).await
}

async fn dispatch<H: MessageHandler>(handler: &H, message: BusMessage) {
    let topic = message.topic.clone();
    if AssertUnwindSafe(handler.handle(message))
        .catch_unwind()
        .await
        .is_err()
    {
        error!("Message handler panicked on message from '{}'", topic);
        handler.on_panic();
    }
}

/// Best-effort shutdown: unsubscribe (when subscribed), then disconnect.
async fn close<T: BusTransport>(transport: &mut T, topic: Option<&str>) {
    if let Some(topic) = topic {
        match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, transport.unsubscribe(topic)).await {
            Ok(Ok(())) => debug!("Unsubscribed from '{}'", topic),
            Ok(Err(e)) => warn!("Failed to unsubscribe from '{}': {}", topic, e),
            Err(_) => warn!("Timed out unsubscribing from '{}'", topic),
        }
    }

    match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, transport.disconnect()).await {
        Ok(Ok(())) => debug!("Disconnected from broker"),
        Ok(Err(e)) => debug!("Error disconnecting from broker: {}", e),
        Err(_) => warn!("Timed out disconnecting from broker"),
    }
}

/// Parse an MQTT broker URL into (host, port, use_tls).
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool), String> {
    let (scheme, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
        ("mqtt", stripped)
    } else if let Some(stripped) = url.strip_prefix("mqtts://") {
        ("mqtts", stripped)
    } else {
        return Err("Invalid scheme: URL must start with mqtt:// or mqtts://".to_string());
    };

    let use_tls = scheme == "mqtts";
    let default_port = if use_tls { 8883 } else { 1883 };
    let rest = rest.trim_end_matches('/');

    // Parse host:port
    let (host, port) = if let Some((h, p)) = rest.rsplit_once(':') {
        let port = p
            .parse::<u16>()
            .map_err(|_| format!("Invalid port: {}", p))?;
        (h.to_string(), port)
    } else {
        (rest.to_string(), default_port)
    };

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    Ok((host, port, use_tls))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|e| TransportError::Credentials {
        path: path.to_path_buf(),
        source: e,
    })
}

/// [`BusTransport`] backed by a `rumqttc` client and event loop.
///
/// Every [`connect`](BusTransport::connect) builds a new client, so no state
/// leaks from a failed connection into the next one.
pub struct MqttTransport {
    options: MqttOptions,
    connection: Option<(AsyncClient, EventLoop)>,
    pending: VecDeque<BusMessage>,
}

impl MqttTransport {
    /// Build a transport from validated configuration.
    ///
    /// Certificate files are read once, here.
    pub fn new(config: &MqttConfig, auth: &AuthMode) -> Result<Self, TransportError> {
        let (host, port, use_tls) =
            parse_broker_url(&config.broker).map_err(TransportError::InvalidUrl)?;

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));

        match auth {
            AuthMode::Cert {
                ca_file,
                cert_file,
                key_file,
            } => {
                let tls = TlsConfiguration::Simple {
                    ca: read_pem(ca_file)?,
                    alpn: None,
                    client_auth: Some((read_pem(cert_file)?, read_pem(key_file)?)),
                };
                options.set_transport(Transport::tls_with_config(tls));
            }
            AuthMode::ApiKey { key } => {
                options.set_credentials(key, "");
                if use_tls {
                    options.set_transport(Transport::tls_with_default_config());
                }
            }
            AuthMode::UserPass { username, password } => {
                options.set_credentials(username, password);
                if use_tls {
                    options.set_transport(Transport::tls_with_default_config());
                }
            }
        }

        Ok(Self {
            options,
            connection: None,
            pending: VecDeque::new(),
        })
    }

    fn connection(&mut self) -> Result<&mut (AsyncClient, EventLoop), TransportError> {
        self.connection.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Poll the event loop until `done` accepts a packet.
    ///
    /// Publishes that arrive in the meantime are queued for
    /// [`next_message`](BusTransport::next_message).
    async fn poll_until<F>(&mut self, mut done: F) -> Result<(), TransportError>
    where
        F: FnMut(&Packet) -> Option<Result<(), TransportError>>,
    {
        let (_, eventloop) = self
            .connection
            .as_mut()
            .ok_or(TransportError::NotConnected)?;
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    self.pending
                        .push_back(BusMessage::new(publish.topic, publish.payload));
                }
                Event::Incoming(packet) => {
                    if let Some(result) = done(&packet) {
                        return result;
                    }
                }
                Event::Outgoing(_) => {}
            }
        }
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        self.connection = Some(AsyncClient::new(self.options.clone(), REQUEST_CAPACITY));

        // rumqttc surfaces a refused CONNACK as a ConnectionError.
        self.poll_until(|packet| match packet {
            Packet::ConnAck(ack) => {
                info!("MQTT connected: {:?}", ack.code);
                Some(Ok(()))
            }
            _ => None,
        })
        .await
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.connection()?.0.subscribe(topic, qos).await?;
        self.poll_until(|packet| match packet {
            Packet::SubAck(ack) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Some(Err(TransportError::Rejected(
                        "subscription refused".to_string(),
                    )))
                } else {
                    Some(Ok(()))
                }
            }
            _ => None,
        })
        .await
    }

    async fn next_message(&mut self) -> Result<BusMessage, TransportError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }

        let (_, eventloop) = self.connection()?;
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(BusMessage::new(publish.topic, publish.payload));
                }
                Event::Incoming(Packet::PingResp) => {
                    debug!("MQTT ping response received");
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(TransportError::Rejected(
                        "broker closed the session".to_string(),
                    ));
                }
                _ => {}
            }
        }
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.connection()?.0.unsubscribe(topic).await?;
        self.poll_until(|packet| matches!(packet, Packet::UnsubAck(_)).then_some(Ok(())))
            .await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some((client, mut eventloop)) = self.connection.take() else {
            return Ok(());
        };
        client.disconnect().await?;

        // Drive the loop until the DISCONNECT packet has been written.
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
