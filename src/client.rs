//! High-level EtherNet/IP client.
//!
//! [`Client`] is the single entry point. It owns the session, the executor
//! that runs tag operations over it, and the background subscription engine.
//!
//! # Example
//!
//! ```no_run
//! use enip::{Client, ClientConfig, TaggedValue};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("192.168.1.10").with_timeout(Duration::from_secs(2));
//! let mut client = Client::connect(config).await?;
//!
//! let speed = client.read("Motor.Speed").await?;
//! client.write("Setpoint", TaggedValue::from(1500i32)).await?;
//!
//! let results = client.read_batch(["Counter", "Program:Main.State"]).await;
//! assert_eq!(results.len(), 2);
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Lifetime
//!
//! The client never reconnects on its own. After the link is lost every
//! operation fails with [`OperationError::SessionLost`](crate::OperationError)
//! until [`Client::reconnect`] is called. Reconnecting starts with no
//! subscriptions.
//!
//! # Ordering
//!
//! Operations from one caller complete in the order they were awaited. The
//! subscription engine polls concurrently, so a poll of a tag racing a write
//! of the same tag may observe either the old or the new value.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::command::RoutePath;
use crate::error::{ConnectionError, Result};
use crate::executor::{Executor, OperationStats, TagReader};
use crate::session::{with_default_port, Session};
use crate::subscription::{Dispatch, EngineHandle, SubscriptionHandle, UpdateEvent};
use crate::transport::{DEFAULT_ENIP_PORT, DEFAULT_TIMEOUT};
use crate::value::{CompositeType, TaggedValue};

/// Default keepalive interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// Default capacity of the [`Client::updates`] channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for connecting a client.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Controller host name or IP address.
    pub host: String,
    /// Controller TCP port.
    #[cfg_attr(feature = "serde", serde(default = "default_port"))]
    pub port: u16,
    /// Timeout for connecting and for each request.
    #[cfg_attr(feature = "serde", serde(default = "default_timeout"))]
    pub timeout: Duration,
    /// Keepalive interval, or `None` to disable keepalives.
    #[cfg_attr(feature = "serde", serde(default = "default_keepalive"))]
    pub keepalive: Option<Duration>,
    /// Route to a controller in a chassis, sent through Unconnected Send.
    #[cfg_attr(feature = "serde", serde(default))]
    pub route: Option<RoutePath>,
    /// Capacity of the broadcast channel returned by [`Client::updates`].
    #[cfg_attr(feature = "serde", serde(default = "default_event_capacity"))]
    pub event_capacity: usize,
}

#[cfg(feature = "serde")]
fn default_port() -> u16 {
    DEFAULT_ENIP_PORT
}

#[cfg(feature = "serde")]
fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

#[cfg(feature = "serde")]
fn default_keepalive() -> Option<Duration> {
    Some(DEFAULT_KEEPALIVE)
}

#[cfg(feature = "serde")]
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl ClientConfig {
    /// Creates a configuration for `address` (`host` or `host:port`).
    ///
    /// The port defaults to 44818.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::ClientConfig;
    ///
    /// let config = ClientConfig::new("192.168.1.10");
    /// assert_eq!(config.endpoint(), "192.168.1.10:44818");
    ///
    /// let config = ClientConfig::new("plc.local:2222");
    /// assert_eq!(config.port, 2222);
    /// ```
    pub fn new(address: impl AsRef<str>) -> Self {
        let endpoint = with_default_port(address.as_ref());
        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(DEFAULT_ENIP_PORT)),
            None => (endpoint.clone(), DEFAULT_ENIP_PORT),
        };
        Self {
            host,
            port,
            timeout: DEFAULT_TIMEOUT,
            keepalive: Some(DEFAULT_KEEPALIVE),
            route: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Sets the port (default 44818).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connect and request timeout (default 5 seconds).
    ///
    /// # Example
    ///
    /// ```
    /// use enip::ClientConfig;
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::new("10.0.0.5").with_timeout(Duration::from_millis(500));
    /// assert_eq!(config.timeout, Duration::from_millis(500));
    /// ```
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the keepalive interval (default 30 seconds).
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    /// Disables keepalives.
    pub fn without_keepalive(mut self) -> Self {
        self.keepalive = None;
        self
    }

    /// Routes requests to a controller in a chassis.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::{ClientConfig, RoutePath};
    ///
    /// // ControlLogix CPU in slot 2
    /// let config = ClientConfig::new("10.0.0.5").with_route(RoutePath::backplane(2));
    /// ```
    pub fn with_route(mut self, route: RoutePath) -> Self {
        self.route = Some(route);
        self
    }

    /// Sets the capacity of the update broadcast channel (default 256).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// `host:port` string used to connect.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Snapshot of a client's state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Status {
    /// Whether the session is connected.
    pub connected: bool,
    /// Controller address.
    pub remote_addr: SocketAddr,
    /// Number of registered subscriptions.
    pub active_subscriptions: usize,
    /// Operation counts and latency since the session was opened.
    pub operations: OperationStats,
}

/// Fans events out to the broadcast channel and the caller's dispatch.
struct ClientDispatch {
    updates: broadcast::Sender<UpdateEvent>,
    user: Option<Arc<dyn Dispatch>>,
}

impl Dispatch for ClientDispatch {
    fn dispatch(&self, event: UpdateEvent) {
        if let Some(user) = &self.user {
            user.dispatch(event.clone());
        }
        self.updates.dispatch(event);
    }
}

/// EtherNet/IP client for one controller.
///
/// Dropping the client aborts the subscription engine and closes the
/// connection without unregistering. Call [`disconnect`](Self::disconnect)
/// for an orderly shutdown.
pub struct Client {
    config: ClientConfig,
    executor: Arc<Executor>,
    engine: EngineHandle,
    updates: broadcast::Sender<UpdateEvent>,
    user_dispatch: Option<Arc<dyn Dispatch>>,
    types: Vec<CompositeType>,
    remote_addr: SocketAddr,
}

impl Client {
    /// Connects to the controller and starts the subscription engine.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the session cannot be opened.
    pub async fn connect(config: ClientConfig) -> std::result::Result<Self, ConnectionError> {
        Self::start(config, None).await
    }

    /// Like [`connect`](Self::connect), additionally delivering every update
    /// event to `dispatch`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use enip::{Client, ClientConfig, UpdateEvent};
    ///
    /// # async fn run() -> Result<(), enip::ConnectionError> {
    /// let client = Client::connect_with_dispatch(
    ///     ClientConfig::new("192.168.1.10"),
    ///     |event: UpdateEvent| println!("{} -> {:?}", event.address, event.value),
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect_with_dispatch<D: Dispatch>(
        config: ClientConfig,
        dispatch: D,
    ) -> std::result::Result<Self, ConnectionError> {
        Self::start(config, Some(Arc::new(dispatch))).await
    }

    async fn start(
        config: ClientConfig,
        user_dispatch: Option<Arc<dyn Dispatch>>,
    ) -> std::result::Result<Self, ConnectionError> {
        let (updates, _) = broadcast::channel(config.event_capacity.max(1));
        let (executor, engine, remote_addr) =
            Self::open(&config, &updates, user_dispatch.clone(), &[]).await?;

        Ok(Self {
            config,
            executor,
            engine,
            updates,
            user_dispatch,
            types: Vec::new(),
            remote_addr,
        })
    }

    async fn open(
        config: &ClientConfig,
        updates: &broadcast::Sender<UpdateEvent>,
        user_dispatch: Option<Arc<dyn Dispatch>>,
        types: &[CompositeType],
    ) -> std::result::Result<(Arc<Executor>, EngineHandle, SocketAddr), ConnectionError> {
        let session = Session::open(&config.endpoint(), config.timeout)
            .await?
            .with_route(config.route);
        let remote_addr = session.remote_addr();

        let executor = Arc::new(Executor::new(session));
        for definition in types {
            executor.register_type(definition.clone());
        }

        let dispatch = ClientDispatch {
            updates: updates.clone(),
            user: user_dispatch,
        };
        let reader: Arc<dyn TagReader> = executor.clone();
        let engine = EngineHandle::spawn(reader, dispatch, config.keepalive);

        info!("connected to {}", remote_addr);
        Ok((executor, engine, remote_addr))
    }

    /// Stops the subscription engine, waits for it to finish, then closes
    /// the session. Calling it again has no effect.
    pub async fn disconnect(&mut self) {
        self.engine.shutdown().await;
        if self.executor.is_connected() {
            self.executor.close().await;
            info!("disconnected from {}", self.remote_addr);
        }
    }

    /// Tears down the current connection and opens a new one with the same
    /// configuration.
    ///
    /// Registered structure types are kept; subscriptions are not.
    pub async fn reconnect(&mut self) -> std::result::Result<(), ConnectionError> {
        self.disconnect().await;
        let (executor, engine, remote_addr) = Self::open(
            &self.config,
            &self.updates,
            self.user_dispatch.clone(),
            &self.types,
        )
        .await?;
        self.executor = executor;
        self.engine = engine;
        self.remote_addr = remote_addr;
        info!("reconnected to {}", remote_addr);
        Ok(())
    }

    /// Reads a tag.
    pub async fn read(&self, address: &str) -> Result<TaggedValue> {
        self.executor.read(address).await
    }

    /// Writes a tag, structure member or integer bit. The value's type must
    /// equal the tag's native type exactly; a bit takes a `Bool`.
    pub async fn write(&self, address: &str, value: impl Into<TaggedValue>) -> Result<()> {
        self.executor.write(address, value.into()).await
    }

    /// Reads several tags; one result per address, in order.
    pub async fn read_batch<I, S>(&self, addresses: I) -> Vec<Result<TaggedValue>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.executor.read_batch(addresses).await
    }

    /// Writes several tags; one result per item, in order.
    pub async fn write_batch<I, S>(&self, items: I) -> Vec<Result<()>>
    where
        I: IntoIterator<Item = (S, TaggedValue)>,
        S: AsRef<str>,
    {
        self.executor.write_batch(items).await
    }

    /// Polls `address` every `interval` and reports changes of at least
    /// `change_threshold` (numeric tags) or any change (other tags).
    ///
    /// Subscribing to an address that is already subscribed replaces its
    /// interval and threshold and returns the existing handle.
    pub async fn subscribe(
        &self,
        address: &str,
        interval: Duration,
        change_threshold: f64,
    ) -> Result<SubscriptionHandle> {
        self.engine
            .subscribe(address, interval, change_threshold)
            .await
    }

    /// Removes a subscription. Unknown handles are ignored.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.engine.unsubscribe(handle).await
    }

    /// Returns a receiver for all update events.
    ///
    /// A receiver that falls more than the configured capacity behind loses
    /// the oldest events.
    pub fn updates(&self) -> broadcast::Receiver<UpdateEvent> {
        self.updates.subscribe()
    }

    /// Registers a structure definition so that reads of tags of that type
    /// decode to composite values.
    pub fn register_type(&mut self, definition: CompositeType) {
        self.executor.register_type(definition.clone());
        self.types.retain(|t| t.handle != definition.handle);
        self.types.push(definition);
    }

    /// Returns a snapshot of the connection state.
    pub fn status(&self) -> Status {
        Status {
            connected: self.executor.is_connected(),
            remote_addr: self.remote_addr,
            active_subscriptions: self.engine.active_subscriptions(),
            operations: self.executor.stats(),
        }
    }

    /// Returns the configuration the client was connected with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("remote_addr", &self.remote_addr)
            .field("executor", &self.executor)
            .field("engine", &self.engine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_new() {
        let config = ClientConfig::new("192.168.1.250");

        assert_eq!(config.host, "192.168.1.250");
        assert_eq!(config.port, DEFAULT_ENIP_PORT);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.keepalive, Some(DEFAULT_KEEPALIVE));
        assert_eq!(config.route, None);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn test_client_config_parses_port() {
        let config = ClientConfig::new("10.1.2.3:2222");
        assert_eq!(config.host, "10.1.2.3");
        assert_eq!(config.port, 2222);

        let config = ClientConfig::new("[::1]:44819");
        assert_eq!(config.host, "[::1]");
        assert_eq!(config.endpoint(), "[::1]:44819");
    }

    #[test]
    fn test_client_config_builders() {
        let config = ClientConfig::new("plc")
            .with_port(1000)
            .with_timeout(Duration::from_secs(1))
            .with_keepalive(Duration::from_secs(10))
            .with_route(RoutePath::backplane(3))
            .with_event_capacity(8);

        assert_eq!(config.endpoint(), "plc:1000");
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.keepalive, Some(Duration::from_secs(10)));
        assert_eq!(config.route, Some(RoutePath { port: 1, slot: 3 }));
        assert_eq!(config.event_capacity, 8);

        assert_eq!(config.without_keepalive().keepalive, None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Client::connect(ClientConfig::new(addr.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Refused { .. }));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_client_config_deserialize_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"host": "10.0.0.9"}"#).unwrap();
        assert_eq!(config.endpoint(), "10.0.0.9:44818");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.keepalive, Some(DEFAULT_KEEPALIVE));
    }
}
