//! Session lifecycle: registration, request exchange, keepalive, teardown.
//!
//! A [`Session`] owns one TCP connection and at most one session handle:
//!
//! ```text
//! Disconnected --open--> Connected(handle) --close | fatal error--> Disconnected
//! ```
//!
//! A session never reconnects by itself. Once it is `Disconnected`, every
//! request fails with [`TransportError::Disconnected`] until the owner opens a
//! new session.
//!
//! Fatal conditions are I/O errors, the peer closing the connection, a reply
//! that cannot be framed, and an "invalid session handle" encapsulation
//! status. A timeout or a malformed CPF/CIP payload inside a well-framed reply
//! fails only the current request.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::command::{send_rr_data, RoutePath, UnconnectedSend};
use crate::error::{encapsulation_status_description, ConnectionError, TransportError};
use crate::header::{
    frame, register_session_data, EncapsulationHeader, COMMAND_NOP, COMMAND_REGISTER_SESSION,
    COMMAND_SEND_RR_DATA, COMMAND_UNREGISTER_SESSION, STATUS_INVALID_SESSION,
};
use crate::response::extract_cip;
use crate::transport::{TcpTransport, DEFAULT_ENIP_PORT, MAX_ENCAPSULATION_LENGTH};

/// Deadline used when a timeout is too long to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No usable connection.
    Disconnected,
    /// Registered with the controller under this session handle.
    Connected(u32),
}

/// One registration with one controller.
pub struct Session {
    transport: Option<TcpTransport>,
    state: SessionState,
    remote_addr: SocketAddr,
    timeout: Duration,
    route: Option<RoutePath>,
    next_context: u64,
    last_activity: Instant,
}

impl Session {
    /// Connects to `address` (`host` or `host:port`, default port 44818) and
    /// registers a session.
    ///
    /// `timeout` bounds name resolution, the TCP connect, and the
    /// registration exchange, each separately.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidAddress` if the address cannot be resolved
    /// - `ConnectionError::Timeout` if any step exceeds `timeout`
    /// - `ConnectionError::Refused` if the TCP connection fails
    /// - `ConnectionError::ProtocolMismatch` if the peer does not answer with
    ///   a valid RegisterSession reply
    ///
    /// # Example
    ///
    /// ```no_run
    /// use enip::Session;
    /// use std::time::Duration;
    ///
    /// # async fn run() -> Result<(), enip::ConnectionError> {
    /// let mut session = Session::open("192.168.1.10", Duration::from_secs(5)).await?;
    /// assert!(session.is_connected());
    /// session.close().await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(address: &str, timeout: Duration) -> Result<Self, ConnectionError> {
        let remote_addr = resolve(address, timeout).await?;
        let connect = tokio::time::timeout(timeout, TcpTransport::connect(remote_addr));
        let mut transport = match connect.await {
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    address: remote_addr.to_string(),
                    timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(ConnectionError::refused(
                    remote_addr.to_string(),
                    e.to_string(),
                ))
            }
            Ok(Ok(transport)) => transport,
        };

        let handle = match tokio::time::timeout(timeout, register(&mut transport)).await {
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    address: remote_addr.to_string(),
                    timeout,
                })
            }
            Ok(result) => result?,
        };

        info!("registered session 0x{:08X} with {}", handle, remote_addr);

        Ok(Self {
            transport: Some(transport),
            state: SessionState::Connected(handle),
            remote_addr,
            timeout,
            route: None,
            next_context: 1,
            last_activity: Instant::now(),
        })
    }

    /// Routes every request through Unconnected Send along `route`.
    pub fn with_route(mut self, route: Option<RoutePath>) -> Self {
        self.route = route;
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true while the session is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    /// Session handle issued by the controller, if connected.
    pub fn session_handle(&self) -> Option<u32> {
        match self.state {
            SessionState::Connected(handle) => Some(handle),
            SessionState::Disconnected => None,
        }
    }

    /// Controller address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time since the last frame was sent.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn next_context(&mut self) -> u64 {
        let context = self.next_context;
        self.next_context = self.next_context.wrapping_add(1);
        context
    }

    /// Marks the session lost and drops the connection.
    fn fail(&mut self, reason: &str) {
        if self.is_connected() {
            warn!("session with {} lost: {}", self.remote_addr, reason);
        }
        self.state = SessionState::Disconnected;
        self.transport = None;
    }

    /// Sends one CIP request and returns the CIP reply.
    ///
    /// The request is wrapped in SendRRData, and in Unconnected Send when a
    /// route is configured. Replies carrying another request's sender
    /// context are discarded while waiting.
    ///
    /// # Errors
    ///
    /// - `TransportError::Disconnected` if the session is, or becomes,
    ///   disconnected
    /// - `TransportError::Timeout` if no matching reply arrives in time
    /// - `TransportError::Malformed` if the reply's CPF items are invalid or
    ///   the request is too large to send
    pub async fn send_request(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let handle = self.session_handle().ok_or(TransportError::Disconnected)?;

        let routed;
        let message = match self.route {
            Some(route) => {
                routed = UnconnectedSend::new(request, route, self.timeout)
                    .map_err(|e| TransportError::malformed(e.to_string()))?
                    .to_bytes();
                &routed[..]
            }
            None => request,
        };
        let data = send_rr_data(message);
        if data.len() > MAX_ENCAPSULATION_LENGTH {
            return Err(TransportError::malformed(format!(
                "request of {} bytes exceeds {MAX_ENCAPSULATION_LENGTH}",
                data.len()
            )));
        }

        let context = self.next_context();
        let bytes = frame(COMMAND_SEND_RR_DATA, handle, context, &data);
        let deadline = deadline_after(Instant::now(), self.timeout);
        let timeout_len = self.timeout;

        let Some(transport) = self.transport.as_mut() else {
            return Err(TransportError::Disconnected);
        };
        debug!("request ctx={} {} bytes", context, request.len());
        match timeout_at(deadline, transport.send(&bytes)).await {
            Ok(Ok(())) => self.last_activity = Instant::now(),
            Ok(Err(e)) => {
                self.fail(&e.to_string());
                return Err(TransportError::Disconnected);
            }
            Err(_) => {
                // A partially written frame leaves the stream unusable.
                self.fail("send timed out");
                return Err(TransportError::Timeout(timeout_len));
            }
        }

        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Err(TransportError::Disconnected);
            };
            let (header, data) = match timeout_at(deadline, transport.recv()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    self.fail(&e.to_string());
                    return Err(TransportError::Disconnected);
                }
                Err(_) => {
                    debug!("request ctx={} timed out after {:?}", context, timeout_len);
                    return Err(TransportError::Timeout(timeout_len));
                }
            };

            if header.status == STATUS_INVALID_SESSION {
                self.fail(encapsulation_status_description(header.status));
                return Err(TransportError::Disconnected);
            }
            if header.sender_context != context {
                warn!(
                    "discarding stale reply ctx={} while waiting for ctx={}",
                    header.sender_context, context
                );
                continue;
            }
            if header.command != COMMAND_SEND_RR_DATA {
                return Err(TransportError::malformed(format!(
                    "expected SendRRData reply, got command 0x{:04X}",
                    header.command
                )));
            }
            if header.status != 0 {
                return Err(TransportError::malformed(format!(
                    "encapsulation status 0x{:08X} ({})",
                    header.status,
                    encapsulation_status_description(header.status)
                )));
            }

            let reply = extract_cip(&data)?;
            debug!("reply ctx={} {} bytes", context, reply.len());
            return Ok(reply);
        }
    }

    /// Sends an encapsulation NOP to keep the connection alive.
    ///
    /// The controller does not answer a NOP. A failed send is fatal.
    pub async fn keepalive(&mut self) -> Result<(), TransportError> {
        let handle = self.session_handle().ok_or(TransportError::Disconnected)?;
        let context = self.next_context();
        let bytes = frame(COMMAND_NOP, handle, context, &[]);
        let timeout_len = self.timeout;
        let Some(transport) = self.transport.as_mut() else {
            return Err(TransportError::Disconnected);
        };

        match timeout(timeout_len, transport.send(&bytes)).await {
            Ok(Ok(())) => {
                self.last_activity = Instant::now();
                debug!("keepalive sent to {}", self.remote_addr);
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail(&e.to_string());
                Err(TransportError::Disconnected)
            }
            Err(_) => {
                self.fail("keepalive send timed out");
                Err(TransportError::Timeout(timeout_len))
            }
        }
    }

    /// Unregisters the session and releases the connection.
    ///
    /// UnRegisterSession is best-effort: failures are logged, never
    /// returned. The session is `Disconnected` afterwards in every case.
    pub async fn close(&mut self) {
        let handle = self.session_handle();
        let context = self.next_context();
        if let (Some(handle), Some(transport)) = (handle, self.transport.as_mut()) {
            let bytes = frame(COMMAND_UNREGISTER_SESSION, handle, context, &[]);
            match timeout(self.timeout, transport.send(&bytes)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("UnRegisterSession to {} failed: {}", self.remote_addr, e),
                Err(_) => warn!("UnRegisterSession to {} timed out", self.remote_addr),
            }
            if let Err(e) = transport.shutdown().await {
                debug!("shutdown of {} failed: {}", self.remote_addr, e);
            }
            info!("closed session 0x{:08X} with {}", handle, self.remote_addr);
        }
        self.state = SessionState::Disconnected;
        self.transport = None;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("route", &self.route)
            .finish()
    }
}

/// Returns `from + after`, or an instant decades away when that overflows.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Appends the default port when `address` has none.
pub(crate) fn with_default_port(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ if address.contains(':') => format!("[{address}]:{DEFAULT_ENIP_PORT}"),
        _ => format!("{address}:{DEFAULT_ENIP_PORT}"),
    }
}

async fn resolve(address: &str, timeout_len: Duration) -> Result<SocketAddr, ConnectionError> {
    let endpoint = with_default_port(address);
    let invalid = |reason: String| ConnectionError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    match timeout(timeout_len, tokio::net::lookup_host(endpoint)).await {
        Err(_) => Err(ConnectionError::Timeout {
            address: address.to_string(),
            timeout: timeout_len,
        }),
        Ok(Err(e)) => Err(invalid(e.to_string())),
        Ok(Ok(mut addrs)) => addrs
            .next()
            .ok_or_else(|| invalid("no addresses found".to_string())),
    }
}

async fn register(transport: &mut TcpTransport) -> Result<u32, ConnectionError> {
    let request = frame(COMMAND_REGISTER_SESSION, 0, 0, &register_session_data());
    let peer = transport.remote_addr().to_string();
    transport
        .send(&request)
        .await
        .map_err(|e| ConnectionError::refused(peer.clone(), e.to_string()))?;

    let (header, _) = transport
        .recv()
        .await
        .map_err(|e| ConnectionError::protocol_mismatch(format!("no RegisterSession reply: {e}")))?;
    check_register_reply(&header)
}

fn check_register_reply(header: &EncapsulationHeader) -> Result<u32, ConnectionError> {
    if header.command != COMMAND_REGISTER_SESSION {
        return Err(ConnectionError::protocol_mismatch(format!(
            "expected RegisterSession reply, got command 0x{:04X}",
            header.command
        )));
    }
    if header.status != 0 {
        return Err(ConnectionError::protocol_mismatch(format!(
            "RegisterSession rejected with status 0x{:08X} ({})",
            header.status,
            encapsulation_status_description(header.status)
        )));
    }
    if header.session_handle == 0 {
        return Err(ConnectionError::protocol_mismatch(
            "RegisterSession reply carries no session handle",
        ));
    }
    Ok(header.session_handle)
}
