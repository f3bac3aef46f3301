//! Tag operations: single reads and writes, batches, and composite member
//! writes.
//!
//! The [`Executor`] shares one [`Session`] between the foreground caller and
//! the subscription engine. The session lock is held for exactly one
//! request/response exchange, and acquiring it is bounded by the session
//! timeout.
//!
//! # Writes
//!
//! A write must know the tag's native type before anything is sent, both to
//! check the value and to put the right type descriptor in the request. The
//! type comes from a cache filled by every successful read; for a tag that
//! has never been read, the executor reads it first.
//!
//! Writing a member of a structure tag (`Motor.Speed`) reads the whole root
//! tag, replaces the member, and writes the root back. The session lock is
//! released between the read and the write, so a concurrent writer to the
//! same structure may be overwritten.
//!
//! # Bits
//!
//! `Flags.3` reads the integer `Flags` and reports bit 3 as a `Bool`.
//! Writing it reads the root tag, sets or clears the bit in an integer of
//! the same width, and writes the root back, with the same caveat as member
//! writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::address::TagAddress;
use crate::codec::{self, TypeRegistry, WireType};
use crate::command::{ReadTagCommand, WriteTagCommand, SERVICE_READ_TAG, SERVICE_WRITE_TAG};
use crate::error::{DecodeError, OperationError, Result, TransportError};
use crate::response::CipResponse;
use crate::session::Session;
use crate::value::{CompositeType, DataType, TaggedValue};

/// Read access to tags, as used by the subscription engine.
#[async_trait]
pub trait TagReader: Send + Sync {
    /// Reads one tag.
    async fn read_tag(&self, address: &str) -> Result<TaggedValue>;

    /// Sends a keepalive if nothing was sent for `idle`.
    async fn keepalive(&self, _idle: Duration) -> Result<()> {
        Ok(())
    }

    /// Returns false once the underlying session is lost.
    fn is_connected(&self) -> bool;
}

/// Counts of completed operations and exchange latency.
///
/// Reads include subscription polls. Reads made internally to learn a tag's
/// type or to fetch a structure for a member write count as exchanges only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OperationStats {
    /// Reads that returned a value.
    pub reads_succeeded: u64,
    /// Reads that returned an error.
    pub reads_failed: u64,
    /// Writes the controller accepted.
    pub writes_succeeded: u64,
    /// Writes that returned an error.
    pub writes_failed: u64,
    /// Request/response exchanges attempted.
    pub exchanges: u64,
    /// Sum of exchange round-trip times, lock wait included.
    pub total_latency: Duration,
    /// Slowest exchange.
    pub max_latency: Duration,
}

impl OperationStats {
    /// Mean exchange round-trip time, if any exchange was made.
    pub fn average_latency(&self) -> Option<Duration> {
        let nanos = self.total_latency.as_nanos().checked_div(u128::from(self.exchanges))?;
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

#[derive(Debug, Default)]
struct Counters {
    reads_succeeded: AtomicU64,
    reads_failed: AtomicU64,
    writes_succeeded: AtomicU64,
    writes_failed: AtomicU64,
    exchanges: AtomicU64,
    latency_micros: AtomicU64,
    max_latency_micros: AtomicU64,
}

impl Counters {
    fn count(&self, succeeded: &AtomicU64, failed: &AtomicU64, ok: bool) {
        let counter = if ok { succeeded } else { failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self, ok: bool) {
        self.count(&self.reads_succeeded, &self.reads_failed, ok);
    }

    fn write(&self, ok: bool) {
        self.count(&self.writes_succeeded, &self.writes_failed, ok);
    }

    fn exchange(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_micros.fetch_max(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> OperationStats {
        OperationStats {
            reads_succeeded: self.reads_succeeded.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            writes_succeeded: self.writes_succeeded.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            exchanges: self.exchanges.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
            max_latency: Duration::from_micros(self.max_latency_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Executes tag operations over a shared session.
pub struct Executor {
    session: Arc<Mutex<Session>>,
    connected: AtomicBool,
    lock_timeout: Duration,
    registry: RwLock<TypeRegistry>,
    tag_types: StdMutex<HashMap<TagAddress, DataType>>,
    counters: Counters,
}

impl Executor {
    /// Creates an executor for an open session.
    pub fn new(session: Session) -> Self {
        let connected = AtomicBool::new(session.is_connected());
        let lock_timeout = session.timeout();
        Self {
            session: Arc::new(Mutex::new(session)),
            connected,
            lock_timeout,
            registry: RwLock::new(TypeRegistry::new()),
            tag_types: StdMutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Operation counts since the executor was created.
    pub fn stats(&self) -> OperationStats {
        self.counters.snapshot()
    }

    /// Returns false once the session has been lost or closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Registers a structure definition used to decode structure replies.
    pub fn register_type(&self, definition: CompositeType) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(definition);
    }

    /// Returns the cached native type of `address`, if it has been read.
    pub fn cached_type(&self, address: &str) -> Option<DataType> {
        let address = TagAddress::parse(address).ok()?;
        self.tag_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    /// Closes the session. Operations fail with `SessionLost` afterwards.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        session.close().await;
        self.connected.store(false, Ordering::Release);
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        tokio::time::timeout(self.lock_timeout, self.session.lock())
            .await
            .map_err(|_| TransportError::Timeout(self.lock_timeout).into())
    }

    /// One request/response exchange under the session lock.
    async fn exchange(&self, request: &[u8]) -> Result<CipResponse> {
        let started = Instant::now();
        let reply = async {
            let mut session = self.lock().await?;
            let reply = session.send_request(request).await;
            self.connected.store(session.is_connected(), Ordering::Release);
            Ok::<_, OperationError>(reply?)
        }
        .await;
        self.counters.exchange(started.elapsed());
        Ok(CipResponse::from_bytes(&reply?)?)
    }

    /// Reads a tag.
    ///
    /// # Errors
    ///
    /// - `AddressNotFound` for a malformed address or one the controller
    ///   does not know
    /// - `SessionLost` if the session is disconnected
    /// - `Transport`, `Decode` or `Rejected` for failures of the exchange
    pub async fn read(&self, address: &str) -> Result<TaggedValue> {
        let result = match TagAddress::parse(address) {
            Ok(address) => match address.bit() {
                Some(bit) => self.read_bit(&address, bit).await,
                None => self.read_typed(&address).await.map(|(value, _)| value),
            },
            Err(e) => Err(e),
        };
        self.counters.read(result.is_ok());
        result
    }

    async fn read_typed(&self, address: &TagAddress) -> Result<(TaggedValue, DataType)> {
        let request = ReadTagCommand::new(address).to_bytes();
        let response = self.exchange(&request).await?;
        response.check_service(SERVICE_READ_TAG)?;
        response.check_status(&address.to_string())?;

        let (wire, used) = WireType::parse(&response.data)?;
        let data_type = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(wire)?;
        let value = codec::decode(&response.data[used..], &data_type)?;
        debug!("read {} = {}", address, value);

        self.tag_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), data_type.clone());
        Ok((value, data_type))
    }

    /// Writes a tag or a structure member.
    ///
    /// The value must have exactly the tag's native type; nothing is sent
    /// otherwise.
    ///
    /// # Errors
    ///
    /// - `Decode(TypeMismatch)` if the value's type differs from the tag's
    /// - `Decode(InvalidValue)` for text longer than a Logix STRING holds
    /// - `AddressNotFound` for a bit the host integer does not have
    /// - any error [`read`](Self::read) can return, when the type has to be
    ///   learned first or a member is written
    pub async fn write(&self, address: &str, value: TaggedValue) -> Result<()> {
        let result = match TagAddress::parse(address) {
            Ok(address) => match address.bit() {
                Some(bit) => self.write_bit(&address, bit, value).await,
                None if address.is_member() => self.write_member(&address, value).await,
                None => self.write_tag(&address, value).await,
            },
            Err(e) => Err(e),
        };
        self.counters.write(result.is_ok());
        result
    }

    async fn native_type(&self, address: &TagAddress) -> Result<DataType> {
        let cached = self
            .tag_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned();
        match cached {
            Some(data_type) => Ok(data_type),
            None => Ok(self.read_typed(address).await?.1),
        }
    }

    async fn write_tag(&self, address: &TagAddress, value: TaggedValue) -> Result<()> {
        let native = self.native_type(address).await?;
        codec::check_assignable(&value, &native)?;
        let data = codec::encode(&value)?;

        let request = WriteTagCommand::new(address, WireType::of(&native), data).to_bytes();
        let response = self.exchange(&request).await?;
        response.check_service(SERVICE_WRITE_TAG)?;
        if let Err(err) = response.check_status(&address.to_string()) {
            if matches!(err, OperationError::Decode(DecodeError::TypeMismatch { .. })) {
                // The cached type is stale.
                self.tag_types
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(address);
            }
            return Err(err);
        }
        debug!("wrote {} = {}", address, value);
        Ok(())
    }

    async fn write_member(&self, address: &TagAddress, value: TaggedValue) -> Result<()> {
        let root = address.root();
        let (mut root_value, root_type) = self.read_typed(&root).await?;
        codec::check_assignable(&value, address.resolve_type(&root_type)?)?;
        *address.resolve_mut(&mut root_value)? = value;
        self.write_tag(&root, root_value).await
    }

    async fn read_bit(&self, address: &TagAddress, bit: u8) -> Result<TaggedValue> {
        let (host, _) = self.read_typed(&address.host()).await?;
        bit_of(address, &host, bit).map(TaggedValue::Bool)
    }

    async fn write_bit(&self, address: &TagAddress, bit: u8, value: TaggedValue) -> Result<()> {
        let on = match value {
            TaggedValue::Bool(on) => on,
            other => return Err(DecodeError::type_mismatch("BOOL", other.type_name()).into()),
        };
        let root = address.root();
        let (mut root_value, _) = self.read_typed(&root).await?;
        let host = address.resolve_mut(&mut root_value)?;
        let updated = match *host {
            TaggedValue::SignedInt(int) => int.with_bit(bit, on),
            _ => None,
        }
        .ok_or_else(|| no_bit(address, host, bit))?;
        *host = TaggedValue::SignedInt(updated);
        self.write_tag(&root, root_value).await
    }

    /// Reads several tags in order.
    ///
    /// The result has one entry per address, in the same order. A failed
    /// item does not affect the others, except that once the session is
    /// lost every remaining item fails with `SessionLost` without being
    /// attempted.
    pub async fn read_batch<I, S>(&self, addresses: I) -> Vec<Result<TaggedValue>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = Vec::new();
        for address in addresses {
            let result = if self.is_connected() {
                self.read(address.as_ref()).await
            } else {
                self.counters.read(false);
                Err(OperationError::SessionLost)
            };
            results.push(result);
        }
        results
    }

    /// Writes several tags in order. Same per-item semantics as
    /// [`read_batch`](Self::read_batch).
    pub async fn write_batch<I, S>(&self, items: I) -> Vec<Result<()>>
    where
        I: IntoIterator<Item = (S, TaggedValue)>,
        S: AsRef<str>,
    {
        let mut results = Vec::new();
        for (address, value) in items {
            let result = if self.is_connected() {
                self.write(address.as_ref(), value).await
            } else {
                self.counters.write(false);
                Err(OperationError::SessionLost)
            };
            results.push(result);
        }
        results
    }

    /// Sends a keepalive if the session has been idle for at least `idle`.
    pub async fn keepalive_if_idle(&self, idle: Duration) -> Result<()> {
        let mut session = self.lock().await?;
        if session.idle_for() < idle {
            return Ok(());
        }
        let result = session.keepalive().await;
        self.connected.store(session.is_connected(), Ordering::Release);
        Ok(result?)
    }
}

fn bit_of(address: &TagAddress, host: &TaggedValue, bit: u8) -> Result<bool> {
    match host {
        TaggedValue::SignedInt(int) => int.bit(bit),
        _ => None,
    }
    .ok_or_else(|| no_bit(address, host, bit))
}

fn no_bit(address: &TagAddress, host: &TaggedValue, bit: u8) -> OperationError {
    OperationError::address_not_found(
        address.to_string(),
        format!("{} has no bit {}", host.type_name(), bit),
    )
}

#[async_trait]
impl TagReader for Executor {
    async fn read_tag(&self, address: &str) -> Result<TaggedValue> {
        self.read(address).await
    }

    async fn keepalive(&self, idle: Duration) -> Result<()> {
        self.keepalive_if_idle(idle).await
    }

    fn is_connected(&self) -> bool {
        Executor::is_connected(self)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("connected", &self.is_connected())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::send_rr_data;
    use crate::header::{
        frame, EncapsulationHeader, COMMAND_REGISTER_SESSION, COMMAND_SEND_RR_DATA,
        ENCAPSULATION_HEADER_SIZE,
    };
    use crate::response::extract_cip;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const HANDLE: u32 = 0x0102_0304;

    /// Answers every Read Tag with the DINT 0b1010 until the client leaves.
    async fn spawn_controller() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let mut head = [0u8; ENCAPSULATION_HEADER_SIZE];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                let header = EncapsulationHeader::from_bytes(&head).unwrap();
                let mut data = vec![0u8; usize::from(header.length)];
                stream.read_exact(&mut data).await.unwrap();

                let reply = match header.command {
                    COMMAND_REGISTER_SESSION => data,
                    COMMAND_SEND_RR_DATA => {
                        assert_eq!(extract_cip(&data).unwrap()[0], SERVICE_READ_TAG);
                        send_rr_data(&[0xCC, 0, 0, 0, 0xC4, 0x00, 0x0A, 0, 0, 0])
                    }
                    _ => return,
                };
                let out = frame(header.command, HANDLE, header.sender_context, &reply);
                stream.write_all(&out).await.unwrap();
            }
        });
        addr
    }

    async fn executor(timeout: Duration) -> Executor {
        let addr = spawn_controller().await;
        Executor::new(Session::open(&addr, timeout).await.unwrap())
    }

    #[tokio::test]
    async fn test_lock_wait_is_bounded() {
        let executor = executor(Duration::from_millis(100)).await;

        let held = executor.session.lock().await;
        let started = Instant::now();
        let err = executor.read("Counter").await.unwrap_err();
        assert_eq!(
            err,
            OperationError::Transport(TransportError::Timeout(Duration::from_millis(100)))
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(executor.is_connected());
        drop(held);

        assert_eq!(executor.read("Counter").await, Ok(TaggedValue::from(10i32)));
        let stats = executor.stats();
        assert_eq!(stats.reads_failed, 1);
        assert_eq!(stats.reads_succeeded, 1);
        assert_eq!(stats.exchanges, 2);
        assert!(stats.max_latency >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_read_bits_of_integer() {
        let executor = executor(Duration::from_secs(2)).await;

        assert_eq!(executor.read("Counter.1").await, Ok(TaggedValue::Bool(true)));
        assert_eq!(executor.read("Counter.2").await, Ok(TaggedValue::Bool(false)));
        assert_eq!(executor.read("Counter.31").await, Ok(TaggedValue::Bool(false)));
        assert!(matches!(
            executor.read("Counter.32").await,
            Err(OperationError::AddressNotFound { .. })
        ));
        // the host integer's type is what gets cached
        assert_eq!(
            executor.cached_type("Counter"),
            Some(DataType::SignedInt(crate::value::IntWidth::W32))
        );
    }

    #[tokio::test]
    async fn test_bit_write_needs_bool() {
        let executor = executor(Duration::from_secs(2)).await;

        let err = executor.write("Counter.1", TaggedValue::from(1i32)).await;
        assert!(matches!(
            err,
            Err(OperationError::Decode(DecodeError::TypeMismatch { .. }))
        ));
        let stats = executor.stats();
        assert_eq!(stats.writes_failed, 1);
        assert_eq!(stats.exchanges, 0);
    }

    #[test]
    fn test_average_latency() {
        let stats = OperationStats {
            exchanges: 4,
            total_latency: Duration::from_millis(10),
            ..OperationStats::default()
        };
        assert_eq!(stats.average_latency(), Some(Duration::from_micros(2500)));
        assert_eq!(OperationStats::default().average_latency(), None);
    }
}
