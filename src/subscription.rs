//! Polling subscriptions with change detection.
//!
//! The subscription engine runs as one background task. It owns the registry
//! of subscriptions; callers change it only by sending commands through an
//! [`EngineHandle`]. On each wake the engine reads every subscription that is
//! due, decides whether the new value is worth reporting, and hands an
//! [`UpdateEvent`] to its [`Dispatch`].
//!
//! # Change detection
//!
//! | Situation | Dispatched? |
//! |-----------|-------------|
//! | First successful poll | always |
//! | Numeric value, same type | if `abs(new - last) >= threshold` |
//! | Bool, text or composite, same type | if `new != last` |
//! | Type changed | always |
//! | Read failed | always, as a `Bad` event |
//! | First successful poll after a failure | always |
//!
//! `last` is the last value that was dispatched, so slow drift below the
//! threshold is reported once it adds up. A threshold of 0 reports every poll
//! of a numeric tag.
//!
//! # Cadence
//!
//! Each subscription has its own due time. The engine sleeps until the
//! nearest due time (or the keepalive deadline) rather than ticking globally.
//! A poll that overruns its interval is not caught up; the next one is
//! scheduled one interval from now.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::address::TagAddress;
use crate::error::{OperationError, Result};
use crate::executor::TagReader;
use crate::session::deadline_after;
use crate::value::TaggedValue;

const COMMAND_CAPACITY: usize = 64;

/// Identifies a subscription. Stable across re-subscribes of the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Numeric value of the handle.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether an event carries a fresh value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Quality {
    /// The read succeeded.
    Good,
    /// The read failed; see [`UpdateEvent::error`].
    Bad,
}

/// A reported change (or failure) of a subscribed tag.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UpdateEvent {
    /// Subscription this event belongs to.
    pub handle: SubscriptionHandle,
    /// Tag address.
    pub address: String,
    /// New value, for `Good` events.
    pub value: Option<TaggedValue>,
    /// Event quality.
    pub quality: Quality,
    /// Read error, for `Bad` events.
    pub error: Option<OperationError>,
    /// When the poll completed.
    pub timestamp: SystemTime,
}

impl UpdateEvent {
    fn good(
        handle: SubscriptionHandle,
        address: &str,
        value: TaggedValue,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            handle,
            address: address.to_string(),
            value: Some(value),
            quality: Quality::Good,
            error: None,
            timestamp,
        }
    }

    fn bad(
        handle: SubscriptionHandle,
        address: &str,
        error: OperationError,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            handle,
            address: address.to_string(),
            value: None,
            quality: Quality::Bad,
            error: Some(error),
            timestamp,
        }
    }
}

/// Receives update events from the engine.
///
/// Implemented for closures, tokio mpsc senders and broadcast senders.
/// `dispatch` is called on the engine task and must not block.
pub trait Dispatch: Send + Sync + 'static {
    /// Delivers one event.
    fn dispatch(&self, event: UpdateEvent);
}

impl<F> Dispatch for F
where
    F: Fn(UpdateEvent) + Send + Sync + 'static,
{
    fn dispatch(&self, event: UpdateEvent) {
        self(event)
    }
}

impl Dispatch for mpsc::UnboundedSender<UpdateEvent> {
    fn dispatch(&self, event: UpdateEvent) {
        if self.send(event).is_err() {
            debug!("update receiver dropped");
        }
    }
}

impl Dispatch for mpsc::Sender<UpdateEvent> {
    fn dispatch(&self, event: UpdateEvent) {
        if let Err(e) = self.try_send(event) {
            warn!("dropping update event: {}", e);
        }
    }
}

impl Dispatch for broadcast::Sender<UpdateEvent> {
    fn dispatch(&self, event: UpdateEvent) {
        // No receivers is not an error.
        let _ = self.send(event);
    }
}

/// One polled tag.
#[derive(Debug)]
struct Subscription {
    handle: SubscriptionHandle,
    address: String,
    interval: Duration,
    threshold: f64,
    last: Option<TaggedValue>,
    last_polled: Option<SystemTime>,
    next_due: Instant,
}

impl Subscription {
    /// Records a poll that completed at `polled_at` and returns the event to
    /// dispatch, if any.
    fn observe(
        &mut self,
        result: Result<TaggedValue>,
        polled_at: SystemTime,
    ) -> Option<UpdateEvent> {
        let previous = self.last_polled.replace(polled_at);
        match result {
            Ok(value) => {
                let report = match &self.last {
                    None => true,
                    Some(last) => is_change(last, &value, self.threshold),
                };
                if !report {
                    return None;
                }
                self.last = Some(value.clone());
                Some(UpdateEvent::good(self.handle, &self.address, value, polled_at))
            }
            Err(error) => {
                warn!(
                    "poll of {} failed: {} (previous poll at {:?})",
                    self.address, error, previous
                );
                self.last = None;
                Some(UpdateEvent::bad(self.handle, &self.address, error, polled_at))
            }
        }
    }

    fn reschedule(&mut self) {
        let now = Instant::now();
        self.next_due = deadline_after(self.next_due, self.interval);
        if self.next_due <= now {
            self.next_due = deadline_after(now, self.interval);
        }
    }
}

/// Decides whether `new` differs enough from `last` to be reported.
fn is_change(last: &TaggedValue, new: &TaggedValue, threshold: f64) -> bool {
    use TaggedValue::{Float, SignedInt};

    let distance = match (last, new) {
        (SignedInt(a), SignedInt(b)) if a.width() == b.width() => {
            (i128::from(b.get()) - i128::from(a.get())).unsigned_abs() as f64
        }
        (Float(a), Float(b)) if a.width() == b.width() => (b.get() - a.get()).abs(),
        _ => return last != new,
    };
    distance >= threshold || distance.is_nan()
}

enum Command {
    Subscribe {
        address: String,
        interval: Duration,
        threshold: f64,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        reply: oneshot::Sender<()>,
    },
}

/// The engine task's state.
struct Engine<D> {
    reader: Arc<dyn TagReader>,
    dispatch: D,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    keepalive: Option<Duration>,
    registry: HashMap<SubscriptionHandle, Subscription>,
    active: Arc<AtomicUsize>,
    next_handle: u64,
}

impl<D: Dispatch> Engine<D> {
    async fn run(mut self) {
        info!("subscription engine started");
        let mut next_keepalive = self.keepalive.map(|k| deadline_after(Instant::now(), k));

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let wake = self
                .registry
                .values()
                .map(|s| s.next_due)
                .chain(next_keepalive)
                .min();
            let sleep = async move {
                match wake {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = sleep => {}
            }

            if !self.poll_due().await {
                break;
            }

            if let (Some(interval), Some(at)) = (self.keepalive, next_keepalive) {
                if Instant::now() >= at {
                    if let Err(e) = self.reader.keepalive(interval).await {
                        warn!("keepalive failed: {}", e);
                    }
                    next_keepalive = Some(deadline_after(Instant::now(), interval));
                }
            }
        }

        self.active.store(0, Ordering::Release);
        info!("subscription engine stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                address,
                interval,
                threshold,
                reply,
            } => {
                let now = Instant::now();
                let existing = self
                    .registry
                    .values_mut()
                    .find(|s| s.address == address);
                let handle = match existing {
                    Some(sub) => {
                        sub.interval = interval;
                        sub.threshold = threshold;
                        sub.next_due = sub.next_due.min(deadline_after(now, interval));
                        debug!("updated subscription {} to {}", sub.handle, address);
                        sub.handle
                    }
                    None => {
                        self.next_handle += 1;
                        let handle = SubscriptionHandle(self.next_handle);
                        self.registry.insert(
                            handle,
                            Subscription {
                                handle,
                                address: address.clone(),
                                interval,
                                threshold,
                                last: None,
                                last_polled: None,
                                next_due: now,
                            },
                        );
                        debug!("added subscription {} to {}", handle, address);
                        handle
                    }
                };
                self.active.store(self.registry.len(), Ordering::Release);
                let _ = reply.send(handle);
            }
            Command::Unsubscribe { handle, reply } => {
                if self.registry.remove(&handle).is_some() {
                    debug!("removed subscription {}", handle);
                }
                self.active.store(self.registry.len(), Ordering::Release);
                let _ = reply.send(());
            }
        }
    }

    /// Polls every due subscription. Returns false if shutdown was requested.
    async fn poll_due(&mut self) -> bool {
        let now = Instant::now();
        let mut due: Vec<(Instant, SubscriptionHandle)> = self
            .registry
            .values()
            .filter(|s| s.next_due <= now)
            .map(|s| (s.next_due, s.handle))
            .collect();
        due.sort();

        for (_, handle) in due {
            if *self.shutdown.borrow() {
                return false;
            }
            let Some(address) = self.registry.get(&handle).map(|s| s.address.clone()) else {
                continue;
            };
            let result = self.reader.read_tag(&address).await;
            let polled_at = SystemTime::now();
            let Some(sub) = self.registry.get_mut(&handle) else {
                continue;
            };
            sub.reschedule();
            if let Some(event) = sub.observe(result, polled_at) {
                debug!("dispatching {:?} update for {}", event.quality, event.address);
                self.dispatch.dispatch(event);
            }
        }
        true
    }
}

/// Control side of a running engine.
///
/// Dropping the handle aborts the engine task.
#[derive(Debug)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Spawns an engine polling through `reader` and reporting to `dispatch`.
    ///
    /// With `keepalive` set, the engine asks the reader to keep the session
    /// alive at that interval.
    pub fn spawn<D: Dispatch>(
        reader: Arc<dyn TagReader>,
        dispatch: D,
        keepalive: Option<Duration>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));

        let engine = Engine {
            reader,
            dispatch,
            commands: commands_rx,
            shutdown: shutdown_rx,
            keepalive,
            registry: HashMap::new(),
            active: Arc::clone(&active),
            next_handle: 0,
        };

        Self {
            commands: commands_tx,
            shutdown: shutdown_tx,
            active,
            task: Some(tokio::spawn(engine.run())),
        }
    }

    /// Subscribes to `address`, or updates the parameters of an existing
    /// subscription to the same address and returns its handle.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `interval` is zero or `change_threshold` is
    ///   negative or NaN
    /// - `AddressNotFound` if the address is malformed
    /// - `SessionLost` if the engine has stopped
    pub async fn subscribe(
        &self,
        address: &str,
        interval: Duration,
        change_threshold: f64,
    ) -> Result<SubscriptionHandle> {
        if interval.is_zero() {
            return Err(OperationError::invalid_argument(
                "interval",
                "must be greater than zero",
            ));
        }
        if change_threshold.is_nan() || change_threshold < 0.0 {
            return Err(OperationError::invalid_argument(
                "change_threshold",
                format!("must be a non-negative number, got {change_threshold}"),
            ));
        }
        let address = TagAddress::parse(address)?.to_string();

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                address,
                interval,
                threshold: change_threshold,
                reply,
            })
            .await
            .map_err(|_| OperationError::SessionLost)?;
        response.await.map_err(|_| OperationError::SessionLost)
    }

    /// Removes a subscription. Unknown handles are ignored, and so is a
    /// stopped engine.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Unsubscribe { handle, reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    /// Number of registered subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Returns true while the engine task is running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signals the engine to stop and waits for the task to end.
    ///
    /// A poll cycle in progress is abandoned before its next tag.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("subscription engine panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Subscribe { address, .. } => write!(f, "Subscribe({address})"),
            Command::Unsubscribe { handle, .. } => write!(f, "Unsubscribe({handle})"),
        }
    }
}
