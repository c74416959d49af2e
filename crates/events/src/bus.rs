//! Publish/subscribe abstraction (mechanics only).
//!
//! The bus distributes small notification messages from background workers to
//! whoever is listening (dashboards, SSE streams, other processes):
//!
//! - **Fire-and-forget**: publishers never wait for an acknowledgement
//! - **No replay**: a subscriber only sees messages published after it subscribed
//! - **No ordering guarantee** across publishers
//!
//! Nothing downstream of the bus is authoritative. Persisted rows are the source
//! of truth; notifications only tell observers that something changed.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::notification::Notification;

/// A subscription to a bus.
///
/// Each subscription receives a copy of every message published after it was
/// created (broadcast semantics). Designed for a single consuming thread.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(msg) => forward(msg),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub bus.
///
/// Implementations exist for in-process channels and Redis pub/sub. `publish`
/// may fail (lock poisoning, network); callers treat that as a lost
/// notification, never as a failure of the work that triggered it.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

/// Object-safe publishing side of a notification bus.
///
/// Workers only ever publish, and they need to hold "some bus" behind an
/// `Arc<dyn _>` regardless of its concrete error type.
pub trait NotificationPublisher: Send + Sync {
    fn publish_notification(&self, notification: Notification) -> Result<(), String>;
}

impl<B> NotificationPublisher for B
where
    B: EventBus<Notification>,
{
    fn publish_notification(&self, notification: Notification) -> Result<(), String> {
        self.publish(notification).map_err(|e| format!("{e:?}"))
    }
}
