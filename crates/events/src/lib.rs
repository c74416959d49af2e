//! Notification bus: broadcast, fire-and-forget messages from the pipeline.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{EventBus, NotificationPublisher, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notification::{MonitorUpdate, MonitorUpdateKind, Notification, SyncComplete};
