pub mod bus;
pub mod event_log;

pub use bus::{EventBus, EventFilter, EventHandler, EventLogAppendError};
pub use event_log::{EventLogError, EventLogStore};
