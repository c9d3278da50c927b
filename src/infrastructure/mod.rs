//! Infrastructure Layer
//!
//! Cross-cutting concerns: time, durability and process lifecycle.

pub mod clock;
pub mod oplog;
pub mod shutdown;

pub use clock::{wall_nanos, Clock, ManualClock, SystemClock};
pub use oplog::{Operation, OperationLog, SqliteOperationLog};
pub use shutdown::shutdown_signal;
