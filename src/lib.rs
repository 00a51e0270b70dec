//! VenomQueue - Shared memory request/response queues
//!
//! Processes written in different languages exchange function calls through
//! one named shared memory segment holding two keyed queues.
//!
//! # Architecture
//!
//! - **Input queue**: callers write requests `{"function", "uuid", "args"}`
//! - **Output queue**: workers write responses `{"uuid", "result"}` under the
//!   request's key
//! - **Segment lock**: one cross-process lock guards both queues, so a
//!   response can be committed and its request removed in one step
//!
//! ```no_run
//! use venom_queue::{Client, Segment, SegmentConfig};
//! use serde_json::json;
//!
//! let segment = Segment::create("calc", &SegmentConfig::default())?;
//! let client = Client::new(&segment);
//! let sum = client.call("add", json!({"a": 10, "b": 4}))?;
//! # Ok::<(), venom_queue::QueueError>(())
//! ```

pub mod bindings;
pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod poll;
pub mod protocol;
pub mod queue;
pub mod segment;
pub mod shm;
pub mod table;
pub mod worker;

pub use client::{CallState, Client, PendingCall};
pub use config::{ConfigError, PollConfig, RelayConfig, SegmentConfig};
pub use error::{QueueError, Result};
pub use poll::{Budget, Poller};
pub use protocol::{Request, Response};
pub use queue::{Direction, QueueManager};
pub use segment::{ReconcileReport, Segment, SegmentStats};
pub use table::{Entry, EntryState, MAX_KEY_LEN};
pub use worker::{Handler, HandlerError, Outcome, Worker, WorkerStats};
