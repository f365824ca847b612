//! Command intake for the scenegate kernel: a file mailbox and an HTTP
//! listener, both drained by a time-budgeted tick on the host's own thread.

pub mod config;
pub mod error;
pub mod http;
pub mod mailbox;
pub mod queue;
pub mod scheduler;
pub mod status;

pub use config::{BridgeConfig, HttpConfig};
pub use error::BridgeError;
pub use http::HttpListener;
pub use mailbox::{Inbound, Mailbox};
pub use queue::{PendingRequest, Reply, RequestQueue};
pub use scheduler::{Bridge, SharedBridge, TickOutcome};
pub use status::StatusSnapshot;
