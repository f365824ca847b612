//! Governed mutation kernel: gate, resolve, audit and execute remote commands
//! against a single-threaded scene host.

pub mod audit;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod host;
pub mod kernel;
pub mod registry;
pub mod session;
pub mod sim;
pub mod telemetry;
pub mod transaction;
pub mod util;

pub use audit::{AuditEntry, AuditLedger, AuditStore, BreakKind, ChainBreak, LedgerError, verify_chain};
pub use command::{Capability, Command, Recipe, WireCommand};
pub use config::KernelConfig;
pub use dispatch::{HandlerContext, HandlerError, HandlerTable, OperationClass, normalize_action};
pub use error::KernelError;
pub use gate::{CapabilityGate, SanityLimits};
pub use host::{HostError, HostStability, ObjectHandle, SceneHost, UndoGroupId};
pub use kernel::{BridgeState, Builtin, HealthReport, Kernel, KernelBuilder, StateObserver};
pub use registry::{Fingerprint, IdentityRegistry, Registration, RegistryEntry, RegistryError};
pub use session::{Session, SessionError};
pub use transaction::{TransactionCoordinator, TransactionGroup};
