//! The governed execution pipeline and the kernel lifecycle.

mod builtins;

pub use builtins::Builtin;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use serde_json::Value;

use crate::audit::fs::FsAuditStore;
use crate::audit::mem::MemAuditStore;
use crate::audit::{AuditLedger, LedgerError};
use crate::command::{Capability, Command};
use crate::config::KernelConfig;
use crate::dispatch::{HandlerContext, HandlerSpec, HandlerTable, OperationClass};
use crate::error::KernelError;
use crate::gate::CapabilityGate;
use crate::host::{ObjectHandle, SceneHost};
use crate::registry::IdentityRegistry;
use crate::session::Session;
use crate::telemetry::ErrorTelemetry;
use crate::transaction::TransactionCoordinator;
use crate::util::now_iso8601;

/// Audit capability recorded when a command reached a mutating handler
/// without declaring a mutating tag itself.
pub const IMPLICIT_CAPABILITY: &str = "write";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl BridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeState::Stopped => "Stopped",
            BridgeState::Starting => "Starting",
            BridgeState::Running => "Running",
            BridgeState::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory heartbeat published for out-of-process monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub state: BridgeState,
    pub editor_state: String,
    pub timestamp: String,
    pub error_count: u64,
}

/// Called on every lifecycle transition with the new state and the session
/// nonce, if a session is active.
pub type StateObserver = Box<dyn FnMut(BridgeState, Option<&str>)>;

enum Route<H: ?Sized> {
    Builtin(Builtin),
    Capability(HandlerSpec<H>),
}

impl<H: ?Sized> Route<H> {
    fn class(&self) -> OperationClass {
        match self {
            Route::Builtin(builtin) => builtin.class(),
            Route::Capability(spec) => spec.class,
        }
    }
}

pub struct KernelBuilder<H: SceneHost> {
    host: H,
    handlers: HandlerTable<H>,
    config: KernelConfig,
    observer: Option<StateObserver>,
}

impl<H: SceneHost> KernelBuilder<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            handlers: HandlerTable::new(),
            config: KernelConfig::default(),
            observer: None,
        }
    }

    pub fn handlers(mut self, handlers: HandlerTable<H>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: impl FnMut(BridgeState, Option<&str>) + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Builds a stopped kernel; call [`Kernel::start`] to accept mutations.
    pub fn build(self) -> Kernel<H> {
        Kernel {
            gate: CapabilityGate::new(self.config.sanity.clone()),
            telemetry: ErrorTelemetry::with_capacity(self.config.telemetry_capacity),
            config: self.config,
            host: self.host,
            handlers: self.handlers,
            registry: IdentityRegistry::in_memory(),
            ledger: None,
            session: None,
            transactions: TransactionCoordinator::new(),
            state: BridgeState::Stopped,
            observer: self.observer,
        }
    }
}

/// Single owner of every piece of mutable kernel state. Only the worker
/// thread holds one.
pub struct Kernel<H: SceneHost> {
    config: KernelConfig,
    host: H,
    handlers: HandlerTable<H>,
    gate: CapabilityGate,
    registry: IdentityRegistry,
    ledger: Option<AuditLedger>,
    session: Option<Session>,
    transactions: TransactionCoordinator,
    telemetry: ErrorTelemetry,
    state: BridgeState,
    observer: Option<StateObserver>,
}

impl<H: SceneHost> fmt::Debug for Kernel<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state)
            .field("handlers", &self.handlers.len())
            .field("registry_entries", &self.registry.len())
            .field("transaction", &self.transactions.current())
            .finish_non_exhaustive()
    }
}

impl<H: SceneHost> Kernel<H> {
    pub fn builder(host: H) -> KernelBuilder<H> {
        KernelBuilder::new(host)
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == BridgeState::Running
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> Option<&AuditLedger> {
        self.ledger.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.nonce.as_str())
    }

    pub fn transactions(&self) -> &TransactionCoordinator {
        &self.transactions
    }

    pub fn telemetry(&self) -> &ErrorTelemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// `Stopped -> Starting -> Running`. Loads the registry and session and
    /// opens the audit ledger; any failure leaves the kernel `Stopped`.
    pub fn start(&mut self) -> Result<(), KernelError> {
        if self.state != BridgeState::Stopped {
            log::debug!("start ignored; kernel is {}", self.state);
            return Ok(());
        }
        self.transition(BridgeState::Starting);
        match self.open_state() {
            Ok(()) => {
                self.transition(BridgeState::Running);
                Ok(())
            }
            Err(err) => {
                log::error!("kernel failed to start: {err}");
                self.ledger = None;
                self.session = None;
                self.transition(BridgeState::Stopped);
                Err(err)
            }
        }
    }

    fn open_state(&mut self) -> Result<(), KernelError> {
        if let Some(path) = &self.config.registry_path {
            self.registry = IdentityRegistry::open(path)?;
        }
        self.session = Some(match &self.config.session_path {
            Some(path) => Session::load_or_create(path)?,
            None => Session::fresh(),
        });
        self.ledger = Some(match &self.config.audit_log_path {
            Some(path) => AuditLedger::open(FsAuditStore::open(path)?)?,
            None => AuditLedger::open(MemAuditStore::new())?,
        });
        Ok(())
    }

    /// `Running -> Stopping -> Stopped`. Aborts an open transaction and
    /// flushes registry and session.
    pub fn shutdown(&mut self) {
        if self.state == BridgeState::Stopped {
            return;
        }
        self.transition(BridgeState::Stopping);
        if let Some(group) = self.transactions.abort(&mut self.host) {
            log::warn!("discarded open transaction '{}' on shutdown", group.name);
        }
        if let Err(err) = self.registry.save() {
            log::error!("failed to flush registry on shutdown: {err}");
        }
        if let (Some(session), Some(path)) = (&self.session, &self.config.session_path) {
            if let Err(err) = session.save(path) {
                log::error!("failed to flush session on shutdown: {err}");
            }
        }
        self.ledger = None;
        self.transition(BridgeState::Stopped);
        self.session = None;
    }

    /// Teardown followed by a fresh start, as after a host runtime reload.
    pub fn reinitialize(&mut self) -> Result<(), KernelError> {
        self.shutdown();
        self.start()
    }

    fn transition(&mut self, next: BridgeState) {
        log::info!("kernel {} -> {}", self.state, next);
        self.state = next;
        let nonce = self.session.as_ref().map(|session| session.nonce.as_str());
        if let Some(observer) = self.observer.as_mut() {
            observer(next, nonce);
        }
    }

    pub fn health(&self) -> HealthReport {
        let editor_state = match self.host.stability() {
            Ok(stability) => stability.editor_state().to_string(),
            Err(_) => "Unknown".to_string(),
        };
        HealthReport {
            state: self.state,
            editor_state,
            timestamp: now_iso8601(),
            error_count: self.telemetry.total(),
        }
    }

    /// Runs one command through the pipeline. Every failure comes back as a
    /// [`KernelError`] value and is recorded in telemetry.
    pub fn execute(&mut self, command: &Command) -> Result<Value, KernelError> {
        let result = self.execute_inner(command);
        if let Err(err) = &result {
            log::debug!("{} failed: {err}", command.action());
            self.telemetry
                .record(command.action(), err.code(), &err.to_string());
        }
        result
    }

    fn execute_inner(&mut self, command: &Command) -> Result<Value, KernelError> {
        let declared_mutation = command.capability().is_some_and(|cap| !cap.is_read());
        if declared_mutation {
            self.admit_mutation(command)?;
        }

        let route = self
            .route(command.action())
            .ok_or_else(|| KernelError::ToolNotFound(command.action().to_string()))?;

        let mutating = declared_mutation || !route.class().is_read();
        if mutating && !declared_mutation {
            if command.capability().is_some_and(Capability::is_read) {
                log::debug!("'{}' declared read but routes to a mutating handler", command.action());
            }
            self.admit_mutation(command)?;
        }
        if mutating {
            self.record_audit(command)?;
        }

        match route {
            Route::Builtin(builtin) => self.run_builtin(builtin, command),
            Route::Capability(spec) => self.run_capability(&spec, command),
        }
    }

    fn route(&self, action: &str) -> Option<Route<H>> {
        if let Some(builtin) = Builtin::lookup(action) {
            return Some(Route::Builtin(builtin));
        }
        self.handlers.get(action).cloned().map(Route::Capability)
    }

    fn admit_mutation(&self, command: &Command) -> Result<(), KernelError> {
        if self.state != BridgeState::Running {
            return Err(KernelError::NotRunning(self.state.to_string()));
        }
        self.gate.check(&self.host, command.args())
    }

    fn record_audit(&mut self, command: &Command) -> Result<(), KernelError> {
        let capability = match command.capability() {
            Some(Capability::Mutate(tag)) => tag.as_str(),
            _ => IMPLICIT_CAPABILITY,
        };
        let details = serde_json::to_string(&command.to_wire()).map_err(LedgerError::from)?;
        let ledger = self
            .ledger
            .as_mut()
            .ok_or_else(|| KernelError::NotRunning(self.state.to_string()))?;
        if let Err(err) = ledger.record(capability, command.action(), &details) {
            log::error!("audit append failed for '{}': {err}", command.action());
            return Err(err.into());
        }
        Ok(())
    }

    fn resolve_target(&mut self, reference: &str) -> Result<ObjectHandle, KernelError> {
        self.registry
            .resolve(&self.host, reference)
            .map(|resolution| resolution.handle)
            .map_err(|err| KernelError::TargetNotFound(err.to_string()))
    }

    fn run_capability(
        &mut self,
        spec: &HandlerSpec<H>,
        command: &Command,
    ) -> Result<Value, KernelError> {
        let target = match spec.target_arg.and_then(|arg| command.arg(arg)) {
            Some(reference) => Some(self.resolve_target(reference)?),
            None => None,
        };
        let mut ctx = HandlerContext::new(&mut self.host, command.args(), spec.target_arg, target);
        let handler = spec.handler.as_ref();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx)));
        let created = ctx.into_created();
        self.track_created(created);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(KernelError::HandlerFailure {
                action: command.action().to_string(),
                reason: err.to_string(),
            }),
            Err(payload) => {
                let reason = format!("handler panicked: {}", panic_message(payload.as_ref()));
                log::error!("'{}' {reason}", command.action());
                Err(KernelError::HandlerFailure {
                    action: command.action().to_string(),
                    reason,
                })
            }
        }
    }

    fn track_created(&mut self, created: Vec<ObjectHandle>) {
        if created.is_empty() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.track_created(created) {
            if let Some(path) = &self.config.session_path {
                if let Err(err) = session.save(path) {
                    log::warn!("failed to persist created handles: {err}");
                }
            }
        }
    }
}

impl<H: SceneHost> Drop for Kernel<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
