//! The worker side of the bridge.
//!
//! [`Bridge::tick`] is meant to be called from the host's own per-frame
//! callback. Each tick:
//! 1. Answers queued socket requests and drains pending mailbox files, oldest
//!    first. The two channels take turns going first from tick to tick.
//! 2. Writes the heartbeat file when it is due
//!
//! Draining stops once the tick budget is spent; whatever is left waits for
//! the next tick. At least one item is processed per tick. Socket requests
//! whose caller already received a timeout are dropped without running.

use std::cell::RefCell;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use axum::http::StatusCode;
use scenegate_kernel::{Command, HandlerTable, Kernel, SceneHost};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::http::HttpListener;
use crate::mailbox::{Inbound, Mailbox};
use crate::queue::{PendingRequest, Reply, RequestQueue};
use crate::status::{write_health, write_status};

/// What one call to [`Bridge::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// False when the tick was a no-op (kernel not running, or re-entered).
    pub ran: bool,
    pub http: usize,
    pub mailbox: usize,
    /// The budget ran out before both channels were drained.
    pub deferred: bool,
}

impl TickOutcome {
    pub fn processed(&self) -> usize {
        self.http + self.mailbox
    }
}

pub struct Bridge<H: SceneHost> {
    config: BridgeConfig,
    kernel: Kernel<H>,
    mailbox: Mailbox,
    queue: RequestQueue,
    http: Option<HttpListener>,
    /// Requests that were answered but could not be deleted. Never re-run.
    consumed: HashSet<PathBuf>,
    last_heartbeat: Option<Instant>,
    mailbox_first: bool,
}

impl<H: SceneHost> Bridge<H> {
    /// Creates the mailbox directories and a stopped kernel whose lifecycle
    /// transitions are mirrored into the status file.
    pub fn new(config: BridgeConfig, host: H, handlers: HandlerTable<H>) -> Result<Self, BridgeError> {
        let mailbox = Mailbox::open(&config.inbox, &config.outbox)?;
        let status_path = config.status_path.clone();
        let kernel = Kernel::builder(host)
            .config(config.kernel.clone())
            .handlers(handlers)
            .observer(move |state, nonce| write_status(&status_path, state, nonce))
            .build();
        Ok(Self {
            config,
            kernel,
            mailbox,
            queue: RequestQueue::new(),
            http: None,
            consumed: HashSet::new(),
            last_heartbeat: None,
            mailbox_first: true,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Kernel<H> {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel<H> {
        &mut self.kernel
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Address the socket channel is bound to, if it is up.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(HttpListener::local_addr)
    }

    /// Starts the kernel, then the socket channel. A socket that cannot bind
    /// is logged and the bridge keeps serving the mailbox.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        if self.kernel.is_running() {
            return Ok(());
        }
        self.kernel.start()?;
        self.queue.open();
        self.last_heartbeat = None;
        if self.config.http.enabled && self.http.is_none() {
            if let Some(nonce) = self.kernel.nonce().map(str::to_owned) {
                match HttpListener::spawn(&self.config.http, self.queue.clone(), &nonce) {
                    Ok(listener) => self.http = Some(listener),
                    Err(err) => tracing::error!("{err}; socket channel disabled"),
                }
            }
        }
        Ok(())
    }

    /// Rejects waiting socket callers, stops the listener and shuts the kernel
    /// down. Unread mailbox files stay in the inbox.
    pub fn shutdown(&mut self) {
        let rejected = self.queue.close(Reply::error(
            StatusCode::SERVICE_UNAVAILABLE,
            "bridge is shutting down",
        ));
        if rejected > 0 {
            tracing::info!(rejected, "rejected queued HTTP requests");
        }
        if let Some(listener) = self.http.take() {
            listener.stop();
        }
        self.kernel.shutdown();
    }

    /// Full teardown and restart, as after a host runtime reload.
    pub fn reinitialize(&mut self) -> Result<(), BridgeError> {
        self.shutdown();
        self.start()
    }

    pub fn tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if !self.kernel.is_running() {
            return outcome;
        }
        outcome.ran = true;
        let started = Instant::now();

        // Channels alternate which one drains first.
        self.mailbox_first = !self.mailbox_first;
        if self.mailbox_first {
            self.drain_mailbox(&started, &mut outcome);
            self.drain_requests(&started, &mut outcome);
        } else {
            self.drain_requests(&started, &mut outcome);
            self.drain_mailbox(&started, &mut outcome);
        }

        if outcome.deferred {
            tracing::debug!(
                deferred = true,
                elapsed_ms = started.elapsed().as_millis() as u64,
                processed = outcome.processed(),
                "tick budget spent"
            );
        }
        self.heartbeat();
        outcome
    }

    fn over_budget(&self, started: &Instant, outcome: &TickOutcome) -> bool {
        outcome.processed() > 0 && started.elapsed() >= self.config.tick_budget
    }

    fn drain_requests(&mut self, started: &Instant, outcome: &mut TickOutcome) {
        loop {
            if self.over_budget(started, outcome) {
                outcome.deferred |= !self.queue.is_empty();
                return;
            }
            let Some(pending) = self.queue.pop() else {
                return;
            };
            if pending.reply.is_closed() {
                tracing::debug!(
                    action = pending.command.action(),
                    "HTTP caller gave up before the tick; request dropped"
                );
                continue;
            }
            let reply = self.run_guarded(&pending.command);
            if pending.reply.send(reply).is_err() {
                tracing::debug!(
                    action = pending.command.action(),
                    "HTTP caller went away before the reply"
                );
            }
            outcome.http += 1;
        }
    }

    fn drain_mailbox(&mut self, started: &Instant, outcome: &mut TickOutcome) {
        if self.over_budget(started, outcome) {
            outcome.deferred = true;
            return;
        }
        let pending = match self.mailbox.pending() {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!("mailbox scan failed: {err}");
                return;
            }
        };
        self.consumed.retain(|path| pending.contains(path));
        for request in pending {
            if self.consumed.contains(&request) {
                continue;
            }
            if self.over_budget(started, outcome) {
                outcome.deferred = true;
                return;
            }
            if self.process_file(&request) {
                outcome.mailbox += 1;
            }
        }
    }

    /// Answers one request file and deletes it. Returns false when the file
    /// vanished before it could be read.
    fn process_file(&mut self, request: &Path) -> bool {
        let reply = match self.mailbox.read(request) {
            Inbound::Gone => return false,
            Inbound::Malformed(err) => {
                tracing::warn!(file = %request.display(), "malformed request: {err}");
                Reply::ok(err.to_payload())
            }
            Inbound::Command(command) => self.run_guarded(&command),
        };
        if let Err(err) = self.mailbox.respond(request, &reply.body) {
            tracing::warn!(file = %request.display(), "response write failed: {err}");
        }
        if let Err(err) = self.mailbox.consume(request) {
            tracing::warn!(file = %request.display(), "request not deleted: {err}");
            self.consumed.insert(request.to_path_buf());
        }
        true
    }

    /// Runs a command so that neither a structured error nor a panic escapes
    /// the tick.
    fn run_guarded(&mut self, command: &Command) -> Reply {
        let started = Instant::now();
        let kernel = &mut self.kernel;
        let result = panic::catch_unwind(AssertUnwindSafe(|| kernel.execute(command)));
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let capability = command.capability().map(|c| c.as_str()).unwrap_or("-");
        match result {
            Ok(Ok(value)) => {
                tracing::debug!(action = command.action(), capability, elapsed_ms, "ok");
                Reply::ok(value)
            }
            Ok(Err(err)) => {
                tracing::info!(
                    action = command.action(),
                    capability,
                    elapsed_ms,
                    code = err.code(),
                    "{err}"
                );
                Reply::ok(err.to_payload())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(action = command.action(), capability, "pipeline panicked: {message}");
                Reply::error(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }

    fn heartbeat(&mut self) {
        let due = self
            .last_heartbeat
            .is_none_or(|last| last.elapsed() >= self.config.heartbeat_interval);
        if due {
            write_health(&self.config.health_path, &self.kernel.health());
            self.last_heartbeat = Some(Instant::now());
        }
    }
}

impl<H: SceneHost> Drop for Bridge<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unexpected failure".to_string()
    }
}

/// Cloneable embedding handle for hosts that tick from callbacks which may
/// themselves be reached from inside a tick.
pub struct SharedBridge<H: SceneHost> {
    inner: Rc<RefCell<Bridge<H>>>,
}

impl<H: SceneHost> Clone for SharedBridge<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<H: SceneHost> SharedBridge<H> {
    pub fn new(bridge: Bridge<H>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(bridge)),
        }
    }

    /// Ticks the bridge; a tick that arrives while the bridge is already
    /// borrowed (a drain in progress) does nothing.
    pub fn tick(&self) -> TickOutcome {
        match self.inner.try_borrow_mut() {
            Ok(mut bridge) => bridge.tick(),
            Err(_) => {
                tracing::debug!("re-entrant tick ignored");
                TickOutcome::default()
            }
        }
    }

    /// Runs `f` against the bridge, or returns `None` if it is already
    /// borrowed.
    pub fn with<R>(&self, f: impl FnOnce(&mut Bridge<H>) -> R) -> Option<R> {
        let mut bridge = self.inner.try_borrow_mut().ok()?;
        Some(f(&mut bridge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenegate_kernel::sim::{SimScene, demo_handlers};
    use std::time::Duration;
    use tempfile::TempDir;

    fn bridge(tmp: &TempDir) -> Bridge<SimScene> {
        let mut config = BridgeConfig::rooted(tmp.path());
        config.http.enabled = false;
        Bridge::new(config, SimScene::demo(), demo_handlers()).unwrap()
    }

    #[test]
    fn tick_before_start_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let mut bridge = bridge(&tmp);
        std::fs::write(bridge.mailbox().inbox().join("a.json"), r#"{"action":"status"}"#).unwrap();
        let outcome = bridge.tick();
        assert!(!outcome.ran);
        assert!(bridge.mailbox().inbox().join("a.json").exists());
    }

    #[test]
    fn zero_budget_still_processes_one_item() {
        let tmp = TempDir::new().unwrap();
        let mut bridge = bridge(&tmp);
        bridge.config.tick_budget = Duration::ZERO;
        bridge.start().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(
                bridge.mailbox().inbox().join(format!("{name}.json")),
                r#"{"action":"status"}"#,
            )
            .unwrap();
        }
        let outcome = bridge.tick();
        assert_eq!(outcome.mailbox, 1);
        assert!(outcome.deferred);
        assert_eq!(bridge.mailbox().pending().unwrap().len(), 2);
    }

    #[test]
    fn channels_take_turns_when_the_budget_is_spent() {
        let tmp = TempDir::new().unwrap();
        let mut bridge = bridge(&tmp);
        bridge.config.tick_budget = Duration::ZERO;
        bridge.start().unwrap();
        std::fs::write(bridge.mailbox().inbox().join("a.json"), r#"{"action":"status"}"#).unwrap();
        let mut replies = Vec::new();
        for _ in 0..3 {
            let (reply, rx) = tokio::sync::oneshot::channel();
            bridge.queue().push(PendingRequest {
                command: Command::new("status"),
                reply,
            });
            replies.push(rx);
        }

        let first = bridge.tick();
        let second = bridge.tick();
        assert_eq!(first.processed(), 1);
        assert_eq!(second.processed(), 1);
        assert_eq!(first.mailbox + second.mailbox, 1);
        assert_eq!(first.http + second.http, 1);
        assert!(bridge.mailbox().pending().unwrap().is_empty());
        assert_eq!(bridge.queue().len(), 2);
    }

    #[test]
    fn abandoned_socket_requests_are_not_run() {
        let tmp = TempDir::new().unwrap();
        let mut bridge = bridge(&tmp);
        bridge.start().unwrap();
        let (reply, rx) = tokio::sync::oneshot::channel();
        bridge.queue().push(PendingRequest {
            command: Command::new("object/delete")
                .with_capability("write")
                .with_arg("path", "Hair"),
            reply,
        });
        drop(rx);

        let outcome = bridge.tick();
        assert_eq!(outcome.http, 0);
        assert!(bridge.queue().is_empty());
        assert!(bridge.kernel().host().find_by_path("Hair").is_some());
        assert!(bridge.kernel().ledger().unwrap().is_empty());
    }

    #[test]
    fn heartbeat_and_status_files_are_written() {
        let tmp = TempDir::new().unwrap();
        let mut bridge = bridge(&tmp);
        bridge.start().unwrap();
        bridge.tick();
        let health = std::fs::read_to_string(&bridge.config().health_path).unwrap();
        assert!(health.contains("\"editorState\""));
        let status = std::fs::read_to_string(&bridge.config().status_path).unwrap();
        assert!(status.contains("Running"));
        bridge.shutdown();
        let status = std::fs::read_to_string(&bridge.config().status_path).unwrap();
        assert!(status.contains("Stopped"));
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
