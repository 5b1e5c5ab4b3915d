//! VPN lifecycle controller
//!
//! The controller owns the session state machine:
//!
//! ```text
//!            Start / SystemRestart            engine Connected
//! Stopped ───────────────────────────▶ Starting ───────────────▶ Active
//!    ▲                                    │                        │
//!    └──────── Stopping ◀─────────────────┴─── Stop / Revoke ──────┘
//! ```
//!
//! Every transition runs under one state lock. Policy reads, intent writes
//! and notification posts happen outside it. Anything that resumes after a
//! suspension re-checks the live state first, so a command that landed in
//! the meantime wins.

use crate::command::CommandEvent;
use crate::engine::{EngineReport, TunnelEngineClient};
use crate::environment::{check_eligible, Environment};
use crate::error::{IntoLifecycleError, LifecycleError, Result};
use crate::intent::IntentStore;
use crate::notification::{NotificationContent, NotificationPresenter};
use crate::policy::{PolicySnapshot, PolicySource};
use crate::routing::{RoutingPolicy, TunnelConfigBuilder};
use crate::status::{Status, StatusSnapshot};
use crate::tunnel::TunnelInterface;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capability interface the host bridge drives
#[async_trait]
pub trait LifecycleService: Send + Sync {
    async fn handle_command(&self, event: CommandEvent) -> Status;

    fn current_status(&self) -> Status;
}

/// Collaborators injected at construction
pub struct ServiceContext {
    pub policy: Arc<dyn PolicySource>,
    pub engine: Arc<dyn TunnelEngineClient>,
    pub presenter: Arc<dyn NotificationPresenter>,
    pub intent: Arc<dyn IntentStore>,
    pub environment: Arc<dyn Environment>,
    pub builder: TunnelConfigBuilder,
    pub interface: Box<dyn TunnelInterface>,
}

/// Which notification path a start took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presentation {
    Foreground,
    Background,
}

struct SessionState {
    status: Status,
    want_running: bool,
    prepared: bool,
    /// A connect request awaits the engine's answer
    connect_pending: bool,
    policy: Option<RoutingPolicy>,
    presentation: Presentation,
    content: NotificationContent,
    /// Bumped by every applied transition; tasks compare it before acting
    generation: u64,
    /// Bumped by every explicit Start, Stop or Revoke
    command_epoch: u64,
    interface: Box<dyn TunnelInterface>,
}

struct Inner {
    session_id: Uuid,
    policy: Arc<dyn PolicySource>,
    engine: Arc<dyn TunnelEngineClient>,
    presenter: Arc<dyn NotificationPresenter>,
    intent: Arc<dyn IntentStore>,
    environment: Arc<dyn Environment>,
    builder: TunnelConfigBuilder,
    state: Mutex<SessionState>,
    /// Epoch of the last intent written to the store
    intent_written: tokio::sync::Mutex<u64>,
    status_tx: watch::Sender<StatusSnapshot>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Lifecycle state machine for one service session
#[derive(Clone)]
pub struct VpnLifecycleController {
    inner: Arc<Inner>,
}

impl VpnLifecycleController {
    pub fn new(context: ServiceContext) -> Self {
        let session_id = Uuid::new_v4();
        let want_running = context.intent.load().unwrap_or_else(|e| {
            log::warn!("Failed to load run intent, assuming stopped: {e}");
            false
        });
        let prepared = context.environment.vpn_permission_granted();

        let mut initial = StatusSnapshot::new(session_id);
        initial.want_running = want_running;
        initial.prepared = prepared;
        let (status_tx, _) = watch::channel(initial);

        log::info!("Created VPN service session {session_id}");
        Self {
            inner: Arc::new(Inner {
                session_id,
                policy: context.policy,
                engine: context.engine,
                presenter: context.presenter,
                intent: context.intent,
                environment: context.environment,
                builder: context.builder,
                state: Mutex::new(SessionState {
                    status: Status::Stopped,
                    want_running,
                    prepared,
                    connect_pending: false,
                    policy: None,
                    presentation: Presentation::Foreground,
                    content: NotificationContent::default(),
                    generation: 0,
                    command_epoch: 0,
                    interface: context.interface,
                }),
                intent_written: tokio::sync::Mutex::new(0),
                status_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Apply a command and return the status it left behind
    pub async fn handle_command(&self, event: CommandEvent) -> Status {
        log::debug!("Handling {} command", event.kind());
        match event {
            CommandEvent::Start { snapshot } => self.start(snapshot).await,
            CommandEvent::Stop { .. } => self.stop().await,
            CommandEvent::Revoke { .. } => self.revoke(),
            CommandEvent::SystemRestart { snapshot } => self.system_restart(snapshot).await,
        }
        self.current_status()
    }

    pub fn current_status(&self) -> Status {
        self.inner.status_tx.borrow().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    /// Observe status changes
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Routing policy of the current attempt, if any
    pub fn routing_policy(&self) -> Option<RoutingPolicy> {
        self.inner.lock_state().policy.clone()
    }

    /// Apply an asynchronous report from the tunnel engine
    pub async fn handle_engine_report(&self, report: EngineReport) -> Status {
        let mut state = self.inner.lock_state();
        match report {
            EngineReport::Connected => {
                if !(state.connect_pending && state.status == Status::Starting) {
                    log::debug!("Ignoring stale engine confirmation in {}", state.status);
                    return state.status;
                }
                state.connect_pending = false;
                if let Err(e) = self.inner.open_interface(&mut state) {
                    log::error!("Failed to open tunnel interface: {e}");
                    self.inner.shut_down(&mut state, true);
                    return state.status;
                }
                self.inner.set_status(&mut state, Status::Active);
                log::info!("Tunnel active for session {}", self.inner.session_id);

                let generation = state.generation;
                let presentation = state.presentation;
                drop(state);
                self.spawn_refresh(generation, presentation);
                Status::Active
            }
            EngineReport::Failed(reason) => {
                if !state.status.is_running() {
                    log::debug!("Ignoring engine failure in {}: {reason}", state.status);
                    return state.status;
                }
                // No retry here: the supervisor decides whether to start again
                log::warn!("Tunnel engine failed: {reason}");
                self.inner.shut_down(&mut state, false);
                state.status
            }
            EngineReport::Disconnected => {
                if !state.status.is_running() {
                    return state.status;
                }
                log::info!("Tunnel engine disconnected");
                self.inner.shut_down(&mut state, false);
                state.status
            }
        }
    }

    /// Tear the tunnel down as the hosting process goes away. The persisted
    /// intent is left alone so a later restart can bring the tunnel back.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.status != Status::Stopped || state.interface.is_open() {
                self.inner.shut_down(&mut state, true);
            }
        }
        self.settle().await;
    }

    /// Wait for every notification task spawned so far
    pub async fn settle(&self) {
        let handles: Vec<_> = {
            let mut tasks = self.inner.lock_tasks();
            tasks.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                log::warn!("Notification task failed: {e}");
            }
        }
    }

    async fn start(&self, snapshot: Option<PolicySnapshot>) {
        let epoch = {
            let mut state = self.inner.lock_state();
            state.want_running = true;
            state.prepared = true;
            state.command_epoch += 1;
            self.inner.publish(&state);
            state.command_epoch
        };
        self.inner.persist_intent(epoch, true).await;

        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => PolicySnapshot::read(self.inner.policy.as_ref()).await,
        };

        let (generation, content) = {
            let mut state = self.inner.lock_state();
            if !(state.want_running && state.prepared) {
                log::debug!("Start superseded by a later stop or revoke");
                return;
            }
            if state.status.is_running() {
                log::debug!("Start ignored: already {}", state.status);
                return;
            }

            state.presentation = Presentation::Foreground;
            if !self.inner.begin_connect(&mut state, &snapshot) {
                return;
            }
            (state.generation, state.content.clone())
        };

        self.spawn_foreground(generation, content);
    }

    async fn stop(&self) {
        let epoch = {
            let mut state = self.inner.lock_state();
            state.want_running = false;
            state.command_epoch += 1;

            if state.status == Status::Stopped {
                log::debug!("Stop ignored: already stopped");
                self.inner.publish(&state);
            } else {
                log::info!("Stopping tunnel for session {}", self.inner.session_id);
                self.inner.shut_down(&mut state, true);
            }
            state.command_epoch
        };
        self.inner.persist_intent(epoch, false).await;
    }

    fn revoke(&self) {
        let mut state = self.inner.lock_state();
        state.prepared = false;
        state.command_epoch += 1;

        if state.status == Status::Stopped {
            self.inner.publish(&state);
            return;
        }
        log::warn!("VPN permission revoked by the OS");
        self.inner.shut_down(&mut state, true);
    }

    async fn system_restart(&self, snapshot: Option<PolicySnapshot>) {
        let epoch = {
            let state = self.inner.lock_state();
            if let Err(e) = self.inner.restart_eligibility(&state) {
                log::info!("Not starting after restart: {e}");
                return;
            }
            state.command_epoch
        };

        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => PolicySnapshot::read(self.inner.policy.as_ref()).await,
        };

        let generation = {
            let mut state = self.inner.lock_state();
            if state.status.is_running() {
                log::debug!("Restart ignored: already {}", state.status);
                return;
            }
            if state.command_epoch != epoch {
                log::debug!("Restart superseded by an explicit command");
                return;
            }
            if let Err(e) = self.inner.restart_eligibility(&state) {
                log::info!("Not starting after restart: {e}");
                return;
            }
            state.prepared = true;
            state.presentation = Presentation::Background;
            if !self.inner.begin_connect(&mut state, &snapshot) {
                return;
            }
            state.generation
        };

        self.spawn_background(generation);
    }

    fn spawn_foreground(&self, generation: u64, content: NotificationContent) {
        let inner = Arc::clone(&self.inner);
        self.track(tokio::spawn(async move {
            let Some(active) = inner.live_activity(generation) else {
                log::debug!("Dropping stale foreground notification");
                return;
            };
            if let Err(e) = inner
                .presenter
                .post_foreground(active, content.hide_disconnect, content.exit_node_name)
                .await
            {
                log::warn!("Foreground notification failed: {e}");
            }
        }));
    }

    /// The restart path was not launched in a foreground context, so it
    /// reads its own policy view and posts a plain notification.
    fn spawn_background(&self, generation: u64) {
        let inner = Arc::clone(&self.inner);
        self.track(tokio::spawn(async move {
            let content = NotificationContent::read(inner.policy.as_ref()).await;
            {
                let mut state = inner.lock_state();
                if state.generation != generation || !state.status.is_running() {
                    log::debug!("Dropping stale background notification");
                    return;
                }
                state.content = content.clone();
                state.presentation = Presentation::Background;
                inner.publish(&state);
            }
            if let Err(e) = inner
                .presenter
                .post_background(content.hide_disconnect, content.exit_node_name)
                .await
            {
                log::warn!("Background notification failed: {e}");
            }
        }));
    }

    fn spawn_refresh(&self, generation: u64, presentation: Presentation) {
        let inner = Arc::clone(&self.inner);
        self.track(tokio::spawn(async move {
            let Some(active) = inner.live_activity(generation) else {
                return;
            };
            let content = inner.lock_state().content.clone();
            let result = match presentation {
                Presentation::Foreground => {
                    inner
                        .presenter
                        .post_foreground(active, content.hide_disconnect, content.exit_node_name)
                        .await
                }
                Presentation::Background => {
                    inner
                        .presenter
                        .post_background(content.hide_disconnect, content.exit_node_name)
                        .await
                }
            };
            if let Err(e) = result {
                log::warn!("Status notification failed: {e}");
            }
        }));
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.lock_tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `state.want_running` mirrors the persisted intent: it is loaded at
    /// construction and only explicit Start/Stop change it
    fn restart_eligibility(&self, state: &SessionState) -> Result<()> {
        check_eligible(self.environment.as_ref())?;
        if state.want_running || self.environment.always_on_enabled() {
            Ok(())
        } else {
            Err(LifecycleError::IneligibleRestart(
                "service was not running before the restart".to_string(),
            ))
        }
    }

    /// Build the routing policy and ask the engine to connect. Returns
    /// `false` when the engine refused and the session fell back to
    /// `Stopped`.
    fn begin_connect(&self, state: &mut SessionState, snapshot: &PolicySnapshot) -> bool {
        let policy = self.builder.build(snapshot);
        state.generation += 1;
        state.connect_pending = true;
        state.policy = Some(policy.clone());
        state.content = NotificationContent::from_snapshot(snapshot);
        self.set_status(state, Status::Starting);

        match self.engine.request_connect(self.session_id, &policy) {
            Ok(()) => {
                log::info!("Requested tunnel connect for session {}", self.session_id);
                true
            }
            Err(e) => {
                log::error!("{}", LifecycleError::EngineConnect(e.to_string()));
                state.connect_pending = false;
                state.policy = None;
                self.set_status(state, Status::Stopped);
                false
            }
        }
    }

    /// Move to `Stopped`, closing the interface first
    fn shut_down(&self, state: &mut SessionState, request_disconnect: bool) {
        state.generation += 1;
        state.connect_pending = false;
        if request_disconnect {
            if let Err(e) = self.engine.request_disconnect(self.session_id) {
                log::warn!("Engine disconnect failed: {e}");
            }
        }
        self.set_status(state, Status::Stopping);
        self.close_interface(state);
        state.policy = None;
        self.set_status(state, Status::Stopped);
    }

    fn open_interface(&self, state: &mut SessionState) -> Result<()> {
        let policy = state
            .policy
            .clone()
            .ok_or_else(|| LifecycleError::InvalidState("no routing policy".to_string()))?;
        state.interface.open(&policy)
    }

    fn close_interface(&self, state: &mut SessionState) {
        if let Err(e) = state.interface.close() {
            log::warn!("Failed to close tunnel interface: {e}");
        }
    }

    /// `Some(active)` while the task spawned at `generation` is still
    /// current
    fn live_activity(&self, generation: u64) -> Option<bool> {
        let state = self.lock_state();
        (state.generation == generation && state.status.is_running())
            .then_some(state.status == Status::Active)
    }

    /// Write the intent recorded at `epoch` unless a later command already
    /// wrote its own
    async fn persist_intent(&self, epoch: u64, want_running: bool) {
        let mut written = self.intent_written.lock().await;
        if *written >= epoch {
            log::debug!("Skipping superseded intent write");
            return;
        }
        let store = Arc::clone(&self.intent);
        let result = tokio::task::spawn_blocking(move || store.store(want_running))
            .await
            .into_lifecycle_error("intent write task")
            .and_then(|stored| stored);
        match result {
            Ok(()) => *written = epoch,
            Err(e) => log::warn!("Failed to persist run intent: {e}"),
        }
    }

    fn set_status(&self, state: &mut SessionState, status: Status) {
        if state.status != status {
            log::debug!("Status {} -> {status}", state.status);
        }
        state.status = status;
        self.publish(state);
    }

    fn publish(&self, state: &SessionState) {
        let next = StatusSnapshot {
            session_id: self.session_id,
            status: state.status,
            want_running: state.want_running,
            prepared: state.prepared,
            exit_node_name: state.content.exit_node_name.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[async_trait]
impl LifecycleService for VpnLifecycleController {
    async fn handle_command(&self, event: CommandEvent) -> Status {
        VpnLifecycleController::handle_command(self, event).await
    }

    fn current_status(&self) -> Status {
        VpnLifecycleController::current_status(self)
    }
}
