//! End-to-end command flows against recording collaborators

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;
use vpnse_lifecycle::command::{CommandBridge, CommandEvent};
use vpnse_lifecycle::controller::{ServiceContext, VpnLifecycleController};
use vpnse_lifecycle::engine::{EngineReport, TunnelEngineClient};
use vpnse_lifecycle::environment::StaticEnvironment;
use vpnse_lifecycle::error::{LifecycleError, Result};
use vpnse_lifecycle::intent::{FileIntentStore, IntentStore, MemoryIntentStore};
use vpnse_lifecycle::notification::NotificationPresenter;
use vpnse_lifecycle::policy::{
    ExitNodeView, NetworkMap, Peer, PolicySnapshot, PolicySource, PolicyValues, Prefs,
    StaticPolicySource,
};
use vpnse_lifecycle::routing::{AppFilter, PatternRegistry, RoutingPolicy, TunnelConfigBuilder};
use vpnse_lifecycle::status::Status;
use vpnse_lifecycle::tunnel::TunnelInterface;

#[derive(Debug, Clone, PartialEq)]
enum EngineCall {
    Connect(RoutingPolicy),
    Disconnect,
}

#[derive(Default)]
struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
}

impl RecordingEngine {
    fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    fn connects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Connect(_)))
            .count()
    }
}

impl TunnelEngineClient for RecordingEngine {
    fn request_connect(&self, _: Uuid, policy: &RoutingPolicy) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::Connect(policy.clone()));
        Ok(())
    }

    fn request_disconnect(&self, _: Uuid) -> Result<()> {
        self.calls.lock().unwrap().push(EngineCall::Disconnect);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Post {
    Foreground {
        active: bool,
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    },
    Background {
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    },
}

#[derive(Default)]
struct RecordingPresenter {
    posts: Mutex<Vec<Post>>,
    fail: AtomicBool,
}

impl RecordingPresenter {
    fn posts(&self) -> Vec<Post> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationPresenter for RecordingPresenter {
    async fn post_foreground(
        &self,
        active: bool,
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LifecycleError::NotificationPost(
                "foreground promotion denied".to_string(),
            ));
        }
        self.posts.lock().unwrap().push(Post::Foreground {
            active,
            hide_disconnect,
            exit_node_name,
        });
        Ok(())
    }

    async fn post_background(
        &self,
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    ) -> Result<()> {
        self.posts.lock().unwrap().push(Post::Background {
            hide_disconnect,
            exit_node_name,
        });
        Ok(())
    }
}

/// Shares its open flag with the test so ownership can stay with the
/// controller
struct SharedInterface {
    open: Arc<AtomicBool>,
}

impl TunnelInterface for SharedInterface {
    fn open(&mut self, _: &RoutingPolicy) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Policy source whose next force-enabled read parks until released
struct GatedPolicySource {
    values: StaticPolicySource,
    armed: AtomicBool,
    entered: Notify,
    release: Semaphore,
}

impl GatedPolicySource {
    fn new(values: PolicyValues) -> Self {
        Self {
            values: StaticPolicySource::new(values),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Resolves once a read is parked at the gate
    async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    fn open(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl PolicySource for GatedPolicySource {
    async fn read_force_enabled(&self) -> Result<bool> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            let _permit = self.release.acquire().await;
        }
        self.values.read_force_enabled().await
    }

    async fn read_included_packages(&self) -> Result<String> {
        self.values.read_included_packages().await
    }

    async fn read_disallowed_packages(&self) -> Result<BTreeSet<String>> {
        self.values.read_disallowed_packages().await
    }

    async fn read_exit_node_view(&self) -> Result<ExitNodeView> {
        self.values.read_exit_node_view().await
    }
}

struct Harness {
    controller: VpnLifecycleController,
    engine: Arc<RecordingEngine>,
    presenter: Arc<RecordingPresenter>,
    policy: Arc<StaticPolicySource>,
    interface_open: Arc<AtomicBool>,
}

fn harness(
    values: PolicyValues,
    environment: StaticEnvironment,
    intent: Arc<dyn IntentStore>,
) -> Harness {
    let policy = Arc::new(StaticPolicySource::new(values));
    let (controller, engine, presenter, interface_open) =
        controller_with(policy.clone(), environment, intent);

    Harness {
        controller,
        engine,
        presenter,
        policy,
        interface_open,
    }
}

fn controller_with(
    policy: Arc<dyn PolicySource>,
    environment: StaticEnvironment,
    intent: Arc<dyn IntentStore>,
) -> (
    VpnLifecycleController,
    Arc<RecordingEngine>,
    Arc<RecordingPresenter>,
    Arc<AtomicBool>,
) {
    let engine = Arc::new(RecordingEngine::default());
    let presenter = Arc::new(RecordingPresenter::default());
    let interface_open = Arc::new(AtomicBool::new(false));

    let controller = VpnLifecycleController::new(ServiceContext {
        policy,
        engine: engine.clone(),
        presenter: presenter.clone(),
        intent,
        environment: Arc::new(environment),
        builder: TunnelConfigBuilder::new(Arc::new(PatternRegistry))
            .with_builtin_exclusions(["com.bad"]),
        interface: Box::new(SharedInterface {
            open: interface_open.clone(),
        }),
    });
    (controller, engine, presenter, interface_open)
}

fn default_harness() -> Harness {
    harness(
        PolicyValues::default(),
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::default()),
    )
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn exit_node_values(force_enabled: bool) -> PolicyValues {
    PolicyValues {
        force_enabled,
        prefs: Prefs {
            exit_node_id: Some("n1".to_string()),
        },
        netmap: Some(NetworkMap {
            peers: vec![Peer {
                id: "n1".to_string(),
                name: "frankfurt.example.ts.net".to_string(),
                computed_name: None,
            }],
        }),
        ..PolicyValues::default()
    }
}

#[tokio::test]
async fn allow_list_from_inclusion_policy() {
    let h = harness(
        PolicyValues {
            included_packages: "com.a, com.b".to_string(),
            disallowed_packages: set(&["com.c"]),
            ..PolicyValues::default()
        },
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::default()),
    );

    h.controller.handle_command(CommandEvent::start()).await;

    match h.engine.calls().as_slice() {
        [EngineCall::Connect(policy)] => {
            assert_eq!(policy.app_filter, AppFilter::AllowList(set(&["com.a", "com.b"])));
        }
        other => panic!("unexpected engine calls: {other:?}"),
    }
}

#[tokio::test]
async fn deny_list_from_exclusions() {
    let h = harness(
        PolicyValues {
            disallowed_packages: set(&["com.d"]),
            ..PolicyValues::default()
        },
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::default()),
    );

    h.controller.handle_command(CommandEvent::start()).await;

    let policy = h.controller.routing_policy().expect("policy while starting");
    assert_eq!(policy.app_filter, AppFilter::DenyList(set(&["com.bad", "com.d"])));
}

#[tokio::test]
async fn snapshot_on_command_takes_precedence() {
    let h = default_harness();
    let snapshot = PolicySnapshot {
        included_packages: "com.only".to_string(),
        ..PolicySnapshot::default()
    };

    h.controller
        .handle_command(CommandEvent::Start {
            snapshot: Some(snapshot),
        })
        .await;

    let policy = h.controller.routing_policy().unwrap();
    assert_eq!(policy.app_filter, AppFilter::AllowList(set(&["com.only"])));
}

#[tokio::test]
async fn ineligible_restart_does_nothing() {
    let h = harness(
        PolicyValues::default(),
        StaticEnvironment {
            permission_granted: false,
            ..StaticEnvironment::default()
        },
        Arc::new(MemoryIntentStore::new(true)),
    );

    let status = h
        .controller
        .handle_command(CommandEvent::system_restart())
        .await;
    h.controller.settle().await;

    assert_eq!(status, Status::Stopped);
    assert!(h.engine.calls().is_empty());
    assert!(h.presenter.posts().is_empty());
}

#[tokio::test]
async fn full_lifecycle() {
    let h = harness(
        exit_node_values(false),
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::default()),
    );
    let mut rx = h.controller.subscribe();

    assert_eq!(
        h.controller.handle_command(CommandEvent::start()).await,
        Status::Starting
    );
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().status, Status::Starting);

    assert_eq!(
        h.controller
            .handle_engine_report(EngineReport::Connected)
            .await,
        Status::Active
    );
    assert!(h.interface_open.load(Ordering::SeqCst));
    h.controller.settle().await;

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.exit_node_name, Some("frankfurt".to_string()));
    assert!(h.presenter.posts().contains(&Post::Foreground {
        active: true,
        hide_disconnect: false,
        exit_node_name: Some("frankfurt".to_string()),
    }));

    assert_eq!(
        h.controller.handle_command(CommandEvent::stop()).await,
        Status::Stopped
    );
    assert!(!h.interface_open.load(Ordering::SeqCst));
    assert_eq!(h.engine.calls().last(), Some(&EngineCall::Disconnect));
    assert!(!h.controller.snapshot().want_running);
}

#[tokio::test]
async fn repeated_commands_are_idempotent() {
    let h = default_harness();

    h.controller.handle_command(CommandEvent::start()).await;
    h.controller.handle_command(CommandEvent::start()).await;
    h.controller
        .handle_engine_report(EngineReport::Connected)
        .await;
    h.controller.handle_command(CommandEvent::start()).await;
    assert_eq!(h.engine.connects(), 1);

    h.controller.handle_command(CommandEvent::stop()).await;
    let calls_after_stop = h.engine.calls().len();
    h.controller.handle_command(CommandEvent::stop()).await;
    assert_eq!(h.engine.calls().len(), calls_after_stop);
}

#[tokio::test]
async fn want_running_follows_explicit_commands_only() {
    let intent = Arc::new(MemoryIntentStore::default());
    let h = harness(
        PolicyValues::default(),
        StaticEnvironment {
            always_on: true,
            ..StaticEnvironment::default()
        },
        intent.clone(),
    );

    let sequence = [
        CommandEvent::start(),
        CommandEvent::revoke(),
        CommandEvent::system_restart(),
        CommandEvent::stop(),
        CommandEvent::system_restart(),
        CommandEvent::revoke(),
        CommandEvent::start(),
        CommandEvent::system_restart(),
    ];
    let mut expected = false;
    for event in sequence {
        match &event {
            CommandEvent::Start { .. } => expected = true,
            CommandEvent::Stop { .. } => expected = false,
            _ => {}
        }
        h.controller.handle_command(event).await;
        assert_eq!(intent.load().unwrap(), expected);
    }
    h.controller.settle().await;
}

#[tokio::test]
async fn notification_failure_does_not_block_connect() {
    let h = default_harness();
    h.presenter.fail.store(true, Ordering::SeqCst);

    let status = h.controller.handle_command(CommandEvent::start()).await;
    h.controller.settle().await;

    assert_eq!(status, Status::Starting);
    assert_eq!(h.engine.connects(), 1);
    assert_eq!(
        h.controller
            .handle_engine_report(EngineReport::Connected)
            .await,
        Status::Active
    );
}

#[tokio::test]
async fn stop_before_notification_suppresses_it() {
    let h = default_harness();

    // Current-thread runtime: the notification task cannot run until we yield
    h.controller.handle_command(CommandEvent::start()).await;
    h.controller.handle_command(CommandEvent::stop()).await;
    h.controller.settle().await;

    assert!(h.presenter.posts().is_empty());
    assert_eq!(h.controller.current_status(), Status::Stopped);
}

#[tokio::test]
async fn restart_posts_background_with_consistent_exit_node() {
    let h = harness(
        exit_node_values(true),
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::new(true)),
    );

    let status = h
        .controller
        .handle_command(CommandEvent::system_restart())
        .await;
    h.controller.settle().await;

    assert_eq!(status, Status::Starting);
    assert_eq!(h.engine.connects(), 1);
    assert_eq!(
        h.presenter.posts(),
        vec![Post::Background {
            hide_disconnect: true,
            exit_node_name: Some("frankfurt".to_string()),
        }]
    );
}

#[tokio::test]
async fn restart_notification_reads_latest_policy() {
    let h = harness(
        PolicyValues::default(),
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::new(true)),
    );

    h.controller
        .handle_command(CommandEvent::system_restart())
        .await;
    // Policy changes before the background task gets to run
    h.policy.update(exit_node_values(true)).unwrap();
    h.controller.settle().await;

    assert_eq!(
        h.presenter.posts(),
        vec![Post::Background {
            hide_disconnect: true,
            exit_node_name: Some("frankfurt".to_string()),
        }]
    );
    assert_eq!(
        h.controller.snapshot().exit_node_name,
        Some("frankfurt".to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_issue_one_connect() {
    let h = default_harness();
    let bridge = CommandBridge::new(Arc::new(h.controller.clone()));

    let handles: Vec<_> = (0..16)
        .map(|_| bridge.deliver(CommandEvent::start()))
        .collect();
    for status in futures::future::join_all(handles).await {
        assert_eq!(status.unwrap(), Status::Starting);
    }

    assert_eq!(h.engine.connects(), 1);
    h.controller.settle().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_settle_consistently() {
    let h = default_harness();
    let bridge = CommandBridge::new(Arc::new(h.controller.clone()));

    let handles: Vec<_> = (0..32)
        .map(|i| {
            if i % 2 == 0 {
                bridge.deliver(CommandEvent::start())
            } else {
                bridge.deliver(CommandEvent::stop())
            }
        })
        .collect();
    for status in futures::future::join_all(handles).await {
        status.unwrap();
    }
    h.controller.settle().await;

    let snapshot = h.controller.snapshot();
    match snapshot.status {
        Status::Starting => assert!(snapshot.want_running),
        Status::Stopped => {
            assert!(!snapshot.want_running);
            assert!(!h.interface_open.load(Ordering::SeqCst));
        }
        other => panic!("unexpected settled status {other}"),
    }

    // Connects and disconnects strictly alternate: never two connects in flight
    let mut connected = false;
    for call in h.engine.calls() {
        match call {
            EngineCall::Connect(_) => {
                assert!(!connected, "overlapping connect request");
                connected = true;
            }
            EngineCall::Disconnect => connected = false,
        }
    }
}

#[tokio::test]
async fn intent_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intent.toml");

    {
        let h = harness(
            PolicyValues::default(),
            StaticEnvironment::default(),
            Arc::new(FileIntentStore::new(&path)),
        );
        h.controller.handle_command(CommandEvent::start()).await;
        h.controller
            .handle_engine_report(EngineReport::Connected)
            .await;
        // Process killed by the OS
        h.controller.shutdown().await;
    }

    let h = harness(
        PolicyValues::default(),
        StaticEnvironment::default(),
        Arc::new(FileIntentStore::new(&path)),
    );
    assert!(h.controller.snapshot().want_running);
    let status = h
        .controller
        .handle_command(CommandEvent::system_restart())
        .await;
    assert_eq!(status, Status::Starting);
    assert_eq!(h.engine.connects(), 1);
    h.controller.settle().await;
}

async fn stop_during_restart_read(environment: StaticEnvironment, intent: bool) {
    let source = Arc::new(GatedPolicySource::new(exit_node_values(false)));
    let intent = Arc::new(MemoryIntentStore::new(intent));
    let (controller, engine, presenter, interface_open) =
        controller_with(source.clone(), environment, intent.clone());

    let restarting = controller.clone();
    let restart = tokio::spawn(async move {
        restarting
            .handle_command(CommandEvent::system_restart())
            .await
    });
    source.wait_entered().await;

    assert_eq!(
        controller.handle_command(CommandEvent::stop()).await,
        Status::Stopped
    );
    source.open();
    restart.await.unwrap();
    controller.settle().await;

    assert_eq!(controller.current_status(), Status::Stopped);
    assert!(!controller.snapshot().want_running);
    assert!(!intent.load().unwrap());
    assert!(engine.calls().is_empty());
    assert!(presenter.posts().is_empty());
    assert!(!interface_open.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stop_during_restart_policy_read_wins() {
    stop_during_restart_read(StaticEnvironment::default(), true).await;
}

#[tokio::test]
async fn stop_during_always_on_restart_policy_read_wins() {
    let always_on = StaticEnvironment {
        always_on: true,
        ..StaticEnvironment::default()
    };
    stop_during_restart_read(always_on, false).await;
}

#[tokio::test]
async fn stop_during_start_policy_read_wins() {
    let source = Arc::new(GatedPolicySource::new(PolicyValues::default()));
    let intent = Arc::new(MemoryIntentStore::default());
    let (controller, engine, presenter, _) =
        controller_with(source.clone(), StaticEnvironment::default(), intent.clone());

    let starting = controller.clone();
    let start =
        tokio::spawn(async move { starting.handle_command(CommandEvent::start()).await });
    source.wait_entered().await;

    controller.handle_command(CommandEvent::stop()).await;
    source.open();
    assert_eq!(start.await.unwrap(), Status::Stopped);
    controller.settle().await;

    assert!(!controller.snapshot().want_running);
    assert!(!intent.load().unwrap());
    assert!(engine.calls().is_empty());
    assert!(presenter.posts().is_empty());
}

#[tokio::test]
async fn revoke_during_start_policy_read_wins() {
    let source = Arc::new(GatedPolicySource::new(PolicyValues::default()));
    let (controller, engine, presenter, _) = controller_with(
        source.clone(),
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::default()),
    );

    let starting = controller.clone();
    let start =
        tokio::spawn(async move { starting.handle_command(CommandEvent::start()).await });
    source.wait_entered().await;

    controller.handle_command(CommandEvent::revoke()).await;
    source.open();
    assert_eq!(start.await.unwrap(), Status::Stopped);
    controller.settle().await;

    let snapshot = controller.snapshot();
    assert!(!snapshot.prepared);
    assert!(snapshot.want_running);
    assert!(engine.calls().is_empty());
    assert!(presenter.posts().is_empty());
}

#[tokio::test]
async fn start_during_restart_policy_read_connects_once() {
    let source = Arc::new(GatedPolicySource::new(exit_node_values(false)));
    let (controller, engine, presenter, _) = controller_with(
        source.clone(),
        StaticEnvironment::default(),
        Arc::new(MemoryIntentStore::new(true)),
    );

    let restarting = controller.clone();
    let restart = tokio::spawn(async move {
        restarting
            .handle_command(CommandEvent::system_restart())
            .await
    });
    source.wait_entered().await;

    assert_eq!(
        controller.handle_command(CommandEvent::start()).await,
        Status::Starting
    );
    source.open();
    assert_eq!(restart.await.unwrap(), Status::Starting);
    controller.settle().await;

    assert_eq!(engine.connects(), 1);
    assert!(presenter
        .posts()
        .iter()
        .all(|post| matches!(post, Post::Foreground { .. })));
    assert!(!presenter.posts().is_empty());
}
