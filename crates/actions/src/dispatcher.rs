use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashSet,
    hearth_config::DispatchConfig,
    serde_json::{Value, json},
    tokio::sync::watch,
    tracing::{debug, info, warn},
};

use crate::{
    action::{Action, ActionRunState, RunSnapshot},
    api::{ActionApi, ServerDirectory},
    catalog::ActionCatalog,
    companion::{ACTION_ROW_PRESSED, CompanionLink},
    error::DispatchError,
    reachability::ReachabilityGateway,
};

/// Observable run state plus the command that drives it.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    fn state(&self) -> ActionRunState;

    fn subscribe(&self) -> watch::Receiver<RunSnapshot>;

    /// Run the action with this id from the latest catalog snapshot. Unknown
    /// ids are ignored.
    async fn run_action_id(&self, id: &str);
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// How long success or failure stays up before clearing to idle.
    pub reset_delay: Duration,
    pub reply_timeout: Duration,
    pub origin: String,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl DispatcherOptions {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            reset_delay: Duration::from_millis(config.reset_delay_ms),
            reply_timeout: Duration::from_millis(config.reply_timeout_ms),
            origin: config.origin.clone(),
        }
    }
}

struct Inner {
    catalog: watch::Receiver<Vec<Action>>,
    reachability: Arc<dyn ReachabilityGateway>,
    link: Arc<dyn CompanionLink>,
    api: Arc<dyn ActionApi>,
    servers: ServerDirectory,
    options: DispatcherOptions,
    state: watch::Sender<RunSnapshot>,
    running: DashSet<String>,
    last_failure: Mutex<Option<Arc<DispatchError>>>,
}

/// Fires actions over the companion link, falling back to a direct call.
#[derive(Clone)]
pub struct ActionDispatcher {
    inner: Arc<Inner>,
}

impl ActionDispatcher {
    pub fn new(
        catalog: &dyn ActionCatalog,
        reachability: Arc<dyn ReachabilityGateway>,
        link: Arc<dyn CompanionLink>,
        api: Arc<dyn ActionApi>,
        servers: ServerDirectory,
        options: DispatcherOptions,
    ) -> Self {
        let (state, _rx) = watch::channel(RunSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                catalog: catalog.subscribe(),
                reachability,
                link,
                api,
                servers,
                options,
                state,
                running: DashSet::new(),
                last_failure: Mutex::new(None),
            }),
        }
    }

    /// Reason the most recent failed run failed.
    pub fn last_failure(&self) -> Option<Arc<DispatchError>> {
        self.inner
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start a run in the background. State is `loading` when this returns
    /// true; false means the id is unknown or already running.
    pub fn trigger(&self, id: &str) -> bool {
        let Some((action, guard)) = self.begin(id) else {
            return false;
        };
        let this = self.clone();
        tokio::spawn(async move { this.complete(action, guard).await });
        true
    }

    fn lookup(&self, id: &str) -> Option<Action> {
        self.inner.catalog.borrow().iter().find(|a| a.id == id).cloned()
    }

    fn begin(&self, id: &str) -> Option<(Action, RunGuard)> {
        let Some(action) = self.lookup(id) else {
            debug!(action_id = %id, "action not in catalog, ignoring");
            return None;
        };
        let Some(guard) = RunGuard::acquire(&self.inner, id) else {
            debug!(action_id = %id, "action already running, ignoring");
            return None;
        };
        self.write_state(ActionRunState::Loading);
        Some((action, guard))
    }

    async fn complete(&self, action: Action, _guard: RunGuard) {
        match self.execute(&action).await {
            Ok(()) => {
                info!(action_id = %action.id, "action fired");
                self.finish(ActionRunState::Success);
            },
            Err(error) => {
                warn!(action_id = %action.id, %error, "action failed");
                *self
                    .inner
                    .last_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(error));
                self.finish(ActionRunState::Failure);
            },
        }
    }

    async fn execute(&self, action: &Action) -> Result<(), DispatchError> {
        if self.inner.reachability.is_immediately_reachable() {
            match self.send_over_link(action).await {
                Ok(()) => return Ok(()),
                Err(error) if !error.falls_back() => return Err(error),
                Err(error) => {
                    debug!(action_id = %action.id, %error, "companion send failed, falling back");
                },
            }
        } else {
            let reason = DispatchError::TransportUnavailable;
            debug!(action_id = %action.id, %reason, "calling server directly");
        }
        self.execute_direct(action).await
    }

    async fn send_over_link(&self, action: &Action) -> Result<(), DispatchError> {
        let reply = self
            .inner
            .link
            .send_message(
                ACTION_ROW_PRESSED,
                json!({ "ActionID": action.id }),
                self.inner.options.reply_timeout,
            )
            .await?;
        match reply.get("fired").and_then(Value::as_bool) {
            Some(true) => Ok(()),
            Some(false) => Err(DispatchError::RemoteExecutionFailed),
            None => Err(DispatchError::NotFired),
        }
    }

    async fn execute_direct(&self, action: &Action) -> Result<(), DispatchError> {
        let server = self
            .inner
            .servers
            .resolve(&action.server)
            .ok_or_else(|| DispatchError::NoServer(action.server.clone()))?;
        self.inner
            .api
            .execute(server, action, &self.inner.options.origin)
            .await?;
        Ok(())
    }

    // ── State ────────────────────────────────────────────────────────────────

    fn write_state(&self, state: ActionRunState) -> u64 {
        let mut revision = 0;
        self.inner.state.send_modify(|snapshot| {
            snapshot.state = state;
            snapshot.revision += 1;
            revision = snapshot.revision;
        });
        revision
    }

    /// Publish a result and schedule its reset. A later write cancels the
    /// reset's effect.
    fn finish(&self, state: ActionRunState) {
        let revision = self.write_state(state);
        let delay = self.inner.options.reset_delay;
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(reset_after(inner, delay, revision));
    }
}

async fn reset_after(inner: Weak<Inner>, delay: Duration, revision: u64) {
    tokio::time::sleep(delay).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let reset = inner.state.send_if_modified(|snapshot| {
        if snapshot.revision != revision || !snapshot.state.is_terminal() {
            return false;
        }
        snapshot.state = ActionRunState::Idle;
        snapshot.revision += 1;
        true
    });
    if !reset {
        debug!(revision, "stale idle reset skipped");
    }
}

#[async_trait]
impl ActionRunner for ActionDispatcher {
    fn state(&self) -> ActionRunState {
        self.inner.state.borrow().state
    }

    fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.inner.state.subscribe()
    }

    async fn run_action_id(&self, id: &str) {
        if let Some((action, guard)) = self.begin(id) {
            self.complete(action, guard).await;
        }
    }
}

/// Marks an action as running until dropped.
struct RunGuard {
    inner: Arc<Inner>,
    id: String,
}

impl RunGuard {
    fn acquire(inner: &Arc<Inner>, id: &str) -> Option<Self> {
        inner.running.insert(id.to_string()).then(|| Self {
            inner: Arc::clone(inner),
            id: id.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.running.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            api::ServerEndpoint,
            catalog::{MemoryCatalog, tests::action},
            error::LinkError,
            reachability::LinkReachability,
        },
        hearth_config::ServerEntry,
        hearth_onboarding::TransportError,
        reqwest::StatusCode,
        std::sync::atomic::{AtomicUsize, Ordering},
        tokio::sync::Notify,
    };

    const RESET: Duration = Duration::from_millis(1_000);

    enum LinkBehavior {
        Reply(Value),
        Fail,
        /// Wait for `release`, or time out.
        Hang,
    }

    struct FakeLink {
        behavior: LinkBehavior,
        sent: AtomicUsize,
        release: Notify,
        /// State observed while the message was in flight.
        observed: Mutex<Vec<ActionRunState>>,
        dispatcher_state: Mutex<Option<watch::Receiver<RunSnapshot>>>,
    }

    impl FakeLink {
        fn new(behavior: LinkBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                sent: AtomicUsize::new(0),
                release: Notify::new(),
                observed: Mutex::new(Vec::new()),
                dispatcher_state: Mutex::new(None),
            })
        }

        fn sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    fn replying(reply: Value) -> Arc<FakeLink> {
        FakeLink::new(LinkBehavior::Reply(reply))
    }

    #[async_trait]
    impl CompanionLink for FakeLink {
        async fn send_message(
            &self,
            identifier: &str,
            content: Value,
            timeout: Duration,
        ) -> Result<Value, LinkError> {
            assert_eq!(identifier, ACTION_ROW_PRESSED);
            assert!(content.get("ActionID").is_some());
            self.sent.fetch_add(1, Ordering::SeqCst);
            if let Some(rx) = self.dispatcher_state.lock().unwrap().as_ref() {
                self.observed.lock().unwrap().push(rx.borrow().state);
            }
            match &self.behavior {
                LinkBehavior::Reply(reply) => Ok(reply.clone()),
                LinkBehavior::Fail => Err(LinkError::Disconnected),
                LinkBehavior::Hang => {
                    tokio::time::timeout(timeout, self.release.notified())
                        .await
                        .map_err(|_| LinkError::Timeout)?;
                    Ok(json!({"fired": true}))
                },
            }
        }
    }

    struct FakeApi {
        status: Option<StatusCode>,
        calls: AtomicUsize,
        origins: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                status: None,
                calls: AtomicUsize::new(0),
                origins: Mutex::new(Vec::new()),
            })
        }

        fn failing(status: StatusCode) -> Arc<Self> {
            Arc::new(Self {
                status: Some(status),
                calls: AtomicUsize::new(0),
                origins: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionApi for FakeApi {
        async fn execute(
            &self,
            server: &ServerEndpoint,
            _action: &Action,
            origin: &str,
        ) -> Result<(), TransportError> {
            assert_eq!(server.id, "home");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.origins.lock().unwrap().push(origin.to_string());
            match self.status {
                None => Ok(()),
                Some(status) => Err(TransportError::Status { status, body: None }),
            }
        }
    }

    struct Harness {
        dispatcher: ActionDispatcher,
        catalog: MemoryCatalog,
        reachability: Arc<LinkReachability>,
        link: Arc<FakeLink>,
        api: Arc<FakeApi>,
    }

    fn harness(reachable: bool, link: Arc<FakeLink>, api: Arc<FakeApi>) -> Harness {
        let catalog = MemoryCatalog::new([action("porch", 0), action("garage", 1)]);
        let reachability = Arc::new(LinkReachability::new(reachable));
        let mut servers = ServerDirectory::default();
        let home = ServerEntry::new("https://home.hearth.test");
        servers.insert(ServerEndpoint::from_entry("home", &home).unwrap());
        let dispatcher = ActionDispatcher::new(
            &catalog,
            reachability.clone(),
            link.clone(),
            api.clone(),
            servers,
            DispatcherOptions {
                reset_delay: RESET,
                reply_timeout: Duration::from_secs(10),
                origin: "Watch".into(),
            },
        );
        *link.dispatcher_state.lock().unwrap() = Some(dispatcher.subscribe());
        Harness {
            dispatcher,
            catalog,
            reachability,
            link,
            api,
        }
    }

    async fn settle() {
        tokio::time::sleep(RESET * 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_action_is_a_no_op() {
        let h = harness(true, replying(json!({"fired": true})), FakeApi::ok());
        h.dispatcher.run_action_id("nope").await;
        assert_eq!(*h.dispatcher.subscribe().borrow(), RunSnapshot::default());
        assert!(!h.dispatcher.trigger("nope"));
        assert_eq!(h.link.sent(), 0);
        assert_eq!(h.api.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_reply_succeeds_without_direct_call() {
        let h = harness(true, replying(json!({"fired": true})), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;

        assert_eq!(*h.link.observed.lock().unwrap(), vec![ActionRunState::Loading]);
        assert_eq!(h.dispatcher.state(), ActionRunState::Success);
        assert_eq!(h.api.calls(), 0);

        settle().await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_link_calls_server() {
        let h = harness(false, FakeLink::new(LinkBehavior::Fail), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Success);
        assert_eq!(h.link.sent(), 0);
        assert_eq!(h.api.calls(), 1);
        assert_eq!(*h.api.origins.lock().unwrap(), vec!["Watch".to_string()]);

        settle().await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_direct_call_fails_then_clears() {
        let api = FakeApi::failing(StatusCode::BAD_GATEWAY);
        let h = harness(false, FakeLink::new(LinkBehavior::Fail), api);
        h.dispatcher.run_action_id("porch").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Failure);
        assert!(matches!(
            h.dispatcher.last_failure().as_deref(),
            Some(DispatchError::Direct(TransportError::Status { .. }))
        ));

        settle().await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_not_fired_skips_fallback() {
        let h = harness(true, replying(json!({"fired": false})), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Failure);
        assert_eq!(h.api.calls(), 0);
        assert!(matches!(
            h.dispatcher.last_failure().as_deref(),
            Some(DispatchError::RemoteExecutionFailed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn link_errors_fall_back() {
        let h = harness(true, FakeLink::new(LinkBehavior::Fail), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Success);
        assert_eq!((h.link.sent(), h.api.calls()), (1, 1));

        let h = harness(true, replying(json!({"ok": true})), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Success);
        assert_eq!(h.api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_falls_back() {
        let h = harness(true, FakeLink::new(LinkBehavior::Hang), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Success);
        assert_eq!(h.api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_server_fails() {
        let h = harness(false, FakeLink::new(LinkBehavior::Fail), FakeApi::ok());
        let mut orphan = action("orphan", 3);
        orphan.server = "cabin".into();
        h.catalog.upsert(orphan);

        h.dispatcher.run_action_id("orphan").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Failure);
        assert!(matches!(
            h.dispatcher.last_failure().as_deref(),
            Some(DispatchError::NoServer(id)) if id == "cabin"
        ));
        assert_eq!(h.api.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_result_governs_idle_reset() {
        let h = harness(false, FakeLink::new(LinkBehavior::Fail), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        h.dispatcher.run_action_id("garage").await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Success);

        // The first reset comes due here and must not clear the second result.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Success);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.dispatcher.state(), ActionRunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn running_action_is_not_restarted() {
        let h = harness(true, FakeLink::new(LinkBehavior::Hang), FakeApi::ok());
        assert!(h.dispatcher.trigger("porch"));
        assert_eq!(h.dispatcher.state(), ActionRunState::Loading);
        tokio::task::yield_now().await;

        h.dispatcher.run_action_id("porch").await;
        assert!(!h.dispatcher.trigger("porch"));
        assert_eq!(h.link.sent(), 1);

        h.link.release.notify_one();
        let mut rx = h.dispatcher.subscribe();
        rx.wait_for(|s| s.state == ActionRunState::Success).await.unwrap();
        assert_eq!(h.api.calls(), 0);

        // Finished runs release the guard.
        assert!(h.dispatcher.trigger("porch"));
    }

    #[tokio::test(start_paused = true)]
    async fn catalog_changes_apply_to_next_run() {
        let h = harness(true, replying(json!({"fired": true})), FakeApi::ok());

        h.dispatcher.run_action_id("lamp").await;
        assert_eq!(h.link.sent(), 0);

        h.catalog.upsert(action("lamp", 5));
        h.dispatcher.run_action_id("lamp").await;
        assert_eq!(h.link.sent(), 1);

        h.catalog.remove("porch");
        settle().await;
        h.dispatcher.run_action_id("porch").await;
        assert_eq!(h.link.sent(), 1);
        assert_eq!(h.dispatcher.state(), ActionRunState::Idle);

        let mut hidden = action("garage", 1);
        hidden.show_on_watch = false;
        h.catalog.upsert(hidden);
        h.dispatcher.run_action_id("garage").await;
        assert_eq!(h.link.sent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reachability_is_read_at_decision_time() {
        let h = harness(false, replying(json!({"fired": true})), FakeApi::ok());
        h.dispatcher.run_action_id("porch").await;
        assert_eq!((h.link.sent(), h.api.calls()), (0, 1));

        h.reachability.set(true);
        h.dispatcher.run_action_id("porch").await;
        assert_eq!((h.link.sent(), h.api.calls()), (1, 1));
    }

    /// Stand-in for the dispatcher where only the command is of interest.
    struct RecordingRunner {
        pressed: Mutex<Vec<String>>,
        state: watch::Sender<RunSnapshot>,
    }

    #[async_trait]
    impl ActionRunner for RecordingRunner {
        fn state(&self) -> ActionRunState {
            self.state.borrow().state
        }

        fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
            self.state.subscribe()
        }

        async fn run_action_id(&self, id: &str) {
            self.pressed.lock().unwrap().push(id.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runners_are_interchangeable() {
        let h = harness(true, replying(json!({"fired": true})), FakeApi::ok());
        let recording = Arc::new(RecordingRunner {
            pressed: Mutex::new(Vec::new()),
            state: watch::channel(RunSnapshot::default()).0,
        });
        let production: Arc<dyn ActionRunner> = Arc::new(h.dispatcher.clone());
        let stub: Arc<dyn ActionRunner> = recording.clone();
        let runners = [production, stub];
        for runner in &runners {
            runner.run_action_id("porch").await;
        }
        assert_eq!(*recording.pressed.lock().unwrap(), vec!["porch".to_string()]);
        assert_eq!(recording.state(), ActionRunState::Idle);
        assert_eq!(runners[0].state(), ActionRunState::Success);
    }
}
