//! The session store: subscribes to identity-change notifications and
//! reconciles each one into a published [`SessionState`] snapshot.
//!
//! Reconciliation of one identity event runs as a pipeline:
//!
//! 1. mark the snapshot loading (and record the new provider identity),
//! 2. decide whether a backend exchange is warranted (not for signed-out,
//!    not for unverified non-anonymous identities),
//! 3. exchange a proof token for an application user,
//! 4. settle: publish all result fields at once with `is_loading` false.
//!
//! Events from the gateway are drained serially by a single task, so two
//! provider events never reconcile concurrently. [`AuthSessionStore::refresh_user`]
//! runs on the caller's task and can race an event; each reconciliation
//! carries a generation number and only the newest may settle.

use crate::error::{SessionError, SessionResult};
use crate::reconcile::{ReconcileInput, ReconcileMachine, ReconcilePhase};
use crate::state::SessionState;
use identity_gateway::{IdentityEvents, IdentityGateway, ProviderIdentity};
use session_exchange::{ApplicationUser, SessionExchanger};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked with every published snapshot.
pub type StateListener = Box<dyn Fn(&SessionState) + Send + Sync>;

type ListenerRegistry = Mutex<Vec<(u64, Arc<StateListener>)>>;

/// Handle to the spawned event-drain task.
///
/// Dropping it detaches the store: the task is aborted and the store stops
/// publishing, so no listener fires after the owner has let go.
pub struct SessionTask {
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Drop for SessionTask {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.handle.abort();
    }
}

/// Subscription handle returned by [`AuthSessionStore::subscribe`].
///
/// The listener stays registered for the lifetime of this handle and is
/// removed on drop.
pub struct StateSubscription {
    registry: Weak<ListenerRegistry>,
    id: u64,
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut listeners = registry.lock().unwrap();
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Reconciles provider identity changes with the application backend and
/// publishes the combined session state.
pub struct AuthSessionStore<G, E> {
    gateway: Arc<G>,
    exchanger: Arc<E>,
    state: Mutex<SessionState>,
    listeners: Arc<ListenerRegistry>,
    next_listener_id: AtomicU64,
    /// Phase machine tracking whether a reconciliation is in flight.
    fsm: Mutex<ReconcileMachine>,
    /// Monotonic reconciliation counter; only the newest generation may
    /// settle the snapshot.
    generation: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl<G, E> AuthSessionStore<G, E>
where
    G: IdentityGateway + Send + Sync + 'static,
    E: SessionExchanger + Send + Sync + 'static,
{
    /// Create a new store. The snapshot starts loading and unauthenticated;
    /// nothing happens until [`attach`](Self::attach) is called.
    pub fn new(gateway: Arc<G>, exchanger: Arc<E>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            exchanger,
            state: Mutex::new(SessionState::initial()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            fsm: Mutex::new(ReconcileMachine::new()),
            generation: AtomicU64::new(0),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Subscribe to the gateway's identity events and spawn the drain task.
    ///
    /// The gateway pushes the current identity immediately, so the first
    /// reconciliation (which clears the initial `is_loading`) begins as soon
    /// as the task runs.
    pub fn attach(self: &Arc<Self>) -> SessionTask {
        let events = self.gateway.subscribe();
        let store = Arc::clone(self);
        let alive = Arc::clone(&self.alive);
        let handle = tokio::spawn(async move {
            store.run(events).await;
        });
        SessionTask { alive, handle }
    }

    async fn run(self: Arc<Self>, mut events: IdentityEvents) {
        while let Some(event) = events.recv().await {
            if !self.alive.load(Ordering::SeqCst) {
                break;
            }
            self.handle_provider_event(event).await;
        }
        debug!("Identity event channel closed");
    }

    async fn handle_provider_event(&self, identity: Option<ProviderIdentity>) {
        debug!(signed_in = identity.is_some(), "Provider identity event");

        // Legal from every phase; a failure here would be a machine bug,
        // not a caller error.
        let _ = self.transition(&ReconcileInput::ProviderEvent);

        let generation = self.begin_generation();
        self.publish_begin(Some(identity.clone()));
        self.reconcile(identity, false, generation).await;
    }

    /// Re-fetch the provider identity and reconcile it, forcing a fresh
    /// proof token. Returns the reloaded identity.
    ///
    /// Rejected with [`SessionError::InvalidStateTransition`] while another
    /// reconciliation is in flight, and with [`SessionError::Detached`]
    /// once the store's event task has been dropped.
    pub async fn refresh_user(&self) -> SessionResult<Option<ProviderIdentity>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SessionError::Detached);
        }
        self.transition(&ReconcileInput::RefreshRequested)?;

        let generation = self.begin_generation();
        self.publish_begin(None);

        let identity = match self.gateway.reload_identity().await {
            Ok(identity) => identity,
            Err(err) => {
                // The snapshot must not be left loading, but the stale
                // pre-reload fields stay as they were.
                let snapshot = {
                    let mut state = self.state.lock().unwrap();
                    state.is_loading = false;
                    state.clone()
                };
                let _ = self.transition(&ReconcileInput::Settle);
                self.notify(&snapshot);
                return Err(err.into());
            }
        };

        self.reconcile(identity.clone(), true, generation).await;
        Ok(identity)
    }

    /// Sign out of the provider and tear down the backend session.
    ///
    /// Both remote calls are best-effort: local state is cleared and a
    /// signed-out snapshot published regardless of their outcome.
    pub async fn logout(&self) {
        if let Err(err) = self.gateway.sign_out().await {
            warn!("Provider sign-out failed: {}", err);
        }
        if let Err(err) = self.exchanger.logout().await {
            warn!("Backend session teardown failed: {}", err);
        }

        // Supersede any in-flight reconciliation so its result cannot
        // resurrect the session.
        self.begin_generation();
        let _ = self.transition(&ReconcileInput::ProviderEvent);
        let _ = self.transition(&ReconcileInput::Settle);

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.user = None;
            state.provider_identity = None;
            state.is_email_verified = false;
            state.is_loading = false;
            state.clone()
        };
        self.notify(&snapshot);
        info!("Logged out");
    }

    /// The current published snapshot.
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    /// The current reconciliation phase.
    pub fn phase(&self) -> ReconcilePhase {
        let fsm = self.fsm.lock().unwrap();
        ReconcilePhase::from(fsm.state())
    }

    /// Register a listener invoked with every published snapshot.
    ///
    /// The listener is removed when the returned handle is dropped.
    pub fn subscribe(&self, listener: StateListener) -> StateSubscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        StateSubscription {
            registry: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Bump and return the reconciliation generation.
    fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply an input to the phase machine, logging phase changes.
    fn transition(&self, input: &ReconcileInput) -> SessionResult<()> {
        let mut fsm = self.fsm.lock().unwrap();
        let old_phase = ReconcilePhase::from(fsm.state());

        fsm.consume(input).map_err(|_| {
            SessionError::InvalidStateTransition(format!(
                "Cannot apply {:?} in state {:?}",
                input,
                fsm.state()
            ))
        })?;

        let new_phase = ReconcilePhase::from(fsm.state());
        drop(fsm);

        if old_phase != new_phase {
            debug!(
                old_phase = ?old_phase,
                new_phase = ?new_phase,
                "Reconcile phase transition"
            );
        }
        Ok(())
    }

    /// Publish the start of a reconciliation: `is_loading` goes true and,
    /// for provider events, the new identity is recorded immediately.
    fn publish_begin(&self, identity_update: Option<Option<ProviderIdentity>>) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.is_loading = true;
            if let Some(identity) = identity_update {
                state.provider_identity = identity;
            }
            state.clone()
        };
        self.notify(&snapshot);
    }

    /// Resolve an identity into the full snapshot and settle it.
    async fn reconcile(
        &self,
        identity: Option<ProviderIdentity>,
        force_refresh: bool,
        generation: u64,
    ) {
        match identity {
            Some(identity) if identity.needs_email_validation() => {
                // No backend session until the email is verified. The
                // identity stays visible so the verification screen can
                // address it.
                info!(subject_id = %identity.subject_id, "Identity awaits email verification");
                self.settle(generation, Some(identity), None, false);
            }
            Some(identity) => {
                let user = self.exchange(force_refresh).await;
                self.settle(generation, Some(identity), user, true);
            }
            None => {
                self.settle(generation, None, None, false);
            }
        }
    }

    /// Exchange a proof token for an application user.
    ///
    /// Every failure degrades to `None`: the snapshot reports signed-out at
    /// the application level rather than surfacing an error.
    async fn exchange(&self, force_refresh: bool) -> Option<ApplicationUser> {
        let proof_token = match self.gateway.proof_token(force_refresh).await {
            Ok(token) => token,
            Err(err) => {
                warn!("Proof token unavailable: {}", err);
                return None;
            }
        };

        match self.exchanger.login(&proof_token).await {
            Ok(Some(user)) => {
                info!(user_id = %user.user_id, "Backend session established");
                Some(user)
            }
            Ok(None) => {
                warn!("Backend granted no session for proof token");
                None
            }
            Err(err) => {
                warn!("Backend exchange failed: {}", err);
                None
            }
        }
    }

    /// Publish the settled snapshot, unless a newer reconciliation has
    /// started in the meantime.
    fn settle(
        &self,
        generation: u64,
        identity: Option<ProviderIdentity>,
        user: Option<ApplicationUser>,
        is_email_verified: bool,
    ) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(generation, "Discarding stale reconciliation result");
            return;
        }

        let _ = self.transition(&ReconcileInput::Settle);

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.provider_identity = identity;
            state.user = user;
            state.is_email_verified = is_email_verified;
            state.is_loading = false;
            state.clone()
        };
        self.notify(&snapshot);
    }

    fn notify(&self, snapshot: &SessionState) {
        // Invoke outside the registry lock so a listener can subscribe or
        // drop its own subscription without deadlocking.
        let listeners: Vec<Arc<StateListener>> = {
            let listeners = self.listeners.lock().unwrap();
            listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in listeners {
            listener(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_gateway::{IdentityEvent, ProviderError, ProviderResult, SocialProvider};
    use session_exchange::{ExchangeError, ExchangeResult};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    fn identity(subject_id: &str, anonymous: bool, verified: bool) -> ProviderIdentity {
        ProviderIdentity {
            subject_id: subject_id.to_string(),
            email: (!anonymous).then(|| format!("{subject_id}@example.com")),
            email_verified: verified,
            is_anonymous: anonymous,
        }
    }

    fn app_user(user_id: &str) -> ApplicationUser {
        ApplicationUser {
            user_id: user_id.to_string(),
            email: format!("{user_id}@example.com"),
            name_full: String::new(),
            name_first: String::new(),
            roles: Vec::new(),
            extra: serde_json::Value::Null,
        }
    }

    #[derive(Default)]
    struct MockGateway {
        identity: Mutex<Option<ProviderIdentity>>,
        subscribers: Mutex<Vec<mpsc::UnboundedSender<IdentityEvent>>>,
        reload_results: Mutex<VecDeque<ProviderResult<Option<ProviderIdentity>>>>,
        token_calls: AtomicUsize,
        forced_flags: Mutex<Vec<bool>>,
        fail_token: AtomicBool,
        fail_sign_out: AtomicBool,
    }

    impl MockGateway {
        fn with_identity(identity: Option<ProviderIdentity>) -> Self {
            Self {
                identity: Mutex::new(identity),
                ..Default::default()
            }
        }

        fn emit(&self, identity: Option<ProviderIdentity>) {
            *self.identity.lock().unwrap() = identity.clone();
            let subscribers = self.subscribers.lock().unwrap();
            for tx in subscribers.iter() {
                let _ = tx.send(identity.clone());
            }
        }

        fn script_reload(&self, result: ProviderResult<Option<ProviderIdentity>>) {
            self.reload_results.lock().unwrap().push_back(result);
        }
    }

    impl IdentityGateway for MockGateway {
        async fn sign_in_with_provider(
            &self,
            _provider: SocialProvider,
        ) -> ProviderResult<ProviderIdentity> {
            unimplemented!()
        }

        async fn sign_in_with_password(
            &self,
            _email: &str,
            _password: &str,
        ) -> ProviderResult<ProviderIdentity> {
            unimplemented!()
        }

        async fn sign_up_with_password(
            &self,
            _email: &str,
            _password: &str,
        ) -> ProviderResult<ProviderIdentity> {
            unimplemented!()
        }

        async fn send_password_reset(&self, _email: &str) -> ProviderResult<()> {
            unimplemented!()
        }

        async fn send_sign_in_link(&self, _email: &str, _continue_url: &str) -> ProviderResult<()> {
            unimplemented!()
        }

        fn is_sign_in_link(&self, _link: &str) -> bool {
            false
        }

        async fn complete_sign_in_with_link(
            &self,
            _email: &str,
            _link: &str,
        ) -> ProviderResult<ProviderIdentity> {
            unimplemented!()
        }

        async fn sign_in_anonymously(&self) -> ProviderResult<ProviderIdentity> {
            unimplemented!()
        }

        async fn send_verification_email(&self) -> ProviderResult<()> {
            unimplemented!()
        }

        async fn reload_identity(&self) -> ProviderResult<Option<ProviderIdentity>> {
            match self.reload_results.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(self.identity.lock().unwrap().clone()),
            }
        }

        async fn proof_token(&self, force_refresh: bool) -> ProviderResult<String> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            self.forced_flags.lock().unwrap().push(force_refresh);
            if self.fail_token.load(Ordering::SeqCst) {
                return Err(ProviderError::TokenRefresh("scripted failure".to_string()));
            }
            Ok("proof-token".to_string())
        }

        async fn sign_out(&self) -> ProviderResult<()> {
            *self.identity.lock().unwrap() = None;
            if self.fail_sign_out.load(Ordering::SeqCst) {
                return Err(ProviderError::Rejected("scripted failure".to_string()));
            }
            Ok(())
        }

        fn current_identity(&self) -> Option<ProviderIdentity> {
            self.identity.lock().unwrap().clone()
        }

        fn subscribe(&self) -> IdentityEvents {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(self.identity.lock().unwrap().clone());
            self.subscribers.lock().unwrap().push(tx);
            rx
        }
    }

    enum Behavior {
        User(ApplicationUser),
        Empty,
        Fail,
    }

    struct MockExchanger {
        behavior: Behavior,
        login_calls: AtomicUsize,
        logout_calls: AtomicUsize,
        fail_logout: bool,
        /// When present, `login` signals `entered` then blocks on `release`.
        gate: Option<(Arc<Semaphore>, Arc<Semaphore>)>,
    }

    impl MockExchanger {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                login_calls: AtomicUsize::new(0),
                logout_calls: AtomicUsize::new(0),
                fail_logout: false,
                gate: None,
            }
        }

        fn gated(behavior: Behavior) -> (Self, Arc<Semaphore>, Arc<Semaphore>) {
            let entered = Arc::new(Semaphore::new(0));
            let release = Arc::new(Semaphore::new(0));
            let mut exchanger = Self::new(behavior);
            exchanger.gate = Some((Arc::clone(&entered), Arc::clone(&release)));
            (exchanger, entered, release)
        }
    }

    impl SessionExchanger for MockExchanger {
        async fn login(&self, _proof_token: &str) -> ExchangeResult<Option<ApplicationUser>> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            if let Some((entered, release)) = &self.gate {
                entered.add_permits(1);
                release.acquire().await.unwrap().forget();
            }
            match &self.behavior {
                Behavior::User(user) => Ok(Some(user.clone())),
                Behavior::Empty => Ok(None),
                Behavior::Fail => Err(ExchangeError::Rejected {
                    status: 500,
                    body: "scripted failure".to_string(),
                }),
            }
        }

        async fn logout(&self) -> ExchangeResult<()> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_logout {
                return Err(ExchangeError::Rejected {
                    status: 500,
                    body: "scripted failure".to_string(),
                });
            }
            Ok(())
        }
    }

    type TestStore = Arc<AuthSessionStore<MockGateway, MockExchanger>>;

    fn store(
        gateway: MockGateway,
        exchanger: MockExchanger,
    ) -> (TestStore, Arc<MockGateway>, Arc<MockExchanger>) {
        let gateway = Arc::new(gateway);
        let exchanger = Arc::new(exchanger);
        let store = AuthSessionStore::new(Arc::clone(&gateway), Arc::clone(&exchanger));
        (store, gateway, exchanger)
    }

    /// Poll until the snapshot satisfies `predicate`, or panic after ~2s.
    async fn wait_for(store: &TestStore, predicate: impl Fn(&SessionState) -> bool) {
        for _ in 0..200 {
            if predicate(&store.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("snapshot never satisfied predicate: {:?}", store.snapshot());
    }

    #[tokio::test]
    async fn test_initial_event_settles_signed_out() {
        let (store, _gateway, exchanger) =
            store(MockGateway::default(), MockExchanger::new(Behavior::Empty));
        let _task = store.attach();

        wait_for(&store, |s| !s.is_loading).await;

        let state = store.snapshot();
        assert!(!state.is_authenticated());
        assert!(state.provider_identity.is_none());
        assert_eq!(exchanger.login_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.phase(), ReconcilePhase::Settled);
    }

    #[tokio::test]
    async fn test_sign_in_establishes_backend_session() {
        let (store, gateway, exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, true)));
        wait_for(&store, |s| s.is_authenticated()).await;

        let state = store.snapshot();
        assert_eq!(state.user.as_ref().unwrap().user_id, "u1");
        assert!(state.is_email_verified);
        assert!(!state.is_loading);
        assert_eq!(exchanger.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loading_spans_each_reconciliation() {
        let (store, gateway, _exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );

        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let _subscription = store.subscribe(Box::new(move |state| {
            sink.lock().unwrap().push(state.is_loading);
        }));

        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, true)));
        wait_for(&store, |s| s.is_authenticated()).await;

        // Initial event and the sign-in each publish a loading snapshot
        // followed by a settled one.
        assert_eq!(*observed.lock().unwrap(), vec![true, false, true, false]);
    }

    #[tokio::test]
    async fn test_unverified_identity_gets_no_backend_session() {
        let (store, gateway, exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, false)));
        wait_for(&store, |s| s.provider_identity.is_some() && !s.is_loading).await;

        let state = store.snapshot();
        assert!(state.user.is_none());
        assert!(!state.is_email_verified);
        assert_eq!(exchanger.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_anonymous_identity_counts_as_verified() {
        let (store, gateway, exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::User(app_user("guest-1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("anon-1", true, false)));
        wait_for(&store, |s| s.is_authenticated()).await;

        let state = store.snapshot();
        assert!(state.is_email_verified);
        assert_eq!(exchanger.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exchange_failure_degrades_to_unauthenticated() {
        let (store, gateway, _exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::Fail),
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, true)));
        wait_for(&store, |s| s.provider_identity.is_some() && !s.is_loading).await;

        let state = store.snapshot();
        assert!(state.user.is_none());
        assert!(state.is_email_verified);
    }

    #[tokio::test]
    async fn test_empty_exchange_response_means_no_session() {
        let (store, gateway, _exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::Empty),
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, true)));
        wait_for(&store, |s| s.provider_identity.is_some() && !s.is_loading).await;

        assert!(store.snapshot().user.is_none());
    }

    #[tokio::test]
    async fn test_proof_token_failure_degrades_to_unauthenticated() {
        let gateway = MockGateway::default();
        gateway.fail_token.store(true, Ordering::SeqCst);
        let (store, gateway, exchanger) =
            store(gateway, MockExchanger::new(Behavior::User(app_user("u1"))));
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, true)));
        wait_for(&store, |s| s.provider_identity.is_some() && !s.is_loading).await;

        assert!(store.snapshot().user.is_none());
        assert_eq!(exchanger.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sign_out_event_clears_session() {
        let (store, gateway, _exchanger) = store(
            MockGateway::with_identity(Some(identity("subject-1", false, true))),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| s.is_authenticated()).await;

        gateway.emit(None);
        wait_for(&store, |s| !s.is_authenticated() && !s.is_loading).await;

        let state = store.snapshot();
        assert!(state.provider_identity.is_none());
        assert!(!state.is_email_verified);
    }

    #[tokio::test]
    async fn test_logout_clears_state_despite_remote_failures() {
        let gateway = MockGateway::with_identity(Some(identity("subject-1", false, true)));
        gateway.fail_sign_out.store(true, Ordering::SeqCst);
        let mut exchanger = MockExchanger::new(Behavior::User(app_user("u1")));
        exchanger.fail_logout = true;

        let (store, _gateway, exchanger) = store(gateway, exchanger);
        let _task = store.attach();
        wait_for(&store, |s| s.is_authenticated()).await;

        store.logout().await;

        let state = store.snapshot();
        assert!(!state.is_authenticated());
        assert!(state.provider_identity.is_none());
        assert!(!state.is_loading);
        assert_eq!(exchanger.logout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_user_forces_fresh_proof_token() {
        let (store, gateway, _exchanger) = store(
            MockGateway::with_identity(Some(identity("subject-1", false, true))),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| s.is_authenticated()).await;

        let reloaded = store.refresh_user().await.unwrap();
        assert_eq!(reloaded.unwrap().subject_id, "subject-1");

        let forced = gateway.forced_flags.lock().unwrap().clone();
        assert_eq!(forced, vec![false, true]);
        assert!(!store.snapshot().is_loading);
    }

    #[tokio::test]
    async fn test_refresh_user_picks_up_signed_out_provider() {
        let (store, gateway, _exchanger) = store(
            MockGateway::with_identity(Some(identity("subject-1", false, true))),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| s.is_authenticated()).await;

        gateway.script_reload(Ok(None));
        let reloaded = store.refresh_user().await.unwrap();
        assert!(reloaded.is_none());

        let state = store.snapshot();
        assert!(!state.is_authenticated());
        assert!(state.provider_identity.is_none());
    }

    #[tokio::test]
    async fn test_refresh_user_while_signed_out_returns_none() {
        let (store, _gateway, exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        let reloaded = store.refresh_user().await.unwrap();
        assert!(reloaded.is_none());
        assert!(store.snapshot().user.is_none());
        assert_eq!(exchanger.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_user_reraises_reload_errors() {
        let (store, gateway, _exchanger) = store(
            MockGateway::with_identity(Some(identity("subject-1", false, true))),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| s.is_authenticated()).await;

        gateway.script_reload(Err(ProviderError::Timeout));
        let result = store.refresh_user().await;
        assert!(matches!(result, Err(SessionError::Provider(_))));

        // The loading flag is restored and the prior session kept.
        let state = store.snapshot();
        assert!(!state.is_loading);
        assert!(state.is_authenticated());
        assert_eq!(store.phase(), ReconcilePhase::Settled);
    }

    #[tokio::test]
    async fn test_refresh_user_rejected_while_reconciling() {
        let (exchanger, entered, release) = MockExchanger::gated(Behavior::User(app_user("u1")));
        let (store, gateway, _exchanger) = store(
            MockGateway::default(),
            exchanger,
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, true)));
        entered.acquire().await.unwrap().forget();

        let result = store.refresh_user().await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidStateTransition(_))
        ));

        release.add_permits(1);
        wait_for(&store, |s| s.is_authenticated()).await;
    }

    #[tokio::test]
    async fn test_stale_refresh_result_is_discarded() {
        let (exchanger, entered, release) = MockExchanger::gated(Behavior::User(app_user("u1")));
        let (store, gateway, _exchanger) = store(
            MockGateway::with_identity(Some(identity("subject-1", false, true))),
            exchanger,
        );
        let _task = store.attach();
        // Block the initial reconciliation's exchange, then let it through
        // so the store settles authenticated.
        entered.acquire().await.unwrap().forget();
        release.add_permits(1);
        wait_for(&store, |s| s.is_authenticated()).await;

        // Start a refresh whose exchange blocks on the gate.
        let refresh_store = Arc::clone(&store);
        let refresh = tokio::spawn(async move { refresh_store.refresh_user().await });
        entered.acquire().await.unwrap().forget();

        // A sign-out event supersedes it and settles immediately.
        gateway.emit(None);
        wait_for(&store, |s| s.provider_identity.is_none() && !s.is_loading).await;

        // Unblock the refresh; its result must not resurrect the session.
        release.add_permits(1);
        refresh.await.unwrap().unwrap();

        let state = store.snapshot();
        assert!(!state.is_authenticated());
        assert!(state.provider_identity.is_none());
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_receiving() {
        let (store, gateway, _exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let subscription = store.subscribe(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        drop(subscription);

        gateway.emit(Some(identity("subject-1", false, true)));
        wait_for(&store, |s| s.is_authenticated()).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_may_drop_its_own_subscription() {
        let (store, gateway, _exchanger) =
            store(MockGateway::default(), MockExchanger::new(Behavior::Empty));

        let slot: Arc<Mutex<Option<StateSubscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let own_slot = Arc::clone(&slot);
        let subscription = store.subscribe(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            drop(own_slot.lock().unwrap().take());
        }));
        *slot.lock().unwrap() = Some(subscription);

        let _task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        gateway.emit(Some(identity("subject-1", false, true)));
        wait_for(&store, |s| s.provider_identity.is_some() && !s.is_loading).await;

        // The listener removed itself during the first snapshot and saw
        // nothing afterwards.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_user_on_detached_store_is_rejected() {
        let (store, _gateway, _exchanger) =
            store(MockGateway::default(), MockExchanger::new(Behavior::Empty));
        let task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        drop(task);
        let result = store.refresh_user().await;
        assert!(matches!(result, Err(SessionError::Detached)));
    }

    #[tokio::test]
    async fn test_detached_store_stops_publishing() {
        let (store, gateway, _exchanger) = store(
            MockGateway::default(),
            MockExchanger::new(Behavior::User(app_user("u1"))),
        );
        let task = store.attach();
        wait_for(&store, |s| !s.is_loading).await;

        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let _subscription = store.subscribe(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        drop(task);
        gateway.emit(Some(identity("subject-1", false, true)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!store.snapshot().is_authenticated());
    }
}
