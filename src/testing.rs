//! In-memory identity backend and profile store for tests.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::controller::{ControllerStats, SessionController};
use crate::identity::{
    AuthError, AuthIdentity, Connector, IdentityClient, Metadata, Session, SessionEvent,
    SessionEventKind, SignUp, Subscribers, Subscription,
};
use crate::profile::{ProfileError, ProfileLookup, ProfileRecord, ProfileStore, ProfileUpdate, Role};
use crate::surface::{AuthContext, AuthState};

const WAIT: Duration = Duration::from_secs(5);

pub fn session_for(identity: &AuthIdentity) -> Session {
    Session {
        access_token: format!("access-{}", identity.id),
        refresh_token: format!("refresh-{}", identity.id),
        token_type: "bearer".to_string(),
        expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        user: identity.clone(),
    }
}

/// Poll `cond` until it holds, panicking after a few seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let polled = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    if tokio::time::timeout(WAIT, polled).await.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

pub async fn wait_stats<F: Fn(&ControllerStats) -> bool>(controller: &SessionController, pred: F) {
    eventually("controller stats", || pred(&controller.stats())).await;
}

/// Wait until `events` session events were handled and no fetch is outstanding.
pub async fn settle(controller: &SessionController, events: u64) {
    wait_stats(controller, |s| s.events_handled >= events && s.is_idle()).await;
}

pub async fn wait_for<F: Fn(&AuthState) -> bool>(ctx: &AuthContext, pred: F) -> Arc<AuthState> {
    match tokio::time::timeout(WAIT, ctx.wait_until(pred)).await {
        Ok(state) => state,
        Err(_) => panic!("timed out waiting for state, last: {:?}", ctx.state()),
    }
}

/// Identity backend held entirely in memory.
#[derive(Default)]
pub struct FakeIdentity {
    session: Mutex<Option<Session>>,
    switch_after_read: Mutex<Option<Option<Session>>>,
    accounts: Mutex<HashMap<String, (String, AuthIdentity)>>,
    subscribers: Subscribers,
    get_session_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    fail_sign_out: AtomicBool,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored session without emitting anything.
    pub fn set_session(&self, identity: Option<AuthIdentity>) {
        *self.session.lock() = identity.as_ref().map(session_for);
    }

    /// The next `get_session` returns the current session, then switches to `identity`.
    pub fn switch_after_first_read(&self, identity: Option<AuthIdentity>) {
        *self.switch_after_read.lock() = Some(identity.as_ref().map(session_for));
    }

    pub fn add_account(&self, email: &str, password: &str, identity: AuthIdentity) {
        self.accounts
            .lock()
            .insert(email.to_string(), (password.to_string(), identity));
    }

    pub fn emit(&self, kind: SessionEventKind, session: Option<Session>) {
        self.subscribers.emit(SessionEvent::new(kind, session));
    }

    /// Emit `kind` carrying whatever session is currently stored.
    pub fn emit_current(&self, kind: SessionEventKind) {
        let session = self.session.lock().clone();
        self.emit(kind, session);
    }

    /// End every open session-change stream.
    pub fn close_streams(&self) {
        self.subscribers.close();
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.fail_sign_out.store(fail, Ordering::SeqCst);
    }

    pub fn get_session_calls(&self) -> usize {
        self.get_session_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn start_session(&self, identity: &AuthIdentity) -> Session {
        let session = session_for(identity);
        *self.session.lock() = Some(session.clone());
        self.emit(SessionEventKind::SignedIn, Some(session.clone()));
        session
    }
}

#[async_trait]
impl IdentityClient for FakeIdentity {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        let mut session = self.session.lock();
        let current = session.clone();
        if let Some(next) = self.switch_after_read.lock().take() {
            *session = next;
        }
        Ok(current)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(AuthIdentity, Session), AuthError> {
        let identity = match self.accounts.lock().get(email) {
            Some((expected, identity)) if expected == password => identity.clone(),
            _ => {
                return Err(AuthError::Rejected {
                    code: "invalid_credentials".to_string(),
                    message: "Invalid login credentials".to_string(),
                })
            }
        };
        let session = self.start_session(&identity);
        Ok((identity, session))
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Metadata,
    ) -> Result<SignUp, AuthError> {
        let identity = {
            let mut accounts = self.accounts.lock();
            if accounts.contains_key(email) {
                return Err(AuthError::Rejected {
                    code: "user_already_exists".to_string(),
                    message: "User already registered".to_string(),
                });
            }
            let identity = AuthIdentity {
                id: uuid::Uuid::new_v4().to_string(),
                email: email.to_string(),
                metadata,
            };
            accounts.insert(email.to_string(), (password.to_string(), identity.clone()));
            identity
        };
        let session = self.start_session(&identity);
        Ok(SignUp {
            identity,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(AuthError::Network("connection reset".to_string()));
        }
        *self.session.lock() = None;
        self.emit(SessionEventKind::SignedOut, None);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe(None)
    }
}

/// Connector whose backend is never reachable.
pub struct FailingConnector;

impl Connector for FailingConnector {
    fn connect(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
        Err(AuthError::BackendUnavailable("backend url not configured".to_string()))
    }
}

/// Profile store held in memory, with switchable failures and fetch gates.
#[derive(Default)]
pub struct FakeProfileStore {
    rows: Mutex<HashMap<String, ProfileRecord>>,
    gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
    fetches: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    fail_fetches: AtomicBool,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
    return_empty: AtomicBool,
}

impl FakeProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a default row for `user_id`, or change the role of the existing one.
    pub fn insert_role(&self, user_id: &str, role: Role) {
        let mut rows = self.rows.lock();
        let row = rows.entry(user_id.to_string()).or_insert_with(|| {
            let identity = AuthIdentity::new(user_id, format!("{}@example.com", user_id));
            ProfileRecord::default_for(&identity, Utc::now())
        });
        row.role = role;
    }

    /// The next fetch reads its row immediately but resolves only once the
    /// returned sender fires (or is dropped).
    pub fn hold_next_fetch(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().push_back(rx);
        tx
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn return_empty(&self, empty: bool) {
        self.return_empty.store(empty, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn denied(operation: &str) -> ProfileError {
        ProfileError::Store {
            code: "42501".to_string(),
            message: format!("permission denied for {}", operation),
        }
    }
}

#[async_trait]
impl ProfileStore for FakeProfileStore {
    async fn fetch(&self, user_id: &str) -> Result<ProfileLookup, ProfileError> {
        let (lookup, gate) = {
            let rows = self.rows.lock();
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let lookup = if self.fail_fetches.load(Ordering::SeqCst) {
                Err(Self::denied("select"))
            } else if self.return_empty.load(Ordering::SeqCst) {
                Ok(ProfileLookup::Empty)
            } else {
                Ok(match rows.get(user_id) {
                    Some(row) => ProfileLookup::Found(row.clone()),
                    None => ProfileLookup::Missing,
                })
            };
            (lookup, self.gates.lock().pop_front())
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        lookup
    }

    async fn create_default(&self, identity: &AuthIdentity) -> Result<ProfileRecord, ProfileError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Self::denied("insert"));
        }
        let record = ProfileRecord::default_for(identity, Utc::now());
        self.rows.lock().insert(identity.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, user_id: &str, fields: &ProfileUpdate) -> Result<(), ProfileError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::denied("update"));
        }
        let now = Utc::now();
        let mut rows = self.rows.lock();
        let row = rows.entry(user_id.to_string()).or_insert_with(|| {
            let identity = AuthIdentity::new(user_id, "");
            ProfileRecord::default_for(&identity, now)
        });
        fields.apply_to(row, now);
        Ok(())
    }
}
