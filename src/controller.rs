//! Session controller.
//!
//! Owns the current session, the merged [`ExtendedUser`] and the fetch cache,
//! and is the only writer of all three. Lifecycle:
//!
//! - `Uninitialized --start()--> Initializing`: concurrent `start()` calls
//!   share one initialization.
//! - `Initializing`: read the current session; if a user is present resolve
//!   their profile before moving on.
//! - `Ready`: subscribe to session changes, then re-read the session once to
//!   pick up anything that changed while initializing.
//!
//! Every profile fetch carries a sequence number and the sign-out epoch it was
//! issued in. A result is applied only if no sign-out happened since, the
//! session still belongs to the same user, and no later-issued fetch for that
//! user has already been applied.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::{FetchState, ProfileFetchCache};
use crate::error::SessionError;
use crate::identity::{
    AuthError, AuthIdentity, IdentityAdapter, Metadata, Session, SessionEvent, SessionEventKind,
    SignUp, Subscription,
};
use crate::profile::{ProfileLookup, ProfileRecord, ProfileStore, ProfileUpdate};
use crate::surface::{AuthContext, AuthState, Phase};
use crate::user::ExtendedUser;

/// Why a fetch result was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// A sign-out happened after the fetch was issued
    SignedOut,
    /// The session now belongs to a different user
    UserChanged,
    /// A later-issued fetch for the same user was already applied
    Superseded,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StaleReason::SignedOut => "signed_out",
            StaleReason::UserChanged => "user_changed",
            StaleReason::Superseded => "superseded",
        })
    }
}

/// What happened to a completed profile fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied,
    Discarded(StaleReason),
}

/// Counters describing controller activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub events_handled: u64,
    pub fetches_issued: u64,
    pub fetches_applied: u64,
    pub fetches_discarded: u64,
}

impl ControllerStats {
    /// No fetch is outstanding.
    pub fn is_idle(&self) -> bool {
        self.fetches_issued == self.fetches_applied + self.fetches_discarded
    }
}

#[derive(Debug, Default)]
struct Counters {
    events_handled: AtomicU64,
    fetches_issued: AtomicU64,
    fetches_applied: AtomicU64,
    fetches_discarded: AtomicU64,
}

/// State guarded by the writer lock
#[derive(Debug, Default)]
struct Writer {
    /// Bumped on every sign-out
    epoch: u64,
    /// Highest applied fetch sequence per user
    last_applied: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy)]
struct FetchTicket {
    seq: u64,
    epoch: u64,
}

struct Inner {
    identity: IdentityAdapter,
    profiles: Arc<dyn ProfileStore>,
    cache: ProfileFetchCache,
    state: ArcSwap<AuthState>,
    writer: Mutex<Writer>,
    next_seq: AtomicU64,
    changes: watch::Sender<u64>,
    init: OnceCell<()>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    counters: Counters,
}

/// Single owner of the session/profile lifecycle.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(identity: IdentityAdapter, profiles: Arc<dyn ProfileStore>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                identity,
                profiles,
                cache: ProfileFetchCache::new(),
                state: ArcSwap::from_pointee(AuthState::default()),
                writer: Mutex::new(Writer::default()),
                next_seq: AtomicU64::new(0),
                changes,
                init: OnceCell::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// The read-only surface handed to the rest of the application.
    pub fn context(&self) -> AuthContext {
        AuthContext::new(self.clone())
    }

    pub fn state(&self) -> Arc<AuthState> {
        self.inner.state.load_full()
    }

    pub(crate) fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn cache(&self) -> &ProfileFetchCache {
        &self.inner.cache
    }

    pub fn stats(&self) -> ControllerStats {
        let c = &self.inner.counters;
        ControllerStats {
            events_handled: c.events_handled.load(Ordering::SeqCst),
            fetches_issued: c.fetches_issued.load(Ordering::SeqCst),
            fetches_applied: c.fetches_applied.load(Ordering::SeqCst),
            fetches_discarded: c.fetches_discarded.load(Ordering::SeqCst),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.state().is_admin()
    }

    pub fn is_manager(&self) -> bool {
        self.state().is_manager()
    }

    /// Resolve the initial session and start listening for changes.
    ///
    /// Idempotent; concurrent callers wait for the same initialization.
    /// Never fails: backend problems end in `Ready` with no user.
    pub async fn start(&self) {
        let inner = self.inner.clone();
        self.inner
            .init
            .get_or_init(|| inner.initialize())
            .await;
    }

    /// Stop listening for session changes and drop all fetch markers.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.cache.clear();
        tracing::info!("Session controller stopped");
    }

    /// Delegates to the identity backend. State changes arrive through the
    /// resulting session event, never from this call.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(AuthIdentity, Session), AuthError> {
        self.inner.identity.sign_in_with_password(email, password).await
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Metadata>,
    ) -> Result<SignUp, AuthError> {
        self.inner.identity.sign_up(email, password, metadata).await
    }

    /// Clear local state right away, then sign out at the backend.
    pub async fn sign_out(&self) {
        self.inner.clear_session("sign_out");
        self.inner.identity.sign_out().await;
    }

    /// Re-fetch the current user's profile regardless of cache state.
    pub async fn refresh_user(&self) {
        if self.force_fetch().await.is_none() {
            tracing::debug!("refresh_user called without a session");
        }
    }

    /// Write profile fields, then re-fetch so the user reflects the stored row.
    pub async fn update_profile(&self, fields: ProfileUpdate) -> Result<(), SessionError> {
        let user_id = self
            .state()
            .user_id()
            .map(str::to_string)
            .ok_or(SessionError::NotSignedIn)?;

        if let Err(e) = self.inner.profiles.update(&user_id, &fields).await {
            tracing::error!(
                user_id = %user_id,
                operation = "update_profile",
                code = e.code(),
                error = %e,
                "Profile update failed"
            );
            return Err(e.into());
        }

        tracing::info!(user_id = %user_id, "Profile updated");
        self.force_fetch().await;
        Ok(())
    }

    pub(crate) async fn force_fetch(&self) -> Option<FetchOutcome> {
        let identity = self.state().session.as_ref()?.user.clone();
        let ticket = self.inner.begin_fetch(&identity.id, true)?;
        self.inner.spawn_fetch(identity, ticket).await
    }
}

impl Inner {
    /// Publish a new snapshot. Callers hold the writer lock.
    fn publish<F>(&self, _writer: &Writer, f: F)
    where
        F: FnOnce(&mut AuthState),
    {
        let current = self.state.load_full();
        let mut next = AuthState::clone(&current);
        f(&mut next);
        self.state.store(Arc::new(next));
        self.changes.send_modify(|version| *version += 1);
    }

    async fn initialize(self: Arc<Self>) {
        {
            let writer = self.writer.lock();
            self.publish(&writer, |s| s.phase = Phase::Initializing);
        }
        tracing::debug!("Session controller initializing");

        let session = match self.identity.get_current_session().await {
            Ok(session) => session,
            Err(AuthError::BackendUnavailable(reason)) => {
                tracing::error!(
                    operation = "get_session",
                    reason = %reason,
                    "Identity backend unavailable, continuing signed out"
                );
                let writer = self.writer.lock();
                self.publish(&writer, |s| {
                    s.phase = Phase::Ready;
                    s.initialized = true;
                    s.backend_unavailable = true;
                    s.session = None;
                    s.user = None;
                });
                return;
            }
            Err(e) => {
                tracing::warn!(
                    operation = "get_session",
                    code = e.code(),
                    error = %e,
                    "Could not read current session, continuing signed out"
                );
                None
            }
        };

        let initial_user = session.as_ref().map(|s| s.user.id.clone());
        if let Some(session) = session {
            let identity = session.user.clone();
            {
                let writer = self.writer.lock();
                self.publish(&writer, |s| s.session = Some(session));
            }
            if let Some(ticket) = self.begin_fetch(&identity.id, false) {
                self.spawn_fetch(identity, ticket).await;
            }
        }

        {
            let writer = self.writer.lock();
            self.publish(&writer, |s| {
                s.phase = Phase::Ready;
                s.initialized = true;
            });
        }
        tracing::info!(user_id = ?initial_user, "Session controller ready");

        match self.identity.on_session_change() {
            Ok(subscription) => {
                let inner = self.clone();
                self.tasks.spawn(inner.listen(subscription, initial_user));
            }
            Err(e) => {
                tracing::error!(
                    operation = "subscribe",
                    code = e.code(),
                    error = %e,
                    "Could not subscribe to session changes"
                );
            }
        }
    }

    async fn listen(self: Arc<Self>, mut subscription: Subscription, initial_user: Option<String>) {
        // Anything that changed between the initial read and the subscription
        // shows up here; later changes are queued on the subscription.
        match self.identity.get_current_session().await {
            Ok(current) => {
                let current_user = current.as_ref().map(|s| s.user.id.clone());
                if current_user != initial_user {
                    tracing::info!(
                        before = ?initial_user,
                        after = ?current_user,
                        "Session changed during initialization, re-deriving"
                    );
                    self.handle_event(SessionEvent::new(SessionEventKind::Initial, current));
                }
            }
            Err(e) => {
                tracing::warn!(operation = "get_session", code = e.code(), error = %e, "Session re-check failed");
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::debug!("Session event stream closed");
                        self.cache.clear();
                        break;
                    }
                }
            }
        }
        tracing::debug!("Session listener stopped");
    }

    fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        let kind = event.kind;
        match event.session {
            None => self.clear_session(kind.as_str()),
            Some(session) => {
                let identity = session.user.clone();
                let holds_user = {
                    let writer = self.writer.lock();
                    let mut holds = false;
                    self.publish(&writer, |s| {
                        if s.user.as_ref().is_some_and(|u| u.id != identity.id) {
                            s.user = None;
                        }
                        holds = s.user.is_some();
                        s.session = Some(session);
                    });
                    holds
                };

                let forced = kind == SessionEventKind::SignedIn;
                let ticket = self.begin_fetch(&identity.id, forced).or_else(|| {
                    // Fetched before, but the merged user was dropped since
                    let orphaned = !holds_user
                        && self.cache.state(&identity.id) == Some(FetchState::Complete);
                    if orphaned {
                        self.begin_fetch(&identity.id, true)
                    } else {
                        None
                    }
                });

                match ticket {
                    Some(ticket) => {
                        tracing::debug!(event = %kind, user_id = %identity.id, seq = ticket.seq, "Profile fetch issued");
                        drop(self.spawn_fetch(identity, ticket));
                    }
                    None => {
                        tracing::debug!(event = %kind, user_id = %identity.id, "Profile fetch not needed");
                    }
                }
            }
        }
        self.counters.events_handled.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop session, user and every fetch marker; fetches in flight become stale.
    fn clear_session(&self, reason: &str) {
        let mut writer = self.writer.lock();
        writer.epoch += 1;
        writer.last_applied.clear();
        self.cache.clear();
        let had_session = self.state.load().session.is_some();
        self.publish(&writer, |s| {
            s.session = None;
            s.user = None;
        });
        if had_session {
            tracing::info!(reason = %reason, "Signed out");
        }
    }

    /// Claim a fetch slot for `user_id`, or `None` if one is not needed.
    fn begin_fetch(&self, user_id: &str, forced: bool) -> Option<FetchTicket> {
        let writer = self.writer.lock();
        if !self.cache.try_begin(user_id, forced) {
            return None;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.fetches_issued.fetch_add(1, Ordering::SeqCst);
        Some(FetchTicket {
            seq,
            epoch: writer.epoch,
        })
    }

    /// Run a claimed fetch on the task tracker. It completes, and releases its
    /// cache marker, even if whoever awaits the result goes away.
    fn spawn_fetch(
        self: &Arc<Self>,
        identity: AuthIdentity,
        ticket: FetchTicket,
    ) -> impl Future<Output = Option<FetchOutcome>> {
        let handle = self.tasks.spawn(self.clone().run_fetch(identity, ticket));
        async move {
            match handle.await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::error!(seq = ticket.seq, error = %e, "Profile fetch task failed");
                    None
                }
            }
        }
    }

    async fn run_fetch(self: Arc<Self>, identity: AuthIdentity, ticket: FetchTicket) -> FetchOutcome {
        let profile = self.resolve_profile(&identity).await;
        self.complete_fetch(&identity.id, profile, ticket)
    }

    /// Read the profile, creating the default row once if there is none.
    /// Every failure ends in `None` (bare identity).
    async fn resolve_profile(&self, identity: &AuthIdentity) -> Option<ProfileRecord> {
        match self.profiles.fetch(&identity.id).await {
            Ok(ProfileLookup::Found(record)) => return Some(record),
            Ok(ProfileLookup::Missing) => {
                tracing::debug!(user_id = %identity.id, "No profile row, creating default");
            }
            Ok(ProfileLookup::Empty) => {
                tracing::warn!(
                    user_id = %identity.id,
                    operation = "fetch_profile",
                    "Profile store returned neither row nor error, creating default"
                );
            }
            Err(e) => {
                tracing::error!(
                    user_id = %identity.id,
                    operation = "fetch_profile",
                    code = e.code(),
                    error = %e,
                    "Profile fetch failed, using bare identity"
                );
                return None;
            }
        }

        match self.profiles.create_default(identity).await {
            Ok(record) => {
                tracing::info!(user_id = %identity.id, role = %record.role, "Default profile created");
                Some(record)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %identity.id,
                    operation = "create_profile",
                    code = e.code(),
                    error = %e,
                    "Default profile creation failed, using bare identity"
                );
                None
            }
        }
    }

    fn complete_fetch(
        &self,
        user_id: &str,
        profile: Option<ProfileRecord>,
        ticket: FetchTicket,
    ) -> FetchOutcome {
        let mut writer = self.writer.lock();

        let outcome = if writer.epoch != ticket.epoch {
            FetchOutcome::Discarded(StaleReason::SignedOut)
        } else {
            self.cache.mark_complete(user_id);
            let state = self.state.load_full();
            match state.session.as_ref() {
                Some(session) if session.user.id == user_id => {
                    let last = writer.last_applied.get(user_id).copied().unwrap_or(0);
                    if ticket.seq < last {
                        FetchOutcome::Discarded(StaleReason::Superseded)
                    } else {
                        writer.last_applied.insert(user_id.to_string(), ticket.seq);
                        let user = ExtendedUser::merge(&session.user, profile);
                        self.publish(&writer, |s| s.user = Some(user));
                        FetchOutcome::Applied
                    }
                }
                _ => FetchOutcome::Discarded(StaleReason::UserChanged),
            }
        };
        drop(writer);

        match outcome {
            FetchOutcome::Applied => {
                self.counters.fetches_applied.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(user_id = %user_id, seq = ticket.seq, "Profile applied");
            }
            FetchOutcome::Discarded(reason) => {
                self.counters.fetches_discarded.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(user_id = %user_id, seq = ticket.seq, reason = %reason, "Stale profile fetch discarded");
            }
        }
        outcome
    }
}
