//! # Rotation Manager
//!
//! Owns one long-lived client per endpoint together with its health state,
//! and decides which endpoint is *current*. Exactly one endpoint is current
//! at a time.
//!
//! # Locking
//!
//! All rotation state sits behind a single [`tokio::sync::RwLock`]:
//!
//! - **Read side**: [`RotationManager::acquire_current`] and friends hand out
//!   a [`CurrentClient`] guard. Any number of callers may issue requests
//!   against the current client concurrently.
//! - **Write side**: selection, start, fail and close. A rotation therefore
//!   waits for in-flight requests to release their guards, and no request can
//!   acquire while the current target is being changed.
//!
//! Every change is also published on a [`watch`] channel so waiters can
//! sleep until the rotation state moves instead of polling the lock.
//!
//! # Sessions
//!
//! Each selection gets a fresh [`SessionId`]. Failure reports carry the
//! session they observed, and [`RotationManager::fail_and_close`] ignores
//! reports for a session that is no longer current.

use crate::config::HealthConfig;
use crate::error::{ClientError, PoolError};
use crate::health::HealthState;
use crate::traits::ApiClient;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, OwnedRwLockReadGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies one selection of an endpoint as the current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionId(u64);

impl SessionId {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of the rotation state, published on every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RotationStatus {
    pub current: Option<String>,
    pub started: bool,
    pub session: SessionId,
}

/// The endpoint a selection or start landed on.
#[derive(Clone)]
pub struct Selection {
    pub session: SessionId,
    pub endpoint: String,
    pub client: Arc<dyn ApiClient>,
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("session", &self.session)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

struct Endpoint {
    id: String,
    client: Arc<dyn ApiClient>,
}

struct RotationState {
    current: Option<usize>,
    /// Current client is started and has not failed since.
    started: bool,
    /// Current client holds an open connection that `close` must release.
    connected: bool,
    session: SessionId,
    health: Vec<HealthState>,
}

/// Shared read access to the current endpoint's client.
///
/// Holds the read side of the rotation lock until dropped, so the endpoint
/// cannot be rotated away while a request is in flight. Dropping the guard
/// (or calling [`CurrentClient::release`]) releases it.
pub struct CurrentClient {
    _guard: OwnedRwLockReadGuard<RotationState>,
    client: Arc<dyn ApiClient>,
    endpoint: String,
    session: SessionId,
}

impl CurrentClient {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// A handle to the client that stays valid after the guard is released.
    pub fn client(&self) -> Arc<dyn ApiClient> {
        Arc::clone(&self.client)
    }

    pub fn release(self) {}
}

impl Deref for CurrentClient {
    type Target = dyn ApiClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl fmt::Debug for CurrentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentClient")
            .field("endpoint", &self.endpoint)
            .field("session", &self.session)
            .finish()
    }
}

pub struct RotationManager {
    endpoints: Vec<Endpoint>,
    state: Arc<RwLock<RotationState>>,
    status: watch::Sender<RotationStatus>,
}

impl RotationManager {
    /// Takes ownership of one client per endpoint, in priority order.
    pub fn new(clients: Vec<Arc<dyn ApiClient>>, policy: HealthConfig) -> Result<Self, PoolError> {
        if clients.is_empty() {
            return Err(PoolError::NoEndpoints);
        }

        let endpoints: Vec<Endpoint> = clients
            .into_iter()
            .map(|client| Endpoint {
                id: client.endpoint().to_string(),
                client,
            })
            .collect();

        let state = RotationState {
            current: None,
            started: false,
            connected: false,
            session: SessionId::default(),
            health: vec![HealthState::new(policy); endpoints.len()],
        };
        let (status, _) = watch::channel(RotationStatus::default());

        Ok(Self {
            endpoints,
            state: Arc::new(RwLock::new(state)),
            status,
        })
    }

    pub fn endpoints(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn current_endpoint(&self) -> Option<String> {
        self.status.borrow().current.clone()
    }

    pub fn status(&self) -> RotationStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RotationStatus> {
        self.status.subscribe()
    }

    pub async fn health(&self, endpoint: &str) -> Option<HealthState> {
        let idx = self.index_of(endpoint)?;
        let state = self.state.read().await;
        state.health.get(idx).copied()
    }

    /// Makes a healthy endpoint current, waiting for one to leave cooldown
    /// if necessary. Returns the existing selection if a target is already
    /// current.
    ///
    /// The write lock is only held while scanning, never across the wait,
    /// and the wait is a sleep until the earliest endpoint becomes
    /// available. Safe to cancel.
    pub async fn select_next(&self) -> Selection {
        loop {
            let wake_at = {
                let mut state = self.state.write().await;
                if let Some(idx) = state.current {
                    return self.selection(&state, idx);
                }

                let now = Instant::now();
                if let Some(idx) = state.health.iter().position(|h| h.is_healthy_at(now)) {
                    state.current = Some(idx);
                    state.started = false;
                    state.connected = false;
                    state.session = state.session.next();
                    info!(
                        endpoint = %self.endpoints[idx].id,
                        session = %state.session,
                        "Selected endpoint"
                    );
                    self.publish(&state);
                    return self.selection(&state, idx);
                }

                state.health.iter().filter_map(|h| h.next_available()).min()
            };

            match wake_at {
                Some(at) => {
                    debug!(
                        wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "All endpoints cooling down"
                    );
                    tokio::time::sleep_until(at).await;
                }
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Starts the current target's client, wiring its terminal error into
    /// `done`.
    pub async fn start_current(
        &self,
        done: oneshot::Sender<ClientError>,
    ) -> Result<Selection, PoolError> {
        let mut state = self.state.write().await;
        let idx = state.current.ok_or(PoolError::NoCurrentTarget)?;
        if state.started || state.connected {
            return Err(PoolError::AlreadyStarted);
        }

        let endpoint = &self.endpoints[idx];
        info!(endpoint = %endpoint.id, "Starting client");
        endpoint
            .client
            .start(done)
            .await
            .map_err(|source| PoolError::Start {
                endpoint: endpoint.id.clone(),
                source,
            })?;

        state.started = true;
        state.connected = true;
        self.publish(&state);
        Ok(self.selection(&state, idx))
    }

    /// Marks the current target failed without deselecting it.
    pub async fn fail_current(&self) {
        let mut state = self.state.write().await;
        self.fail_locked(&mut state);
        self.publish(&state);
    }

    /// Closes the current target's client if it was started and clears the
    /// selection.
    pub async fn close_current(&self) {
        let mut state = self.state.write().await;
        self.close_locked(&mut state).await;
        self.publish(&state);
    }

    /// Fails and closes the current target, but only if `session` is still
    /// the current selection. Returns whether anything was done.
    pub async fn fail_and_close(&self, session: SessionId) -> bool {
        let mut state = self.state.write().await;
        if state.session != session || state.current.is_none() {
            debug!(%session, current = %state.session, "Ignoring stale failure report");
            return false;
        }
        self.fail_locked(&mut state);
        self.close_locked(&mut state).await;
        self.publish(&state);
        true
    }

    /// Records a failure of `endpoint` observed outside the pool, e.g. by an
    /// external health check. Does not rotate. Returns false for an unknown
    /// endpoint.
    pub async fn mark_unhealthy(&self, endpoint: &str) -> bool {
        let Some(idx) = self.index_of(endpoint) else {
            return false;
        };
        let mut state = self.state.write().await;
        state.health[idx].mark_unhealthy();
        true
    }

    /// Current client, whether or not it has finished starting.
    pub async fn acquire_current(&self) -> Result<CurrentClient, PoolError> {
        let guard = Arc::clone(&self.state).read_owned().await;
        let current = guard.current;
        let idx = current.ok_or(PoolError::NoCurrentTarget)?;
        Ok(self.guard_for(guard, idx))
    }

    /// Non-blocking [`Self::acquire_current`]. `None` while a rotation holds
    /// the lock or nothing is current.
    pub fn try_acquire_current(&self) -> Option<CurrentClient> {
        let guard = Arc::clone(&self.state).try_read_owned().ok()?;
        let current = guard.current;
        let idx = current?;
        Some(self.guard_for(guard, idx))
    }

    /// Waits until a target is current, triggering selection when nothing
    /// is current. A target that is still starting is waited on, so the
    /// returned client is always usable.
    ///
    /// Fails with [`ClientError::NotConnected`] when the target it waited on
    /// is failed or replaced before it finished starting, so callers can
    /// count that as a failed attempt instead of waiting indefinitely.
    pub async fn acquire_current_when_ready(&self) -> Result<CurrentClient, ClientError> {
        let mut status = self.status.subscribe();
        let mut waiting_on: Option<(SessionId, usize)> = None;
        loop {
            let guard = Arc::clone(&self.state).read_owned().await;
            match (guard.current, waiting_on) {
                (Some(idx), _) if guard.started => return Ok(self.guard_for(guard, idx)),
                (Some(idx), None) => waiting_on = Some((guard.session, idx)),
                (Some(_), Some((session, _))) if guard.session == session => {}
                (_, Some((_, idx))) => {
                    return Err(ClientError::NotConnected {
                        endpoint: self.endpoints[idx].id.clone(),
                    });
                }
                (None, None) => {
                    drop(guard);
                    let selected = self.select_next().await;
                    if let Some(idx) = self.index_of(&selected.endpoint) {
                        waiting_on = Some((selected.session, idx));
                    }
                    continue;
                }
            }
            drop(guard);

            if status.changed().await.is_err() {
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn release_current(&self, current: CurrentClient) {
        current.release();
    }

    /// Resolves once `session` is no longer the started current selection.
    pub async fn wait_session_end(&self, session: SessionId) {
        let mut status = self.status.subscribe();
        loop {
            {
                let now = status.borrow_and_update();
                if now.session != session || !now.started {
                    return;
                }
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    fn fail_locked(&self, state: &mut RotationState) {
        state.started = false;
        if let Some(idx) = state.current {
            state.health[idx].mark_unhealthy();
            let health = &state.health[idx];
            warn!(
                endpoint = %self.endpoints[idx].id,
                backoff_ms = health.backoff().as_millis() as u64,
                "Endpoint marked unhealthy"
            );
        }
    }

    async fn close_locked(&self, state: &mut RotationState) {
        let Some(idx) = state.current.take() else {
            return;
        };
        if state.connected {
            debug!(endpoint = %self.endpoints[idx].id, "Closing client");
            self.endpoints[idx].client.close().await;
        }
        state.started = false;
        state.connected = false;
    }

    fn publish(&self, state: &RotationState) {
        self.status.send_replace(RotationStatus {
            current: state.current.map(|idx| self.endpoints[idx].id.clone()),
            started: state.started,
            session: state.session,
        });
    }

    fn selection(&self, state: &RotationState, idx: usize) -> Selection {
        Selection {
            session: state.session,
            endpoint: self.endpoints[idx].id.clone(),
            client: Arc::clone(&self.endpoints[idx].client),
        }
    }

    fn guard_for(&self, guard: OwnedRwLockReadGuard<RotationState>, idx: usize) -> CurrentClient {
        let endpoint = &self.endpoints[idx];
        let session = guard.session;
        CurrentClient {
            _guard: guard,
            client: Arc::clone(&endpoint.client),
            endpoint: endpoint.id.clone(),
            session,
        }
    }

    fn index_of(&self, endpoint: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.id == endpoint)
    }
}
