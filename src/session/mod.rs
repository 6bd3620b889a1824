//! Session lifecycle: connect, keep-alive supervision, reconnect with
//! subscription rebinding, identity renewal and close.

pub mod state;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::manager::{ManagerDiagnostics, SubscriptionManager};
use crate::service::{SessionHandle, SessionTransport, SubscriptionServices, UserIdentity};
use crate::types::{SessionOptions, StatusCode};

use state::{transition, ConnectivityState, ConnectivityTrigger};

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionDiagnostics {
    pub state: ConnectivityState,
    pub session_id: Option<String>,
    pub connect_count: u64,
    pub reconnect_count: u64,
    pub subscriptions: ManagerDiagnostics,
}

struct SessionInner {
    options: SessionOptions,
    transport: Arc<dyn SessionTransport>,
    subscriptions: SubscriptionManager,
    state_tx: watch::Sender<ConnectivityState>,
    /// Guards against overlapping connect, reconnect and reactivate
    /// attempts; only one may run at a time.
    transitioning: AtomicBool,
    identity: StdMutex<UserIdentity>,
    handle: ArcSwapOption<SessionHandle>,
    connect_count: AtomicU64,
    reconnect_count: AtomicU64,
    cancel: CancellationToken,
}

struct TransitionPermit<'a>(&'a AtomicBool);

impl Drop for TransitionPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SessionInner {
    fn acquire_transition(&self) -> Result<TransitionPermit<'_>> {
        if self
            .transitioning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::TransitionInFlight);
        }
        Ok(TransitionPermit(&self.transitioning))
    }

    fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Apply a trigger if the table allows it. The check and the state
    /// change happen atomically under the watch channel.
    fn try_apply(&self, trigger: ConnectivityTrigger) -> Option<ConnectivityState> {
        let mut next = None;
        self.state_tx.send_if_modified(|state| match transition(*state, trigger) {
            Some(new_state) => {
                next = Some(new_state);
                *state = new_state;
                true
            }
            None => false,
        });
        if let Some(new_state) = next {
            info!(state = %new_state, %trigger, "session state changed");
        }
        next
    }

    fn apply(&self, trigger: ConnectivityTrigger) -> Result<ConnectivityState> {
        self.try_apply(trigger).ok_or_else(|| Error::InvalidTransition {
            state: self.state().to_string(),
            trigger: trigger.to_string(),
        })
    }

    fn identity_snapshot(&self) -> UserIdentity {
        match self.identity.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_identity(&self, identity: UserIdentity) {
        match self.identity.lock() {
            Ok(mut guard) => *guard = identity,
            Err(poisoned) => *poisoned.into_inner() = identity,
        }
    }

    async fn establish(&self) -> Result<()> {
        let identity = self.identity_snapshot();
        let handle = self
            .transport
            .create_session(&self.options, &identity)
            .await?;
        info!(
            session_id = %handle.session_id,
            revised_timeout_ms = handle.revised_timeout_ms,
            "session created"
        );
        self.handle.store(Some(Arc::new(handle)));
        self.transport.activate_session(&identity).await?;
        Ok(())
    }

    /// Bring previously registered subscriptions up on a fresh session.
    async fn bind_subscriptions(&self) {
        self.subscriptions.recreate_subscriptions().await;
        for subscription in self.subscriptions.subscriptions() {
            if !subscription.created() {
                if let Err(e) = subscription.create().await {
                    warn!(error = %e, "subscription create on connect failed");
                }
            }
        }
        self.subscriptions.poke();
    }

    async fn reconnect(&self) -> Result<()> {
        let _permit = self.acquire_transition()?;
        self.apply(ConnectivityTrigger::KeepAliveMissing)?;
        self.subscriptions.pause();
        self.apply(ConnectivityTrigger::Reconnect)?;
        match self.do_reconnect().await {
            Ok(()) => {
                self.apply(ConnectivityTrigger::ReconnectComplete)?;
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                // only resume publishing once subscriptions are rebound
                self.subscriptions.resume();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "reconnect failed");
                let _ = self.try_apply(ConnectivityTrigger::ReconnectFailed);
                Err(e)
            }
        }
    }

    async fn do_reconnect(&self) -> Result<()> {
        let identity = self.identity_snapshot();
        self.transport.recreate_channel().await?;
        match self.transport.activate_session(&identity).await {
            Ok(()) => {}
            Err(e)
                if matches!(
                    e.status(),
                    Some(StatusCode::BAD_SESSION_ID_INVALID)
                        | Some(StatusCode::BAD_SESSION_CLOSED)
                ) =>
            {
                info!("server lost the session, creating a new one");
                self.establish().await?;
            }
            Err(e) => return Err(e),
        }
        self.bind_subscriptions().await;
        Ok(())
    }
}

/// Keep-alive supervision: while connected, run the subscription
/// watchdogs and reconnect when publish traffic stops for two keep-alive
/// intervals.
async fn run_monitor(inner: Arc<SessionInner>) {
    let interval = inner
        .options
        .keep_alive_interval()
        .max(Duration::from_millis(100));
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if inner.state() != ConnectivityState::Connected {
            continue;
        }
        inner.subscriptions.check_watchdogs();
        if inner.subscriptions.publish_stalled(interval.saturating_mul(2)) {
            warn!("keep-alive missing, attempting reconnect");
            if let Err(e) = inner.reconnect().await {
                error!(error = %e, "session entered error state");
            }
        }
    }
    debug!("session monitor stopped");
}

/// An OPC UA client session.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        services: Arc<dyn SubscriptionServices>,
        options: SessionOptions,
    ) -> Self {
        let subscriptions = SubscriptionManager::new(services, &options);
        let (state_tx, _) = watch::channel(ConnectivityState::Closed);
        let inner = Arc::new(SessionInner {
            options,
            transport,
            subscriptions,
            state_tx,
            transitioning: AtomicBool::new(false),
            identity: StdMutex::new(UserIdentity::Anonymous),
            handle: ArcSwapOption::const_empty(),
            connect_count: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_monitor(inner.clone()));
        Self { inner }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.state()
    }

    /// Watch channel following every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscriptions(&self) -> SubscriptionManager {
        self.inner.subscriptions.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner
            .handle
            .load()
            .as_ref()
            .map(|h| h.session_id.clone())
    }

    /// Create and activate a session. Legal from `Closed` and, as the
    /// explicit retry, from `Error`.
    pub async fn connect(&self, identity: UserIdentity) -> Result<()> {
        let _permit = self.inner.acquire_transition()?;
        self.inner.apply(ConnectivityTrigger::Create)?;
        self.inner.set_identity(identity);
        match self.inner.establish().await {
            Ok(()) => {
                self.inner.apply(ConnectivityTrigger::ConnectComplete)?;
                self.inner.connect_count.fetch_add(1, Ordering::Relaxed);
                self.inner.bind_subscriptions().await;
                self.inner.subscriptions.resume();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "connect failed");
                let _ = self.inner.try_apply(ConnectivityTrigger::ConnectFailed);
                Err(e)
            }
        }
    }

    /// Reactivate the session with a new identity. Subscriptions are not
    /// touched.
    pub async fn renew_identity(&self, identity: UserIdentity) -> Result<()> {
        let _permit = self.inner.acquire_transition()?;
        self.inner.apply(ConnectivityTrigger::RenewIdentity)?;
        match self.inner.transport.activate_session(&identity).await {
            Ok(()) => {
                self.inner.set_identity(identity);
                self.inner.apply(ConnectivityTrigger::ReactivateComplete)?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "identity renewal failed");
                let _ = self.inner.try_apply(ConnectivityTrigger::ReactivateFailed);
                self.inner.subscriptions.pause();
                Err(e)
            }
        }
    }

    /// Close the session and everything it owns. Safe to call more than
    /// once.
    pub async fn close(&self) -> Result<()> {
        if self.inner.try_apply(ConnectivityTrigger::Close).is_none() {
            // already closed
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.subscriptions.close().await;
        if self.inner.handle.load().is_some() {
            if let Err(e) = self.inner.transport.close_session().await {
                warn!(error = %e, "close session call failed");
            }
            self.inner.handle.store(None);
        }
        info!("session closed");
        Ok(())
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            state: self.inner.state(),
            session_id: self.session_id(),
            connect_count: self.inner.connect_count.load(Ordering::Relaxed),
            reconnect_count: self.inner.reconnect_count.load(Ordering::Relaxed),
            subscriptions: self.inner.subscriptions.diagnostics(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
