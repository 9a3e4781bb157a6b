//! The per-address connection state machine: owns one [`Transport`], drives
//! the five-state connectivity FSM, and reconnects with interruptible
//! exponential backoff.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::backoff::BackoffBuilder;
use crate::cancel::CancelToken;
use crate::status::Status;

use super::connectivity::ConnectivityState;
use super::name_resolution::{address_sets_equal, Address};
use super::transport::{ConnectResult, Transport};

const LOG_TARGET: &str = "grpc::client::subchannel";

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

struct StateData {
    connectivity: ConnectivityState,
    addresses: Vec<Address>,
    current_address: Option<Address>,
    last_error: Option<Status>,
}

struct Inner {
    id: u64,
    transport: Arc<dyn Transport>,
    backoff_builder: BackoffBuilder,
    state: Mutex<StateData>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    connect_gate: Semaphore,
    interrupt: Mutex<CancelToken>,
    dispose_cancel: CancelToken,
}

impl Inner {
    fn notify(&self, state: ConnectivityState) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

/// A cheaply-cloneable handle to one logical connection. Every clone refers
/// to the same underlying state.
#[derive(Clone)]
pub struct Subchannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subchannel").field("id", &self.inner.id).finish()
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for Subchannel {}

impl std::hash::Hash for Subchannel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

/// A handle to an [`on_state_changed`](Subchannel::on_state_changed)
/// registration. Dropping it does nothing; call [`cancel`](Self::cancel) to
/// unsubscribe.
pub struct Subscription {
    inner: Arc<Inner>,
    id: u64,
}

impl Subscription {
    pub fn cancel(self) {
        self.inner.listeners.lock().unwrap().retain(|(id, _)| *id != self.id);
    }
}

impl Subchannel {
    /// Creates a new subchannel in `Idle` state, owning `transport`.
    pub fn new(transport: Arc<dyn Transport>, addresses: Vec<Address>, backoff_builder: BackoffBuilder) -> Self {
        assert!(!addresses.is_empty(), "a subchannel needs at least one address");
        let id = NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::SeqCst);
        debug!(target: LOG_TARGET, id, count = addresses.len(), "SubchannelCreated");
        Self {
            inner: Arc::new(Inner {
                id,
                transport,
                backoff_builder,
                state: Mutex::new(StateData {
                    connectivity: ConnectivityState::Idle,
                    addresses,
                    current_address: None,
                    last_error: None,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                connect_gate: Semaphore::new(1),
                interrupt: Mutex::new(CancelToken::new()),
                dispose_cancel: CancelToken::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.state.lock().unwrap().connectivity
    }

    pub fn current_address(&self) -> Option<Address> {
        self.inner.state.lock().unwrap().current_address.clone()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.inner.state.lock().unwrap().addresses.clone()
    }

    /// The status attached to the most recent `TransientFailure`/`Idle`
    /// transition, if any. Read by error pickers.
    pub fn last_error(&self) -> Option<Status> {
        self.inner.state.lock().unwrap().last_error.clone()
    }

    /// See the type-level contract in the module spec: replaces the address
    /// list, reconnecting as necessary. A structurally-equal list is a no-op.
    pub fn update_addresses(&self, new_addresses: Vec<Address>) {
        let mut should_spawn_loop = false;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.connectivity == ConnectivityState::Shutdown {
                warn!(target: LOG_TARGET, id = self.inner.id, "UpdateAddresses called on shutdown subchannel");
                return;
            }
            if address_sets_equal(&state.addresses, &new_addresses) {
                return;
            }
            debug!(target: LOG_TARGET, id = self.inner.id, "AddressesUpdated");
            state.addresses = new_addresses.clone();

            match state.connectivity {
                ConnectivityState::Idle => {}
                ConnectivityState::Connecting | ConnectivityState::TransientFailure => {
                    debug!(target: LOG_TARGET, id = self.inner.id, "AddressesUpdatedWhileConnecting");
                    self.inner.transport.disconnect();
                    self.inner.interrupt.lock().unwrap().cancel();
                }
                ConnectivityState::Ready => {
                    if let Some(current) = state.current_address.clone() {
                        if !new_addresses.contains(&current) {
                            debug!(target: LOG_TARGET, id = self.inner.id, "ConnectedAddressNotInUpdatedAddresses");
                            state.connectivity = ConnectivityState::Connecting;
                            state.current_address = None;
                            self.inner.transport.disconnect();
                            should_spawn_loop = true;
                        }
                    }
                }
                ConnectivityState::Shutdown => unreachable!(),
            }
        }
        if should_spawn_loop {
            self.inner.notify(ConnectivityState::Connecting);
            self.spawn_connect_loop();
        }
    }

    /// From `Idle`, starts the connect loop. From `Connecting`/`Ready`/
    /// `TransientFailure`, interrupts any in-progress backoff delay so the
    /// next attempt happens immediately.
    pub fn request_connection(&self) {
        let mut should_spawn_loop = false;
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.connectivity {
                ConnectivityState::Idle => {
                    debug!(target: LOG_TARGET, id = self.inner.id, "ConnectionRequested");
                    state.connectivity = ConnectivityState::Connecting;
                    should_spawn_loop = true;
                }
                ConnectivityState::Connecting | ConnectivityState::Ready | ConnectivityState::TransientFailure => {
                    debug!(target: LOG_TARGET, id = self.inner.id, "ConnectionRequestedInNonIdleState");
                }
                ConnectivityState::Shutdown => {
                    warn!(target: LOG_TARGET, id = self.inner.id, "RequestConnection called on shutdown subchannel");
                    return;
                }
            }
        }
        if should_spawn_loop {
            self.inner.notify(ConnectivityState::Connecting);
            self.spawn_connect_loop();
        } else {
            // Interrupting a non-existent backoff wait is a harmless no-op:
            // the token is simply re-created before the loop's next wait.
            self.inner.interrupt.lock().unwrap().cancel();
        }
    }

    /// Registers `callback` to be invoked (outside any internal lock, in
    /// registration order) on every connectivity transition.
    pub fn on_state_changed(&self, callback: impl Fn(ConnectivityState) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().unwrap().push((id, Arc::new(callback)));
        Subscription {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Transitions to `Shutdown`, cancels all connect work, disconnects the
    /// transport, and clears registrations. Idempotent.
    pub fn dispose(&self) {
        let should_notify = {
            let mut state = self.inner.state.lock().unwrap();
            if state.connectivity == ConnectivityState::Shutdown {
                false
            } else {
                state.connectivity = ConnectivityState::Shutdown;
                state.current_address = None;
                true
            }
        };
        self.inner.dispose_cancel.cancel();
        self.inner.transport.disconnect();
        if should_notify {
            self.inner.notify(ConnectivityState::Shutdown);
        }
        self.inner.listeners.lock().unwrap().clear();
    }

    fn spawn_connect_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { run_connect_loop(inner).await });
    }
}

fn transition(inner: &Inner, new_state: ConnectivityState, status: Option<Status>) -> bool {
    let should_notify = {
        let mut state = inner.state.lock().unwrap();
        if state.connectivity == ConnectivityState::Shutdown || state.connectivity == new_state {
            false
        } else {
            state.connectivity = new_state;
            if new_state != ConnectivityState::Ready {
                state.current_address = None;
            }
            state.last_error = status;
            true
        }
    };
    if should_notify {
        debug!(target: LOG_TARGET, id = inner.id, ?new_state, "SubchannelStateChanged");
        inner.notify(new_state);
    }
    should_notify
}

/// Resolves after `duration` elapses, or never resolves when `duration` is
/// `None` — lets the connect loop race a transport's optional
/// [`Transport::connect_timeout`] alongside `try_connect` with a single
/// `tokio::select!`, instead of branching the whole select on its presence.
async fn sleep_or_pending(duration: Option<std::time::Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn run_connect_loop(inner: Arc<Inner>) {
    let mut backoff = inner.backoff_builder.create();
    let mut attempt_index: usize = 0;

    loop {
        if inner.dispose_cancel.is_cancelled() {
            return;
        }
        let addresses = {
            let state = inner.state.lock().unwrap();
            if state.connectivity == ConnectivityState::Shutdown {
                return;
            }
            state.addresses.clone()
        };
        if addresses.is_empty() {
            transition(&inner, ConnectivityState::TransientFailure, Some(Status::unavailable("no addresses to connect to")));
            return;
        }

        let address = addresses[attempt_index % addresses.len()].clone();
        attempt_index = attempt_index.wrapping_add(1);

        let permit = match inner.connect_gate.try_acquire() {
            Ok(p) => p,
            Err(_) => {
                debug!(target: LOG_TARGET, id = inner.id, "QueuingConnect");
                tokio::select! {
                    p = inner.connect_gate.acquire() => match p {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                    _ = inner.dispose_cancel.cancelled() => return,
                }
            }
        };

        debug!(target: LOG_TARGET, id = inner.id, %address, "ConnectingTransport");
        let result = tokio::select! {
            r = inner.transport.try_connect(&address) => r,
            _ = sleep_or_pending(inner.transport.connect_timeout()) => {
                debug!(target: LOG_TARGET, id = inner.id, "connect attempt exceeded the transport's ConnectTimeout");
                ConnectResult::Timeout
            }
            _ = inner.dispose_cancel.cancelled() => {
                debug!(target: LOG_TARGET, id = inner.id, "ConnectCanceled");
                drop(permit);
                return;
            }
        };
        drop(permit);

        match result {
            ConnectResult::Success => {
                {
                    let mut state = inner.state.lock().unwrap();
                    state.current_address = Some(address);
                }
                transition(&inner, ConnectivityState::Ready, None);
                return;
            }
            ConnectResult::Timeout => {
                transition(
                    &inner,
                    ConnectivityState::Idle,
                    Some(Status::unavailable("Timeout connecting to subchannel.")),
                );
                return;
            }
            ConnectResult::Failure(status) => {
                warn!(target: LOG_TARGET, id = inner.id, %status, "ConnectError");
                transition(&inner, ConnectivityState::TransientFailure, Some(status));

                let delay = backoff.next();
                debug!(target: LOG_TARGET, id = inner.id, ?delay, "StartingConnectBackoff");
                let interrupt = CancelToken::new();
                *inner.interrupt.lock().unwrap() = interrupt.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        debug!(target: LOG_TARGET, id = inner.id, "ConnectBackoffComplete");
                    }
                    _ = interrupt.cancelled() => {
                        debug!(target: LOG_TARGET, id = inner.id, "ConnectBackoffInterrupted");
                        backoff = inner.backoff_builder.create();
                    }
                    _ = inner.dispose_cancel.cancelled() => {
                        return;
                    }
                }
            }
        }
    }
}
