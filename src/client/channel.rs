//! The connection manager: the channel-state owner that mediates between
//! the resolver, the load-balancing policy, and the per-call pick loop.
//!
//! This implements the `ChannelControlHelper` capability set
//! (`{CreateSubchannel, UpdateState, RefreshResolver}`) that a balancer is
//! given, the `gRFC A21` service-config fallback ladder, and `PickAsync`.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use crate::attributes::Attributes;
use crate::backoff::BackoffBuilder;
use crate::cancel::CancelToken;
use crate::status::{Code, Status};

use super::connectivity::ConnectivityState;
use super::load_balancing::{self, ChannelState, LbPolicy, LbPolicyBuilder, LbState, Picker, PickResult};
use super::name_resolution::{self, Address, ResolverBuilder, ResolverOptions, ResolverResult};
use super::service_config::{self, ParsedServiceConfig};
use super::subchannel::Subchannel;
use super::transport::{self, TransportBuilder};

/// Construction-time configuration for a [`Channel`]. Fields left `None`
/// fall back to the crate's global registries.
#[non_exhaustive]
pub struct ChannelOptions {
    /// Default port used by resolvers (e.g. `dns`) when the target doesn't
    /// specify one.
    pub default_port: u16,
    /// Disables service-config resolution/use entirely (A21 ladder step 1).
    pub disable_service_config_lookup: bool,
    /// Overrides the default backoff used for subchannel reconnection.
    pub connection_backoff: Option<BackoffBuilder>,
    pub resolver_registry: Option<Arc<name_resolution::ResolverRegistry>>,
    pub lb_policy_registry: Option<Arc<load_balancing::Registry>>,
    pub transport_registry: Option<Arc<transport::TransportRegistry>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_port: 443,
            disable_service_config_lookup: false,
            connection_backoff: None,
            resolver_registry: None,
            lb_policy_registry: None,
            transport_registry: None,
        }
    }
}

impl ChannelOptions {
    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn disable_service_config_lookup(mut self, disable: bool) -> Self {
        self.disable_service_config_lookup = disable;
        self
    }

    pub fn connection_backoff(mut self, backoff: BackoffBuilder) -> Self {
        self.connection_backoff = Some(backoff);
        self
    }
}

/// The outcome of one successful [`Channel::pick_async`] call: the chosen
/// subchannel, the address it is currently connected on, and an optional
/// completion callback the caller must invoke once the RPC terminates.
pub struct Pick {
    pub subchannel: Subchannel,
    pub address: Address,
    pub on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// True for a [`Status`] produced by a `Drop` pick result: retry layers
/// must treat these as non-retryable, per the outbound drop marker in the
/// external interface contract.
#[derive(Clone, Debug)]
pub struct PickError {
    pub status: Status,
    pub is_drop: bool,
}

struct BalancerSlot {
    policy_name: String,
    policy: Box<dyn LbPolicy>,
}

struct Registries {
    resolvers: Arc<name_resolution::ResolverRegistry>,
    lb_policies: Arc<load_balancing::Registry>,
    transports: Arc<transport::TransportRegistry>,
}

/// Guards the balancer reference, the current channel/picker state, and the
/// state-change watcher list — the "connection-manager lock" of the
/// concurrency model. Never held across an `.await`.
struct Guarded {
    balancer: Option<BalancerSlot>,
    previous_service_config: Option<ParsedServiceConfig>,
    resolver: Option<Arc<dyn name_resolution::Resolver>>,
}

struct Inner {
    target: Url,
    options_default_port: u16,
    disable_service_config_lookup: bool,
    connection_backoff: BackoffBuilder,
    registries: Registries,
    guarded: Mutex<Guarded>,
    picker_tx: watch::Sender<Option<LbState>>,
    state_tx: watch::Sender<ConnectivityState>,
    dispose_cancel: CancelToken,
    started: std::sync::atomic::AtomicBool,
}

/// A live client channel: resolves `target`, runs a load-balancing policy
/// over the results, and hands out picks to callers via [`pick_async`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub fn new(target: &str, options: ChannelOptions) -> Result<Self, Status> {
        let target = Url::from_str(target)
            .map_err(|e| Status::with_cause(Code::InvalidArgument, format!("invalid target URI: {target}"), e))?;
        let registries = Registries {
            resolvers: options
                .resolver_registry
                .unwrap_or_else(|| name_resolution::GLOBAL_RESOLVER_REGISTRY.clone()),
            lb_policies: options
                .lb_policy_registry
                .unwrap_or_else(|| load_balancing::GLOBAL_LB_REGISTRY.clone()),
            transports: options
                .transport_registry
                .unwrap_or_else(|| transport::GLOBAL_TRANSPORT_REGISTRY.clone()),
        };
        let (picker_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(ConnectivityState::Idle);
        let inner = Arc::new(Inner {
            target,
            options_default_port: options.default_port,
            disable_service_config_lookup: options.disable_service_config_lookup,
            connection_backoff: options.connection_backoff.unwrap_or_default(),
            registries,
            guarded: Mutex::new(Guarded {
                balancer: None,
                previous_service_config: None,
                resolver: None,
            }),
            picker_tx,
            state_tx,
            dispose_cancel: CancelToken::new(),
            started: std::sync::atomic::AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    /// The channel's current connectivity state, as last published by the
    /// balancer.
    pub fn state(&self) -> ConnectivityState {
        *self.inner.state_tx.borrow()
    }

    /// Starts resolution on first use. Idempotent.
    fn ensure_started(&self) {
        if self.inner.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let scheme = self.inner.target.scheme();
        let builder = match self.inner.registries.resolvers.get_scheme(scheme) {
            Some(b) => b,
            None => {
                self.deliver_channel_state(None, ChannelState::failure(Status::unavailable(format!(
                    "no resolver registered for scheme {scheme}"
                ))));
                return;
            }
        };
        let resolver = builder.build(
            self.inner.target.clone(),
            ResolverOptions {
                default_port: self.inner.options_default_port,
                disable_service_config: self.inner.disable_service_config_lookup,
            },
        );
        self.inner.guarded.lock().unwrap().resolver = Some(resolver.clone());
        let this = self.clone();
        resolver.start(Arc::new(move |result| this.on_resolver_result(result)));
    }

    /// Implements the A21 service-config fallback ladder for one resolver
    /// result, then hands the resulting [`ChannelState`] to the balancer.
    fn on_resolver_result(&self, result: ResolverResult) {
        match result {
            ResolverResult::Success {
                addresses,
                service_config,
                service_config_status,
                attributes,
            } => {
                let mut guarded = self.inner.guarded.lock().unwrap();
                let outcome = service_config::apply_ladder(
                    self.inner.disable_service_config_lookup,
                    service_config,
                    service_config_status,
                    &mut guarded.previous_service_config,
                );
                drop(guarded);
                self.apply_service_config_outcome(outcome, addresses, attributes);
            }
            ResolverResult::Failure { status } => {
                warn!(target: "grpc::client::channel", %status, "resolver reported a failure");
                self.deliver_channel_state(None, ChannelState::failure(status));
            }
        }
    }

    fn apply_service_config_outcome(
        &self,
        outcome: service_config::ServiceConfigOutcome,
        addresses: Vec<Address>,
        attributes: Attributes,
    ) {
        use service_config::ServiceConfigOutcome::*;
        match outcome {
            Disabled => {
                self.deliver_channel_state(
                    None,
                    ChannelState {
                        status: Status::ok(),
                        addresses: Some(addresses),
                        load_balancing_config: None,
                        attributes,
                    },
                );
            }
            Use(cfg) | UseDefault(cfg) | Fallback(cfg) => {
                let config_value = serde_json::to_value(
                    cfg.load_balancing_configs
                        .iter()
                        .map(|e| {
                            let mut obj = e.config.clone();
                            if let serde_json::Value::Object(map) = &mut obj {
                                map.insert("policyName".to_string(), serde_json::Value::String(e.policy_name.clone()));
                            }
                            obj
                        })
                        .collect::<Vec<_>>(),
                )
                .unwrap_or(serde_json::Value::Array(vec![]));

                match load_balancing::select_policy(&self.inner.registries.lb_policies, &config_value) {
                    Some((builder, policy_config)) => {
                        self.deliver_channel_state(
                            Some(builder.name()),
                            ChannelState {
                                status: Status::ok(),
                                addresses: Some(addresses),
                                load_balancing_config: Some(policy_config),
                                attributes,
                            },
                        );
                    }
                    None => {
                        // Already logged `ResolverUnsupportedLoadBalancingConfig`
                        // per entry by `select_policy`; the balancer is left
                        // unchanged, per the external interface contract.
                    }
                }
            }
            ChannelFailure(status) => {
                self.deliver_channel_state(None, ChannelState::failure(status));
            }
        }
    }

    /// Ensures a balancer matching `policy_name` exists (creating/replacing
    /// it if necessary, defaulting to `pick_first` when `None`), then
    /// forwards `channel_state` to it under the connection-manager lock.
    pub(super) fn deliver_channel_state(&self, policy_name: Option<&str>, channel_state: ChannelState) {
        let mut guarded = self.inner.guarded.lock().unwrap();
        self.ensure_balancer(&mut guarded, policy_name);
        let Some(slot) = guarded.balancer.as_mut() else {
            return;
        };
        let mut controller = Controller { inner: &self.inner };
        debug!(target: "grpc::client::channel", status = %channel_state.status, "ChannelStateUpdated");
        let _ = slot.policy.resolver_update(channel_state, &mut controller);
    }

    /// Creates (or swaps in) the balancer instance named `policy_name`,
    /// defaulting to `pick_first` when no policy has been selected yet
    /// (e.g. a channel failure before any service config was ever seen).
    fn ensure_balancer(&self, guarded: &mut Guarded, policy_name: Option<&str>) {
        let desired = policy_name.unwrap_or(load_balancing::pick_first::POLICY_NAME);
        if let Some(slot) = &guarded.balancer {
            if slot.policy_name == desired {
                return;
            }
        }
        let Some(builder) = self.inner.registries.lb_policies.get_policy(desired) else {
            warn!(target: "grpc::client::channel", policy = desired, "ResolverUnsupportedLoadBalancingConfig");
            return;
        };
        if let Some(mut old) = guarded.balancer.take() {
            old.policy.dispose();
        }
        guarded.balancer = Some(BalancerSlot {
            policy_name: desired.to_string(),
            policy: builder.build(),
        });
    }

    /// Blocks until a pick is available, observing `wait_for_ready`
    /// semantics: a `Fail` pick loops back to waiting instead of erroring
    /// when set. Cancels with `cancel`.
    pub async fn pick_async(&self, wait_for_ready: bool, cancel: &CancelToken) -> Result<Pick, PickError> {
        self.ensure_started();
        debug!(target: "grpc::client::channel", "PickStarted");
        let mut rx = self.inner.picker_tx.subscribe();
        let mut previous: Option<Arc<dyn Picker>> = None;

        loop {
            let lb_state = {
                let current = rx.borrow_and_update().clone();
                match current {
                    Some(s) if previous.as_ref().map(|p| !Arc::ptr_eq(p, &s.picker)).unwrap_or(true) => s,
                    _ => {
                        debug!(target: "grpc::client::channel", "PickWaiting");
                        self.wait_for_next_picker(&mut rx, cancel).await.map_err(|status| PickError {
                            status,
                            is_drop: false,
                        })?
                    }
                }
            };

            match lb_state.picker.pick() {
                PickResult::Complete { subchannel, on_complete } => match subchannel.current_address() {
                    Some(address) => {
                        debug!(target: "grpc::client::channel", "PickResultSuccessful");
                        return Ok(Pick {
                            subchannel,
                            address,
                            on_complete,
                        });
                    }
                    None => {
                        debug!(target: "grpc::client::channel", "PickResultSubchannelNoCurrentAddress");
                        previous = Some(lb_state.picker.clone());
                        continue;
                    }
                },
                PickResult::Queue => {
                    debug!(target: "grpc::client::channel", "PickResultQueued");
                    previous = Some(lb_state.picker.clone());
                    continue;
                }
                PickResult::Fail { status } => {
                    if wait_for_ready {
                        debug!(target: "grpc::client::channel", %status, "PickResultFailureWithWaitForReady");
                        previous = Some(lb_state.picker.clone());
                        continue;
                    }
                    debug!(target: "grpc::client::channel", %status, "PickResultFailure");
                    return Err(PickError { status, is_drop: false });
                }
                PickResult::Drop { status } => {
                    return Err(PickError { status, is_drop: true });
                }
            }
        }
    }

    async fn wait_for_next_picker(&self, rx: &mut watch::Receiver<Option<LbState>>, cancel: &CancelToken) -> Result<LbState, Status> {
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|_| Status::new(Code::Unavailable, "channel disposed while waiting for a picker"))?;
                    if let Some(state) = rx.borrow_and_update().clone() {
                        return Ok(state);
                    }
                }
                _ = self.inner.dispose_cancel.cancelled() => {
                    return Err(Status::new(Code::Unavailable, "channel disposed while waiting for a picker"));
                }
                _ = cancel.cancelled() => {
                    return Err(Status::cancelled("pick cancelled by caller"));
                }
            }
        }
    }

    /// Ensures the resolver has started; if the channel isn't `Ready` and
    /// `wait_for_ready` is set, nudges the balancer to (re)connect and
    /// waits for the channel to reach `Ready` or for `cancel` to fire.
    pub async fn connect_async(&self, wait_for_ready: bool, cancel: &CancelToken) -> Result<(), Status> {
        self.ensure_started();
        if self.state() == ConnectivityState::Ready {
            return Ok(());
        }
        let mut rx = self.inner.state_tx.subscribe();
        {
            let mut guarded = self.inner.guarded.lock().unwrap();
            if let Some(slot) = guarded.balancer.as_mut() {
                let mut controller = Controller { inner: &self.inner };
                slot.policy.request_connection(&mut controller);
            }
        }
        if !wait_for_ready {
            return Ok(());
        }
        loop {
            if *rx.borrow_and_update() == ConnectivityState::Ready {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|_| Status::new(Code::Unavailable, "channel disposed"))?;
                }
                _ = self.inner.dispose_cancel.cancelled() => {
                    return Err(Status::new(Code::Unavailable, "channel disposed"));
                }
                _ = cancel.cancelled() => {
                    return Err(Status::cancelled("connect cancelled by caller"));
                }
            }
        }
    }

    /// Tears the channel down: cancels the resolver, disposes the balancer
    /// (and transitively every subchannel it owns), and satisfies any
    /// outstanding waiters so they observe disposal instead of hanging.
    pub fn dispose(&self) {
        self.inner.dispose_cancel.cancel();
        let mut guarded = self.inner.guarded.lock().unwrap();
        if let Some(resolver) = guarded.resolver.take() {
            resolver.dispose();
        }
        if let Some(mut slot) = guarded.balancer.take() {
            slot.policy.dispose();
        }
        let _ = self.inner.state_tx.send(ConnectivityState::Shutdown);
    }
}

/// The capability set handed to the balancer while its methods run,
/// implementing `load_balancing::ChannelController` against this channel's
/// [`Inner`]. Constructed fresh for each call into the balancer; it never
/// outlives the connection-manager lock guard it's built from.
struct Controller<'a> {
    inner: &'a Arc<Inner>,
}

impl<'a> load_balancing::ChannelController for Controller<'a> {
    fn new_subchannel(&mut self, addresses: &[Address]) -> Subchannel {
        let address_type = addresses.first().map(|a| a.address_type).unwrap_or(name_resolution::TCP_ADDRESS_TYPE);
        let transport = match self.inner.registries.transports.get_transport(address_type) {
            Some(builder) => builder.build(),
            None => {
                warn!(target: "grpc::client::channel", address_type, "no transport registered for address type");
                Arc::new(super::transport::mock::MockTransport::new(super::transport::mock::MockBehavior::Fail(
                    format!("no transport registered for address type {address_type}"),
                )))
            }
        };
        let subchannel = Subchannel::new(transport, addresses.to_vec(), self.inner.connection_backoff);
        let inner = self.inner.clone();
        let sc_for_listener = subchannel.clone();
        subchannel.on_state_changed(move |state| {
            notify_subchannel_state(&inner, &sc_for_listener, state);
        });
        subchannel
    }

    fn update_picker(&mut self, state: LbState) {
        debug!(target: "grpc::client::channel", connectivity_state = ?state.connectivity_state, "ChannelPickerUpdated");
        let _ = self.inner.state_tx.send(state.connectivity_state);
        let _ = self.inner.picker_tx.send(Some(state));
    }

    fn request_resolution(&mut self) {
        let resolver = self.inner.guarded.lock().unwrap().resolver.clone();
        match resolver {
            Some(r) => r.refresh(),
            None => debug!(target: "grpc::client::channel", "ResolverRefreshIgnored"),
        }
    }
}

/// Forwards a subchannel's state transition into the balancer. Runs
/// outside the subchannel's own lock (the subchannel guarantees this) and
/// takes the connection-manager lock only for the duration of the
/// balancer call, never across an `.await`.
fn notify_subchannel_state(inner: &Arc<Inner>, subchannel: &Subchannel, state: ConnectivityState) {
    let mut guarded = inner.guarded.lock().unwrap();
    let Some(slot) = guarded.balancer.as_mut() else {
        return;
    };
    let mut controller = Controller { inner };
    slot.policy.subchannel_update(subchannel, state, &mut controller);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::name_resolution::TCP_ADDRESS_TYPE;
    use crate::client::transport::mock::MockBehavior;
    use std::time::Duration;

    fn test_registries(behavior: MockBehavior) -> (Arc<name_resolution::ResolverRegistry>, Arc<transport::TransportRegistry>) {
        let resolvers = Arc::new(name_resolution::ResolverRegistry::new());
        resolvers.add_builder(name_resolution::StaticResolverBuilder);

        struct FixedTransportBuilder(MockBehavior);
        impl transport::TransportBuilder for FixedTransportBuilder {
            fn build(&self) -> Arc<dyn transport::Transport> {
                Arc::new(super::super::transport::mock::MockTransport::new(self.0.clone()))
            }
            fn address_type(&self) -> &'static str {
                TCP_ADDRESS_TYPE
            }
        }
        let transports = Arc::new(transport::TransportRegistry::new());
        transports.add_builder(FixedTransportBuilder(behavior));
        (resolvers, transports)
    }

    #[tokio::test]
    async fn pick_first_happy_path_returns_a_complete_pick() {
        let (resolvers, transports) = test_registries(MockBehavior::Succeed);
        let channel = Channel::new(
            "static:///127.0.0.1:50051,127.0.0.1:50052",
            ChannelOptions {
                resolver_registry: Some(resolvers),
                transport_registry: Some(transports),
                connection_backoff: Some(BackoffBuilder::new().base(Duration::from_millis(1)).max(Duration::from_millis(5))),
                ..Default::default()
            },
        )
        .unwrap();

        let cancel = CancelToken::new();
        let pick = tokio::time::timeout(Duration::from_secs(2), channel.pick_async(true, &cancel))
            .await
            .expect("pick should complete")
            .expect("pick should succeed");
        assert_eq!(pick.address.address, "127.0.0.1:50051");
        channel.dispose();
    }

    #[tokio::test]
    async fn round_robin_rotates_across_two_ready_backends() {
        let (resolvers, transports) = test_registries(MockBehavior::Succeed);
        let lb_policies = Arc::new(load_balancing::Registry::new());
        lb_policies.add_builder(load_balancing::round_robin::Builder);
        let channel = Channel::new(
            "static:///a:1,b:1",
            ChannelOptions {
                resolver_registry: Some(resolvers),
                transport_registry: Some(transports),
                lb_policy_registry: Some(lb_policies),
                connection_backoff: Some(BackoffBuilder::new().base(Duration::from_millis(1)).max(Duration::from_millis(5))),
                ..Default::default()
            },
        )
        .unwrap();

        // The static resolver carries no service config, so drive the
        // balancer selection directly to exercise round-robin end-to-end.
        channel.deliver_channel_state(
            Some("round_robin"),
            ChannelState::ok(
                vec![Address::new(TCP_ADDRESS_TYPE, "a:1"), Address::new(TCP_ADDRESS_TYPE, "b:1")],
                Some(serde_json::json!([{"policyName": "round_robin"}])),
            ),
        );

        let cancel = CancelToken::new();
        let mut addrs = vec![];
        for _ in 0..3 {
            let pick = tokio::time::timeout(Duration::from_secs(2), channel.pick_async(true, &cancel))
                .await
                .expect("pick should complete")
                .expect("pick should succeed");
            addrs.push(pick.address.address);
        }
        assert_eq!(addrs, vec!["a:1", "b:1", "a:1"]);
        channel.dispose();
    }

    #[tokio::test]
    async fn cancellation_during_pick_wait_surfaces_an_error() {
        let resolvers = Arc::new(name_resolution::ResolverRegistry::new());
        resolvers.add_builder(name_resolution::StaticResolverBuilder);
        let transports = Arc::new(transport::TransportRegistry::new());
        let channel = Channel::new(
            "static:///",
            ChannelOptions {
                resolver_registry: Some(resolvers),
                transport_registry: Some(transports),
                ..Default::default()
            },
        )
        .unwrap();

        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel2.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(1), channel.pick_async(true, &cancel))
            .await
            .expect("pick should not hang past cancellation");
        assert!(result.is_err());
        channel.dispose();
    }
}
