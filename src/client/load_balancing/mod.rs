//! The load-balancing policy plane: the abstract `LbPolicy` contract, the
//! pick loop's `Picker`/`PickResult` types, and the registry of known
//! policy names (`pick_first`, `round_robin`, ...).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::attributes::Attributes;
use crate::status::Status;

use super::name_resolution::Address;
use super::subchannel::Subchannel;

pub mod pick_first;
pub mod round_robin;
pub mod subchannel_list;

pub use super::connectivity::ConnectivityState;

/// The input to a balancer: the channel status and (if `status` is `Ok`)
/// the resolved addresses, plus any load-balancing-policy-specific config
/// and resolver attributes.
#[derive(Clone)]
pub struct ChannelState {
    pub status: Status,
    pub addresses: Option<Vec<Address>>,
    pub load_balancing_config: Option<Value>,
    pub attributes: Attributes,
}

impl ChannelState {
    pub fn ok(addresses: Vec<Address>, load_balancing_config: Option<Value>) -> Self {
        Self {
            status: Status::ok(),
            addresses: Some(addresses),
            load_balancing_config,
            attributes: Attributes::new(),
        }
    }

    pub fn failure(status: Status) -> Self {
        debug_assert!(!status.is_ok());
        Self {
            status,
            addresses: None,
            load_balancing_config: None,
            attributes: Attributes::new(),
        }
    }
}

/// `(connectivityState, picker)` — what a balancer hands back to the
/// connection manager.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

/// A pure function of whatever state it captured at construction time.
/// `pick` MUST NOT mutate the subchannel set it was built from.
pub trait Picker: Send + Sync {
    fn pick(&self) -> PickResult;
}

/// The tagged result of one pick. `Fail` is retryable under wait-for-ready;
/// `Drop` is not.
pub enum PickResult {
    Complete {
        subchannel: Subchannel,
        on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
    },
    Queue,
    Fail {
        status: Status,
    },
    Drop {
        status: Status,
    },
}

/// A picker that always queues, used while a balancer has no usable
/// subchannel yet.
pub struct EmptyPicker;

impl Picker for EmptyPicker {
    fn pick(&self) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that always fails with a fixed status.
pub struct ErrorPicker {
    pub status: Status,
}

impl Picker for ErrorPicker {
    fn pick(&self) -> PickResult {
        PickResult::Fail {
            status: self.status.clone(),
        }
    }
}

/// The capability set a balancer is given to talk back to its owning
/// channel: create subchannels, publish new balancer state, and ask for a
/// fresh resolver pass.
pub trait ChannelController: Send {
    /// Creates a new, `Idle` subchannel spanning `addresses` (all treated as
    /// equivalent; the subchannel itself handles address-to-address
    /// failover). Pick-first passes the whole resolved list; the
    /// subchannels-base balancer passes one address at a time.
    fn new_subchannel(&mut self, addresses: &[Address]) -> Subchannel;
    fn update_picker(&mut self, state: LbState);
    fn request_resolution(&mut self);
}

/// One load-balancing policy instance, scoped to one channel.
pub trait LbPolicy: Send {
    /// A new resolver result (after the A21 service-config ladder) or a
    /// resolution failure.
    fn resolver_update(&mut self, update: ChannelState, channel_controller: &mut dyn ChannelController) -> Result<(), Status>;

    /// One of this policy's subchannels changed connectivity state.
    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: ConnectivityState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Requests that the policy (re)connect whatever it currently manages,
    /// e.g. in response to an application-level "connect now" call.
    fn request_connection(&mut self, channel_controller: &mut dyn ChannelController);

    /// Releases every subchannel the policy owns. Called when the policy is
    /// being replaced or the channel is shutting down.
    fn dispose(&mut self);
}

/// An `LbPolicy` factory, indexed in a [`Registry`] by [`name`](Self::name).
pub trait LbPolicyBuilder: Send + Sync {
    fn build(&self) -> Box<dyn LbPolicy>;
    fn name(&self) -> &'static str;
}

/// A registry of LB policy factories, indexed by policy name.
pub struct Registry {
    builders: Mutex<HashMap<&'static str, Arc<dyn LbPolicyBuilder>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        let builder = Arc::new(builder);
        self.builders.lock().unwrap().insert(builder.name(), builder);
    }

    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.builders.lock().unwrap().get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry used by a channel that wasn't given a local one. Populated
/// on first use with the two required policies. `Arc`-wrapped so
/// `Channel::new` can share it cheaply instead of rebuilding an equivalent
/// registry per channel.
pub static GLOBAL_LB_REGISTRY: Lazy<Arc<Registry>> = Lazy::new(|| {
    let registry = Registry::new();
    registry.add_builder(pick_first::Builder);
    registry.add_builder(round_robin::Builder);
    Arc::new(registry)
});

/// Picks the first `loadBalancingConfigs` entry whose `policyName` is known
/// to `registry`, per the resolved "first wins" Open Question, logging and
/// skipping any that aren't recognized.
pub fn select_policy(registry: &Registry, load_balancing_config: &Value) -> Option<(Arc<dyn LbPolicyBuilder>, Value)> {
    let entries = load_balancing_config.as_array()?;
    for entry in entries {
        let Some(name) = entry.get("policyName").and_then(Value::as_str) else {
            continue;
        };
        if let Some(builder) = registry.get_policy(name) {
            return Some((builder, entry.clone()));
        }
        tracing::warn!(target: "grpc::client::load_balancing", policy_name = name, "ResolverUnsupportedLoadBalancingConfig");
    }
    None
}
