//! End-to-end scenarios wiring the static resolver, the mock transport, and
//! the real load-balancing policies together through a [`Channel`], the way
//! a caller actually exercises them. Unit tests elsewhere in this tree cover
//! individual components in isolation; this module covers the scenarios
//! that only show up once those components are composed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::async_trait;

use crate::backoff::BackoffBuilder;
use crate::cancel::CancelToken;
use crate::status::Status;

use super::load_balancing;
use super::name_resolution::{self, Address, TCP_ADDRESS_TYPE};
use super::transport::{self, ConnectResult, Transport, TransportBuilder};
use super::{Channel, ChannelOptions};

/// A transport whose `try_connect` outcome depends on the address being
/// dialed, so a single mock can model "this address is unreachable, that
/// one isn't" across the address list a `pick_first`/`round_robin`
/// subchannel walks through one shared transport instance.
struct AddressGatedTransport {
    unreachable: Vec<String>,
    current: Mutex<Option<Address>>,
    attempts: AtomicUsize,
}

impl AddressGatedTransport {
    fn new(unreachable: Vec<&str>) -> Self {
        Self {
            unreachable: unreachable.into_iter().map(String::from).collect(),
            current: Mutex::new(None),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for AddressGatedTransport {
    async fn try_connect(&self, address: &Address) -> ConnectResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.contains(&address.address) {
            return ConnectResult::Failure(Status::unavailable(format!("{} is unreachable", address.address)));
        }
        *self.current.lock().unwrap() = Some(address.clone());
        ConnectResult::Success
    }

    fn disconnect(&self) {
        self.current.lock().unwrap().take();
    }

    fn current_endpoint(&self) -> Option<Address> {
        self.current.lock().unwrap().clone()
    }
}

struct AddressGatedTransportBuilder(Vec<&'static str>);

impl TransportBuilder for AddressGatedTransportBuilder {
    fn build(&self) -> Arc<dyn Transport> {
        Arc::new(AddressGatedTransport::new(self.0.clone()))
    }

    fn address_type(&self) -> &'static str {
        TCP_ADDRESS_TYPE
    }
}

fn fast_backoff() -> BackoffBuilder {
    BackoffBuilder::new().base(Duration::from_millis(1)).max(Duration::from_millis(5))
}

fn static_target(addresses: &[&str]) -> String {
    format!("static:///{}", addresses.join(","))
}

fn channel_with(addresses: &[&str], unreachable: Vec<&'static str>, lb_policies: Option<Arc<load_balancing::Registry>>) -> Channel {
    let resolvers = Arc::new(name_resolution::ResolverRegistry::new());
    resolvers.add_builder(name_resolution::StaticResolverBuilder);
    let transports = Arc::new(transport::TransportRegistry::new());
    transports.add_builder(AddressGatedTransportBuilder(unreachable));
    Channel::new(
        &static_target(addresses),
        ChannelOptions {
            resolver_registry: Some(resolvers),
            transport_registry: Some(transports),
            lb_policy_registry: lb_policies,
            connection_backoff: Some(fast_backoff()),
            ..Default::default()
        },
    )
    .unwrap()
}

/// S2 — pick-first fallback: the first address is unreachable, so the pick
/// loop must surface a `Complete` pick bound to the second address without
/// ever returning an error to the caller.
#[tokio::test]
async fn pick_first_falls_back_to_the_next_reachable_address() {
    let channel = channel_with(&["127.0.0.1:50051", "127.0.0.1:50052"], vec!["127.0.0.1:50051"], None);

    let cancel = CancelToken::new();
    let pick = tokio::time::timeout(Duration::from_secs(2), channel.pick_async(true, &cancel))
        .await
        .expect("pick should complete")
        .expect("pick should succeed without surfacing the first address's failure");
    assert_eq!(pick.address.address, "127.0.0.1:50052");
    channel.dispose();
}

/// S4 — resolver-driven address removal: round-robin starts over `[A, B]`,
/// both reach `Ready`, then the resolver narrows to `[B]`. The picker must
/// settle on rotating over `B` alone, and the subchannel bound to `A` must
/// be disposed rather than left dangling.
#[tokio::test]
async fn resolver_removing_an_address_disposes_its_subchannel() {
    let lb_policies = Arc::new(load_balancing::Registry::new());
    lb_policies.add_builder(load_balancing::round_robin::Builder);
    let channel = channel_with(&["a:1", "b:1"], vec![], Some(lb_policies));

    // The static resolver's result carries no service config, which would
    // otherwise fall through the A21 ladder to the hard-coded `pick_first`
    // default — and this registry only knows `round_robin`. Drive the
    // balancer selection directly, before the first pick, so the rest of
    // the scenario exercises round-robin's `{a:1, b:1}` rotation rather
    // than blocking forever waiting for a picker that's never published.
    channel.deliver_channel_state(
        Some("round_robin"),
        load_balancing::ChannelState::ok(
            vec![Address::new(TCP_ADDRESS_TYPE, "a:1"), Address::new(TCP_ADDRESS_TYPE, "b:1")],
            Some(serde_json::json!([{"policyName": "round_robin"}])),
        ),
    );

    let cancel = CancelToken::new();
    let first_subchannels: std::collections::HashSet<_> = {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let pick = tokio::time::timeout(Duration::from_secs(2), channel.pick_async(true, &cancel))
                .await
                .expect("pick should complete")
                .expect("pick should succeed");
            seen.insert(pick.address.address);
        }
        seen
    };
    assert_eq!(first_subchannels, std::collections::HashSet::from(["a:1".to_string(), "b:1".to_string()]));

    channel.deliver_channel_state(
        Some("round_robin"),
        load_balancing::ChannelState::ok(vec![Address::new(TCP_ADDRESS_TYPE, "b:1")], Some(serde_json::json!([{"policyName": "round_robin"}]))),
    );

    // Give the narrowed picker time to settle; every subsequent pick must
    // land on `b:1` only.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let pick = channel.pick_async(true, &cancel).await.expect("pick should succeed");
            if pick.address.address == "b:1" {
                for _ in 0..3 {
                    let pick = channel.pick_async(true, &cancel).await.expect("pick should succeed");
                    assert_eq!(pick.address.address, "b:1");
                }
                break;
            }
        }
    })
    .await
    .expect("picker should converge onto the remaining address");

    channel.dispose();
}
