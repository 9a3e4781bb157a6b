#![allow(unused_imports, dead_code)]

use std::sync::Arc;

use bencher::{benchmark_group, benchmark_main, Bencher};
use rand::prelude::*;

use grpc::client::load_balancing::{ChannelController, ChannelState, LbPolicy, LbPolicyBuilder, LbState};
use grpc::client::name_resolution::{Address, TCP_ADDRESS_TYPE};
use grpc::client::transport::mock::{MockBehavior, MockTransport};
use grpc::client::{load_balancing, ConnectivityState, Subchannel};

benchmark_group!(benches, pick_first_subchannel_churn, round_robin_subchannel_churn, round_robin_resolver_update);
benchmark_main!(benches);

static NUM_ADDRESSES: i32 = 200;

fn addresses(n: i32) -> Vec<Address> {
    (0..n).map(|i| Address::new(TCP_ADDRESS_TYPE, format!("10.0.0.{}:{}", i / 256, 50000 + i))).collect()
}

/// A `ChannelController` double backed by a mock transport that always
/// succeeds, so the subchannels it hands out connect (and reconnect)
/// instantly — these benchmarks measure the policies' own bookkeeping, not
/// connection latency or backoff.
struct StubChannelController {
    subchannels: Vec<Subchannel>,
}

impl StubChannelController {
    fn new() -> Self {
        Self { subchannels: vec![] }
    }
}

impl ChannelController for StubChannelController {
    fn new_subchannel(&mut self, addresses: &[Address]) -> Subchannel {
        let transport = Arc::new(MockTransport::new(MockBehavior::Succeed));
        let sc = Subchannel::new(transport, addresses.to_vec(), Default::default());
        self.subchannels.push(sc.clone());
        sc
    }

    fn update_picker(&mut self, _state: LbState) {}

    fn request_resolution(&mut self) {}
}

fn pick_first_subchannel_churn(bench: &mut Bencher) {
    // `resolver_update` hands fresh subchannels to `request_connection`,
    // which spawns their connect loop; bencher runs benches with no Tokio
    // runtime of its own, so entering one here is what keeps that spawn
    // from panicking.
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut lb = load_balancing::pick_first::Builder.build();
    let mut controller = StubChannelController::new();
    lb.resolver_update(ChannelState::ok(addresses(NUM_ADDRESSES), None), &mut controller).unwrap();
    let sc = controller.subchannels[0].clone();

    bench.iter(|| {
        lb.subchannel_update(&sc, ConnectivityState::Connecting, &mut controller);
        lb.subchannel_update(&sc, ConnectivityState::Ready, &mut controller);
        lb.subchannel_update(&sc, ConnectivityState::Idle, &mut controller);
    });
}

fn round_robin_subchannel_churn(bench: &mut Bencher) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut lb = load_balancing::round_robin::Builder.build();
    let mut controller = StubChannelController::new();
    lb.resolver_update(ChannelState::ok(addresses(NUM_ADDRESSES), None), &mut controller).unwrap();
    let subchannels = controller.subchannels.clone();

    bench.iter(|| {
        let sc = &subchannels[thread_rng().gen_range(0..subchannels.len())];
        lb.subchannel_update(sc, ConnectivityState::Ready, &mut controller);
        lb.subchannel_update(sc, ConnectivityState::TransientFailure, &mut controller);
    });
}

/// Repeated resolver churn over a large address list exercises
/// `SubchannelList`'s structural-equality diffing, which is the part of
/// `round_robin` most sensitive to address-count growth.
fn round_robin_resolver_update(bench: &mut Bencher) {
    // Unlike the churn benches above, `resolver_update` runs on every
    // iteration here, not just during setup, so the runtime guard has to
    // stay entered for the whole `bench.iter` body.
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut lb = load_balancing::round_robin::Builder.build();
    let mut controller = StubChannelController::new();
    let full = addresses(NUM_ADDRESSES);
    let mut shrunk = full.clone();
    shrunk.pop();

    bench.iter(|| {
        lb.resolver_update(ChannelState::ok(full.clone(), None), &mut controller).unwrap();
        lb.resolver_update(ChannelState::ok(shrunk.clone(), None), &mut controller).unwrap();
    });
}
