//! The `static` resolver: a fixed address list baked into the target URI,
//! useful for tests and for targets that already know their backends.
//!
//! Per the framework's resolved Open Question, it behaves like grpc-go's
//! `passthrough` resolver: it emits its one and only result from `start` and
//! treats `refresh` as a no-op, since there is nothing further to resolve.

use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::{Address, Resolver, ResolverBuilder, ResolverListener, ResolverOptions, ResolverResult, TCP_ADDRESS_TYPE};

pub static STATIC_SCHEME: &str = "static";

pub struct StaticResolverBuilder;

impl ResolverBuilder for StaticResolverBuilder {
    fn build(&self, target: Url, _options: ResolverOptions) -> Arc<dyn Resolver> {
        let addresses = parse_static_target(&target);
        Arc::new(StaticResolver { addresses })
    }

    fn scheme(&self) -> &'static str {
        STATIC_SCHEME
    }
}

/// `static:///host1:port1,host2:port2,...`: a comma-separated `host:port`
/// list in the path, with an empty authority just like the `dns` scheme.
fn parse_static_target(target: &Url) -> Vec<Address> {
    let path = target.path();
    let list = path.strip_prefix('/').unwrap_or(path);
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Address::new(TCP_ADDRESS_TYPE, s))
        .collect()
}

struct StaticResolver {
    addresses: Vec<Address>,
}

impl Resolver for StaticResolver {
    fn start(&self, listener: ResolverListener) {
        debug!(target: "grpc::client::name_resolution::static", count = self.addresses.len(), "emitting static address list");
        listener(ResolverResult::success(self.addresses.clone()));
    }

    fn refresh(&self) {
        // Nothing to re-resolve; the address list never changes.
    }

    fn dispose(&self) {}
}
