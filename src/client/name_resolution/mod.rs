//! The pluggable name-resolution pipeline: resolvers turn a scheme-qualified
//! target URI into a stream of address-set updates.

use core::fmt;
use std::fmt::{Display, Formatter};
use std::hash::Hash;
use std::sync::Arc;

use url::Url;

use crate::attributes::Attributes;
use crate::client::service_config::ParsedServiceConfig;
use crate::status::Status;

mod dns;
pub mod polling;
mod registry;
mod static_resolver;

pub use dns::{DnsResolverBuilder, DNS_SCHEME};
pub use registry::{ResolverRegistry, GLOBAL_RESOLVER_REGISTRY};
pub use static_resolver::{StaticResolverBuilder, STATIC_SCHEME};

/// `(host, port)` plus an open-ended attribute map, per the data model.
/// `address_type` discriminates what kind of endpoint identifier `address`
/// holds ("tcp" for the DNS/static resolvers' `host:port` strings), leaving
/// room for resolvers that name endpoints a different way (e.g. a mock
/// transport used in tests that addresses backends by id).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Address {
    pub address_type: &'static str,
    pub address: String,
    pub attributes: Attributes,
}

impl Address {
    pub fn new(address_type: &'static str, address: impl Into<String>) -> Self {
        Self {
            address_type,
            address: address.into(),
            attributes: Attributes::new(),
        }
    }
}

pub static TCP_ADDRESS_TYPE: &str = "tcp";

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.address_type == other.address_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address_type, self.address)
    }
}

/// Structural, order-insensitive equality over a set of addresses, as
/// required by the subchannel's `UpdateAddresses` no-op rule.
pub fn address_sets_equal(a: &[Address], b: &[Address]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|addr| b.contains(addr))
}

/// The tagged `Success | Failure` result a resolver delivers to its
/// listener. `Failure.status` is never `Code::Ok`; a `Success` may carry a
/// `service_config_status` with any code, but only alongside a
/// `service_config` when that status is `Code::Ok`.
#[derive(Debug, Clone)]
pub enum ResolverResult {
    Success {
        addresses: Vec<Address>,
        service_config: Option<ParsedServiceConfig>,
        service_config_status: Option<Status>,
        attributes: Attributes,
    },
    Failure {
        status: Status,
    },
}

impl ResolverResult {
    pub fn success(addresses: Vec<Address>) -> Self {
        Self::Success {
            addresses,
            service_config: None,
            service_config_status: None,
            attributes: Attributes::new(),
        }
    }

    pub fn failure(status: Status) -> Self {
        debug_assert!(!status.is_ok(), "Failure.status must never be Ok");
        Self::Failure { status }
    }
}

/// Invoked once per delivered result. Every `Resolver::start` precedes any
/// call to the listener it was given.
pub type ResolverListener = Arc<dyn Fn(ResolverResult) + Send + Sync>;

/// A name resolver instance, scoped to one target.
///
/// `start` is idempotent-failing: calling it a second time is a programmer
/// error. `refresh` is a hint and may coalesce concurrent calls onto a
/// single in-flight resolution; calling it before `start` is an error.
/// `dispose` cancels any outstanding work and is idempotent.
pub trait Resolver: Send + Sync {
    fn start(&self, listener: ResolverListener);
    fn refresh(&self);
    fn dispose(&self);
}

#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct ResolverOptions {
    /// The default port to use for addresses that don't specify one.
    pub default_port: u16,
    /// Disables resolution/use of service configuration.
    pub disable_service_config: bool,
}

/// A name resolver factory, indexed in a [`ResolverRegistry`] by the URI
/// scheme it handles.
pub trait ResolverBuilder: Send + Sync {
    fn build(&self, target: Url, options: ResolverOptions) -> Arc<dyn Resolver>;
    fn scheme(&self) -> &'static str;
    /// The default authority for a channel using this resolver and target,
    /// when the caller hasn't overridden it.
    fn default_authority(&self, target: &Url) -> String {
        let path = target.path();
        path.strip_prefix('/').unwrap_or(path).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(TCP_ADDRESS_TYPE, s)
    }

    #[test]
    fn address_set_equality_ignores_order() {
        let a = vec![addr("1.1.1.1:80"), addr("2.2.2.2:80")];
        let b = vec![addr("2.2.2.2:80"), addr("1.1.1.1:80")];
        assert!(address_sets_equal(&a, &b));
    }

    #[test]
    fn address_set_equality_detects_difference() {
        let a = vec![addr("1.1.1.1:80")];
        let b = vec![addr("2.2.2.2:80")];
        assert!(!address_sets_equal(&a, &b));
    }

    #[test]
    fn address_equality_ignores_attributes() {
        let mut a = addr("1.1.1.1:80");
        let b = addr("1.1.1.1:80");
        a.attributes
            .set(crate::attributes::AttributeKey::<u32>::new("x"), 1);
        assert_eq!(a, b);
    }
}
