use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use super::ResolverBuilder;

/// A registry to store and retrieve name resolver factories, indexed by the
/// URI scheme they are intended to handle.
pub struct ResolverRegistry {
    builders: Mutex<HashMap<&'static str, Arc<dyn ResolverBuilder>>>,
}

impl ResolverRegistry {
    /// Constructs an empty name resolver registry.
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a resolver factory, indexed by `builder.scheme()`.
    pub fn add_builder(&self, builder: impl ResolverBuilder + 'static) {
        let builder = Arc::new(builder);
        self.builders
            .lock()
            .unwrap()
            .insert(builder.scheme(), builder);
    }

    /// Retrieves a resolver factory by scheme, or `None` if not registered.
    pub fn get_scheme(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.lock().unwrap().get(scheme).cloned()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry used by a channel that wasn't given a local registry of its
/// own. Populated on first use with the built-in `dns` and `static`
/// resolvers. `Arc`-wrapped so `Channel::new` can share it cheaply instead
/// of rebuilding an equivalent registry per channel.
pub static GLOBAL_RESOLVER_REGISTRY: Lazy<Arc<ResolverRegistry>> = Lazy::new(|| {
    let registry = ResolverRegistry::new();
    registry.add_builder(super::DnsResolverBuilder::new());
    registry.add_builder(super::StaticResolverBuilder);
    Arc::new(registry)
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_registry_has_builtin_resolvers() {
        assert!(GLOBAL_RESOLVER_REGISTRY.get_scheme("dns").is_some());
        assert!(GLOBAL_RESOLVER_REGISTRY.get_scheme("static").is_some());
        assert!(GLOBAL_RESOLVER_REGISTRY.get_scheme("nope").is_none());
    }
}
