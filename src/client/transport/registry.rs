use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use super::TransportBuilder;

/// A registry of transport factories, indexed by the address type
/// (`Address::address_type`) they dial.
pub struct TransportRegistry {
    builders: Mutex<HashMap<&'static str, Arc<dyn TransportBuilder>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_builder(&self, builder: impl TransportBuilder + 'static) {
        let builder = Arc::new(builder);
        self.builders
            .lock()
            .unwrap()
            .insert(builder.address_type(), builder);
    }

    pub fn get_transport(&self, address_type: &str) -> Option<Arc<dyn TransportBuilder>> {
        self.builders.lock().unwrap().get(address_type).cloned()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry used by a channel that wasn't given a local one. Populated
/// on first use with the built-in TCP transport. `Arc`-wrapped so
/// `Channel::new` can share it cheaply instead of rebuilding an equivalent
/// registry per channel.
pub static GLOBAL_TRANSPORT_REGISTRY: Lazy<Arc<TransportRegistry>> = Lazy::new(|| {
    let registry = TransportRegistry::new();
    registry.add_builder(super::tcp::TcpTransportBuilder);
    Arc::new(registry)
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_registry_has_tcp_transport() {
        assert!(GLOBAL_TRANSPORT_REGISTRY.get_transport("tcp").is_some());
        assert!(GLOBAL_TRANSPORT_REGISTRY.get_transport("nope").is_none());
    }
}
