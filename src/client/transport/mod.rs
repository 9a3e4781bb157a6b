//! The boundary between a subchannel and whatever actually owns a socket
//! and an HTTP/2 connection. Stream framing, TLS, and protobuf codecs all
//! live on the far side of this trait; the load-balancing core only needs
//! to connect, disconnect, and be told when a call finishes.

use tonic::async_trait;

use crate::client::name_resolution::Address;
use crate::status::Status;

pub mod mock;
mod registry;
mod tcp;

pub use registry::{TransportRegistry, GLOBAL_TRANSPORT_REGISTRY};
pub use tcp::{TcpTransport, TcpTransportBuilder};

/// The outcome of one `try_connect` attempt.
#[derive(Debug)]
pub enum ConnectResult {
    /// The transport is connected (or will post `Ready` asynchronously); the
    /// subchannel's connect loop exits without changing state itself.
    Success,
    /// The attempt timed out; the subchannel moves to `Idle`.
    Timeout,
    /// The attempt failed outright; the subchannel backs off and retries.
    Failure(Status),
}

/// A handle the subchannel uses to drive one underlying connection.
///
/// A single `Transport` instance is bound to exactly one subchannel and is
/// replaced, not reused, across reconnect sequences that change the target
/// address.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempts to establish a connection to `address`. Cancellation-safe:
    /// callers race this against a cancellation signal and drop the future
    /// on loss, at which point the transport must not have left a
    /// connection half-installed as `Ready`.
    async fn try_connect(&self, address: &Address) -> ConnectResult;

    /// Drops the current connection, if any, synchronously.
    fn disconnect(&self);

    /// The address this transport is currently connected to, or `None`.
    fn current_endpoint(&self) -> Option<Address>;

    /// An optional per-attempt timeout; if set, the subchannel enforces it
    /// with its own timer around `try_connect`.
    fn connect_timeout(&self) -> Option<std::time::Duration> {
        None
    }

    /// Notifies the transport that a call dispatched through it has
    /// completed, so it can update stream counters or reachability
    /// heuristics. A no-op for transports that don't track this.
    fn on_request_complete(&self) {}
}

/// A transport factory, indexed in a [`TransportRegistry`] by the address
/// type (`Address::address_type`) it knows how to dial.
pub trait TransportBuilder: Send + Sync {
    fn build(&self) -> std::sync::Arc<dyn Transport>;
    fn address_type(&self) -> &'static str;
}
