//! A minimal TCP transport: it proves out the `connect`/`disconnect`
//! contract against a real socket without taking on HTTP/2 framing, which is
//! the call-dispatch layer's concern, not this crate's.

use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpStream;
use tonic::async_trait;
use tracing::debug;

use crate::client::name_resolution::Address;
use crate::status::Status;

use super::{ConnectResult, Transport, TransportBuilder};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct TcpTransportBuilder;

impl TransportBuilder for TcpTransportBuilder {
    fn build(&self) -> std::sync::Arc<dyn Transport> {
        std::sync::Arc::new(TcpTransport::new())
    }

    fn address_type(&self) -> &'static str {
        crate::client::name_resolution::TCP_ADDRESS_TYPE
    }
}

pub struct TcpTransport {
    current: Mutex<Option<(Address, TcpStream)>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn try_connect(&self, address: &Address) -> ConnectResult {
        // The subchannel races this future against `connect_timeout()`
        // itself, so there's no deadline timer here — just the dial.
        match TcpStream::connect(&address.address).await {
            Ok(stream) => {
                debug!(target: "grpc::client::transport::tcp", %address, "connected");
                *self.current.lock().unwrap() = Some((address.clone(), stream));
                ConnectResult::Success
            }
            Err(e) => ConnectResult::Failure(Status::with_cause(
                crate::status::Code::Unavailable,
                format!("failed to connect to {address}"),
                e,
            )),
        }
    }

    fn disconnect(&self) {
        self.current.lock().unwrap().take();
    }

    fn current_endpoint(&self) -> Option<Address> {
        self.current.lock().unwrap().as_ref().map(|(addr, _)| addr.clone())
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(DEFAULT_CONNECT_TIMEOUT)
    }
}
