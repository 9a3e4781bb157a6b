//! The client-side load-balancing core: name resolution, subchannels, the
//! load-balancing policy plane, and the connection manager that mediates
//! between them.

pub mod connectivity;
pub mod load_balancing;
pub mod name_resolution;
pub mod service_config;
pub mod subchannel;
pub mod transport;

mod channel;

#[cfg(test)]
mod tests;

pub use channel::{Channel, ChannelOptions};
pub use connectivity::ConnectivityState;
pub use subchannel::Subchannel;
