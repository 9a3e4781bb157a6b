//! A reusable base for balancers that want one subchannel per address,
//! generalizing the structural diffing the delegating benchmark policy did
//! per-child into a single helper shared by every "subchannels base"
//! balancer (currently just [`super::round_robin`]).

use std::sync::Arc;

use crate::status::Status;

use super::{ChannelController, ConnectivityState, EmptyPicker, ErrorPicker, LbState, Picker, Subchannel};
use crate::client::name_resolution::Address;

/// The customization point a concrete subchannels-base balancer supplies:
/// how to turn the current `Ready` set into a picker.
pub trait PickerFactory: Send {
    fn create_picker(&self, ready: Vec<Subchannel>) -> Arc<dyn Picker>;
}

struct Entry {
    address: Address,
    subchannel: Subchannel,
    state: ConnectivityState,
}

/// Owns one subchannel per resolved address, diffing the address list on
/// every update and aggregating the group's connectivity state.
pub struct SubchannelList<F: PickerFactory> {
    entries: Vec<Entry>,
    picker_factory: F,
}

impl<F: PickerFactory> SubchannelList<F> {
    pub fn new(picker_factory: F) -> Self {
        Self {
            entries: Vec::new(),
            picker_factory,
        }
    }

    /// Diffs `addresses` against the current set by structural address
    /// equality: creates subchannels for new addresses, disposes those
    /// whose address dropped out, and leaves the rest untouched.
    pub fn update_addresses(&mut self, addresses: Vec<Address>, channel_controller: &mut dyn ChannelController) {
        let mut kept = Vec::with_capacity(addresses.len());
        for entry in self.entries.drain(..) {
            if addresses.contains(&entry.address) {
                kept.push(entry);
            } else {
                entry.subchannel.dispose();
            }
        }
        for address in &addresses {
            if kept.iter().any(|e: &Entry| &e.address == address) {
                continue;
            }
            let sc = channel_controller.new_subchannel(std::slice::from_ref(address));
            sc.request_connection();
            kept.push(Entry {
                address: address.clone(),
                subchannel: sc,
                state: ConnectivityState::Idle,
            });
        }
        self.entries = kept;
    }

    /// Records a child subchannel's new state and, per the base balancer's
    /// contract, asks for a resolver refresh on `Idle`/`TransientFailure`
    /// (requesting a reconnect too, on `Idle`).
    pub fn subchannel_update(&mut self, subchannel: &Subchannel, state: ConnectivityState, channel_controller: &mut dyn ChannelController) {
        let Some(entry) = self.entries.iter_mut().find(|e| &e.subchannel == subchannel) else {
            return;
        };
        entry.state = state;
        if matches!(state, ConnectivityState::Idle | ConnectivityState::TransientFailure) {
            channel_controller.request_resolution();
            if state == ConnectivityState::Idle {
                subchannel.request_connection();
            }
        }
    }

    pub fn aggregate_state(&self) -> ConnectivityState {
        if self.entries.iter().any(|e| e.state == ConnectivityState::Ready) {
            ConnectivityState::Ready
        } else if self
            .entries
            .iter()
            .any(|e| matches!(e.state, ConnectivityState::Connecting | ConnectivityState::Idle))
        {
            ConnectivityState::Connecting
        } else {
            ConnectivityState::TransientFailure
        }
    }

    pub fn publish(&self, channel_controller: &mut dyn ChannelController) {
        let state = self.aggregate_state();
        let picker: Arc<dyn Picker> = match state {
            ConnectivityState::Ready => {
                let ready: Vec<Subchannel> = self
                    .entries
                    .iter()
                    .filter(|e| e.state == ConnectivityState::Ready)
                    .map(|e| e.subchannel.clone())
                    .collect();
                self.picker_factory.create_picker(ready)
            }
            ConnectivityState::TransientFailure => Arc::new(ErrorPicker { status: self.first_error() }),
            _ => Arc::new(EmptyPicker),
        };
        channel_controller.update_picker(LbState {
            connectivity_state: state,
            picker,
        });
    }

    pub fn request_connection_all(&self) {
        for entry in &self.entries {
            entry.subchannel.request_connection();
        }
    }

    pub fn dispose(&mut self) {
        for entry in self.entries.drain(..) {
            entry.subchannel.dispose();
        }
    }

    fn first_error(&self) -> Status {
        self.entries
            .iter()
            .find_map(|e| e.subchannel.last_error())
            .unwrap_or_else(|| Status::unavailable("no reachable subchannels"))
    }
}
