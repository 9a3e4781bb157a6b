//! The `round_robin` policy: one subchannel per resolved address (via
//! [`super::subchannel_list::SubchannelList`]), picking among the `Ready`
//! ones in rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::subchannel_list::{PickerFactory, SubchannelList};
use super::{ChannelController, ConnectivityState, LbPolicy, LbPolicyBuilder, Picker, PickResult, Subchannel};
use crate::status::Status;

pub static POLICY_NAME: &str = "round_robin";

pub struct Builder;

impl LbPolicyBuilder for Builder {
    fn build(&self) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            list: SubchannelList::new(RoundRobinPickerFactory),
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct RoundRobinPickerFactory;

impl PickerFactory for RoundRobinPickerFactory {
    fn create_picker(&self, ready: Vec<Subchannel>) -> Arc<dyn Picker> {
        Arc::new(RoundRobinPicker {
            subchannels: ready,
            counter: AtomicUsize::new(0),
        })
    }
}

/// Selects index `(atomic_counter++) mod n` over the `Ready` set captured at
/// construction time. Immutable once built: rotation state lives in the
/// counter, never in the subchannel list itself.
struct RoundRobinPicker {
    subchannels: Vec<Subchannel>,
    counter: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self) -> PickResult {
        if self.subchannels.is_empty() {
            return PickResult::Queue;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Complete {
            subchannel: self.subchannels[index].clone(),
            on_complete: None,
        }
    }
}

struct RoundRobinPolicy {
    list: SubchannelList<RoundRobinPickerFactory>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(&mut self, update: super::ChannelState, channel_controller: &mut dyn ChannelController) -> Result<(), Status> {
        let addresses = match update.addresses.filter(|a| !a.is_empty()) {
            Some(a) => a,
            None => {
                // `update.status` is `Ok` when the resolver succeeded with an
                // empty address list; synthesize a real error status in that
                // case so the published `ErrorPicker` never wraps `Code::Ok`.
                let status = if update.status.is_ok() {
                    Status::unavailable("resolver produced no addresses")
                } else {
                    update.status
                };
                self.list.dispose();
                channel_controller.update_picker(super::LbState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    picker: Arc::new(super::ErrorPicker { status: status.clone() }),
                });
                return Err(status);
            }
        };
        self.list.update_addresses(addresses, channel_controller);
        self.list.publish(channel_controller);
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Subchannel, state: ConnectivityState, channel_controller: &mut dyn ChannelController) {
        self.list.subchannel_update(subchannel, state, channel_controller);
        self.list.publish(channel_controller);
    }

    fn request_connection(&mut self, _channel_controller: &mut dyn ChannelController) {
        self.list.request_connection_all();
    }

    fn dispose(&mut self) {
        self.list.dispose();
    }
}
