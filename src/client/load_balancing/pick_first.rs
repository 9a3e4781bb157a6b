//! The `pick_first` policy: one subchannel spanning the whole resolved
//! address list, relying on the subchannel's own address-to-address
//! failover during its connect loop.

use std::sync::Arc;

use tracing::debug;

use crate::status::Status;

use super::{ChannelController, ConnectivityState, EmptyPicker, ErrorPicker, LbPolicy, LbPolicyBuilder, LbState, Picker, PickResult, Subchannel};

pub static POLICY_NAME: &str = "pick_first";

pub struct Builder;

impl LbPolicyBuilder for Builder {
    fn build(&self) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy::new())
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct PickFirstPolicy {
    subchannel: Option<Subchannel>,
}

impl PickFirstPolicy {
    fn new() -> Self {
        Self { subchannel: None }
    }

    fn publish_for_state(&self, state: ConnectivityState, channel_controller: &mut dyn ChannelController) {
        let Some(sc) = self.subchannel.clone() else {
            return;
        };
        let picker: Arc<dyn Picker> = match state {
            ConnectivityState::Ready => Arc::new(PickFirstPicker { subchannel: sc }),
            ConnectivityState::Idle => Arc::new(RequestConnectionPicker { subchannel: sc }),
            ConnectivityState::Connecting => Arc::new(EmptyPicker),
            ConnectivityState::TransientFailure => Arc::new(ErrorPicker {
                status: sc
                    .last_error()
                    .unwrap_or_else(|| Status::unavailable("subchannel is in transient failure")),
            }),
            ConnectivityState::Shutdown => Arc::new(EmptyPicker),
        };
        channel_controller.update_picker(LbState {
            connectivity_state: state,
            picker,
        });
    }
}

impl LbPolicy for PickFirstPolicy {
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
                    update.status.clone()
                };
                let has_ready = self.subchannel.as_ref().map(|sc| sc.state() == ConnectivityState::Ready).unwrap_or(false);
                if !has_ready {
                    if let Some(sc) = self.subchannel.take() {
                        sc.dispose();
                    }
                    channel_controller.update_picker(LbState {
                        connectivity_state: ConnectivityState::TransientFailure,
                        picker: Arc::new(ErrorPicker { status: status.clone() }),
                    });
                }
                return Err(status);
            }
        };

        match &self.subchannel {
            None => {
                let sc = channel_controller.new_subchannel(&addresses);
                self.subchannel = Some(sc.clone());
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::Idle,
                    picker: Arc::new(EmptyPicker),
                });
                sc.request_connection();
            }
            Some(sc) => sc.update_addresses(addresses),
        }
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Subchannel, state: ConnectivityState, channel_controller: &mut dyn ChannelController) {
        let matches = matches!(&self.subchannel, Some(sc) if sc == subchannel);
        if !matches {
            return;
        }
        if state == ConnectivityState::Idle {
            debug!(target: "grpc::client::load_balancing::pick_first", "ResolverRefreshRequested");
            channel_controller.request_resolution();
        }
        self.publish_for_state(state, channel_controller);
    }

    fn request_connection(&mut self, _channel_controller: &mut dyn ChannelController) {
        if let Some(sc) = &self.subchannel {
            sc.request_connection();
        }
    }

    fn dispose(&mut self) {
        if let Some(sc) = self.subchannel.take() {
            sc.dispose();
        }
    }
}

struct PickFirstPicker {
    subchannel: Subchannel,
}

impl Picker for PickFirstPicker {
    fn pick(&self) -> PickResult {
        PickResult::Complete {
            subchannel: self.subchannel.clone(),
            on_complete: None,
        }
    }
}

/// Published while the subchannel is `Idle`: a pick nudges it to connect,
/// matching grpc-go's "lazy" pick-first behavior.
struct RequestConnectionPicker {
    subchannel: Subchannel,
}

impl Picker for RequestConnectionPicker {
    fn pick(&self) -> PickResult {
        self.subchannel.request_connection();
        PickResult::Complete {
            subchannel: self.subchannel.clone(),
            on_complete: None,
        }
    }
}
