//! An in-memory transport for exercising the subchannel/balancer machinery
//! without a real socket. Not registered in [`super::GLOBAL_TRANSPORT_REGISTRY`];
//! tests wire it in directly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use tonic::async_trait;

use crate::client::name_resolution::Address;
use crate::status::Status;

use super::{ConnectResult, Transport};

/// What a [`MockTransport`] should do the next time (and every subsequent
/// time, until changed) `try_connect` is called.
#[derive(Clone, Debug)]
pub enum MockBehavior {
    Succeed,
    Fail(String),
    Timeout,
}

pub struct MockTransport {
    behavior: Mutex<MockBehavior>,
    current: Mutex<Option<Address>>,
    connect_attempts: AtomicUsize,
    disconnected: AtomicBool,
}

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            current: Mutex::new(None),
            connect_attempts: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn try_connect(&self, address: &Address) -> ConnectResult {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            MockBehavior::Succeed => {
                *self.current.lock().unwrap() = Some(address.clone());
                ConnectResult::Success
            }
            MockBehavior::Fail(detail) => ConnectResult::Failure(Status::unavailable(detail)),
            MockBehavior::Timeout => ConnectResult::Timeout,
        }
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.current.lock().unwrap().take();
    }

    fn current_endpoint(&self) -> Option<Address> {
        self.current.lock().unwrap().clone()
    }
}
