//! Helpers shared by the integration tests.

use std::cell::RefCell;
use std::rc::Rc;

use aml::NodeId;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Records every message a handler receives.
#[derive(Clone, Default)]
pub struct Recorder {
    messages: Rc<RefCell<Vec<(NodeId, Vec<u8>)>>>,
}

impl Recorder {
    pub fn handler(&self) -> impl FnMut(NodeId, &[u8]) + 'static {
        let messages = self.messages.clone();
        move |sender: NodeId, payload: &[u8]| {
            messages.borrow_mut().push((sender, payload.to_vec()));
        }
    }

    pub fn messages(&self) -> Vec<(NodeId, Vec<u8>)> {
        self.messages.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Recognizable payload of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
