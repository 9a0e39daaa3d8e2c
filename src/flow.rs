// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Shared flow lifecycle machinery
//!
//! Every shim engine drives its flows through the same three-state
//! machine: NULL → PENDING → ALLOCATED → NULL. This module holds the
//! state type, the per-flow SDU queue that exists only while a flow is
//! PENDING, and the queue-drain step executed on the transition to
//! ALLOCATED.

use crate::controller::UserIpcp;
use crate::error::ShimError;
use crate::ipcp::PortId;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// One opaque payload as submitted by (or destined for) the user IPCP.
pub type Sdu = Vec<u8>;

/// Lifecycle state of a shim flow.
///
/// A flow that left PENDING for ALLOCATED never returns to PENDING. A
/// refused flow drops back to NULL but is retained as a stub until the
/// controller explicitly deallocates it, so that the refused peer
/// cannot loop on re-allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowState {
    Null,
    Pending,
    Allocated,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Null => write!(f, "NULL"),
            FlowState::Pending => write!(f, "PENDING"),
            FlowState::Allocated => write!(f, "ALLOCATED"),
        }
    }
}

/// FIFO of SDUs that arrived before the flow reached ALLOCATED.
#[derive(Debug, Default)]
pub struct SduQueue {
    items: VecDeque<Sdu>,
}

impl SduQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sdu: Sdu) {
        self.items.push_back(sdu);
    }

    pub fn pop(&mut self) -> Option<Sdu> {
        self.items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Drains a pending flow's SDU queue into the user IPCP in arrival
/// order.
///
/// If an enqueue fails mid-drain the drain is aborted and the error is
/// returned; the remaining SDUs stay in the queue and the flow stays
/// ALLOCATED. The caller destroys the queue only on success.
pub fn drain_sdu_queue(
    queue: &mut SduQueue,
    user_ipcp: &Arc<dyn UserIpcp>,
    port_id: PortId,
) -> Result<(), ShimError> {
    while let Some(sdu) = queue.pop() {
        if let Err(e) = user_ipcp.du_enqueue(port_id, sdu) {
            log::error!("Couldn't enqueue SDU to user IPCP: {e}");
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::AppName;
    use std::sync::Mutex;

    struct Sink {
        accepted: Mutex<Vec<Sdu>>,
        fail_after: usize,
    }

    impl UserIpcp for Sink {
        fn flow_binding_ipcp(&self, _port_id: PortId) -> Result<(), ShimError> {
            Ok(())
        }
        fn flow_unbinding_ipcp(&self, _port_id: PortId) {}
        fn du_enqueue(&self, _port_id: PortId, sdu: Sdu) -> Result<(), ShimError> {
            let mut accepted = self.accepted.lock().unwrap();
            if accepted.len() >= self.fail_after {
                return Err(ShimError::Resource("sink full".to_string()));
            }
            accepted.push(sdu);
            Ok(())
        }
        fn enable_write(&self, _port_id: PortId) {}
        fn ipcp_name(&self) -> Option<AppName> {
            None
        }
        fn nm1_flow_state_change(&self, _port_id: PortId, _up: bool) {}
    }

    #[test]
    fn test_drain_preserves_fifo_order() {
        let mut queue = SduQueue::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.push(vec![3]);

        let sink = Arc::new(Sink {
            accepted: Mutex::new(Vec::new()),
            fail_after: usize::MAX,
        });
        let user: Arc<dyn UserIpcp> = sink.clone();
        drain_sdu_queue(&mut queue, &user, 9).unwrap();

        assert!(queue.is_empty());
        assert_eq!(*sink.accepted.lock().unwrap(), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_drain_aborts_on_enqueue_failure() {
        let mut queue = SduQueue::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.push(vec![3]);

        let sink = Arc::new(Sink {
            accepted: Mutex::new(Vec::new()),
            fail_after: 1,
        });
        let user: Arc<dyn UserIpcp> = sink.clone();
        assert!(drain_sdu_queue(&mut queue, &user, 9).is_err());

        // One SDU delivered, the rest still queued.
        assert_eq!(sink.accepted.lock().unwrap().len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
