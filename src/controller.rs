// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Upstream controller capabilities
//!
//! The shim subsystem never reaches for process-wide state: every shim
//! family receives a [`Controller`] handle when its factory is built
//! and threads it through. The controller owns port-id allocation and
//! receives the flow lifecycle notifications; user IPCPs are the upper
//! consumers of shim flows, resolved through the controller and held by
//! flows as shared handles.

use crate::error::ShimError;
use crate::flow::Sdu;
use crate::ipcp::{FlowSpec, IpcpId, PortId};
use crate::name::AppName;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Capability set the upstream controller exposes to the shims.
pub trait Controller: Send + Sync {
    /// Reserves a process-wide unique port-id for a flow on `ipcp_id`.
    fn reserve_port_id(&self, ipcp_id: IpcpId) -> Result<PortId, ShimError>;

    /// Returns a port-id to the allocator.
    fn release_port_id(&self, port_id: PortId);

    /// Resolves the user IPCP serving `name`, if any. `None` means the
    /// destination is a directly attached application.
    fn find_user_ipcp_by_name(&self, name: &AppName) -> Option<Arc<dyn UserIpcp>>;

    /// A remotely-initiated flow reached PENDING; the controller must
    /// eventually answer with `flow_allocate_response`.
    fn notify_flow_arrived(
        &self,
        ipcp_id: IpcpId,
        port_id: PortId,
        dif_name: &AppName,
        local_app: &AppName,
        remote_app: &AppName,
        fspec: &FlowSpec,
    ) -> Result<(), ShimError>;

    /// Reports the outcome of a locally-initiated allocation.
    fn notify_flow_alloc_result(&self, ipcp_id: IpcpId, port_id: PortId, ok: bool);

    /// Reports a flow deallocation; `remote` marks peer-initiated
    /// releases.
    fn notify_flow_dealloc(&self, ipcp_id: IpcpId, reason: i32, port_id: PortId, remote: bool);
}

/// Handle to the upper IPCP consuming SDUs from a shim flow.
pub trait UserIpcp: Send + Sync {
    /// Binds the given port-id to this IPCP; called when a flow reaches
    /// ALLOCATED.
    fn flow_binding_ipcp(&self, port_id: PortId) -> Result<(), ShimError>;

    /// Reverse of `flow_binding_ipcp`; called on tear-down.
    fn flow_unbinding_ipcp(&self, port_id: PortId);

    /// Delivers one inbound SDU.
    fn du_enqueue(&self, port_id: PortId, sdu: Sdu) -> Result<(), ShimError>;

    /// Clears a prior WouldBlock; the IPCP may retry writes.
    fn enable_write(&self, port_id: PortId);

    /// The IPCP's own name, or `None` for a directly attached
    /// application endpoint.
    fn ipcp_name(&self) -> Option<AppName>;

    /// Signals that the N-1 flow under `port_id` went up or down.
    fn nm1_flow_state_change(&self, port_id: PortId, up: bool);
}

/// Minimal controller for the demo daemon: sequential port-ids, logged
/// notifications, no user IPCP directory.
pub struct LoggingController {
    next_port_id: AtomicU32,
}

impl LoggingController {
    pub fn new() -> Self {
        Self {
            next_port_id: AtomicU32::new(1),
        }
    }
}

impl Default for LoggingController {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller for LoggingController {
    fn reserve_port_id(&self, _ipcp_id: IpcpId) -> Result<PortId, ShimError> {
        Ok(self.next_port_id.fetch_add(1, Ordering::Relaxed))
    }

    fn release_port_id(&self, _port_id: PortId) {}

    fn find_user_ipcp_by_name(&self, _name: &AppName) -> Option<Arc<dyn UserIpcp>> {
        None
    }

    fn notify_flow_arrived(
        &self,
        ipcp_id: IpcpId,
        port_id: PortId,
        dif_name: &AppName,
        local_app: &AppName,
        remote_app: &AppName,
        _fspec: &FlowSpec,
    ) -> Result<(), ShimError> {
        log::info!(
            "flow arrived on ipcp {ipcp_id}: port {port_id}, dif {dif_name}, {remote_app} -> {local_app}"
        );
        Ok(())
    }

    fn notify_flow_alloc_result(&self, ipcp_id: IpcpId, port_id: PortId, ok: bool) {
        log::info!("flow alloc result on ipcp {ipcp_id}: port {port_id}, ok={ok}");
    }

    fn notify_flow_dealloc(&self, ipcp_id: IpcpId, reason: i32, port_id: PortId, remote: bool) {
        log::info!(
            "flow dealloc on ipcp {ipcp_id}: port {port_id}, reason={reason}, remote={remote}"
        );
    }
}
