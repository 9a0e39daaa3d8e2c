// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Shared controller/user doubles for the integration tests.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use aris::{
    AppName, Controller, FlowSpec, IpcpId, PortId, Sdu, ShimError, ShimInstance, UserIpcp,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What the controller does when a shim reports an arrived flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalPolicy {
    /// Immediately answer with a positive allocate-response.
    Accept,
    /// Immediately answer with a negative allocate-response.
    Reject,
    /// Record the arrival and let the test answer.
    Manual,
}

#[derive(Debug, Clone)]
pub struct Arrival {
    pub ipcp_id: IpcpId,
    pub port_id: PortId,
    pub local_app: AppName,
    pub remote_app: AppName,
}

/// Test double for the upstream controller.
pub struct TestController {
    next_port: AtomicU32,
    policy: Mutex<ArrivalPolicy>,
    instances: Mutex<HashMap<IpcpId, Arc<dyn ShimInstance>>>,
    users: Mutex<HashMap<String, Arc<TestUser>>>,
    pub arrivals: Mutex<Vec<Arrival>>,
    pub alloc_results: Mutex<Vec<(IpcpId, PortId, bool)>>,
    pub deallocs: Mutex<Vec<(IpcpId, PortId, bool)>>,
    pub released_ports: Mutex<Vec<PortId>>,
}

impl TestController {
    pub fn new(policy: ArrivalPolicy) -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU32::new(1),
            policy: Mutex::new(policy),
            instances: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            arrivals: Mutex::new(Vec::new()),
            alloc_results: Mutex::new(Vec::new()),
            deallocs: Mutex::new(Vec::new()),
            released_ports: Mutex::new(Vec::new()),
        })
    }

    pub fn set_policy(&self, policy: ArrivalPolicy) {
        *self.policy.lock().unwrap() = policy;
    }

    pub fn add_instance(&self, instance: Arc<dyn ShimInstance>) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.ipcp_id(), instance);
    }

    pub fn instance(&self, ipcp_id: IpcpId) -> Arc<dyn ShimInstance> {
        self.instances.lock().unwrap()[&ipcp_id].clone()
    }

    pub fn add_user(&self, name: &str) -> Arc<TestUser> {
        let user = TestUser::new(name);
        self.users
            .lock()
            .unwrap()
            .insert(name.to_string(), user.clone());
        user
    }

    pub fn reserve(&self, ipcp_id: IpcpId) -> PortId {
        self.reserve_port_id(ipcp_id).unwrap()
    }

    pub fn wait_arrival(&self, ipcp_id: IpcpId, timeout: Duration) -> Option<Arrival> {
        wait_for(timeout, || {
            self.arrivals
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.ipcp_id == ipcp_id)
                .cloned()
        })
    }

    pub fn wait_alloc_result(&self, port_id: PortId, timeout: Duration) -> Option<bool> {
        wait_for(timeout, || {
            self.alloc_results
                .lock()
                .unwrap()
                .iter()
                .find(|(_, p, _)| *p == port_id)
                .map(|&(_, _, ok)| ok)
        })
    }

    pub fn wait_dealloc(&self, ipcp_id: IpcpId, timeout: Duration) -> Option<(PortId, bool)> {
        wait_for(timeout, || {
            self.deallocs
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _, _)| *id == ipcp_id)
                .map(|&(_, p, r)| (p, r))
        })
    }
}

impl Controller for TestController {
    fn reserve_port_id(&self, _ipcp_id: IpcpId) -> Result<PortId, ShimError> {
        Ok(self.next_port.fetch_add(1, Ordering::Relaxed))
    }

    fn release_port_id(&self, port_id: PortId) {
        self.released_ports.lock().unwrap().push(port_id);
    }

    fn find_user_ipcp_by_name(&self, name: &AppName) -> Option<Arc<dyn UserIpcp>> {
        self.users
            .lock()
            .unwrap()
            .get(&name.process_name)
            .map(|user| user.clone() as Arc<dyn UserIpcp>)
    }

    fn notify_flow_arrived(
        &self,
        ipcp_id: IpcpId,
        port_id: PortId,
        _dif_name: &AppName,
        local_app: &AppName,
        remote_app: &AppName,
        _fspec: &FlowSpec,
    ) -> Result<(), ShimError> {
        self.arrivals.lock().unwrap().push(Arrival {
            ipcp_id,
            port_id,
            local_app: local_app.clone(),
            remote_app: remote_app.clone(),
        });
        let policy = *self.policy.lock().unwrap();
        match policy {
            ArrivalPolicy::Manual => Ok(()),
            ArrivalPolicy::Accept => {
                let instance = self.instance(ipcp_id);
                let user = self.find_user_ipcp_by_name(local_app);
                instance.flow_allocate_response(user, port_id, true)
            }
            ArrivalPolicy::Reject => {
                let instance = self.instance(ipcp_id);
                instance.flow_allocate_response(None, port_id, false)
            }
        }
    }

    fn notify_flow_alloc_result(&self, ipcp_id: IpcpId, port_id: PortId, ok: bool) {
        self.alloc_results.lock().unwrap().push((ipcp_id, port_id, ok));
    }

    fn notify_flow_dealloc(&self, ipcp_id: IpcpId, _reason: i32, port_id: PortId, remote: bool) {
        self.deallocs.lock().unwrap().push((ipcp_id, port_id, remote));
    }
}

/// Test double for the user IPCP on top of a shim flow.
pub struct TestUser {
    pub name: String,
    pub received: Mutex<Vec<Sdu>>,
    pub enable_writes: AtomicU32,
    pub nm1_events: Mutex<Vec<bool>>,
}

impl TestUser {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
            enable_writes: AtomicU32::new(0),
            nm1_events: Mutex::new(Vec::new()),
        })
    }

    pub fn wait_received(&self, count: usize, timeout: Duration) -> bool {
        wait_for(timeout, || {
            (self.received.lock().unwrap().len() >= count).then_some(())
        })
        .is_some()
    }
}

impl UserIpcp for TestUser {
    fn flow_binding_ipcp(&self, _port_id: PortId) -> Result<(), ShimError> {
        Ok(())
    }

    fn flow_unbinding_ipcp(&self, _port_id: PortId) {}

    fn du_enqueue(&self, _port_id: PortId, sdu: Sdu) -> Result<(), ShimError> {
        self.received.lock().unwrap().push(sdu);
        Ok(())
    }

    fn enable_write(&self, _port_id: PortId) {
        self.enable_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn ipcp_name(&self) -> Option<AppName> {
        None
    }

    fn nm1_flow_state_change(&self, _port_id: PortId, up: bool) {
        self.nm1_events.lock().unwrap().push(up);
    }
}

/// Polls `probe` until it yields a value or the timeout elapses.
pub fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
