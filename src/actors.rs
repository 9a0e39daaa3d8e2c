// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Actor facade over shim instances
//!
//! Wraps a shim instance in a Tokio actor so async callers (the
//! daemon, tests) drive it through a message channel instead of
//! holding the instance directly.

use crate::controller::UserIpcp;
use crate::flow::Sdu;
use crate::ipcp::{DifConfig, FlowSpec, InstanceSnapshot, PortId, ShimInstance};
use crate::name::AppName;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages for a shim-instance actor
pub enum InstanceMessage {
    FlowAllocateRequest {
        user_ipcp: Arc<dyn UserIpcp>,
        source: AppName,
        dest: AppName,
        fspec: FlowSpec,
        port_id: PortId,
        response: mpsc::Sender<Result<(), String>>,
    },
    FlowAllocateResponse {
        user_ipcp: Option<Arc<dyn UserIpcp>>,
        port_id: PortId,
        accepted: bool,
        response: mpsc::Sender<Result<(), String>>,
    },
    FlowDeallocate {
        port_id: PortId,
        response: mpsc::Sender<Result<(), String>>,
    },
    ApplicationRegister {
        name: AppName,
        daf_name: Option<AppName>,
        response: mpsc::Sender<Result<(), String>>,
    },
    ApplicationUnregister {
        name: AppName,
        response: mpsc::Sender<Result<(), String>>,
    },
    AssignToDif {
        dif_name: AppName,
        config: DifConfig,
        response: mpsc::Sender<Result<(), String>>,
    },
    DuWrite {
        port_id: PortId,
        sdu: Sdu,
        blocking: bool,
        response: mpsc::Sender<Result<(), String>>,
    },
    Snapshot {
        response: mpsc::Sender<InstanceSnapshot>,
    },
}

/// Instance Actor - drives one shim IPCP instance
pub struct InstanceActor {
    instance: Arc<dyn ShimInstance>,
    receiver: mpsc::Receiver<InstanceMessage>,
}

impl InstanceActor {
    pub fn new(instance: Arc<dyn ShimInstance>, receiver: mpsc::Receiver<InstanceMessage>) -> Self {
        Self { instance, receiver }
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                InstanceMessage::FlowAllocateRequest {
                    user_ipcp,
                    source,
                    dest,
                    fspec,
                    port_id,
                    response,
                } => {
                    let result = self
                        .instance
                        .flow_allocate_request(user_ipcp, &source, &dest, &fspec, port_id)
                        .map_err(String::from);
                    let _ = response.send(result).await;
                }
                InstanceMessage::FlowAllocateResponse {
                    user_ipcp,
                    port_id,
                    accepted,
                    response,
                } => {
                    let result = self
                        .instance
                        .flow_allocate_response(user_ipcp, port_id, accepted)
                        .map_err(String::from);
                    let _ = response.send(result).await;
                }
                InstanceMessage::FlowDeallocate { port_id, response } => {
                    let result = self
                        .instance
                        .flow_deallocate(port_id)
                        .map_err(String::from);
                    let _ = response.send(result).await;
                }
                InstanceMessage::ApplicationRegister {
                    name,
                    daf_name,
                    response,
                } => {
                    let result = self
                        .instance
                        .application_register(&name, daf_name.as_ref())
                        .map_err(String::from);
                    let _ = response.send(result).await;
                }
                InstanceMessage::ApplicationUnregister { name, response } => {
                    let result = self
                        .instance
                        .application_unregister(&name)
                        .map_err(String::from);
                    let _ = response.send(result).await;
                }
                InstanceMessage::AssignToDif {
                    dif_name,
                    config,
                    response,
                } => {
                    let result = self
                        .instance
                        .assign_to_dif(&dif_name, &config)
                        .map_err(String::from);
                    let _ = response.send(result).await;
                }
                InstanceMessage::DuWrite {
                    port_id,
                    sdu,
                    blocking,
                    response,
                } => {
                    let result = self
                        .instance
                        .du_write(port_id, sdu, blocking)
                        .map_err(String::from);
                    let _ = response.send(result).await;
                }
                InstanceMessage::Snapshot { response } => {
                    let _ = response.send(self.instance.snapshot()).await;
                }
            }
        }
    }
}

/// Actor handle for sending messages to an actor
pub struct ActorHandle<T> {
    sender: mpsc::Sender<T>,
}

impl<T> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> ActorHandle<T> {
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, msg: T) -> Result<(), String> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| "Failed to send message".to_string())
    }
}

pub type InstanceHandle = ActorHandle<InstanceMessage>;

/// Spawns an actor around `instance` and returns its handle.
pub fn spawn_instance_actor(instance: Arc<dyn ShimInstance>) -> InstanceHandle {
    let (tx, rx) = mpsc::channel(32);
    let actor = InstanceActor::new(instance, rx);
    tokio::spawn(async move {
        actor.run().await;
    });
    InstanceHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::LoggingController;
    use crate::hv::HvShim;
    use crate::loopback::{LoopVmpi, StaticVmpiProvider};
    use crate::factory::ShimFactory;
    use crate::ipcp::DifConfig;

    #[tokio::test]
    async fn test_actor_assign_and_snapshot() {
        let provider = StaticVmpiProvider::new();
        let (a, _b) = LoopVmpi::pair();
        provider.insert(0, a);

        let family = HvShim::new(Arc::new(LoggingController::new()), provider);
        let instance = family
            .create(&AppName::from_process_name("hv.a"), 7, 0)
            .unwrap();
        let handle = spawn_instance_actor(instance);

        let (tx, mut rx) = mpsc::channel(1);
        handle
            .send(InstanceMessage::AssignToDif {
                dif_name: AppName::from_process_name("hv-dif"),
                config: DifConfig::from_entries(&[("vmpi-id", "0")]),
                response: tx,
            })
            .await
            .unwrap();
        rx.recv().await.unwrap().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        handle
            .send(InstanceMessage::Snapshot { response: tx })
            .await
            .unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.ipcp_id, 7);
        assert_eq!(snapshot.dif_name.as_deref(), Some("hv-dif///"));
    }
}
