// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

use aris::{
    AppName, CliArgs, Controller, DifConfig, EthShim, FactoryRegistry, FlowSpec, IpcpId, PortId,
    RunMode, Sdu, ShimError, ShimInstance, TcpUdpShim, UserIpcp, register_eth_factories,
};
use aris::loopback::Segment;
use aris::name::Gha;
use clap::Parser;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Controller used by the demo walkthrough: sequential port-ids,
/// auto-accepted flow arrivals, an application directory of demo
/// users.
struct DemoController {
    next_port: AtomicU32,
    instances: Mutex<HashMap<IpcpId, Arc<dyn ShimInstance>>>,
    users: Mutex<HashMap<String, Arc<DemoUser>>>,
    alloc_results: Mutex<Vec<(PortId, bool)>>,
}

impl DemoController {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU32::new(1),
            instances: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            alloc_results: Mutex::new(Vec::new()),
        })
    }

    fn add_instance(&self, instance: Arc<dyn ShimInstance>) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.ipcp_id(), instance);
    }

    fn add_user(&self, name: &str) -> Arc<DemoUser> {
        let user = Arc::new(DemoUser {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
        });
        self.users
            .lock()
            .unwrap()
            .insert(name.to_string(), user.clone());
        user
    }

    fn wait_alloc_result(&self, port_id: PortId, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(&(_, ok)) = self
                .alloc_results
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| *p == port_id)
            {
                return Some(ok);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }
}

impl Controller for DemoController {
    fn reserve_port_id(&self, _ipcp_id: IpcpId) -> Result<PortId, ShimError> {
        Ok(self.next_port.fetch_add(1, Ordering::Relaxed))
    }

    fn release_port_id(&self, _port_id: PortId) {}

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
        dif_name: &AppName,
        local_app: &AppName,
        remote_app: &AppName,
        _fspec: &FlowSpec,
    ) -> Result<(), ShimError> {
        log::info!(
            "flow arrived on ipcp {ipcp_id}: port {port_id}, dif {dif_name}, {remote_app} -> {local_app}"
        );
        let instance = self
            .instances
            .lock()
            .unwrap()
            .get(&ipcp_id)
            .cloned()
            .ok_or_else(|| ShimError::NotFound(format!("instance {ipcp_id}")))?;
        let user = self.find_user_ipcp_by_name(local_app);
        instance.flow_allocate_response(user, port_id, true)
    }

    fn notify_flow_alloc_result(&self, ipcp_id: IpcpId, port_id: PortId, ok: bool) {
        log::info!("flow alloc result on ipcp {ipcp_id}: port {port_id}, ok={ok}");
        self.alloc_results.lock().unwrap().push((port_id, ok));
    }

    fn notify_flow_dealloc(&self, ipcp_id: IpcpId, reason: i32, port_id: PortId, remote: bool) {
        log::info!(
            "flow dealloc on ipcp {ipcp_id}: port {port_id}, reason={reason}, remote={remote}"
        );
    }
}

/// Demo endpoint: collects delivered SDUs.
struct DemoUser {
    name: String,
    received: Mutex<Vec<Sdu>>,
}

impl UserIpcp for DemoUser {
    fn flow_binding_ipcp(&self, port_id: PortId) -> Result<(), ShimError> {
        log::debug!("{}: bound to port {port_id}", self.name);
        Ok(())
    }

    fn flow_unbinding_ipcp(&self, port_id: PortId) {
        log::debug!("{}: unbound from port {port_id}", self.name);
    }

    fn du_enqueue(&self, port_id: PortId, sdu: Sdu) -> Result<(), ShimError> {
        log::info!("{}: received {} bytes on port {port_id}", self.name, sdu.len());
        self.received.lock().unwrap().push(sdu);
        Ok(())
    }

    fn enable_write(&self, port_id: PortId) {
        log::debug!("{}: write enabled on port {port_id}", self.name);
    }

    fn ipcp_name(&self) -> Option<AppName> {
        None
    }

    fn nm1_flow_state_change(&self, port_id: PortId, up: bool) {
        log::info!("{}: N-1 flow on port {port_id} is {}", self.name, if up { "up" } else { "down" });
    }
}

/// Walks an Ethernet allocation over an in-memory segment: register,
/// allocate, deliver one SDU.
fn run_demo() -> Result<(), String> {
    log::info!("running Ethernet shim demo over an in-memory segment");

    let controller = DemoController::new();
    let segment = Segment::new();
    segment.add_device("ethA", Gha::new([0x02, 0, 0, 0, 0, 0x0A]), 1500);
    segment.add_device("ethB", Gha::new([0x02, 0, 0, 0, 0, 0x0B]), 1500);

    let family = EthShim::new(controller.clone(), segment.clone());
    segment.attach(&family);

    let registry = FactoryRegistry::new();
    register_eth_factories(&registry, &family).map_err(String::from)?;
    let handle = registry.find("shim-eth").ok_or("factory not registered")?;

    let a = registry
        .create(handle, &AppName::from_process_name("demo.eth.A"), 1, 0)
        .map_err(String::from)?;
    let b = registry
        .create(handle, &AppName::from_process_name("demo.eth.B"), 2, 0)
        .map_err(String::from)?;
    controller.add_instance(a.clone());
    controller.add_instance(b.clone());

    let dif = AppName::from_process_name("eth-demo-dif");
    a.assign_to_dif(&dif, &DifConfig::from_entries(&[("interface-name", "ethA")]))
        .map_err(String::from)?;
    b.assign_to_dif(&dif, &DifConfig::from_entries(&[("interface-name", "ethB")]))
        .map_err(String::from)?;

    let alpha_name = AppName::from_process_name("alpha");
    let beta_name = AppName::from_process_name("beta");
    let alpha = controller.add_user("alpha");
    let beta = controller.add_user("beta");
    a.application_register(&alpha_name, None).map_err(String::from)?;
    b.application_register(&beta_name, None).map_err(String::from)?;

    let port_id = controller.reserve_port_id(1).map_err(String::from)?;
    a.flow_allocate_request(
        alpha.clone(),
        &alpha_name,
        &beta_name,
        &FlowSpec::default(),
        port_id,
    )
    .map_err(String::from)?;

    match controller.wait_alloc_result(port_id, Duration::from_secs(2)) {
        Some(true) => log::info!("flow on port {port_id} allocated"),
        Some(false) => return Err("flow allocation refused".to_string()),
        None => return Err("flow allocation timed out".to_string()),
    }

    a.du_write(port_id, vec![1, 2, 3], false).map_err(String::from)?;

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if !beta.received.lock().unwrap().is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            return Err("SDU was not delivered".to_string());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    log::info!("demo complete: beta received {:?}", beta.received.lock().unwrap());
    Ok(())
}

/// Serves the shims declared in the configuration file until ctrl-c.
async fn run_serve(args: &CliArgs) -> Result<(), String> {
    let config_path = args
        .config
        .as_ref()
        .ok_or("serve mode requires --config")?;
    let config = aris::load_config(config_path).map_err(String::from)?;

    let controller = Arc::new(aris::LoggingController::new());
    let registry = FactoryRegistry::new();
    let tcp_udp = TcpUdpShim::new(controller);
    registry
        .register("shim-tcp-udp", tcp_udp.clone())
        .map_err(String::from)?;

    let mut instances: Vec<Arc<dyn ShimInstance>> = Vec::new();
    for shim in &config.shims {
        let Some(handle) = registry.find(&shim.shim_type) else {
            log::warn!(
                "shim '{}' needs factory '{}' which is not available in serve mode",
                shim.name,
                shim.shim_type
            );
            continue;
        };
        let instance = registry
            .create(handle, &AppName::from_process_name(&shim.name), shim.ipcp_id, 0)
            .map_err(String::from)?;
        instance
            .assign_to_dif(&AppName::from_process_name(&shim.dif), &shim.dif_config())
            .map_err(String::from)?;
        log::info!("shim '{}' assigned to DIF '{}'", shim.name, shim.dif);
        instances.push(instance);
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    log::info!("serving {} shim instance(s), ctrl-c to stop", instances.len());
    token.cancelled().await;

    for instance in &instances {
        match serde_json::to_string_pretty(&instance.snapshot()) {
            Ok(json) => log::info!("final state of ipcp {}:\n{json}", instance.ipcp_id()),
            Err(e) => log::warn!("cannot serialize snapshot: {e}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = CliArgs::parse();
    let level = args
        .log_level
        .parse::<log::Level>()
        .map_err(|e| format!("invalid log level: {e}"))?;
    simple_logger::init_with_level(level).map_err(|e| e.to_string())?;

    match args.mode {
        RunMode::Demo => run_demo(),
        RunMode::Serve => run_serve(&args).await,
    }
}
