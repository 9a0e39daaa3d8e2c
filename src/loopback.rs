// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! In-memory lower layers
//!
//! Loopback stand-ins for the transports the shims normally sit on: an
//! Ethernet segment delivering frames between in-process devices, and
//! a cross-linked VMPI channel pair. They drive the engines end-to-end
//! in the demo daemon and the integration tests without touching real
//! hardware. Delivery is asynchronous through a single worker, like a
//! real lower layer interrupting at its own pace.

use crate::dispatch::WorkQueue;
use crate::error::ShimError;
use crate::eth::{DeviceResolver, EthDevice, EthShim, FrameType, TxError, parse_frame};
use crate::hv::{VMPI_NUM_CHANNELS, VmpiCallbacks, VmpiDevice};
use crate::name::Gha;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// One device on a [`Segment`].
pub struct SegDevice {
    name: String,
    mac: Gha,
    mtu: usize,
    up: AtomicBool,
    busy: AtomicBool,
    segment: Weak<SegmentInner>,
}

impl SegDevice {
    /// Simulates transmit-queue congestion; while set, `transmit`
    /// refuses with [`TxError::Busy`].
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl EthDevice for SegDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn hw_addr(&self) -> Gha {
        self.mac
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn transmit(&self, frame: Vec<u8>) -> Result<(), TxError> {
        if !self.is_up() {
            return Err(TxError::Down);
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(TxError::Busy);
        }
        let Some(segment) = self.segment.upgrade() else {
            return Err(TxError::Down);
        };
        segment.queue.post(SegItem::Frame {
            src: self.name.clone(),
            frame,
        });
        Ok(())
    }

    fn vlan_info(&self) -> Option<(String, u16)> {
        // Loopback devices are plain physical interfaces.
        None
    }
}

struct SegmentState {
    devices: Vec<Arc<SegDevice>>,
    shims: Vec<Weak<EthShim>>,
}

enum SegItem {
    Frame { src: String, frame: Vec<u8> },
    Flush(std::sync::mpsc::Sender<()>),
}

struct SegmentInner {
    state: Mutex<SegmentState>,
    queue: WorkQueue<SegItem>,
}

impl SegmentInner {
    fn deliver(&self, src_dev: &str, frame: Vec<u8>) {
        let (devices, shims) = {
            let state = self.state.lock().unwrap();
            (state.devices.clone(), state.shims.clone())
        };
        let Ok((header, _)) = parse_frame(&frame) else {
            return;
        };
        for dev in devices {
            if dev.name() == src_dev || !dev.is_up() {
                continue;
            }
            let frame_type = if header.dest.is_broadcast() {
                FrameType::Broadcast
            } else if header.dest == dev.hw_addr() {
                FrameType::Host
            } else {
                FrameType::OtherHost
            };
            for shim in &shims {
                if let Some(shim) = shim.upgrade() {
                    shim.receive_frame(dev.name(), &frame, frame_type);
                }
            }
        }
    }
}

/// An in-memory Ethernet segment: every frame transmitted by one
/// device is seen by every other device on the segment.
pub struct Segment {
    inner: Arc<SegmentInner>,
}

impl Segment {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new_cyclic(|weak: &Weak<SegmentInner>| {
            let worker = weak.clone();
            SegmentInner {
                state: Mutex::new(SegmentState {
                    devices: Vec::new(),
                    shims: Vec::new(),
                }),
                queue: WorkQueue::spawn("loopback-segment", move |item| match item {
                    SegItem::Frame { src, frame } => {
                        if let Some(segment) = worker.upgrade() {
                            segment.deliver(&src, frame);
                        }
                    }
                    SegItem::Flush(done) => {
                        let _ = done.send(());
                    }
                }),
            }
        });
        Arc::new(Self { inner })
    }

    pub fn add_device(&self, name: &str, mac: Gha, mtu: usize) -> Arc<SegDevice> {
        let device = Arc::new(SegDevice {
            name: name.to_string(),
            mac,
            mtu,
            up: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            segment: Arc::downgrade(&self.inner),
        });
        self.inner.state.lock().unwrap().devices.push(device.clone());
        device
    }

    /// The concrete device handle, for tests that toggle link state.
    pub fn device(&self, name: &str) -> Option<Arc<SegDevice>> {
        let state = self.inner.state.lock().unwrap();
        state.devices.iter().find(|dev| dev.name() == name).cloned()
    }

    /// Attaches a shim family; its instances will see frames for their
    /// bound devices.
    pub fn attach(&self, shim: &Arc<EthShim>) {
        self.inner
            .state
            .lock()
            .unwrap()
            .shims
            .push(Arc::downgrade(shim));
    }

    /// Flushes frames queued before the call; frames generated by
    /// their delivery are not waited for. Returns false on timeout.
    pub fn settle(&self, timeout: std::time::Duration) -> bool {
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.queue.post(SegItem::Flush(tx));
        rx.recv_timeout(timeout).is_ok()
    }
}

impl DeviceResolver for Segment {
    fn get_by_name(&self, name: &str) -> Option<Arc<dyn EthDevice>> {
        let state = self.inner.state.lock().unwrap();
        state
            .devices
            .iter()
            .find(|dev| dev.name() == name)
            .cloned()
            .map(|dev| dev as Arc<dyn EthDevice>)
    }
}

/// One endpoint of an in-memory VMPI channel pair.
pub struct LoopVmpi {
    peer: Mutex<Weak<LoopVmpi>>,
    callbacks: Mutex<Option<Arc<dyn VmpiCallbacks>>>,
    queue: WorkQueue<(u32, Vec<u8>)>,
}

impl LoopVmpi {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<LoopVmpi>| {
            let worker = weak.clone();
            LoopVmpi {
                peer: Mutex::new(Weak::new()),
                callbacks: Mutex::new(None),
                queue: WorkQueue::spawn("loopback-vmpi", move |(channel, data)| {
                    let Some(this) = worker.upgrade() else { return };
                    let callbacks = this.callbacks.lock().unwrap().clone();
                    if let Some(callbacks) = callbacks {
                        callbacks.receive(channel, data);
                    }
                }),
            }
        })
    }

    /// Builds a connected pair: writes on one side arrive as receive
    /// callbacks on the other.
    pub fn pair() -> (Arc<LoopVmpi>, Arc<LoopVmpi>) {
        let a = Self::new();
        let b = Self::new();
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }
}

impl VmpiDevice for LoopVmpi {
    fn num_channels(&self) -> u32 {
        VMPI_NUM_CHANNELS
    }

    fn write(&self, channel: u32, data: Vec<u8>) -> Result<(), ShimError> {
        let peer = self
            .peer
            .lock()
            .unwrap()
            .upgrade()
            .ok_or_else(|| ShimError::Transient("peer endpoint gone".to_string()))?;
        peer.queue.post((channel, data));
        Ok(())
    }

    fn register_callbacks(&self, callbacks: Arc<dyn VmpiCallbacks>) -> Result<(), ShimError> {
        *self.callbacks.lock().unwrap() = Some(callbacks);
        Ok(())
    }
}

/// Maps `vmpi-id` values to endpoints for the hypervisor shim.
#[derive(Default)]
pub struct StaticVmpiProvider {
    endpoints: Mutex<HashMap<u32, Arc<dyn VmpiDevice>>>,
}

impl StaticVmpiProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, vmpi_id: u32, device: Arc<dyn VmpiDevice>) {
        self.endpoints.lock().unwrap().insert(vmpi_id, device);
    }
}

impl crate::hv::VmpiProvider for StaticVmpiProvider {
    fn find_instance(&self, vmpi_id: u32) -> Option<Arc<dyn VmpiDevice>> {
        self.endpoints.lock().unwrap().get(&vmpi_id).cloned()
    }
}
