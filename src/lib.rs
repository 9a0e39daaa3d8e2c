// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Shim IPC Processes for the ARI RINA implementation.
//!
//! This crate implements the family of "shim" IPC Processes that
//! multiplex RINA application flows onto non-RINA lower layers:
//! Ethernet frames, UDP datagrams, TCP byte streams, and a hypervisor
//! VMPI channel set. Each shim turns its connectionless transport into
//! named flows with port-ids, allocation/deallocation signalling,
//! address resolution, and per-flow queueing while an allocation is in
//! flight.
//!
//! The upstream controller (the IPC manager) instantiates shims
//! through the [`factory::FactoryRegistry`] and drives them through
//! the [`ipcp::ShimInstance`] operations; the shims call back through
//! the [`controller::Controller`] capability set handed to each family
//! at construction.

// Public module declarations
pub mod actors;
pub mod arp;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod eth;
pub mod factory;
pub mod flow;
pub mod hv;
pub mod ipcp;
pub mod loopback;
pub mod name;
pub mod tcp_udp;

// Re-export commonly used types
pub use actors::{ActorHandle, InstanceActor, InstanceHandle, InstanceMessage};
pub use arp::{ArpHandle, Resolver};
pub use config::{CliArgs, DaemonConfig, RunMode, ShimSection, load_config};
pub use controller::{Controller, LoggingController, UserIpcp};
pub use error::{CodecError, ResolverError, ShimError};
pub use eth::{DeviceResolver, EthDevice, EthShim, FrameType, VlanMode, register_eth_factories};
pub use factory::{FactoryHandle, FactoryRegistry, ShimFactory};
pub use flow::{FlowState, Sdu, SduQueue};
pub use hv::{HvShim, VmpiCallbacks, VmpiDevice, VmpiProvider};
pub use ipcp::{
    ConfigEntry, DifConfig, FlowSpec, InstanceSnapshot, IpcpId, PortId, ShimInstance,
};
pub use name::{AppName, Gha, Gpa};
pub use tcp_udp::TcpUdpShim;
