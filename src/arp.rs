// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! ARP-like address resolver for the Ethernet shim
//!
//! Maps generic protocol addresses (GPAs, derived from application
//! names) to generic hardware addresses (GHAs, MAC addresses) with a
//! request/reply exchange carried in its own EtherType. Registrations
//! answer requests for local names; resolutions are non-blocking, with
//! the completion callback invoked on the resolver worker thread when
//! a reply arrives or when the query times out.

use crate::dispatch::WorkQueue;
use crate::error::{ResolverError, ShimError};
use crate::eth::{ETH_P_RINA, EthDevice, build_frame};
use crate::name::{Gha, Gpa};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;
const HTYPE_ETHERNET: u16 = 1;
const HLEN_ETHERNET: u8 = 6;

/// How long a resolution may stay pending before it fails.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(4);

/// Completion callback: `Some((gpa, gha))` on success, `None` on
/// timeout.
pub type ResolveCallback = Box<dyn FnOnce(Option<(Gpa, Gha)>) + Send>;

/// Identifies one registration made with [`Resolver::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpHandle(u64);

struct Registration {
    id: u64,
    dev: Arc<dyn EthDevice>,
    gpa: Gpa,
    gha: Gha,
}

struct PendingQuery {
    dev_name: String,
    target: Gpa,
    deadline: Instant,
    callback: ResolveCallback,
}

struct CacheEntry {
    dev_name: String,
    gpa: Gpa,
    gha: Gha,
}

#[derive(Default)]
struct ResolverState {
    registrations: Vec<Registration>,
    pending: Vec<PendingQuery>,
    cache: Vec<CacheEntry>,
    next_id: u64,
}

type Completion = (ResolveCallback, Option<(Gpa, Gha)>);

/// The resolver proper. One instance serves a whole shim family; each
/// application registration gets its own handle.
pub struct Resolver {
    state: Arc<Mutex<ResolverState>>,
    completions: WorkQueue<Completion>,
    timeout: Duration,
    ticker_stop: mpsc::Sender<()>,
    ticker: Option<JoinHandle<()>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_RESOLVE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let state = Arc::new(Mutex::new(ResolverState::default()));
        let completions = WorkQueue::spawn("rinarp-completions", |(cb, result): Completion| {
            cb(result);
        });

        let (ticker_stop, stop_rx) = mpsc::channel::<()>();
        let ticker_state = state.clone();
        let tick = timeout.min(Duration::from_millis(500)).max(Duration::from_millis(10));
        let ticker = std::thread::Builder::new()
            .name("rinarp-timeouts".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    let now = Instant::now();
                    let mut expired = Vec::new();
                    {
                        let mut state = ticker_state.lock().unwrap();
                        let mut i = 0;
                        while i < state.pending.len() {
                            if state.pending[i].deadline <= now {
                                expired.push(state.pending.swap_remove(i));
                            } else {
                                i += 1;
                            }
                        }
                    }
                    for query in expired {
                        log::debug!("resolution of {} timed out", query.target);
                        (query.callback)(None);
                    }
                }
            })
            .expect("failed to spawn resolver ticker");

        Self {
            state,
            completions,
            timeout,
            ticker_stop,
            ticker: Some(ticker),
        }
    }

    /// Registers a local (GPA, GHA) binding on `dev`; requests for the
    /// GPA arriving on the device will be answered with the GHA.
    pub fn add(&self, dev: Arc<dyn EthDevice>, gpa: Gpa, gha: Gha) -> Result<ArpHandle, ShimError> {
        if !gpa.is_ok() {
            return Err(ResolverError::BadAddress.into());
        }
        if gpa.len() > u8::MAX as usize {
            return Err(ResolverError::BadAddress.into());
        }

        let mut state = self.state.lock().unwrap();
        if state
            .registrations
            .iter()
            .any(|r| r.dev.name() == dev.name() && r.gpa == gpa)
        {
            return Err(ShimError::NameConflict(gpa.to_string()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.registrations.push(Registration { id, dev, gpa, gha });
        Ok(ArpHandle(id))
    }

    /// Removes a registration and silently drops its pending queries.
    pub fn remove(&self, handle: ArpHandle) -> Result<(), ShimError> {
        let mut state = self.state.lock().unwrap();
        let pos = state
            .registrations
            .iter()
            .position(|r| r.id == handle.0)
            .ok_or(ResolverError::UnknownHandle(handle.0))?;
        let reg = state.registrations.swap_remove(pos);
        let dev_name = reg.dev.name().to_string();
        state.pending.retain(|q| q.dev_name != dev_name);
        Ok(())
    }

    /// Starts resolving `target` through the registration behind
    /// `handle`. Non-blocking; `callback` runs later on the resolver
    /// worker.
    pub fn resolve(
        &self,
        handle: ArpHandle,
        target: &Gpa,
        callback: ResolveCallback,
    ) -> Result<(), ShimError> {
        if !target.is_ok() || target.len() > u8::MAX as usize {
            return Err(ResolverError::BadAddress.into());
        }

        let mut state = self.state.lock().unwrap();
        let reg = state
            .registrations
            .iter()
            .find(|r| r.id == handle.0)
            .ok_or(ResolverError::UnknownHandle(handle.0))?;

        let dev = reg.dev.clone();
        let spa = reg.gpa.clone();
        let sha = reg.gha;

        if let Some(entry) = state
            .cache
            .iter()
            .find(|e| e.dev_name == dev.name() && e.gpa == *target)
        {
            let result = (entry.gpa.clone(), entry.gha);
            self.completions.post((callback, Some(result)));
            return Ok(());
        }

        let request = pack_packet(OPER_REQUEST, sha, &spa, Gha::BROADCAST, target);
        let frame = build_frame(Gha::BROADCAST, sha, crate::eth::ETH_P_RINARP, &request);
        dev.transmit(frame)
            .map_err(|e| ShimError::Transient(format!("resolver request tx failed: {e}")))?;

        state.pending.push(PendingQuery {
            dev_name: dev.name().to_string(),
            target: target.clone(),
            deadline: Instant::now() + self.timeout,
            callback,
        });
        Ok(())
    }

    /// Cancels any pending resolution of `target` on the handle's
    /// device; the callbacks are dropped without being invoked.
    pub fn cancel(&self, handle: ArpHandle, target: &Gpa) {
        let mut state = self.state.lock().unwrap();
        let Some(dev_name) = state
            .registrations
            .iter()
            .find(|r| r.id == handle.0)
            .map(|r| r.dev.name().to_string())
        else {
            return;
        };
        state
            .pending
            .retain(|q| !(q.dev_name == dev_name && q.target == *target));
    }

    /// Reverse lookup: the GPA last seen for `gha` on the handle's
    /// device.
    pub fn find_gpa(&self, handle: ArpHandle, gha: &Gha) -> Option<Gpa> {
        let state = self.state.lock().unwrap();
        let dev_name = state
            .registrations
            .iter()
            .find(|r| r.id == handle.0)
            .map(|r| r.dev.name().to_string())?;
        state
            .cache
            .iter()
            .find(|e| e.dev_name == dev_name && e.gha == *gha)
            .map(|e| e.gpa.clone())
    }

    /// Feeds one resolver packet received on `dev` (Ethernet payload,
    /// header already stripped). Answers requests for registered GPAs
    /// and completes pending queries on replies.
    pub fn handle_packet(&self, dev: &Arc<dyn EthDevice>, payload: &[u8]) {
        let packet = match parse_packet(payload) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("dropping malformed resolver packet on {}: {e}", dev.name());
                return;
            }
        };

        let mut completed = Vec::new();
        let mut reply_frame = None;
        {
            let mut state = self.state.lock().unwrap();
            learn(&mut state, dev.name(), &packet.spa, packet.sha);

            match packet.oper {
                OPER_REQUEST => {
                    if let Some(reg) = state
                        .registrations
                        .iter()
                        .find(|r| r.dev.name() == dev.name() && r.gpa == packet.tpa)
                    {
                        let reply =
                            pack_packet(OPER_REPLY, reg.gha, &reg.gpa, packet.sha, &packet.spa);
                        reply_frame = Some((
                            reg.dev.clone(),
                            build_frame(packet.sha, reg.gha, crate::eth::ETH_P_RINARP, &reply),
                        ));
                    }
                }
                OPER_REPLY => {
                    let mut i = 0;
                    while i < state.pending.len() {
                        if state.pending[i].dev_name == dev.name()
                            && state.pending[i].target == packet.spa
                        {
                            completed.push(state.pending.swap_remove(i));
                        } else {
                            i += 1;
                        }
                    }
                }
                other => {
                    log::debug!("ignoring resolver packet with operation {other}");
                }
            }
        }

        if let Some((dev, frame)) = reply_frame {
            if let Err(e) = dev.transmit(frame) {
                log::warn!("resolver reply tx failed on {}: {e}", dev.name());
            }
        }
        for query in completed {
            self.completions
                .post((query.callback, Some((packet.spa.clone(), packet.sha))));
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let _ = self.ticker_stop.send(());
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

fn learn(state: &mut ResolverState, dev_name: &str, gpa: &Gpa, gha: Gha) {
    if !gpa.is_ok() {
        return;
    }
    if let Some(entry) = state
        .cache
        .iter_mut()
        .find(|e| e.dev_name == dev_name && e.gpa == *gpa)
    {
        entry.gha = gha;
        return;
    }
    state.cache.push(CacheEntry {
        dev_name: dev_name.to_string(),
        gpa: gpa.clone(),
        gha,
    });
}

struct ArpPacket {
    oper: u16,
    sha: Gha,
    spa: Gpa,
    #[allow(dead_code)]
    tha: Gha,
    tpa: Gpa,
}

fn pack_packet(oper: u16, sha: Gha, spa: &Gpa, tha: Gha, tpa: &Gpa) -> Vec<u8> {
    let plen = spa.len().max(tpa.len()) as u8;
    let mut out = Vec::with_capacity(8 + 2 * (6 + plen as usize));
    out.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    out.extend_from_slice(&ETH_P_RINA.to_be_bytes());
    out.push(HLEN_ETHERNET);
    out.push(plen);
    out.extend_from_slice(&oper.to_be_bytes());
    out.extend_from_slice(&sha.octets());
    out.extend_from_slice(&spa.grown_to(plen as usize));
    out.extend_from_slice(&tha.octets());
    out.extend_from_slice(&tpa.grown_to(plen as usize));
    out
}

fn parse_packet(payload: &[u8]) -> Result<ArpPacket, ResolverError> {
    if payload.len() < 8 {
        return Err(ResolverError::MalformedPacket("short header".to_string()));
    }
    let htype = u16::from_be_bytes([payload[0], payload[1]]);
    let ptype = u16::from_be_bytes([payload[2], payload[3]]);
    let hlen = payload[4];
    let plen = payload[5] as usize;
    let oper = u16::from_be_bytes([payload[6], payload[7]]);

    if htype != HTYPE_ETHERNET || hlen != HLEN_ETHERNET {
        return Err(ResolverError::MalformedPacket(format!(
            "hardware type {htype}/{hlen}"
        )));
    }
    if ptype != ETH_P_RINA {
        return Err(ResolverError::MalformedPacket(format!(
            "protocol type {ptype:#06x}"
        )));
    }

    let needed = 8 + 2 * (6 + plen);
    if payload.len() < needed {
        return Err(ResolverError::MalformedPacket("short body".to_string()));
    }

    let bad = |_| ResolverError::MalformedPacket("hardware address".to_string());
    let mut at = 8;
    let sha = Gha::from_slice(&payload[at..at + 6]).map_err(bad)?;
    at += 6;
    let spa = Gpa::shrunk(&payload[at..at + plen]);
    at += plen;
    let tha = Gha::from_slice(&payload[at..at + 6]).map_err(bad)?;
    at += 6;
    let tpa = Gpa::shrunk(&payload[at..at + plen]);

    Ok(ArpPacket {
        oper,
        sha,
        spa,
        tha,
        tpa,
    })
}
