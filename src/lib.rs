#![deny(missing_docs)]

//! Capture bridge from a JACK audio server into a host application.
//!
//! Each source opens its own server client, registers up to
//! [`MAX_CHANNELS`] input ports, connects them to user-chosen external ports,
//! and hands the captured audio to the host through lock-free
//! [`HandoffBuffer`](ring::HandoffBuffer)s. The realtime capture callback
//! never blocks or allocates; everything else (opening, binding, rebuilding,
//! tearing down) runs on host threads under the
//! [`ClientManager`](lifecycle::ClientManager).

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

pub mod capture;
pub mod config;
/// Status API and developer console.
pub mod control;
pub mod lifecycle;
pub mod ports;
pub mod probe;
pub mod resample;
pub mod ring;
pub mod server;
pub mod source;


pub use config::{BridgeOptions, RuntimeConfig, Settings};
pub use lifecycle::{CaptureOutput, ClientManager, LifecycleState, ServerEvent};
pub use ring::{HandoffBuffer, PullReport};
pub use source::{JackInput, SourceContext, SourceInfo};

/// Upper bound on channels per source.
pub const MAX_CHANNELS: usize = 8;

const LOG_CAPACITY: usize = 256;

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static TRACING_INIT: Once = Once::new();
static SOURCES: Lazy<Mutex<BTreeMap<u64, Weak<ClientManager>>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));
static SOURCE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Errors surfaced by the bridge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// No server could be reached (not running, auto-start disabled, or no
    /// answer in time).
    #[error("audio server unavailable: {reason}")]
    ServerUnavailable {
        /// What the server library reported.
        reason: String,
    },
    /// A requested external port does not exist or cannot be connected.
    #[error("port {name} unavailable")]
    PortUnavailable {
        /// Full name of the port.
        name: String,
    },
    /// The server went away while the client was active.
    #[error("audio server shut down: {reason}")]
    ServerShutdown {
        /// Reason given by the server library.
        reason: String,
    },
    /// The server refused to register one of our ports.
    #[error("failed to register port {name}: {reason}")]
    PortRegistration {
        /// Short name of the port.
        name: String,
        /// What the server library reported.
        reason: String,
    },
    /// Channel count outside `1..=MAX_CHANNELS`.
    #[error("invalid channel count {0}")]
    InvalidChannelCount(usize),
    /// Slot index beyond the configured channel count.
    #[error("channel slot {slot} out of range (channels: {channels})")]
    InvalidSlot {
        /// Requested slot.
        slot: usize,
        /// Configured channel count.
        channels: usize,
    },
    /// Any other server library failure.
    #[error("audio server error: {0}")]
    Backend(String),
}

/// Install the fmt subscriber. Safe to call repeatedly; a subscriber
/// installed by the embedding application wins.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub(crate) fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// Oldest unread line of the event log.
pub fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}

/// Snapshot of one channel slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelStatus {
    /// Slot index (0-based).
    pub index: usize,
    /// Full name of our input port.
    pub port_name: Option<String>,
    /// External ports currently feeding the slot.
    pub connections: Vec<String>,
    /// Ring fill ratio (0..=1).
    pub buffer_fill: f32,
    /// Pushes that had to drop old frames.
    pub overruns: u64,
    /// Frames dropped by overruns.
    pub dropped_frames: u64,
    /// Pulls that were short of data.
    pub underruns: u64,
    /// Frames padded with silence.
    pub padded_frames: u64,
}

/// Snapshot of one source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceStatus {
    /// Process-local source id.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Backend name.
    pub backend: &'static str,
    /// Server client name while a client is open.
    pub client_name: Option<String>,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Whether the source may launch a server.
    pub start_server: bool,
    /// Server sample rate (0 without a client).
    pub sample_rate: u32,
    /// Server block size (0 without a client).
    pub block_frames: u32,
    /// Rate the host pulls at.
    pub host_sample_rate: u32,
    /// Per-channel ring capacity.
    pub capacity_frames: usize,
    /// Capture cycles run by the current client.
    pub cycles: u64,
    /// Capture cycles that degraded to silence.
    pub faults: u64,
    /// Most recent activation or server error.
    pub last_error: Option<String>,
    /// Per-channel details.
    pub channels: Vec<ChannelStatus>,
}

pub(crate) fn register_source(manager: &Arc<ClientManager>) -> u64 {
    let id = SOURCE_SEQ.fetch_add(1, Ordering::Relaxed);
    SOURCES.lock().insert(id, Arc::downgrade(manager));
    id
}

pub(crate) fn unregister_source(id: u64) {
    SOURCES.lock().remove(&id);
}

/// Run `f` against a live source.
pub fn with_source<R>(id: u64, f: impl FnOnce(&ClientManager) -> R) -> Option<R> {
    let manager = SOURCES.lock().get(&id)?.upgrade()?;
    Some(f(&manager))
}

/// Status of every live source, ordered by id.
pub fn source_statuses() -> Vec<SourceStatus> {
    let live: Vec<(u64, Arc<ClientManager>)> = {
        let mut guard = SOURCES.lock();
        guard.retain(|_, manager| manager.strong_count() > 0);
        guard
            .iter()
            .filter_map(|(id, manager)| manager.upgrade().map(|m| (*id, m)))
            .collect()
    };
    live.iter().map(|(id, manager)| manager.status(*id)).collect()
}
