//! Client lifecycle: open, activate, rebuild and release the server client,
//! and hand captured audio to the host.
//!
//! Lifecycle operations run on host threads and are serialised by one
//! non-realtime mutex. The capture callback never touches it; it only sees
//! the rings, slot flags and sizing atomics built for it at activation.
//! Server notifications arrive on the server's own thread and are forwarded
//! through a channel, then applied by [`ClientManager::poll_events`], which
//! every lifecycle operation runs first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capture::{CaptureCallback, SharedSizing, SlotFlags};
use crate::config::{BridgeOptions, ConfigDiff, ConfigSurface, RuntimeConfig};
use crate::ports::{BindReport, PortRegistry};
use crate::resample::{MAX_RATE, MIN_RATE, StreamResampler};
use crate::ring::{HandoffBuffer, PullReport, capacity_for_blocks};
use crate::server::{
    AudioBackend, ClientRequest, Control, NotificationHandler, PortId, ServerClient,
    open_with_timeout, unique_client_name,
};
use crate::{BridgeError, ChannelStatus, MAX_CHANNELS, SourceStatus, push_log};

/// Largest chunk a host pull is split into before conversion.
const PULL_CHUNK_FRAMES: usize = 1_024;
/// Input frames a channel reader can consume for one chunk at the most
/// extreme supported rate ratio.
const READER_SCRATCH_FRAMES: usize = PULL_CHUNK_FRAMES * (MAX_RATE / MIN_RATE) as usize + 2;

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one source's server connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// No client.
    Inactive = 0,
    /// Opening the client and registering ports.
    Connecting = 1,
    /// Capturing.
    Active = 2,
    /// Releasing the client.
    Deactivating = 3,
    /// Activation failed or the server went away.
    Error = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Active,
            3 => Self::Deactivating,
            4 => Self::Error,
            _ => Self::Inactive,
        }
    }

    /// Lower-case label for logs and the console.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Error => "error",
        }
    }
}

/// Host callback told about every state change. It may run on the server's
/// notification thread and must not call back into the source.
pub type StateListener = Arc<dyn Fn(LifecycleState) + Send + Sync>;

/// Notification forwarded from the server thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// The server exited.
    Shutdown {
        /// Reason given by the server library.
        reason: String,
    },
    /// The server changed sample rate.
    SampleRateChanged(u32),
    /// An external port was renamed.
    PortRenamed {
        /// Previous full name.
        old_name: String,
        /// New full name.
        new_name: String,
    },
    /// An external port went away.
    PortRemoved {
        /// Full name of the vanished port.
        name: String,
    },
}

/// One channel as exposed to the host.
pub struct ChannelSlot {
    /// Slot index (0-based).
    pub index: usize,
    /// Full name of the input port registered for this slot.
    pub port_name: Option<String>,
    /// Ring written by the capture callback.
    pub buffer: Arc<HandoffBuffer>,
}

/// The slot set of one activation.
pub struct ChannelSet {
    generation: u64,
    slots: Vec<ChannelSlot>,
    sizing: Arc<SharedSizing>,
}

struct BridgeShared {
    state: AtomicU8,
    generation: AtomicU64,
    channels: RwLock<Option<Arc<ChannelSet>>>,
    listener: Option<StateListener>,
}

impl BridgeShared {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(
                from = LifecycleState::from_u8(previous).as_str(),
                to = state.as_str(),
                "lifecycle transition"
            );
            if let Some(listener) = &self.listener {
                listener(state);
            }
        }
    }

    fn publish(&self, set: Option<Arc<ChannelSet>>) {
        *self.channels.write() = set;
    }
}

struct EventForwarder {
    generation: u64,
    tx: Sender<(u64, ServerEvent)>,
    sizing: Arc<SharedSizing>,
    shared: Arc<BridgeShared>,
}

impl EventForwarder {
    fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::Acquire) == self.generation
    }

    fn forward(&self, event: ServerEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

impl NotificationHandler for EventForwarder {
    fn shutdown(&mut self, reason: &str) {
        if self.is_current() {
            self.shared.set_state(LifecycleState::Error);
        }
        self.forward(ServerEvent::Shutdown {
            reason: reason.to_string(),
        });
    }

    fn sample_rate(&mut self, rate: u32) -> Control {
        self.sizing.set_sample_rate(rate);
        self.forward(ServerEvent::SampleRateChanged(rate));
        Control::Continue
    }

    fn port_renamed(&mut self, old_name: &str, new_name: &str) {
        self.forward(ServerEvent::PortRenamed {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        });
    }

    fn port_unregistered(&mut self, name: &str) {
        self.forward(ServerEvent::PortRemoved {
            name: name.to_string(),
        });
    }
}

struct ManagerInner {
    client: Option<Box<dyn ServerClient>>,
    ports: Vec<PortId>,
    registry: Option<PortRegistry>,
    sizing: Option<Arc<SharedSizing>>,
    surface: ConfigSurface,
    last_error: Option<String>,
    seen_block: u32,
    generation: u64,
}

/// Owns the server client of one source.
pub struct ClientManager {
    backend: Arc<dyn AudioBackend>,
    options: BridgeOptions,
    shared: Arc<BridgeShared>,
    events_tx: Sender<(u64, ServerEvent)>,
    events_rx: Receiver<(u64, ServerEvent)>,
    inner: Mutex<ManagerInner>,
}

impl ClientManager {
    /// A manager in the `Inactive` state.
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        options: BridgeOptions,
        listener: Option<StateListener>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            backend,
            options,
            shared: Arc::new(BridgeShared {
                state: AtomicU8::new(LifecycleState::Inactive as u8),
                generation: AtomicU64::new(0),
                channels: RwLock::new(None),
                listener,
            }),
            events_tx,
            events_rx,
            inner: Mutex::new(ManagerInner {
                client: None,
                ports: Vec::new(),
                registry: None,
                sizing: None,
                surface: ConfigSurface::new(),
                last_error: None,
                seen_block: 0,
                generation: 0,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Bridge options this manager was built with.
    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Most recent activation or server error.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Configuration currently applied.
    pub fn applied_config(&self) -> Option<RuntimeConfig> {
        self.inner.lock().surface.applied().cloned()
    }

    /// Open a client for `config` and start capturing. An existing client is
    /// released first. On failure every partially acquired resource is
    /// released and the state becomes `Error`.
    pub fn activate(&self, config: RuntimeConfig) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        self.drain_events_locked(&mut inner);
        self.activate_locked(&mut inner, config)
    }

    /// Release the client. Idempotent; a no-op when already inactive.
    pub fn deactivate(&self) {
        let mut inner = self.inner.lock();
        self.drain_events_locked(&mut inner);
        self.deactivate_locked(&mut inner);
    }

    /// Apply a new configuration. Channel count, auto-start or device name
    /// changes rebuild the client; port-list changes rebind the affected
    /// slots. A source that is not active is (re)activated on any change.
    pub fn reconfigure(&self, config: RuntimeConfig) -> Result<ConfigDiff, BridgeError> {
        let mut inner = self.inner.lock();
        self.drain_events_locked(&mut inner);
        let diff = inner.surface.stage(&config);
        if diff.is_empty() {
            return Ok(diff);
        }
        if diff.requires_rebuild() || self.state() != LifecycleState::Active {
            info!(
                channels = diff.channels,
                start_server = diff.start_server,
                device_name = diff.device_name,
                "configuration changed, rebuilding client"
            );
            // Teardown walks the port table of the applied configuration, so
            // it must run before the new configuration is committed.
            self.deactivate_locked(&mut inner);
            self.activate_locked(&mut inner, config)?;
            return Ok(diff);
        }

        let inner = &mut *inner;
        if let (Some(registry), Some(client)) = (inner.registry.as_mut(), inner.client.as_mut()) {
            for &slot in &diff.ports_changed {
                let report = registry.bind(Some(client.as_mut()), slot, config.ports_for(slot))?;
                log_bind(slot, &report);
            }
        }
        inner.surface.commit(config);
        Ok(diff)
    }

    /// Replace the ports feeding `slot`.
    pub fn bind(&self, slot: usize, port_names: &[String]) -> Result<BindReport, BridgeError> {
        let mut guard = self.inner.lock();
        self.drain_events_locked(&mut guard);
        let inner = &mut *guard;
        let mut config = inner
            .surface
            .applied()
            .cloned()
            .ok_or(BridgeError::InvalidSlot { slot, channels: 0 })?;
        if slot >= config.channels {
            return Err(BridgeError::InvalidSlot {
                slot,
                channels: config.channels,
            });
        }
        let report = match inner.registry.as_mut() {
            Some(registry) => {
                let client = inner.client.as_deref_mut();
                registry.bind(client, slot, port_names)?
            }
            None => BindReport::default(),
        };
        log_bind(slot, &report);
        if let Some(list) = config.ports.get_mut(slot) {
            *list = port_names.to_vec();
        }
        inner.surface.commit(config);
        Ok(report)
    }

    /// Disconnect everything feeding `slot`. Unbinding a slot that was never
    /// bound is a no-op.
    pub fn unbind(&self, slot: usize) -> Result<(), BridgeError> {
        let mut guard = self.inner.lock();
        self.drain_events_locked(&mut guard);
        let inner = &mut *guard;
        let Some(mut config) = inner.surface.applied().cloned() else {
            return Ok(());
        };
        if slot >= config.channels {
            return Err(BridgeError::InvalidSlot {
                slot,
                channels: config.channels,
            });
        }
        if let Some(registry) = inner.registry.as_mut() {
            registry.unbind(inner.client.as_deref_mut(), slot)?;
        }
        if let Some(list) = config.ports.get_mut(slot) {
            list.clear();
        }
        inner.surface.commit(config);
        Ok(())
    }

    /// Live connections per slot.
    pub fn active_bindings(&self) -> BTreeMap<usize, Vec<String>> {
        self.inner
            .lock()
            .registry
            .as_ref()
            .map(PortRegistry::active_bindings)
            .unwrap_or_default()
    }

    /// Apply pending server notifications. Returns how many were handled.
    pub fn poll_events(&self) -> usize {
        let mut inner = self.inner.lock();
        self.drain_events_locked(&mut inner)
    }

    /// A new host-side reader over this source's channels.
    pub fn output(&self) -> CaptureOutput {
        CaptureOutput {
            shared: self.shared.clone(),
            host_rate: self.options.host_sample_rate,
            generation: 0,
            readers: (0..MAX_CHANNELS)
                .map(|_| StreamResampler::new(READER_SCRATCH_FRAMES))
                .collect(),
        }
    }

    /// Diagnostics snapshot.
    pub fn status(&self, id: u64) -> SourceStatus {
        let inner = self.inner.lock();
        let set = self.shared.channels.read().clone();
        let bindings = inner
            .registry
            .as_ref()
            .map(PortRegistry::active_bindings)
            .unwrap_or_default();
        let channels = set
            .as_ref()
            .map(|set| {
                set.slots
                    .iter()
                    .map(|slot| {
                        let stats = slot.buffer.stats();
                        ChannelStatus {
                            index: slot.index,
                            port_name: slot.port_name.clone(),
                            connections: bindings.get(&slot.index).cloned().unwrap_or_default(),
                            buffer_fill: slot.buffer.fill_ratio(),
                            overruns: stats.overruns,
                            dropped_frames: stats.dropped_frames,
                            underruns: stats.underruns,
                            padded_frames: stats.padded_frames,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        let applied = inner.surface.applied();
        SourceStatus {
            id,
            name: applied.map(|c| c.device_name.clone()).unwrap_or_default(),
            backend: self.backend.name(),
            client_name: inner.client.as_ref().map(|c| c.client_name().to_string()),
            state: self.state(),
            start_server: applied.is_some_and(|c| c.start_server),
            sample_rate: inner.sizing.as_ref().map_or(0, |s| s.sample_rate()),
            block_frames: inner.sizing.as_ref().map_or(0, |s| s.block_frames()),
            host_sample_rate: self.options.host_sample_rate,
            capacity_frames: inner.sizing.as_ref().map_or(0, |s| s.capacity_frames()),
            cycles: inner.sizing.as_ref().map_or(0, |s| s.cycles()),
            faults: inner.sizing.as_ref().map_or(0, |s| s.faults()),
            last_error: inner.last_error.clone(),
            channels,
        }
    }

    fn activate_locked(
        &self,
        inner: &mut ManagerInner,
        mut config: RuntimeConfig,
    ) -> Result<(), BridgeError> {
        config.fit_ports();
        if inner.client.is_some() || self.state() != LifecycleState::Inactive {
            self.deactivate_locked(inner);
        }
        self.shared.set_state(LifecycleState::Connecting);
        let result = self.try_activate(inner, &config);
        let device_name = config.device_name.clone();
        inner.surface.commit(config);
        match result {
            Ok(()) => {
                inner.last_error = None;
                self.shared.set_state(LifecycleState::Active);
                info!(device = %device_name, "capture active");
                push_log(format!("{device_name}: active"));
                Ok(())
            }
            Err(err) => {
                warn!(device = %device_name, %err, "activation failed");
                push_log(format!("{device_name}: activation failed: {err}"));
                self.teardown_locked(inner);
                inner.last_error = Some(err.to_string());
                self.shared.set_state(LifecycleState::Error);
                Err(err)
            }
        }
    }

    fn try_activate(
        &self,
        inner: &mut ManagerInner,
        config: &RuntimeConfig,
    ) -> Result<(), BridgeError> {
        if config.channels == 0 || config.channels > MAX_CHANNELS {
            return Err(BridgeError::InvalidChannelCount(config.channels));
        }
        let request = ClientRequest {
            name: unique_client_name(
                &config.device_name,
                CLIENT_SEQ.fetch_add(1, Ordering::Relaxed),
            ),
            start_server: config.start_server,
        };
        debug!(client = %request.name, start_server = request.start_server, "opening client");
        let client = inner.client.insert(open_with_timeout(
            &self.backend,
            &request,
            self.options.open_timeout,
        )?);

        let sample_rate = client.sample_rate();
        let server_block = client.buffer_size() as usize;
        let host_block = host_block_in_server_frames(
            self.options.host_block_frames,
            self.options.host_sample_rate,
            sample_rate,
        );
        let capacity = capacity_for_blocks(server_block, host_block, self.options.headroom);
        let sizing = Arc::new(SharedSizing::new(sample_rate, server_block as u32, capacity));
        let flags = Arc::new(SlotFlags::default());
        let registry = inner
            .registry
            .insert(PortRegistry::new(config.channels, flags.clone()));

        let mut slots = Vec::with_capacity(config.channels);
        for index in 0..config.channels {
            let short_name = format!("in_{}", index + 1);
            let port = client
                .register_input(&short_name)
                .map_err(|err| match err {
                    BridgeError::PortRegistration { .. } => err,
                    other => BridgeError::PortRegistration {
                        name: short_name.clone(),
                        reason: other.to_string(),
                    },
                })?;
            inner.ports.push(port);
            registry.attach(index, port)?;
            slots.push(ChannelSlot {
                index,
                port_name: client.port_name(port),
                buffer: Arc::new(HandoffBuffer::new(capacity)),
            });
        }

        inner.generation += 1;
        let generation = inner.generation;
        self.shared.generation.store(generation, Ordering::Release);
        let callback = CaptureCallback::new(
            slots.iter().map(|slot| slot.buffer.clone()).collect(),
            flags,
            sizing.clone(),
            capacity,
        );
        let forwarder = EventForwarder {
            generation,
            tx: self.events_tx.clone(),
            sizing: sizing.clone(),
            shared: self.shared.clone(),
        };
        client.activate(Box::new(callback), Box::new(forwarder))?;
        info!(
            client = client.client_name(),
            channels = config.channels,
            sample_rate,
            server_block,
            capacity,
            "client activated"
        );

        self.shared.publish(Some(Arc::new(ChannelSet {
            generation,
            slots,
            sizing: sizing.clone(),
        })));
        for slot in 0..config.channels {
            let report = registry.bind(Some(client.as_mut()), slot, config.ports_for(slot))?;
            log_bind(slot, &report);
        }
        inner.seen_block = server_block as u32;
        inner.sizing = Some(sizing);
        Ok(())
    }

    fn deactivate_locked(&self, inner: &mut ManagerInner) {
        if self.state() == LifecycleState::Inactive && inner.client.is_none() {
            return;
        }
        self.shared.set_state(LifecycleState::Deactivating);
        self.teardown_locked(inner);
        self.shared.set_state(LifecycleState::Inactive);
        info!("capture inactive");
        if let Some(config) = inner.surface.applied() {
            push_log(format!("{}: inactive", config.device_name));
        }
    }

    fn teardown_locked(&self, inner: &mut ManagerInner) {
        self.shared.publish(None);
        let mut client = inner.client.take();
        if let Some(mut registry) = inner.registry.take() {
            registry.unbind_all(client.as_deref_mut());
        }
        if let Some(client) = client.as_mut() {
            if let Err(err) = client.deactivate() {
                debug!(%err, "deactivate failed");
            }
        }
        for port in inner.ports.drain(..) {
            if let Some(client) = client.as_mut() {
                if let Err(err) = client.unregister_input(port) {
                    debug!(?port, %err, "unregister failed");
                }
            }
        }
        if let Some(client) = client {
            let name = client.client_name().to_string();
            if let Err(err) = client.close() {
                warn!(client = %name, %err, "close failed");
            } else {
                debug!(client = %name, "client closed");
            }
        }
        inner.sizing = None;
    }

    fn drain_events_locked(&self, inner: &mut ManagerInner) -> usize {
        let mut handled = 0;
        while let Ok((generation, event)) = self.events_rx.try_recv() {
            handled += 1;
            if generation != inner.generation || inner.client.is_none() {
                debug!(?event, "ignoring stale server event");
                continue;
            }
            match event {
                ServerEvent::Shutdown { reason } => {
                    let err = BridgeError::ServerShutdown { reason };
                    warn!(%err, "releasing client");
                    push_log(err.to_string());
                    self.teardown_locked(inner);
                    inner.last_error = Some(err.to_string());
                    self.shared.set_state(LifecycleState::Error);
                }
                ServerEvent::SampleRateChanged(rate) => {
                    info!(rate, "server sample rate changed");
                    push_log(format!("server sample rate {rate} Hz"));
                }
                ServerEvent::PortRenamed { old_name, new_name } => {
                    if let Some(registry) = inner.registry.as_mut() {
                        registry.port_renamed(&old_name, &new_name);
                    }
                }
                ServerEvent::PortRemoved { name } => {
                    if let Some(registry) = inner.registry.as_mut() {
                        if registry.port_removed(&name) {
                            info!(port = %name, "bound port vanished");
                            push_log(format!("port {name} vanished"));
                        }
                    }
                }
            }
        }

        if inner.sizing.as_ref().is_some_and(|s| s.stopped())
            && self.state() == LifecycleState::Active
        {
            let err = BridgeError::Backend("capture callback quit on a port table mismatch".into());
            warn!(%err, "releasing client");
            push_log(err.to_string());
            self.teardown_locked(inner);
            inner.last_error = Some(err.to_string());
            self.shared.set_state(LifecycleState::Error);
        }

        if let Some(sizing) = inner.sizing.clone() {
            let block = sizing.block_frames();
            if block != inner.seen_block {
                info!(block, "server block size changed");
                push_log(format!("server block size {block} frames"));
                inner.seen_block = block;
            }
            if sizing.resize_pending() && self.state() == LifecycleState::Active {
                if let Some(config) = inner.surface.applied().cloned() {
                    info!(block, "block size outgrew handoff buffers, rebuilding");
                    if let Err(err) = self.activate_locked(inner, config) {
                        warn!(block, %err, "rebuild after block-size change failed");
                    }
                }
            }
        }
        handled
    }
}

impl Drop for ClientManager {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.client.is_some() {
            self.teardown_locked(&mut inner);
            self.shared.set_state(LifecycleState::Inactive);
        }
    }
}

fn log_bind(slot: usize, report: &BindReport) {
    if !report.connected.is_empty() {
        debug!(slot, ports = ?report.connected, "slot bound");
    }
    for name in &report.rejected {
        warn!(slot, port = %name, "port unavailable, channel stays silent");
    }
}

fn host_block_in_server_frames(host_block: usize, host_rate: u32, server_rate: u32) -> usize {
    if host_rate == 0 || host_rate == server_rate {
        return host_block;
    }
    ((host_block as u64 * server_rate as u64).div_ceil(host_rate as u64)) as usize
}

/// Host-side reader. Each reader keeps its own conversion state, so use one
/// per pulling thread.
pub struct CaptureOutput {
    shared: Arc<BridgeShared>,
    host_rate: u32,
    generation: u64,
    readers: Vec<StreamResampler>,
}

impl CaptureOutput {
    /// Channels currently delivering captured audio (0 when not active).
    pub fn channels(&self) -> usize {
        if self.shared.state() != LifecycleState::Active {
            return 0;
        }
        self.shared
            .channels
            .try_read()
            .and_then(|set| set.as_ref().map(|set| set.slots.len()))
            .unwrap_or(0)
    }

    /// Fill `out` with `channel`'s audio at the host rate. Always fills `out`
    /// completely; silence when the source is not active, while it is being
    /// rebuilt, or for channels beyond the configured count.
    pub fn pull(&mut self, channel: usize, out: &mut [f32]) -> PullReport {
        let silent = PullReport {
            read: 0,
            padded: out.len(),
        };
        let Some(set) = self.current_set() else {
            out.fill(0.0);
            return silent;
        };
        let (Some(slot), Some(reader)) = (set.slots.get(channel), self.readers.get_mut(channel))
        else {
            out.fill(0.0);
            return silent;
        };
        let source_rate = set.sizing.sample_rate();
        let mut report = PullReport::default();
        for chunk in out.chunks_mut(PULL_CHUNK_FRAMES) {
            let step = reader.pull(&slot.buffer, source_rate, self.host_rate, chunk);
            report.read += step.read;
            report.padded += step.padded;
        }
        report
    }

    /// Pull every channel in `outputs`, one buffer per channel.
    pub fn pull_all(&mut self, outputs: &mut [&mut [f32]]) -> PullReport {
        let mut total = PullReport::default();
        for (channel, out) in outputs.iter_mut().enumerate() {
            let report = self.pull(channel, out);
            total.read += report.read;
            total.padded += report.padded;
        }
        total
    }

    fn current_set(&mut self) -> Option<Arc<ChannelSet>> {
        if self.shared.state() != LifecycleState::Active {
            return None;
        }
        let set = self.shared.channels.try_read()?.clone()?;
        if set.generation != self.generation {
            for reader in &mut self.readers {
                reader.reset();
            }
            self.generation = set.generation;
        }
        Some(set)
    }
}
