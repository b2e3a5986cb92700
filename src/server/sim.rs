//! In-process stand-in for the audio server.
//!
//! Exposes named output ports that produce silence, a constant, a tone or
//! queued samples, and drives registered clients one cycle at a time (or on a
//! clock thread). Server-side events such as shutdown, rate or block-size
//! changes and port renames can be injected to exercise the bridge without a
//! running JACK daemon.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    AudioBackend, ClientRequest, Control, NotificationHandler, PortId, ProcessHandler,
    ServerClient,
};
use crate::BridgeError;
use crate::probe::ToneGenerator;

/// Default simulated sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
/// Default simulated block size.
pub const DEFAULT_BUFFER_SIZE: u32 = 256;

/// What a simulated output port plays.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceSignal {
    /// All zeros.
    Silence,
    /// A fixed sample value.
    Constant(f32),
    /// A sine wave.
    Tone {
        /// Frequency in Hertz.
        frequency_hz: f64,
        /// Peak amplitude.
        amplitude: f32,
    },
}

struct SourcePort {
    constant: f32,
    tone: Option<ToneGenerator>,
    queued: VecDeque<f32>,
}

impl SourcePort {
    fn new(signal: SourceSignal, sample_rate: u32) -> Self {
        let (constant, tone) = match signal {
            SourceSignal::Silence => (0.0, None),
            SourceSignal::Constant(value) => (value, None),
            SourceSignal::Tone {
                frequency_hz,
                amplitude,
            } => (
                0.0,
                Some(ToneGenerator::new(sample_rate, frequency_hz, amplitude)),
            ),
        };
        Self {
            constant,
            tone,
            queued: VecDeque::new(),
        }
    }

    fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![self.constant; frames];
        if let Some(tone) = self.tone.as_mut() {
            tone.fill(&mut out);
        }
        for sample in out.iter_mut() {
            match self.queued.pop_front() {
                Some(queued) => *sample = queued,
                None => break,
            }
        }
        out
    }
}

struct SimPort {
    short_name: String,
    connections: Vec<String>,
}

struct Handlers {
    process: Box<dyn ProcessHandler>,
    notifications: Box<dyn NotificationHandler>,
}

struct SimClientState {
    name: String,
    ports: BTreeMap<PortId, SimPort>,
    handlers: Option<Handlers>,
    zombie: bool,
}

struct SimState {
    running: bool,
    autostart: bool,
    sample_rate: u32,
    buffer_size: u32,
    port_limit: Option<usize>,
    refuse_activation: bool,
    sources: BTreeMap<String, SourcePort>,
    clients: BTreeMap<u64, SimClientState>,
    next_client: u64,
    next_port: u32,
}

impl SimState {
    fn live_client(&mut self, id: u64) -> Result<&mut SimClientState, BridgeError> {
        if !self.running {
            return Err(BridgeError::ServerUnavailable {
                reason: "server is not running".into(),
            });
        }
        match self.clients.get_mut(&id) {
            Some(client) if !client.zombie => Ok(client),
            _ => Err(BridgeError::ServerUnavailable {
                reason: "client handle is no longer valid".into(),
            }),
        }
    }
}

/// Shared handle to a simulated server. Clones refer to the same server.
#[derive(Clone)]
pub struct SimulatedServer {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedServer {
    /// A running server at the default rate and block size.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                running: true,
                autostart: true,
                sample_rate: DEFAULT_SAMPLE_RATE,
                buffer_size: DEFAULT_BUFFER_SIZE,
                port_limit: None,
                refuse_activation: false,
                sources: BTreeMap::new(),
                clients: BTreeMap::new(),
                next_client: 1,
                next_port: 1,
            })),
        }
    }

    /// A server that is not running yet; it starts when a client asks for
    /// auto-start (unless auto-start is disabled).
    pub fn stopped() -> Self {
        let server = Self::new();
        server.inner.lock().running = false;
        server
    }

    /// Set the sample rate before any client connects.
    pub fn with_sample_rate(self, rate: u32) -> Self {
        self.inner.lock().sample_rate = rate;
        self
    }

    /// Set the block size before any client connects.
    pub fn with_buffer_size(self, frames: u32) -> Self {
        self.inner.lock().buffer_size = frames;
        self
    }

    /// Allow or refuse auto-start requests.
    pub fn with_autostart(self, allowed: bool) -> Self {
        self.inner.lock().autostart = allowed;
        self
    }

    /// Refuse port registrations beyond `limit` ports per client.
    pub fn with_port_limit(self, limit: usize) -> Self {
        self.inner.lock().port_limit = Some(limit);
        self
    }

    /// Make client activation fail (or succeed again).
    pub fn refuse_activation(&self, refuse: bool) {
        self.inner.lock().refuse_activation = refuse;
    }

    /// Add an output port.
    pub fn with_source(self, name: &str, signal: SourceSignal) -> Self {
        self.add_source(name, signal);
        self
    }

    /// Add an output port at runtime.
    pub fn add_source(&self, name: &str, signal: SourceSignal) {
        let mut state = self.inner.lock();
        let port = SourcePort::new(signal, state.sample_rate);
        state.sources.insert(name.to_string(), port);
    }

    /// Queue exact samples on an output port; they replace its signal for the
    /// next cycles until exhausted.
    pub fn feed(&self, name: &str, samples: &[f32]) -> Result<(), BridgeError> {
        let mut state = self.inner.lock();
        let port = state
            .sources
            .get_mut(name)
            .ok_or_else(|| BridgeError::PortUnavailable {
                name: name.to_string(),
            })?;
        port.queued.extend(samples.iter().copied());
        Ok(())
    }

    /// Whether the server process is up.
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Current sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().sample_rate
    }

    /// Current block size.
    pub fn buffer_size(&self) -> u32 {
        self.inner.lock().buffer_size
    }

    /// Run one processing cycle for every active client. Returns how many
    /// clients were processed.
    pub fn run_cycle(&self) -> usize {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if !state.running {
            return 0;
        }
        let frames = state.buffer_size as usize;
        let rendered: BTreeMap<&str, Vec<f32>> = state
            .sources
            .iter_mut()
            .map(|(name, port)| (name.as_str(), port.render(frames)))
            .collect();

        let mut processed = 0;
        for client in state.clients.values_mut() {
            let Some(handlers) = client.handlers.as_mut() else {
                continue;
            };
            let inputs: Vec<Vec<f32>> = client
                .ports
                .values()
                .map(|port| {
                    let mut buffer = vec![0.0f32; frames];
                    for source in &port.connections {
                        if let Some(samples) = rendered.get(source.as_str()) {
                            for (dst, src) in buffer.iter_mut().zip(samples) {
                                *dst += *src;
                            }
                        }
                    }
                    buffer
                })
                .collect();
            let slices: Vec<&[f32]> = inputs.iter().map(Vec::as_slice).collect();
            if handlers.process.process(frames, &slices) == Control::Quit {
                debug!(client = %client.name, "client requested quit, deactivating");
                client.handlers = None;
            }
            processed += 1;
        }
        processed
    }

    /// Run `cycles` processing cycles.
    pub fn run_cycles(&self, cycles: usize) {
        for _ in 0..cycles {
            self.run_cycle();
        }
    }

    /// Stop the server. Active clients receive a shutdown notification and
    /// every open handle becomes invalid.
    pub fn shutdown(&self, reason: &str) {
        let mut state = self.inner.lock();
        state.running = false;
        for client in state.clients.values_mut() {
            if let Some(mut handlers) = client.handlers.take() {
                handlers.notifications.shutdown(reason);
            }
            client.zombie = true;
        }
        info!(reason, "simulated server shut down");
    }

    /// Change the sample rate and notify active clients.
    pub fn set_sample_rate(&self, rate: u32) {
        let mut state = self.inner.lock();
        state.sample_rate = rate;
        for handlers in state.clients.values_mut().filter_map(|c| c.handlers.as_mut()) {
            handlers.notifications.sample_rate(rate);
        }
    }

    /// Change the block size and notify active clients.
    pub fn set_buffer_size(&self, frames: u32) {
        let mut state = self.inner.lock();
        state.buffer_size = frames;
        for handlers in state.clients.values_mut().filter_map(|c| c.handlers.as_mut()) {
            handlers.process.buffer_size(frames);
        }
    }

    /// Rename an output port, keeping its connections.
    pub fn rename_source(&self, old_name: &str, new_name: &str) -> Result<(), BridgeError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let port = state
            .sources
            .remove(old_name)
            .ok_or_else(|| BridgeError::PortUnavailable {
                name: old_name.to_string(),
            })?;
        state.sources.insert(new_name.to_string(), port);
        for client in state.clients.values_mut() {
            for port in client.ports.values_mut() {
                for connection in port.connections.iter_mut().filter(|c| c.as_str() == old_name) {
                    *connection = new_name.to_string();
                }
            }
            if let Some(handlers) = client.handlers.as_mut() {
                handlers.notifications.port_renamed(old_name, new_name);
            }
        }
        Ok(())
    }

    /// Remove an output port and its connections.
    pub fn remove_source(&self, name: &str) -> Result<(), BridgeError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state
            .sources
            .remove(name)
            .ok_or_else(|| BridgeError::PortUnavailable {
                name: name.to_string(),
            })?;
        for client in state.clients.values_mut() {
            for port in client.ports.values_mut() {
                port.connections.retain(|c| c != name);
            }
            if let Some(handlers) = client.handlers.as_mut() {
                handlers.notifications.port_unregistered(name);
            }
        }
        Ok(())
    }

    /// Drop a client's input port (`client:port`) from the server's port
    /// table behind the client's back. Its process handler then sees one
    /// input fewer than it registered.
    pub fn evict_port(&self, full_name: &str) -> Result<(), BridgeError> {
        let missing = || BridgeError::PortUnavailable {
            name: full_name.to_string(),
        };
        let (client_name, short_name) = full_name.split_once(':').ok_or_else(missing)?;
        let mut state = self.inner.lock();
        let client = state
            .clients
            .values_mut()
            .find(|c| c.name == client_name)
            .ok_or_else(missing)?;
        let id = client
            .ports
            .iter()
            .find(|(_, p)| p.short_name == short_name)
            .map(|(id, _)| *id)
            .ok_or_else(missing)?;
        client.ports.remove(&id);
        Ok(())
    }

    /// Open client handles, including invalidated ones not yet closed.
    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Clients with installed handlers.
    pub fn active_client_count(&self) -> usize {
        self.inner
            .lock()
            .clients
            .values()
            .filter(|c| c.handlers.is_some())
            .count()
    }

    /// Ports registered by all open clients.
    pub fn registered_port_count(&self) -> usize {
        self.inner
            .lock()
            .clients
            .values()
            .map(|c| c.ports.len())
            .sum()
    }

    /// Names of open clients.
    pub fn client_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .clients
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    /// External ports connected to the client port `full_name`
    /// (`client:port`).
    pub fn connections_to(&self, full_name: &str) -> Vec<String> {
        let Some((client_name, short_name)) = full_name.split_once(':') else {
            return Vec::new();
        };
        let state = self.inner.lock();
        state
            .clients
            .values()
            .filter(|c| c.name == client_name)
            .flat_map(|c| c.ports.values())
            .filter(|p| p.short_name == short_name)
            .flat_map(|p| p.connections.iter().cloned())
            .collect()
    }

    /// Drive cycles in real time on a background thread.
    pub fn spawn_clock(&self) -> SimClock {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let server = self.clone();
        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::Acquire) {
                let (rate, frames) = {
                    let state = server.inner.lock();
                    (state.sample_rate.max(1), state.buffer_size.max(1))
                };
                server.run_cycle();
                let period = Duration::from_secs_f64(frames as f64 / rate as f64);
                std::thread::sleep(period);
            }
        });
        SimClock {
            running,
            handle: Some(handle),
        }
    }
}

impl AudioBackend for SimulatedServer {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open(&self, request: &ClientRequest) -> Result<Box<dyn ServerClient>, BridgeError> {
        let mut state = self.inner.lock();
        if !state.running {
            if request.start_server && state.autostart {
                info!("auto-starting simulated server");
                state.running = true;
            } else {
                return Err(BridgeError::ServerUnavailable {
                    reason: if request.start_server {
                        "server could not be started".into()
                    } else {
                        "server is not running and auto-start is disabled".into()
                    },
                });
            }
        }
        if state.clients.values().any(|c| c.name == request.name) {
            return Err(BridgeError::ServerUnavailable {
                reason: format!("client name {} is already in use", request.name),
            });
        }
        let id = state.next_client;
        state.next_client += 1;
        state.clients.insert(
            id,
            SimClientState {
                name: request.name.clone(),
                ports: BTreeMap::new(),
                handlers: None,
                zombie: false,
            },
        );
        Ok(Box::new(SimClient {
            server: self.inner.clone(),
            id,
            name: request.name.clone(),
        }))
    }
}

/// Background cycle driver; stops when dropped.
pub struct SimClock {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimClock {
    /// Stop the clock and wait for the thread to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        self.halt();
    }
}

struct SimClient {
    server: Arc<Mutex<SimState>>,
    id: u64,
    name: String,
}

impl ServerClient for SimClient {
    fn client_name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.server.lock().sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.server.lock().buffer_size
    }

    fn register_input(&mut self, short_name: &str) -> Result<PortId, BridgeError> {
        let mut state = self.server.lock();
        let port_id = PortId(state.next_port);
        let limit = state.port_limit;
        let client = state.live_client(self.id)?;
        if limit.is_some_and(|limit| client.ports.len() >= limit) {
            return Err(BridgeError::PortRegistration {
                name: short_name.to_string(),
                reason: "server port limit reached".into(),
            });
        }
        if client.ports.values().any(|p| p.short_name == short_name) {
            return Err(BridgeError::PortRegistration {
                name: short_name.to_string(),
                reason: "port name already in use".into(),
            });
        }
        client.ports.insert(
            port_id,
            SimPort {
                short_name: short_name.to_string(),
                connections: Vec::new(),
            },
        );
        state.next_port += 1;
        Ok(port_id)
    }

    fn unregister_input(&mut self, port: PortId) -> Result<(), BridgeError> {
        let mut state = self.server.lock();
        let client = state.live_client(self.id)?;
        client
            .ports
            .remove(&port)
            .map(|_| ())
            .ok_or_else(|| BridgeError::Backend(format!("unknown port {port:?}")))
    }

    fn port_name(&self, port: PortId) -> Option<String> {
        let state = self.server.lock();
        let client = state.clients.get(&self.id)?;
        client
            .ports
            .get(&port)
            .map(|p| format!("{}:{}", client.name, p.short_name))
    }

    fn connect(&mut self, source: &str, port: PortId) -> Result<(), BridgeError> {
        let mut guard = self.server.lock();
        let state = &mut *guard;
        if !state.sources.contains_key(source) {
            return Err(BridgeError::PortUnavailable {
                name: source.to_string(),
            });
        }
        let client = state.live_client(self.id)?;
        let port = client
            .ports
            .get_mut(&port)
            .ok_or_else(|| BridgeError::Backend(format!("unknown port {port:?}")))?;
        if !port.connections.iter().any(|c| c == source) {
            port.connections.push(source.to_string());
        }
        Ok(())
    }

    fn disconnect(&mut self, source: &str, port: PortId) -> Result<(), BridgeError> {
        let mut state = self.server.lock();
        let client = state.live_client(self.id)?;
        let port = client
            .ports
            .get_mut(&port)
            .ok_or_else(|| BridgeError::Backend(format!("unknown port {port:?}")))?;
        let before = port.connections.len();
        port.connections.retain(|c| c != source);
        if port.connections.len() == before {
            return Err(BridgeError::Backend(format!("{source} is not connected")));
        }
        Ok(())
    }

    fn activate(
        &mut self,
        process: Box<dyn ProcessHandler>,
        notifications: Box<dyn NotificationHandler>,
    ) -> Result<(), BridgeError> {
        let mut state = self.server.lock();
        if state.refuse_activation {
            return Err(BridgeError::Backend("server refused to activate client".into()));
        }
        let client = state.live_client(self.id)?;
        if client.handlers.is_some() {
            return Err(BridgeError::Backend("client is already active".into()));
        }
        client.handlers = Some(Handlers {
            process,
            notifications,
        });
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), BridgeError> {
        let mut state = self.server.lock();
        if let Some(client) = state.clients.get_mut(&self.id) {
            client.handlers = None;
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), BridgeError> {
        let mut state = self.server.lock();
        state.clients.remove(&self.id);
        Ok(())
    }
}
