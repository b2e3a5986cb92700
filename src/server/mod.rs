//! Audio-server collaborator contract.
//!
//! The bridge only relies on the primitives below: open a client, register
//! and unregister input ports, connect and disconnect by name, install a
//! realtime process handler plus a notification handler, deactivate, close.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, warn};

use crate::BridgeError;

#[cfg(feature = "jack")]
pub mod jack;
pub mod sim;

#[cfg(feature = "jack")]
pub use self::jack::JackBackend;
pub use self::sim::{SimClock, SimulatedServer, SourceSignal};

/// Longest client name the server accepts.
pub const MAX_CLIENT_NAME_LEN: usize = 63;

/// Identifier of a port registered by a [`ServerClient`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Return status of a realtime callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    /// Cycle handled; keep the client running.
    Continue,
    /// The client is in an errored state and must be deactivated by the server.
    Quit,
}

/// Realtime process handler invoked by the server once per cycle.
pub trait ProcessHandler: Send + 'static {
    /// Handle one cycle of `frames` samples. `inputs[i]` is the buffer of the
    /// i-th registered input port and is only valid for the duration of the
    /// call.
    fn process(&mut self, frames: usize, inputs: &[&[f32]]) -> Control;

    /// The server changed its block size. Called between cycles.
    fn buffer_size(&mut self, _frames: u32) -> Control {
        Control::Continue
    }
}

/// Non-realtime notifications from the server.
pub trait NotificationHandler: Send + 'static {
    /// The server went away; the client is no longer usable.
    fn shutdown(&mut self, reason: &str);
    /// The server sample rate changed.
    fn sample_rate(&mut self, rate: u32) -> Control;
    /// An external port was renamed.
    fn port_renamed(&mut self, old_name: &str, new_name: &str);
    /// An external port was unregistered.
    fn port_unregistered(&mut self, name: &str);
}

/// Parameters for opening a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRequest {
    /// Client name, unique within this process.
    pub name: String,
    /// Ask the server library to launch a server if none is running.
    pub start_server: bool,
}

/// Factory for server connections.
pub trait AudioBackend: Send + Sync + 'static {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Open a client connection.
    fn open(&self, request: &ClientRequest) -> Result<Box<dyn ServerClient>, BridgeError>;
}

/// An open connection to the audio server.
pub trait ServerClient: Send {
    /// Name the server assigned to this client.
    fn client_name(&self) -> &str;
    /// Current server sample rate in Hertz.
    fn sample_rate(&self) -> u32;
    /// Current server block size in frames.
    fn buffer_size(&self) -> u32;
    /// Register an audio input port.
    fn register_input(&mut self, short_name: &str) -> Result<PortId, BridgeError>;
    /// Unregister a port created by [`ServerClient::register_input`].
    fn unregister_input(&mut self, port: PortId) -> Result<(), BridgeError>;
    /// Full `client:port` name of one of our ports.
    fn port_name(&self, port: PortId) -> Option<String>;
    /// Connect the external output port `source` to our input `port`.
    fn connect(&mut self, source: &str, port: PortId) -> Result<(), BridgeError>;
    /// Disconnect the external output port `source` from our input `port`.
    fn disconnect(&mut self, source: &str, port: PortId) -> Result<(), BridgeError>;
    /// Install handlers and start processing.
    fn activate(
        &mut self,
        process: Box<dyn ProcessHandler>,
        notifications: Box<dyn NotificationHandler>,
    ) -> Result<(), BridgeError>;
    /// Stop processing. After this returns the process handler is never
    /// invoked again.
    fn deactivate(&mut self) -> Result<(), BridgeError>;
    /// Close the connection.
    fn close(self: Box<Self>) -> Result<(), BridgeError>;
}

/// Open a client on a helper thread, giving up after `timeout`. A client that
/// opens after the deadline is closed by the helper.
pub fn open_with_timeout(
    backend: &Arc<dyn AudioBackend>,
    request: &ClientRequest,
    timeout: Duration,
) -> Result<Box<dyn ServerClient>, BridgeError> {
    // Rendezvous: a send only succeeds while the caller is still waiting.
    let (tx, rx) = bounded(0);
    let worker_backend = backend.clone();
    let worker_request = request.clone();
    std::thread::Builder::new()
        .name("jack-capture-open".into())
        .spawn(move || {
            let result = worker_backend.open(&worker_request);
            if let Err(crossbeam_channel::SendError(Ok(client))) = tx.send(result) {
                debug!(client = client.client_name(), "closing client opened after deadline");
                let _ = client.close();
            }
        })
        .map_err(|err| BridgeError::Backend(format!("failed to spawn open thread: {err}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(client = %request.name, ?timeout, "timed out opening client");
            Err(BridgeError::ServerUnavailable {
                reason: format!("no response from server within {timeout:?}"),
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(BridgeError::ServerUnavailable {
            reason: "client open aborted".into(),
        }),
    }
}

/// Turn a display name into a client name that is unique within this process
/// and fits the server's length limit.
pub fn unique_client_name(display_name: &str, instance: u64) -> String {
    let suffix = format!("-{instance}");
    let mut base: String = display_name
        .chars()
        .map(|c| if c == ':' || c.is_control() { '_' } else { c })
        .collect();
    if base.trim().is_empty() {
        base = "jack-capture".into();
    }
    let budget = MAX_CLIENT_NAME_LEN.saturating_sub(suffix.len());
    let mut end = base.len().min(budget);
    while !base.is_char_boundary(end) {
        end -= 1;
    }
    base.truncate(end);
    base.push_str(&suffix);
    base
}
