//! Backend talking to a real JACK server through the `jack` crate.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{
    AudioBackend, ClientRequest, Control, NotificationHandler, PortId, ProcessHandler,
    ServerClient,
};
use crate::{BridgeError, MAX_CHANNELS};

/// Connects to the JACK server of the current user.
#[derive(Clone, Copy, Debug, Default)]
pub struct JackBackend;

impl AudioBackend for JackBackend {
    fn name(&self) -> &'static str {
        "jack"
    }

    fn open(&self, request: &ClientRequest) -> Result<Box<dyn ServerClient>, BridgeError> {
        let options = if request.start_server {
            jack::ClientOptions::empty()
        } else {
            jack::ClientOptions::NO_START_SERVER
        };
        let (client, status) = jack::Client::new(&request.name, options).map_err(|err| {
            BridgeError::ServerUnavailable {
                reason: err.to_string(),
            }
        })?;
        info!(client = client.name(), ?status, "opened jack client");
        Ok(Box::new(JackClient {
            name: client.name().to_string(),
            state: ClientState::Inactive(client),
            ports: BTreeMap::new(),
            port_names: BTreeMap::new(),
            next_port: 0,
        }))
    }
}

fn to_jack(control: Control) -> jack::Control {
    match control {
        Control::Continue => jack::Control::Continue,
        Control::Quit => jack::Control::Quit,
    }
}

fn backend_error(err: jack::Error) -> BridgeError {
    BridgeError::Backend(err.to_string())
}

struct JackProcess {
    ports: Vec<(PortId, jack::Port<jack::AudioIn>)>,
    handler: Box<dyn ProcessHandler>,
}

impl jack::ProcessHandler for JackProcess {
    fn process(&mut self, _: &jack::Client, scope: &jack::ProcessScope) -> jack::Control {
        let frames = scope.n_frames() as usize;
        let mut inputs: [&[f32]; MAX_CHANNELS] = [&[]; MAX_CHANNELS];
        let count = self.ports.len().min(MAX_CHANNELS);
        for (input, (_, port)) in inputs.iter_mut().zip(&self.ports) {
            *input = port.as_slice(scope);
        }
        to_jack(self.handler.process(frames, &inputs[..count]))
    }

    fn buffer_size(&mut self, _: &jack::Client, frames: jack::Frames) -> jack::Control {
        to_jack(self.handler.buffer_size(frames))
    }
}

struct JackNotifications {
    handler: Box<dyn NotificationHandler>,
}

impl jack::NotificationHandler for JackNotifications {
    unsafe fn shutdown(&mut self, _status: jack::ClientStatus, reason: &str) {
        self.handler.shutdown(reason);
    }

    fn sample_rate(&mut self, _: &jack::Client, rate: jack::Frames) -> jack::Control {
        to_jack(self.handler.sample_rate(rate))
    }

    fn port_registration(&mut self, client: &jack::Client, port_id: jack::PortId, registered: bool) {
        if registered {
            return;
        }
        if let Some(name) = client.port_by_id(port_id).and_then(|port| port.name().ok()) {
            self.handler.port_unregistered(&name);
        }
    }

    fn port_rename(
        &mut self,
        _: &jack::Client,
        _port_id: jack::PortId,
        old_name: &str,
        new_name: &str,
    ) -> jack::Control {
        self.handler.port_renamed(old_name, new_name);
        jack::Control::Continue
    }
}

enum ClientState {
    Inactive(jack::Client),
    Active(jack::AsyncClient<JackNotifications, JackProcess>),
    Closed,
}

struct JackClient {
    name: String,
    state: ClientState,
    ports: BTreeMap<PortId, jack::Port<jack::AudioIn>>,
    port_names: BTreeMap<PortId, String>,
    next_port: u32,
}

impl JackClient {
    fn client(&self) -> Result<&jack::Client, BridgeError> {
        match &self.state {
            ClientState::Inactive(client) => Ok(client),
            ClientState::Active(active) => Ok(active.as_client()),
            ClientState::Closed => Err(BridgeError::ServerUnavailable {
                reason: "client is closed".into(),
            }),
        }
    }

    fn full_name(&self, port: PortId) -> Result<&str, BridgeError> {
        self.port_names
            .get(&port)
            .map(String::as_str)
            .ok_or_else(|| BridgeError::Backend(format!("unknown port {port:?}")))
    }
}

impl ServerClient for JackClient {
    fn client_name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.client().map_or(0, |client| client.sample_rate() as u32)
    }

    fn buffer_size(&self) -> u32 {
        self.client().map_or(0, |client| client.buffer_size())
    }

    fn register_input(&mut self, short_name: &str) -> Result<PortId, BridgeError> {
        let ClientState::Inactive(client) = &self.state else {
            return Err(BridgeError::PortRegistration {
                name: short_name.to_string(),
                reason: "ports are registered before activation".into(),
            });
        };
        let port = client
            .register_port(short_name, jack::AudioIn::default())
            .map_err(|err| BridgeError::PortRegistration {
                name: short_name.to_string(),
                reason: err.to_string(),
            })?;
        let full_name = port.name().map_err(backend_error)?;
        let id = PortId(self.next_port);
        self.next_port += 1;
        self.port_names.insert(id, full_name);
        self.ports.insert(id, port);
        Ok(id)
    }

    fn unregister_input(&mut self, port: PortId) -> Result<(), BridgeError> {
        self.port_names.remove(&port);
        let owned = self
            .ports
            .remove(&port)
            .ok_or_else(|| BridgeError::Backend(format!("unknown port {port:?}")))?;
        self.client()?.unregister_port(owned).map_err(backend_error)
    }

    fn port_name(&self, port: PortId) -> Option<String> {
        self.port_names.get(&port).cloned()
    }

    fn connect(&mut self, source: &str, port: PortId) -> Result<(), BridgeError> {
        let destination = self.full_name(port)?;
        self.client()?
            .connect_ports_by_name(source, destination)
            .map_err(|err| {
                debug!(source, destination, %err, "connect failed");
                BridgeError::PortUnavailable {
                    name: source.to_string(),
                }
            })
    }

    fn disconnect(&mut self, source: &str, port: PortId) -> Result<(), BridgeError> {
        let destination = self.full_name(port)?;
        self.client()?
            .disconnect_ports_by_name(source, destination)
            .map_err(backend_error)
    }

    fn activate(
        &mut self,
        process: Box<dyn ProcessHandler>,
        notifications: Box<dyn NotificationHandler>,
    ) -> Result<(), BridgeError> {
        let client = match std::mem::replace(&mut self.state, ClientState::Closed) {
            ClientState::Inactive(client) => client,
            other => {
                self.state = other;
                return Err(BridgeError::Backend("client is already active".into()));
            }
        };
        let process = JackProcess {
            ports: std::mem::take(&mut self.ports).into_iter().collect(),
            handler: process,
        };
        let notifications = JackNotifications {
            handler: notifications,
        };
        let active = client
            .activate_async(notifications, process)
            .map_err(backend_error)?;
        self.state = ClientState::Active(active);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), BridgeError> {
        let active = match std::mem::replace(&mut self.state, ClientState::Closed) {
            ClientState::Active(active) => active,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let (client, _notifications, process) = active.deactivate().map_err(backend_error)?;
        self.ports = process.ports.into_iter().collect();
        self.state = ClientState::Inactive(client);
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), BridgeError> {
        let result = self.deactivate();
        self.ports.clear();
        self.state = ClientState::Closed;
        debug!(client = %self.name, "closed jack client");
        result
    }
}
