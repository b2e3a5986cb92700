//! Port registry: which external server ports feed which channel slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::BridgeError;
use crate::capture::SlotFlags;
use crate::server::{PortId, ServerClient};

/// Result of binding one slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindReport {
    /// Ports now connected to the slot.
    pub connected: Vec<String>,
    /// Ports the server rejected; the slot simply does not receive them.
    pub rejected: Vec<String>,
}

#[derive(Default)]
struct Binding {
    port: Option<PortId>,
    requested: Vec<String>,
    connected: Vec<String>,
}

/// Slot → external port bindings for one open client.
pub struct PortRegistry {
    bindings: Vec<Binding>,
    flags: Arc<SlotFlags>,
}

impl PortRegistry {
    /// Registry for `channels` slots publishing connection state to `flags`.
    pub fn new(channels: usize, flags: Arc<SlotFlags>) -> Self {
        Self {
            bindings: (0..channels).map(|_| Binding::default()).collect(),
            flags,
        }
    }

    /// Number of slots.
    pub fn channels(&self) -> usize {
        self.bindings.len()
    }

    /// Record the input port registered for `slot`.
    pub fn attach(&mut self, slot: usize, port: PortId) -> Result<(), BridgeError> {
        let channels = self.channels();
        let binding = self
            .bindings
            .get_mut(slot)
            .ok_or(BridgeError::InvalidSlot { slot, channels })?;
        binding.port = Some(port);
        Ok(())
    }

    /// Replace the ports feeding `slot`. The previous set is disconnected
    /// first; ports the server rejects are skipped and reported.
    pub fn bind(
        &mut self,
        mut client: Option<&mut (dyn ServerClient + 'static)>,
        slot: usize,
        port_names: &[String],
    ) -> Result<BindReport, BridgeError> {
        self.unbind(client.as_deref_mut(), slot)?;

        let binding = &mut self.bindings[slot];
        binding.requested = port_names.to_vec();
        let mut report = BindReport::default();
        let (Some(client), Some(port)) = (client, binding.port) else {
            return Ok(report);
        };

        for name in port_names {
            let name = name.trim();
            if name.is_empty() || binding.connected.iter().any(|c| c == name) {
                continue;
            }
            match client.connect(name, port) {
                Ok(()) => {
                    debug!(slot, port = name, "connected");
                    binding.connected.push(name.to_string());
                    report.connected.push(name.to_string());
                }
                Err(err) => {
                    warn!(slot, port = name, %err, "skipping port");
                    crate::push_log(format!("channel {}: {err}", slot + 1));
                    report.rejected.push(name.to_string());
                }
            }
        }
        self.flags.set_connected(slot, !binding.connected.is_empty());
        Ok(report)
    }

    /// Disconnect everything feeding `slot`. Unbinding a slot that was never
    /// bound does nothing.
    pub fn unbind(
        &mut self,
        client: Option<&mut (dyn ServerClient + 'static)>,
        slot: usize,
    ) -> Result<(), BridgeError> {
        let channels = self.channels();
        let binding = self
            .bindings
            .get_mut(slot)
            .ok_or(BridgeError::InvalidSlot { slot, channels })?;
        self.flags.set_connected(slot, false);
        let connected = std::mem::take(&mut binding.connected);
        if let (Some(client), Some(port)) = (client, binding.port) {
            for name in &connected {
                if let Err(err) = client.disconnect(name, port) {
                    debug!(slot, port = %name, %err, "disconnect failed");
                }
            }
        }
        Ok(())
    }

    /// Disconnect every slot. Safe to call repeatedly and without a client.
    pub fn unbind_all(&mut self, mut client: Option<&mut (dyn ServerClient + 'static)>) {
        for slot in 0..self.channels() {
            let _ = self.unbind(client.as_deref_mut(), slot);
        }
    }

    /// Slots with at least one live connection and the ports feeding them.
    pub fn active_bindings(&self) -> BTreeMap<usize, Vec<String>> {
        self.bindings
            .iter()
            .enumerate()
            .filter(|(_, binding)| !binding.connected.is_empty())
            .map(|(slot, binding)| (slot, binding.connected.clone()))
            .collect()
    }

    /// Ports requested for `slot`, connected or not.
    pub fn requested(&self, slot: usize) -> &[String] {
        self.bindings
            .get(slot)
            .map(|binding| binding.requested.as_slice())
            .unwrap_or(&[])
    }

    /// Follow an external port rename. Returns `true` if any binding changed.
    pub fn port_renamed(&mut self, old_name: &str, new_name: &str) -> bool {
        let mut changed = false;
        for (slot, binding) in self.bindings.iter_mut().enumerate() {
            let mut slot_changed = false;
            for name in binding
                .connected
                .iter_mut()
                .chain(binding.requested.iter_mut())
                .filter(|name| name.as_str() == old_name)
            {
                *name = new_name.to_string();
                slot_changed = true;
            }
            if slot_changed {
                info!(slot, old_name, new_name, "port renamed");
                changed = true;
            }
        }
        changed
    }

    /// Drop a vanished external port from every binding. Returns `true` if
    /// any slot lost a connection.
    pub fn port_removed(&mut self, name: &str) -> bool {
        let mut changed = false;
        for (slot, binding) in self.bindings.iter_mut().enumerate() {
            let before = binding.connected.len();
            binding.connected.retain(|connected| connected != name);
            if binding.connected.len() != before {
                changed = true;
                self.flags.set_connected(slot, !binding.connected.is_empty());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AudioBackend, ClientRequest, SimulatedServer, SourceSignal};

    fn client(server: &SimulatedServer) -> Box<dyn ServerClient> {
        server
            .open(&ClientRequest {
                name: "registry-test".into(),
                start_server: false,
            })
            .unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bind_skips_unknown_ports() {
        let server = SimulatedServer::new()
            .with_source("system:capture_1", SourceSignal::Silence)
            .with_source("system:capture_2", SourceSignal::Silence);
        let mut client = client(&server);
        let port = client.register_input("in_1").unwrap();
        let flags = Arc::new(SlotFlags::default());
        let mut registry = PortRegistry::new(1, flags.clone());
        registry.attach(0, port).unwrap();

        let report = registry
            .bind(
                Some(client.as_mut()),
                0,
                &names(&["system:capture_1", "nope:missing", "system:capture_2"]),
            )
            .unwrap();
        assert_eq!(report.connected, names(&["system:capture_1", "system:capture_2"]));
        assert_eq!(report.rejected, names(&["nope:missing"]));
        assert!(flags.is_connected(0));
        assert_eq!(server.connections_to("registry-test:in_1").len(), 2);
    }

    #[test]
    fn rebinding_replaces_previous_connections() {
        let server = SimulatedServer::new()
            .with_source("system:capture_1", SourceSignal::Silence)
            .with_source("system:capture_2", SourceSignal::Silence);
        let mut client = client(&server);
        let port = client.register_input("in_1").unwrap();
        let mut registry = PortRegistry::new(1, Arc::new(SlotFlags::default()));
        registry.attach(0, port).unwrap();

        registry
            .bind(Some(client.as_mut()), 0, &names(&["system:capture_1"]))
            .unwrap();
        registry
            .bind(Some(client.as_mut()), 0, &names(&["system:capture_2"]))
            .unwrap();
        assert_eq!(
            server.connections_to("registry-test:in_1"),
            names(&["system:capture_2"])
        );
        assert_eq!(registry.active_bindings()[&0], names(&["system:capture_2"]));
    }

    #[test]
    fn unbinding_unbound_slot_is_noop() {
        let mut registry = PortRegistry::new(2, Arc::new(SlotFlags::default()));
        assert!(registry.unbind(None, 1).is_ok());
        registry.unbind_all(None);
        registry.unbind_all(None);
        assert!(registry.active_bindings().is_empty());
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let mut registry = PortRegistry::new(2, Arc::new(SlotFlags::default()));
        assert!(matches!(
            registry.unbind(None, 5),
            Err(BridgeError::InvalidSlot { slot: 5, channels: 2 })
        ));
    }

    #[test]
    fn rename_and_removal_update_bindings() {
        let server = SimulatedServer::new()
            .with_source("system:capture_1", SourceSignal::Silence)
            .with_source("system:capture_2", SourceSignal::Silence);
        let mut client = client(&server);
        let port = client.register_input("in_1").unwrap();
        let flags = Arc::new(SlotFlags::default());
        let mut registry = PortRegistry::new(1, flags.clone());
        registry.attach(0, port).unwrap();
        registry
            .bind(
                Some(client.as_mut()),
                0,
                &names(&["system:capture_1", "system:capture_2"]),
            )
            .unwrap();

        assert!(registry.port_renamed("system:capture_1", "system:mic"));
        assert_eq!(
            registry.active_bindings()[&0],
            names(&["system:mic", "system:capture_2"])
        );
        assert_eq!(registry.requested(0), names(&["system:mic", "system:capture_2"]));

        assert!(registry.port_removed("system:capture_2"));
        assert!(flags.is_connected(0));
        assert!(registry.port_removed("system:mic"));
        assert!(!flags.is_connected(0));
        assert!(!registry.port_removed("system:mic"));
    }
}
