//! Host-facing audio source.
//!
//! [`SourceInfo`] is the contract a host uses to drive an input source:
//! identify it, create it from settings, push settings updates, describe its
//! properties and destroy it. [`JackInput`] implements it on top of a
//! [`ClientManager`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::{
    BridgeOptions, CHANNELS_KEY, ConfigDiff, DEFAULT_CHANNELS, RuntimeConfig, START_SERVER_KEY,
    Settings, channel_ports_key,
};
use crate::lifecycle::{CaptureOutput, ClientManager, LifecycleState, StateListener};
use crate::server::AudioBackend;
use crate::{BridgeError, MAX_CHANNELS, SourceStatus, init_tracing, push_log};

/// What a host needs to drive an input source.
pub trait SourceInfo: Sized {
    /// Stable identifier the host registers the source under.
    const ID: &'static str;

    /// Human-readable source type name.
    fn name() -> &'static str;

    /// Build a source from its initial settings. Fails instead of returning a
    /// half-built source.
    fn create(settings: &Settings, context: SourceContext) -> Result<Self, BridgeError>;

    /// Release everything the source holds.
    fn destroy(self);

    /// Apply changed settings.
    fn update(&mut self, settings: &Settings) -> Result<ConfigDiff, BridgeError>;

    /// Fill in default settings.
    fn defaults(settings: &mut Settings);

    /// Describe the editable properties.
    fn properties(&self) -> Properties;
}

/// Everything a source gets from the host besides its settings.
pub struct SourceContext {
    /// Display name of the source instance.
    pub display_name: String,
    /// Server connection factory.
    pub backend: Arc<dyn AudioBackend>,
    /// Buffering and timeout options.
    pub options: BridgeOptions,
    /// Optional state-change callback.
    pub listener: Option<StateListener>,
}

impl SourceContext {
    /// Context with default options and no listener.
    pub fn new(display_name: &str, backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            display_name: display_name.to_string(),
            backend,
            options: BridgeOptions::default(),
            listener: None,
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: BridgeOptions) -> Self {
        self.options = options;
        self
    }

    /// Install a state-change callback.
    pub fn with_listener(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }
}

/// One editable property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    /// Bounded integer.
    Int {
        /// Smallest value.
        min: i64,
        /// Largest value.
        max: i64,
        /// Increment.
        step: i64,
    },
    /// Checkbox.
    Bool,
    /// Editable list of strings.
    EditableList,
}

/// A property as shown by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    /// Settings key.
    pub key: &'static str,
    /// Label.
    pub label: &'static str,
    /// Widget kind.
    pub kind: PropertyKind,
    /// Whether the host should show it.
    pub visible: bool,
}

/// Ordered property list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    items: Vec<Property>,
}

impl Properties {
    /// Properties in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.items.iter()
    }

    /// Property stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Property> {
        self.items.iter().find(|p| p.key == key)
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no properties.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Show port lists for the configured channels and hide the rest. Call
    /// when the host reports a change of the channel count.
    pub fn channel_count_changed(&mut self, settings: &Settings) {
        let channels = settings.get_int(CHANNELS_KEY).clamp(1, MAX_CHANNELS as i64) as usize;
        for slot in 0..MAX_CHANNELS {
            let Some(key) = channel_ports_key(slot) else {
                continue;
            };
            if let Some(property) = self.items.iter_mut().find(|p| p.key == key) {
                property.visible = slot < channels;
            }
        }
    }
}

/// JACK capture source: one server client per instance.
pub struct JackInput {
    id: u64,
    display_name: String,
    settings: Settings,
    manager: Arc<ClientManager>,
}

impl JackInput {
    /// Process-local id, as listed by [`crate::source_statuses`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.manager.state()
    }

    /// Host-side reader for captured audio.
    pub fn output(&self) -> CaptureOutput {
        self.manager.output()
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> SourceStatus {
        self.manager.status(self.id)
    }

    /// Live connections per slot.
    pub fn active_bindings(&self) -> BTreeMap<usize, Vec<String>> {
        self.manager.active_bindings()
    }

    /// Apply pending server notifications.
    pub fn poll_events(&self) -> usize {
        self.manager.poll_events()
    }

    /// The host renamed the source. The client name derives from it, so the
    /// client is rebuilt.
    pub fn rename(&mut self, display_name: &str) -> Result<ConfigDiff, BridgeError> {
        self.display_name = display_name.to_string();
        let settings = self.settings.clone();
        self.update(&settings)
    }

    /// Re-open the client with the current settings, e.g. after the server
    /// came back.
    pub fn reactivate(&self) -> Result<(), BridgeError> {
        self.manager
            .activate(RuntimeConfig::from_settings(&self.settings, &self.display_name))
    }

    /// Release the client but keep the source.
    pub fn deactivate(&self) {
        self.manager.deactivate();
    }
}

impl SourceInfo for JackInput {
    const ID: &'static str = "jack_output_capture";

    fn name() -> &'static str {
        "JACK Input Client"
    }

    fn create(settings: &Settings, context: SourceContext) -> Result<Self, BridgeError> {
        init_tracing();
        let manager = Arc::new(ClientManager::new(
            context.backend,
            context.options,
            context.listener,
        ));
        manager.activate(RuntimeConfig::from_settings(settings, &context.display_name))?;
        let id = crate::register_source(&manager);
        info!(id, name = %context.display_name, "source created");
        push_log(format!("{}: created", context.display_name));
        Ok(Self {
            id,
            display_name: context.display_name,
            settings: settings.clone(),
            manager,
        })
    }

    fn destroy(self) {
        drop(self);
    }

    fn update(&mut self, settings: &Settings) -> Result<ConfigDiff, BridgeError> {
        self.settings = settings.clone();
        self.manager
            .reconfigure(RuntimeConfig::from_settings(settings, &self.display_name))
    }

    fn defaults(settings: &mut Settings) {
        settings.set_default_int(CHANNELS_KEY, DEFAULT_CHANNELS);
        settings.set_default_bool(START_SERVER_KEY, false);
    }

    fn properties(&self) -> Properties {
        let mut items = vec![
            Property {
                key: CHANNELS_KEY,
                label: "Channels",
                kind: PropertyKind::Int {
                    min: 1,
                    max: MAX_CHANNELS as i64,
                    step: 1,
                },
                visible: true,
            },
            Property {
                key: START_SERVER_KEY,
                label: "Start JACK Server",
                kind: PropertyKind::Bool,
                visible: true,
            },
        ];
        items.extend((0..MAX_CHANNELS).filter_map(channel_ports_key).map(|key| Property {
            key,
            label: key,
            kind: PropertyKind::EditableList,
            visible: true,
        }));
        let mut properties = Properties { items };
        properties.channel_count_changed(&self.settings);
        properties
    }
}

impl Drop for JackInput {
    fn drop(&mut self) {
        crate::unregister_source(self.id);
        self.manager.deactivate();
        info!(id = self.id, name = %self.display_name, "source destroyed");
        push_log(format!("{}: destroyed", self.display_name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SimulatedServer;

    fn settings(channels: i64) -> Settings {
        let mut settings = Settings::new();
        JackInput::defaults(&mut settings);
        settings.set_int(CHANNELS_KEY, channels);
        settings
    }

    #[test]
    fn defaults_match_plugin() {
        let mut settings = Settings::new();
        JackInput::defaults(&mut settings);
        assert_eq!(settings.get_int(CHANNELS_KEY), 2);
        assert!(!settings.get_bool(START_SERVER_KEY));
        assert_eq!(JackInput::ID, "jack_output_capture");
    }

    #[test]
    fn create_fails_without_server() {
        let server = SimulatedServer::stopped();
        let result = JackInput::create(
            &settings(2),
            SourceContext::new("Mic", Arc::new(server.clone())),
        );
        assert!(matches!(result, Err(BridgeError::ServerUnavailable { .. })));
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn properties_follow_channel_count() {
        let server = SimulatedServer::new();
        let source =
            JackInput::create(&settings(3), SourceContext::new("Mic", Arc::new(server))).unwrap();
        let properties = source.properties();
        assert_eq!(properties.len(), 2 + MAX_CHANNELS);
        assert!(properties.get("ports connected to channel 3").unwrap().visible);
        assert!(!properties.get("ports connected to channel 4").unwrap().visible);
        assert_eq!(
            properties.get(CHANNELS_KEY).unwrap().kind,
            PropertyKind::Int {
                min: 1,
                max: 8,
                step: 1
            }
        );
    }

    #[test]
    fn rename_rebuilds_client() {
        let server = SimulatedServer::new();
        let mut source = JackInput::create(
            &settings(1),
            SourceContext::new("Mic", Arc::new(server.clone())),
        )
        .unwrap();
        let before = server.client_names();
        let diff = source.rename("Vocals").unwrap();
        assert!(diff.device_name);
        assert_eq!(source.display_name(), "Vocals");
        let after = server.client_names();
        assert_eq!(after.len(), 1);
        assert_ne!(before, after);
        assert!(after[0].starts_with("Vocals-"));
    }

    #[test]
    fn destroy_releases_client() {
        let server = SimulatedServer::new();
        let source = JackInput::create(
            &settings(4),
            SourceContext::new("Mic", Arc::new(server.clone())),
        )
        .unwrap();
        assert_eq!(server.registered_port_count(), 4);
        source.destroy();
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.registered_port_count(), 0);
    }
}
