//! Host settings, runtime configuration and change detection.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

use crate::MAX_CHANNELS;

/// Settings key holding the channel count.
pub const CHANNELS_KEY: &str = "channels";
/// Settings key holding the auto-start flag.
pub const START_SERVER_KEY: &str = "startjack";
/// Channel count used when the host has none stored.
pub const DEFAULT_CHANNELS: i64 = 2;

/// Default bound on opening a client (including a server auto-start).
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Default ring headroom, in multiples of the larger block size.
pub const DEFAULT_HEADROOM: usize = 4;
/// Default host sample rate.
pub const DEFAULT_HOST_SAMPLE_RATE: u32 = 48_000;
/// Default host pull size in frames.
pub const DEFAULT_HOST_BLOCK_FRAMES: usize = 1_024;

const CHANNEL_PORT_KEYS: [&str; MAX_CHANNELS] = [
    "ports connected to channel 1",
    "ports connected to channel 2",
    "ports connected to channel 3",
    "ports connected to channel 4",
    "ports connected to channel 5",
    "ports connected to channel 6",
    "ports connected to channel 7",
    "ports connected to channel 8",
];

/// Settings key listing the ports connected to `slot` (0-based).
pub fn channel_ports_key(slot: usize) -> Option<&'static str> {
    CHANNEL_PORT_KEYS.get(slot).copied()
}

/// A single stored setting.
#[derive(Clone, Debug, PartialEq)]
pub enum SettingValue {
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// Ordered list of strings.
    List(Vec<String>),
}

/// Host-owned key/value settings with a defaults layer. Lookups fall back to
/// the default when no explicit value is stored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    values: BTreeMap<String, SettingValue>,
    defaults: BTreeMap<String, SettingValue>,
}

impl Settings {
    /// Empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key).or_else(|| self.defaults.get(key))
    }

    /// Integer value or 0.
    pub fn get_int(&self, key: &str) -> i64 {
        match self.lookup(key) {
            Some(SettingValue::Int(value)) => *value,
            _ => 0,
        }
    }

    /// Boolean value or `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.lookup(key), Some(SettingValue::Bool(true)))
    }

    /// List value or empty.
    pub fn get_list(&self, key: &str) -> &[String] {
        match self.lookup(key) {
            Some(SettingValue::List(value)) => value,
            _ => &[],
        }
    }

    /// Store an integer.
    pub fn set_int(&mut self, key: &str, value: i64) {
        self.values.insert(key.into(), SettingValue::Int(value));
    }

    /// Store a boolean.
    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.into(), SettingValue::Bool(value));
    }

    /// Store a list.
    pub fn set_list<I, S>(&mut self, key: &str, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.values.insert(key.into(), SettingValue::List(items));
    }

    /// Register a default integer.
    pub fn set_default_int(&mut self, key: &str, value: i64) {
        self.defaults.insert(key.into(), SettingValue::Int(value));
    }

    /// Register a default boolean.
    pub fn set_default_bool(&mut self, key: &str, value: bool) {
        self.defaults.insert(key.into(), SettingValue::Bool(value));
    }

    /// Set the ports feeding `slot`. Out-of-range slots are ignored.
    pub fn set_channel_ports<I, S>(&mut self, slot: usize, ports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(key) = channel_ports_key(slot) {
            self.set_list(key, ports);
        }
    }
}

/// Configuration the lifecycle manager activates with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Host-visible source name; also the base of the client name.
    pub device_name: String,
    /// Ask the server library to auto-start a server.
    pub start_server: bool,
    /// Number of channel slots (1..=8).
    pub channels: usize,
    /// Requested external ports per slot; `ports.len() == channels`.
    pub ports: Vec<Vec<String>>,
}

impl RuntimeConfig {
    /// Configuration with `channels` unconnected slots.
    pub fn new(device_name: &str, channels: usize) -> Self {
        Self {
            device_name: device_name.to_string(),
            start_server: false,
            channels,
            ports: vec![Vec::new(); channels],
        }
    }

    /// Request auto-start.
    pub fn with_start_server(mut self, start: bool) -> Self {
        self.start_server = start;
        self
    }

    /// Set the ports feeding `slot`. Out-of-range slots are ignored.
    pub fn with_ports<I, S>(mut self, slot: usize, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(list) = self.ports.get_mut(slot) {
            *list = ports.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Read the configuration from host settings. Out-of-range channel counts
    /// are clamped to 1..=8.
    pub fn from_settings(settings: &Settings, device_name: &str) -> Self {
        let requested = settings.get_int(CHANNELS_KEY);
        let channels = requested.clamp(1, MAX_CHANNELS as i64) as usize;
        if requested != channels as i64 {
            warn!(requested, channels, "channel count out of range, clamping");
        }
        let ports = (0..channels)
            .map(|slot| {
                channel_ports_key(slot)
                    .map(|key| {
                        settings
                            .get_list(key)
                            .iter()
                            .map(|name| name.trim().to_string())
                            .filter(|name| !name.is_empty())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();
        Self {
            device_name: device_name.to_string(),
            start_server: settings.get_bool(START_SERVER_KEY),
            channels,
            ports,
        }
    }

    /// Pad or truncate the port lists to one entry per slot.
    pub fn fit_ports(&mut self) {
        let slots = self.channels.min(MAX_CHANNELS);
        self.ports.resize_with(slots, Vec::new);
    }

    /// Ports requested for `slot`.
    pub fn ports_for(&self, slot: usize) -> &[String] {
        self.ports.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Field-by-field difference between two configurations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    /// Channel count changed.
    pub channels: bool,
    /// Auto-start flag changed.
    pub start_server: bool,
    /// Device name changed.
    pub device_name: bool,
    /// Slots whose port list changed (only slots present in both).
    pub ports_changed: Vec<usize>,
}

impl ConfigDiff {
    /// Nothing changed.
    pub fn is_empty(&self) -> bool {
        !self.requires_rebuild() && self.ports_changed.is_empty()
    }

    /// The change needs a full deactivate + activate.
    pub fn requires_rebuild(&self) -> bool {
        self.channels || self.start_server || self.device_name
    }
}

/// Holds the applied configuration and compares incoming ones against it.
#[derive(Debug, Default)]
pub struct ConfigSurface {
    applied: Option<RuntimeConfig>,
}

impl ConfigSurface {
    /// Surface with nothing applied.
    pub fn new() -> Self {
        Self::default()
    }

    /// The configuration currently in effect.
    pub fn applied(&self) -> Option<&RuntimeConfig> {
        self.applied.as_ref()
    }

    /// Compare `incoming` with the applied configuration. With nothing
    /// applied every field counts as changed.
    pub fn stage(&self, incoming: &RuntimeConfig) -> ConfigDiff {
        let Some(applied) = &self.applied else {
            return ConfigDiff {
                channels: true,
                start_server: true,
                device_name: true,
                ports_changed: (0..incoming.channels).collect(),
            };
        };
        let shared = applied.channels.min(incoming.channels);
        ConfigDiff {
            channels: applied.channels != incoming.channels,
            start_server: applied.start_server != incoming.start_server,
            device_name: applied.device_name != incoming.device_name,
            ports_changed: (0..shared)
                .filter(|&slot| applied.ports_for(slot) != incoming.ports_for(slot))
                .collect(),
        }
    }

    /// Make `config` the applied configuration.
    pub fn commit(&mut self, config: RuntimeConfig) {
        self.applied = Some(config);
    }
}

/// Bridge tuning supplied by the embedding host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Bound on opening a client.
    pub open_timeout: Duration,
    /// Ring headroom in multiples of the larger block size (at least 2).
    pub headroom: usize,
    /// Rate at which the host pulls audio.
    pub host_sample_rate: u32,
    /// Largest pull the host makes, in host frames.
    pub host_block_frames: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            headroom: DEFAULT_HEADROOM,
            host_sample_rate: DEFAULT_HOST_SAMPLE_RATE,
            host_block_frames: DEFAULT_HOST_BLOCK_FRAMES,
        }
    }
}

impl BridgeOptions {
    /// Override the open timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Override the ring headroom.
    pub fn with_headroom(mut self, headroom: usize) -> Self {
        self.headroom = headroom.max(2);
        self
    }

    /// Override the host pull rate and block size.
    pub fn with_host_format(mut self, sample_rate: u32, block_frames: usize) -> Self {
        self.host_sample_rate = sample_rate;
        self.host_block_frames = block_frames;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_values() {
        let mut settings = Settings::new();
        settings.set_default_int(CHANNELS_KEY, DEFAULT_CHANNELS);
        settings.set_default_bool(START_SERVER_KEY, false);
        let config = RuntimeConfig::from_settings(&settings, "Mic");
        assert_eq!(config.channels, 2);
        assert!(!config.start_server);
        assert_eq!(config.ports, vec![Vec::<String>::new(); 2]);

        settings.set_int(CHANNELS_KEY, 3);
        settings.set_bool(START_SERVER_KEY, true);
        let config = RuntimeConfig::from_settings(&settings, "Mic");
        assert_eq!(config.channels, 3);
        assert!(config.start_server);
    }

    #[test]
    fn channel_count_is_clamped() {
        let mut settings = Settings::new();
        settings.set_int(CHANNELS_KEY, 12);
        assert_eq!(RuntimeConfig::from_settings(&settings, "x").channels, 8);
        settings.set_int(CHANNELS_KEY, 0);
        assert_eq!(RuntimeConfig::from_settings(&settings, "x").channels, 1);
    }

    #[test]
    fn port_lists_are_trimmed_per_channel() {
        let mut settings = Settings::new();
        settings.set_int(CHANNELS_KEY, 2);
        settings.set_channel_ports(0, [" system:capture_1 ", ""]);
        settings.set_channel_ports(1, ["system:capture_2"]);
        settings.set_channel_ports(5, ["ignored:port"]);
        let config = RuntimeConfig::from_settings(&settings, "x");
        assert_eq!(config.ports_for(0), ["system:capture_1"]);
        assert_eq!(config.ports_for(1), ["system:capture_2"]);
        assert!(config.ports_for(5).is_empty());
    }

    #[test]
    fn fit_ports_matches_channel_count() {
        let mut short = RuntimeConfig {
            ports: Vec::new(),
            ..RuntimeConfig::new("x", 3)
        };
        short.fit_ports();
        assert_eq!(short.ports.len(), 3);

        let mut long = RuntimeConfig {
            channels: 1,
            ..RuntimeConfig::new("x", 4).with_ports(0, ["a:1"])
        };
        long.fit_ports();
        assert_eq!(long.ports, vec![vec!["a:1".to_string()]]);
    }

    #[test]
    fn diff_separates_rebuild_from_rebind() {
        let mut surface = ConfigSurface::new();
        let base = RuntimeConfig::new("Mic", 2).with_ports(0, ["a:1"]);
        assert!(surface.stage(&base).requires_rebuild());
        surface.commit(base.clone());
        assert!(surface.stage(&base).is_empty());

        let rebind = base.clone().with_ports(1, ["b:1"]);
        let diff = surface.stage(&rebind);
        assert!(!diff.requires_rebuild());
        assert_eq!(diff.ports_changed, vec![1]);

        let renamed = RuntimeConfig {
            device_name: "Mic 2".into(),
            ..base.clone()
        };
        assert!(surface.stage(&renamed).device_name);

        let grown = RuntimeConfig::new("Mic", 4);
        let diff = surface.stage(&grown);
        assert!(diff.channels);
        assert_eq!(diff.ports_changed, vec![0]);
        assert_eq!(surface.applied().map(|c| c.channels), Some(2));
    }
}
