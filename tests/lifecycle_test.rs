use std::sync::Arc;

use parking_lot::Mutex;

use jack_capture::config::{CHANNELS_KEY, START_SERVER_KEY};
use jack_capture::server::{SimulatedServer, SourceSignal};
use jack_capture::{
    BridgeError, BridgeOptions, ClientManager, JackInput, LifecycleState, RuntimeConfig, Settings,
    SourceContext, SourceInfo,
};

const BLOCK_FRAMES: usize = 128;

fn server() -> SimulatedServer {
    SimulatedServer::new()
        .with_buffer_size(BLOCK_FRAMES as u32)
        .with_source("system:capture_1", SourceSignal::Silence)
        .with_source("system:capture_2", SourceSignal::Silence)
}

fn manager(server: &SimulatedServer) -> ClientManager {
    ClientManager::new(Arc::new(server.clone()), BridgeOptions::default(), None)
}

#[test]
fn activate_then_deactivate_leaves_nothing_behind() {
    let server = server();
    for channels in 1..=8 {
        let manager = manager(&server);
        manager
            .activate(RuntimeConfig::new("Mic", channels))
            .unwrap_or_else(|err| panic!("{channels} channels: {err}"));
        assert_eq!(server.registered_port_count(), channels);
        manager.deactivate();
        assert_eq!(manager.state(), LifecycleState::Inactive);
        assert_eq!(server.registered_port_count(), 0, "{channels} channels");
        assert_eq!(server.client_count(), 0, "{channels} channels");
    }
}

#[test]
fn reconfiguring_channel_count_replaces_every_port() {
    let server = server();
    let manager = manager(&server);
    manager.activate(RuntimeConfig::new("Mic", 6)).unwrap();
    assert_eq!(server.registered_port_count(), 6);

    let diff = manager.reconfigure(RuntimeConfig::new("Mic", 3)).unwrap();
    assert!(diff.channels);
    assert_eq!(server.registered_port_count(), 3);
    assert_eq!(server.client_count(), 1);
    assert_eq!(manager.output().channels(), 3);

    manager.reconfigure(RuntimeConfig::new("Mic", 8)).unwrap();
    assert_eq!(server.registered_port_count(), 8);
    assert_eq!(manager.output().channels(), 8);
}

#[test]
fn port_list_change_rebinds_without_rebuilding() {
    let server = server();
    let manager = manager(&server);
    manager
        .activate(RuntimeConfig::new("Mic", 2).with_ports(0, ["system:capture_1"]))
        .unwrap();
    let client = server.client_names().remove(0);

    let diff = manager
        .reconfigure(
            RuntimeConfig::new("Mic", 2)
                .with_ports(0, ["system:capture_2"])
                .with_ports(1, ["system:capture_1"]),
        )
        .unwrap();
    assert!(!diff.requires_rebuild());
    assert_eq!(diff.ports_changed, vec![0, 1]);
    assert_eq!(server.client_names(), vec![client.clone()]);
    assert_eq!(
        server.connections_to(&format!("{client}:in_1")),
        vec!["system:capture_2".to_string()]
    );
    assert_eq!(
        server.connections_to(&format!("{client}:in_2")),
        vec!["system:capture_1".to_string()]
    );
}

#[test]
fn unchanged_settings_are_a_noop() {
    let server = server();
    let manager = manager(&server);
    let config = RuntimeConfig::new("Mic", 2).with_ports(1, ["system:capture_2"]);
    manager.activate(config.clone()).unwrap();
    let before = server.client_names();
    let diff = manager.reconfigure(config).unwrap();
    assert!(diff.is_empty());
    assert_eq!(server.client_names(), before);
}

#[test]
fn missing_port_keeps_channel_silent() {
    let server = server();
    let manager = manager(&server);
    let config = RuntimeConfig::new("Mic", 2)
        .with_ports(0, ["system:capture_1"])
        .with_ports(1, ["system:does_not_exist"]);
    manager.activate(config).unwrap();
    assert_eq!(manager.state(), LifecycleState::Active);
    let bindings = manager.active_bindings();
    assert!(bindings.contains_key(&0));
    assert!(!bindings.contains_key(&1));
}

#[test]
fn unbinding_never_bound_slot_is_noop() {
    let server = server();
    let manager = manager(&server);
    manager.activate(RuntimeConfig::new("Mic", 3)).unwrap();
    manager.unbind(2).unwrap();
    manager.unbind(2).unwrap();
    assert!(matches!(
        manager.unbind(3),
        Err(BridgeError::InvalidSlot { slot: 3, channels: 3 })
    ));
}

#[test]
fn bind_at_runtime_feeds_slot() {
    let server = SimulatedServer::new()
        .with_buffer_size(BLOCK_FRAMES as u32)
        .with_source("system:capture_1", SourceSignal::Constant(0.25));
    let manager = manager(&server);
    manager.activate(RuntimeConfig::new("Mic", 1)).unwrap();
    let mut output = manager.output();

    server.run_cycle();
    let mut out = vec![1.0f32; BLOCK_FRAMES];
    output.pull(0, &mut out);
    assert!(out.iter().all(|s| *s == 0.0));

    let report = manager.bind(0, &["system:capture_1".to_string()]).unwrap();
    assert_eq!(report.connected, vec!["system:capture_1".to_string()]);
    server.run_cycle();
    output.pull(0, &mut out);
    assert!(out.iter().all(|s| *s == 0.25));
    assert_eq!(
        manager.applied_config().unwrap().ports_for(0),
        ["system:capture_1"]
    );
}

#[test]
fn server_shutdown_moves_to_error_and_silences_output() {
    let server = SimulatedServer::new()
        .with_buffer_size(BLOCK_FRAMES as u32)
        .with_source("system:capture_1", SourceSignal::Constant(0.5));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let manager = ClientManager::new(
        Arc::new(server.clone()),
        BridgeOptions::default(),
        Some(Arc::new(move |state: LifecycleState| log.lock().push(state))),
    );
    manager
        .activate(RuntimeConfig::new("Mic", 1).with_ports(0, ["system:capture_1"]))
        .unwrap();
    let mut output = manager.output();
    server.run_cycles(2);

    server.shutdown("killed");
    assert_eq!(manager.state(), LifecycleState::Error);
    assert_eq!(seen.lock().last(), Some(&LifecycleState::Error));

    let mut out = vec![1.0f32; BLOCK_FRAMES];
    let report = output.pull(0, &mut out);
    assert_eq!(report.padded, BLOCK_FRAMES);
    assert!(out.iter().all(|s| *s == 0.0));

    assert_eq!(manager.poll_events(), 1);
    assert_eq!(manager.state(), LifecycleState::Error);
    assert_eq!(server.client_count(), 0);
    assert!(manager.last_error().unwrap().contains("killed"));

    manager.deactivate();
    assert_eq!(manager.state(), LifecycleState::Inactive);
}

#[test]
fn block_size_growth_rebuilds_buffers() {
    let server = server();
    let manager = manager(&server);
    manager.activate(RuntimeConfig::new("Mic", 2)).unwrap();
    let small = manager.status(0).capacity_frames;

    server.set_buffer_size(8_192);
    manager.poll_events();
    let status = manager.status(0);
    assert_eq!(manager.state(), LifecycleState::Active);
    assert_eq!(status.block_frames, 8_192);
    assert!(status.capacity_frames >= 2 * 8_192);
    assert!(status.capacity_frames > small);
    assert_eq!(server.registered_port_count(), 2);
}

#[test]
fn port_rename_is_followed() {
    let server = server();
    let manager = manager(&server);
    manager
        .activate(RuntimeConfig::new("Mic", 1).with_ports(0, ["system:capture_1"]))
        .unwrap();
    server.rename_source("system:capture_1", "system:mic").unwrap();
    manager.poll_events();
    assert_eq!(manager.active_bindings()[&0], vec!["system:mic".to_string()]);

    server.remove_source("system:mic").unwrap();
    manager.poll_events();
    assert!(manager.active_bindings().is_empty());
}

#[test]
fn source_lifecycle_through_host_contract() {
    let server = server();
    let mut settings = Settings::new();
    JackInput::defaults(&mut settings);
    settings.set_channel_ports(0, ["system:capture_1"]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let context = SourceContext::new("Desk", Arc::new(server.clone()))
        .with_listener(Arc::new(move |state: LifecycleState| log.lock().push(state)));
    let mut source = JackInput::create(&settings, context).unwrap();
    assert_eq!(source.state(), LifecycleState::Active);
    assert_eq!(
        seen.lock().as_slice(),
        [LifecycleState::Connecting, LifecycleState::Active]
    );
    assert_eq!(server.registered_port_count(), 2);
    assert!(
        jack_capture::source_statuses()
            .iter()
            .any(|status| status.id == source.id())
    );

    settings.set_int(CHANNELS_KEY, 4);
    settings.set_bool(START_SERVER_KEY, true);
    let diff = source.update(&settings).unwrap();
    assert!(diff.channels && diff.start_server);
    assert_eq!(server.registered_port_count(), 4);

    let id = source.id();
    source.destroy();
    assert_eq!(server.client_count(), 0);
    assert_eq!(seen.lock().last(), Some(&LifecycleState::Inactive));
    assert!(
        !jack_capture::source_statuses()
            .iter()
            .any(|status| status.id == id)
    );
}

#[test]
fn failed_port_registration_rolls_back_earlier_ports() {
    let server = server().with_port_limit(2);
    let manager = manager(&server);
    let err = manager.activate(RuntimeConfig::new("Mic", 4)).unwrap_err();
    assert!(matches!(err, BridgeError::PortRegistration { .. }));
    assert_eq!(manager.state(), LifecycleState::Error);
    assert_eq!(server.registered_port_count(), 0);
    assert_eq!(server.client_count(), 0);

    manager.activate(RuntimeConfig::new("Mic", 2)).unwrap();
    assert_eq!(server.registered_port_count(), 2);
}

#[test]
fn refused_activation_rolls_back_every_port() {
    let server = server();
    let manager = manager(&server);
    server.refuse_activation(true);
    let err = manager
        .activate(RuntimeConfig::new("Mic", 3).with_ports(0, ["system:capture_1"]))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Backend(_)));
    assert_eq!(manager.state(), LifecycleState::Error);
    assert!(manager.last_error().is_some());
    assert_eq!(server.registered_port_count(), 0);
    assert_eq!(server.client_count(), 0);
    assert_eq!(manager.output().channels(), 0);

    server.refuse_activation(false);
    manager.activate(RuntimeConfig::new("Mic", 3)).unwrap();
    assert_eq!(manager.state(), LifecycleState::Active);
    assert_eq!(server.registered_port_count(), 3);
}

#[test]
fn failed_rebuild_after_block_growth_reports_error() {
    let server = server();
    let manager = manager(&server);
    manager.activate(RuntimeConfig::new("Mic", 2)).unwrap();

    server.refuse_activation(true);
    server.set_buffer_size(8_192);
    manager.poll_events();
    assert_eq!(manager.state(), LifecycleState::Error);
    assert!(manager.last_error().unwrap().contains("refused"));
    assert_eq!(server.client_count(), 0);
    assert_eq!(server.registered_port_count(), 0);
}

#[test]
fn callback_quit_moves_source_to_error() {
    let server = SimulatedServer::new()
        .with_buffer_size(BLOCK_FRAMES as u32)
        .with_source("system:capture_1", SourceSignal::Constant(0.5));
    let manager = manager(&server);
    manager
        .activate(RuntimeConfig::new("Mic", 2).with_ports(0, ["system:capture_1"]))
        .unwrap();
    let mut output = manager.output();
    let port = manager.status(0).channels[1].port_name.clone().unwrap();

    server.evict_port(&port).unwrap();
    server.run_cycle();
    assert_eq!(server.active_client_count(), 0);

    manager.poll_events();
    assert_eq!(manager.state(), LifecycleState::Error);
    assert!(manager.last_error().unwrap().contains("port table"));
    assert_eq!(server.client_count(), 0);

    let mut out = vec![1.0f32; BLOCK_FRAMES];
    assert_eq!(output.pull(0, &mut out).padded, BLOCK_FRAMES);
    assert!(out.iter().all(|s| *s == 0.0));

    manager.deactivate();
    assert_eq!(manager.state(), LifecycleState::Inactive);
}
