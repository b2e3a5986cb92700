use std::sync::Arc;
use std::time::Duration;

use jack_capture::config::BridgeOptions;
use jack_capture::probe::rms;
use jack_capture::ring::{HandoffBuffer, MIN_CAPACITY_FRAMES};
use jack_capture::server::{SimulatedServer, SourceSignal};
use jack_capture::{ClientManager, LifecycleState, RuntimeConfig};

#[test]
fn overruns_count_dropping_pushes_and_pulls_stay_full_length() {
    let ring = HandoffBuffer::new(MIN_CAPACITY_FRAMES);
    let block = vec![0.5f32; 256];
    for _ in 0..10 {
        ring.push(&block);
    }
    let stats = ring.stats();
    assert_eq!(stats.overruns, 8);
    assert_eq!(stats.dropped_frames, 8 * 256);

    let mut out = vec![1.0f32; 1_024];
    let report = ring.pull(&mut out);
    assert_eq!(report.read + report.padded, out.len());
    assert_eq!(report.read, MIN_CAPACITY_FRAMES);
    assert!(out[..MIN_CAPACITY_FRAMES].iter().all(|s| *s == 0.5));
    assert!(out[MIN_CAPACITY_FRAMES..].iter().all(|s| *s == 0.0));
    assert_eq!(ring.underruns(), 1);

    let report = ring.pull(&mut out);
    assert_eq!(report.padded, out.len());
    assert_eq!(ring.underruns(), 2);
}

#[test]
fn unbound_channel_stays_silent_while_bound_ones_carry_audio() {
    let server = SimulatedServer::new()
        .with_buffer_size(256)
        .with_source("system:capture_1", SourceSignal::Constant(0.1))
        .with_source("system:capture_2", SourceSignal::Constant(-0.2));
    let manager = ClientManager::new(Arc::new(server.clone()), BridgeOptions::default(), None);
    manager
        .activate(
            RuntimeConfig::new("Desk", 3)
                .with_ports(0, ["system:capture_1"])
                .with_ports(1, ["system:capture_2"]),
        )
        .unwrap();
    let mut output = manager.output();

    let mut first = vec![0.0f32; 256];
    let mut second = vec![0.0f32; 256];
    let mut third = vec![1.0f32; 256];
    for _ in 0..16 {
        server.run_cycle();
        output.pull_all(&mut [
            first.as_mut_slice(),
            second.as_mut_slice(),
            third.as_mut_slice(),
        ]);
        assert!(first.iter().all(|s| *s == 0.1));
        assert!(second.iter().all(|s| *s == -0.2));
        assert!(third.iter().all(|s| *s == 0.0));
    }
    let status = manager.status(0);
    assert_eq!(status.channels[2].underruns, 0);
    assert_eq!(status.channels[2].overruns, 0);
}

#[test]
fn channels_beyond_configured_count_are_silent() {
    let server = SimulatedServer::new().with_source("system:capture_1", SourceSignal::Constant(0.3));
    let manager = ClientManager::new(Arc::new(server.clone()), BridgeOptions::default(), None);
    manager
        .activate(RuntimeConfig::new("Mono", 1).with_ports(0, ["system:capture_1"]))
        .unwrap();
    let mut output = manager.output();
    server.run_cycle();
    let mut out = vec![1.0f32; 64];
    let report = output.pull(5, &mut out);
    assert_eq!(report.padded, 64);
    assert!(out.iter().all(|s| *s == 0.0));
}

#[test]
fn clocked_server_streams_without_faults() {
    let server = SimulatedServer::new()
        .with_buffer_size(128)
        .with_source(
            "system:capture_1",
            SourceSignal::Tone {
                frequency_hz: 440.0,
                amplitude: 0.5,
            },
        );
    let manager = ClientManager::new(Arc::new(server.clone()), BridgeOptions::default(), None);
    manager
        .activate(RuntimeConfig::new("Clocked", 1).with_ports(0, ["system:capture_1"]))
        .unwrap();
    let mut output = manager.output();

    let clock = server.spawn_clock();
    let mut captured = Vec::new();
    let mut block = vec![0.0f32; 128];
    for _ in 0..60 {
        std::thread::sleep(Duration::from_millis(3));
        let report = output.pull(0, &mut block);
        captured.extend_from_slice(&block[..report.read]);
    }
    clock.stop();

    let status = manager.status(0);
    assert_eq!(manager.state(), LifecycleState::Active);
    assert!(status.cycles > 0);
    assert_eq!(status.faults, 0);
    assert!(!captured.is_empty());
    assert!(rms(&captured) > 0.1);
}

#[test]
fn two_channels_deliver_fed_samples_exactly() {
    const FRAMES: usize = 64;
    const CYCLES: usize = 4;
    let server = SimulatedServer::new()
        .with_buffer_size(FRAMES as u32)
        .with_source("system:capture_1", SourceSignal::Silence)
        .with_source("system:capture_2", SourceSignal::Silence);
    let left: Vec<f32> = (0..FRAMES * CYCLES).map(|i| i as f32 / 1_000.0).collect();
    let right: Vec<f32> = (0..FRAMES * CYCLES).map(|i| -(i as f32) / 3_000.0).collect();
    server.feed("system:capture_1", &left).unwrap();
    server.feed("system:capture_2", &right).unwrap();

    let manager = ClientManager::new(Arc::new(server.clone()), BridgeOptions::default(), None);
    manager
        .activate(
            RuntimeConfig::new("Stereo", 2)
                .with_ports(0, ["system:capture_1"])
                .with_ports(1, ["system:capture_2"]),
        )
        .unwrap();
    let mut output = manager.output();

    let mut out = vec![0.0f32; FRAMES];
    for cycle in 0..CYCLES {
        server.run_cycle();
        let span = cycle * FRAMES..(cycle + 1) * FRAMES;
        assert_eq!(output.pull(0, &mut out).read, FRAMES);
        assert_eq!(out, left[span.clone()]);
        assert_eq!(output.pull(1, &mut out).read, FRAMES);
        assert_eq!(out, right[span]);
    }
    assert!(server.feed("system:missing", &left).is_err());
}

#[test]
fn server_rate_change_retunes_host_conversion() {
    let server = SimulatedServer::new()
        .with_buffer_size(256)
        .with_source("system:capture_1", SourceSignal::Constant(0.5));
    let manager = ClientManager::new(Arc::new(server.clone()), BridgeOptions::default(), None);
    manager
        .activate(RuntimeConfig::new("Mic", 1).with_ports(0, ["system:capture_1"]))
        .unwrap();
    let mut output = manager.output();
    assert_eq!(manager.status(0).sample_rate, 48_000);

    server.set_sample_rate(24_000);
    assert_eq!(manager.poll_events(), 1);
    assert_eq!(manager.state(), LifecycleState::Active);
    assert_eq!(manager.status(0).sample_rate, 24_000);

    server.run_cycles(4);
    let mut out = vec![0.0f32; 1_024];
    let report = output.pull(0, &mut out);
    assert_eq!(report.read, 1_024);
    assert_eq!(report.padded, 0);
    assert!(out[2..].iter().all(|s| *s == 0.5));
    // Upsampling by two consumes half as many server frames.
    let status = manager.status(0);
    let buffered = status.channels[0].buffer_fill * status.capacity_frames as f32;
    assert_eq!(buffered, 512.0);
}
