use std::env;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use jack_capture::config::{CHANNELS_KEY, START_SERVER_KEY};
use jack_capture::server::{AudioBackend, SimulatedServer, SourceSignal};
use jack_capture::{JackInput, Settings, SourceContext, SourceInfo};

const USAGE: &str = "Usage: jackinputctl [--demo] [--status] [--jack] [--start-server] [--ports <port>,<port>...]

Without --jack the sources run against an in-process simulated server.
--status prints a snapshot and exits instead of launching the console.";

struct Args {
    demo: bool,
    status: bool,
    jack: bool,
    start_server: bool,
    ports: Vec<String>,
}

fn parse_args() -> Args {
    let mut args = Args {
        demo: false,
        status: false,
        jack: false,
        start_server: false,
        ports: Vec::new(),
    };
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--demo" => args.demo = true,
            "--status" | "-s" => args.status = true,
            "--jack" => args.jack = true,
            "--start-server" => args.start_server = true,
            "--ports" => match iter.next() {
                Some(list) => {
                    args.ports = list
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                }
                None => fail("--ports needs a value"),
            },
            "--help" | "-h" => {
                println!("{USAGE}");
                process::exit(0);
            }
            other => fail(&format!("unknown argument '{other}'")),
        }
    }
    args
}

fn fail(message: &str) -> ! {
    eprintln!("jackinputctl: {message}");
    process::exit(1);
}

fn settings(channels: usize, start_server: bool, ports: &[String]) -> Settings {
    let mut settings = Settings::new();
    JackInput::defaults(&mut settings);
    settings.set_int(CHANNELS_KEY, channels as i64);
    settings.set_bool(START_SERVER_KEY, start_server);
    for (slot, port) in ports.iter().enumerate().take(channels) {
        settings.set_channel_ports(slot, [port.as_str()]);
    }
    settings
}

/// Pulls every source at the host rate so the rings keep draining.
struct HostPump {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HostPump {
    fn start(sources: &[JackInput]) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let mut outputs: Vec<_> = sources.iter().map(JackInput::output).collect();
        let handle = std::thread::spawn(move || {
            let mut buffer = vec![0.0f32; 480];
            while flag.load(Ordering::Acquire) {
                for output in &mut outputs {
                    for channel in 0..output.channels() {
                        output.pull(channel, &mut buffer);
                    }
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        Self {
            running,
            handle: Some(handle),
        }
    }
}

impl Drop for HostPump {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn print_status() {
    let statuses = jack_capture::control::api::get_status();
    if statuses.is_empty() {
        fail("no live sources");
    }
    for status in statuses {
        println!(
            "[{}] {} | {} | backend={} | client={} | rate={} Hz | block={} | cycles={} | faults={}",
            status.id,
            status.name,
            status.state.as_str(),
            status.backend,
            status.client_name.as_deref().unwrap_or("-"),
            status.sample_rate,
            status.block_frames,
            status.cycles,
            status.faults,
        );
        if let Some(err) = &status.last_error {
            println!("    error: {err}");
        }
        for ch in &status.channels {
            println!(
                "    ch{} {} | fill={:.1}% | overruns={} | underruns={} | from={}",
                ch.index + 1,
                ch.port_name.as_deref().unwrap_or("-"),
                ch.buffer_fill * 100.0,
                ch.overruns,
                ch.underruns,
                if ch.connections.is_empty() {
                    "(silent)".to_string()
                } else {
                    ch.connections.join(", ")
                },
            );
        }
    }
    for line in jack_capture::control::api::drain_log() {
        println!("log: {line}");
    }
}

#[cfg(feature = "jack")]
fn jack_backend() -> Arc<dyn AudioBackend> {
    Arc::new(jack_capture::server::JackBackend)
}

#[cfg(not(feature = "jack"))]
fn jack_backend() -> Arc<dyn AudioBackend> {
    fail("built without the `jack` feature")
}

fn main() {
    let args = parse_args();
    if args.status {
        jack_capture::init_tracing();
    } else {
        // The console owns the terminal; events reach it through the log.
        let _ = tracing_subscriber::fmt().with_writer(std::io::sink).try_init();
    }

    let mut sources = Vec::new();
    let mut clock = None;
    if args.jack && !args.demo {
        let context = SourceContext::new("JACK Input", jack_backend());
        let channels = args.ports.len().clamp(2, jack_capture::MAX_CHANNELS);
        match JackInput::create(&settings(channels, args.start_server, &args.ports), context) {
            Ok(source) => sources.push(source),
            Err(err) => fail(&err.to_string()),
        }
    } else {
        let server = SimulatedServer::new()
            .with_source(
                "system:capture_1",
                SourceSignal::Tone {
                    frequency_hz: 440.0,
                    amplitude: 0.5,
                },
            )
            .with_source(
                "system:capture_2",
                SourceSignal::Tone {
                    frequency_hz: 660.0,
                    amplitude: 0.25,
                },
            );
        let backend: Arc<dyn AudioBackend> = Arc::new(server.clone());
        let stereo = settings(
            2,
            false,
            &["system:capture_1".into(), "system:capture_2".into()],
        );
        let mono = settings(1, false, &["system:capture_2".into()]);
        for (name, settings) in [("Stereo Mic", stereo), ("Mono Mic", mono)] {
            match JackInput::create(&settings, SourceContext::new(name, backend.clone())) {
                Ok(source) => sources.push(source),
                Err(err) => fail(&err.to_string()),
            }
        }
        clock = Some(server.spawn_clock());
    }

    let pump = HostPump::start(&sources);
    if args.status {
        std::thread::sleep(Duration::from_millis(200));
        print_status();
    } else if let Err(err) = jack_capture::control::ui::run() {
        eprintln!("jackinputctl: {err}");
        drop(pump);
        process::exit(1);
    }
    drop(pump);
    drop(clock);
    for source in sources {
        source.destroy();
    }
}
