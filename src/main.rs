//! endpoint-bench - mmap Endpoint 压力测试工具
//!
//! 在虚拟 mmap 设备上跑一个完整的 Endpoint：
//! - render：若干客户端线程写正弦波 span，Endpoint 混音到设备 buffer
//! - capture：虚拟硬件写正弦波，Endpoint 分发给每个客户端
//!
//! 结束时输出 Endpoint 统计和虚拟硬件观察到的数据。

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use audio_endpoint::audio::timing::relative_sleep;
use audio_endpoint::{
    AudioStreamInfo, AudioStreamType, ClientStream, DeviceDescriptor, DeviceRole, DeviceType,
    Endpoint, EndpointConfig, EndpointType, HardwareIoAdapter, ProcessStream, SampleFormat,
    VirtualDevice, VirtualDeviceConfig, VolumeRamp,
};

/// Endpoint bench - run a mmap audio endpoint against a virtual device
#[derive(Parser)]
#[command(name = "endpoint-bench")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000")]
    rate: u32,

    /// Channel count
    #[arg(short, long, default_value = "2")]
    channels: u16,

    /// Frames per span
    #[arg(short, long, default_value = "240")]
    span: u32,

    /// Spans in the device buffer
    #[arg(long, default_value = "4")]
    spans: u32,

    /// Run time in seconds (0 = until Ctrl+C)
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Number of client streams
    #[arg(short = 'n', long, default_value = "1")]
    clients: usize,

    /// Capture instead of render
    #[arg(long)]
    capture: bool,

    /// Tone frequency in Hz
    #[arg(short, long, default_value = "440")]
    tone: f32,

    /// Per-client gain (0.0 - 1.0)
    #[arg(short, long, default_value = "0.5")]
    gain: f32,

    /// Do not request realtime priority for the endpoint thread
    #[arg(long)]
    no_realtime: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    if cli.clients == 0 {
        anyhow::bail!("need at least one client stream");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    run_bench(&cli, running)
}

fn run_bench(cli: &Cli, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let role = if cli.capture {
        DeviceRole::Input
    } else {
        DeviceRole::Output
    };
    let device_type = if cli.capture {
        DeviceType::Mic
    } else {
        DeviceType::Speaker
    };
    let format = SampleFormat::S16Le;
    let info = AudioStreamInfo::new(cli.rate, cli.channels, format);

    let device = Arc::new(VirtualDevice::new(VirtualDeviceConfig {
        span_frames: cli.span,
        span_count: cli.spans,
        simulate_hardware: true,
        tone_hz: cli.tone,
    }));
    let descriptor = DeviceDescriptor::local(role, device_type, cli.rate, cli.channels, format);

    let config = EndpointConfig {
        realtime_priority: !cli.no_realtime,
        max_linked_streams: cli.clients.max(EndpointConfig::default().max_linked_streams),
        ..EndpointConfig::default()
    };
    let mut endpoint = Endpoint::new(
        EndpointType::Mmap,
        Arc::clone(&device) as Arc<dyn HardwareIoAdapter>,
        config,
    );
    endpoint
        .config(&descriptor)
        .context("failed to configure endpoint")?;

    println!("Endpoint Bench - {} {}", role, info);
    println!(
        "Span: {} frames ({:.2} ms) x {}, clients: {}",
        cli.span,
        info.frames_to_ns(cli.span as u64) as f64 / 1_000_000.0,
        cli.spans,
        cli.clients
    );
    println!("Press Ctrl+C to stop.\n");

    let mut clients = Vec::with_capacity(cli.clients);
    for _ in 0..cli.clients {
        let client = Arc::new(ClientStream::new(info, cli.span, cli.spans, AudioStreamType::Music)?);
        let stream: Arc<dyn ProcessStream> = client.clone();
        endpoint.link_process_stream(Arc::clone(&stream))?;
        client.start();
        endpoint.on_start(&stream)?;
        clients.push((client, stream));
    }

    let received = Arc::new(AtomicU64::new(0));
    let capture = cli.capture;
    let workers: Vec<JoinHandle<()>> = clients
        .iter()
        .enumerate()
        .map(|(index, (client, _))| {
            let client = Arc::clone(client);
            let running = running.clone();
            let received = received.clone();
            let worker = ClientWorker {
                info,
                span_frames: cli.span,
                tone_hz: cli.tone * (index + 1) as f32,
                gain: cli.gain,
            };
            thread::Builder::new()
                .name(format!("client-{}", index))
                .spawn(move || {
                    if capture {
                        worker.capture(&client, &running, &received)
                    } else {
                        worker.render(&client, &running)
                    }
                })
                .context("failed to spawn client thread")
        })
        .collect::<anyhow::Result<_>>()?;

    let started = Instant::now();
    let deadline = (cli.duration > 0).then(|| Duration::from_secs(cli.duration));
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    running.store(false, Ordering::SeqCst);

    for worker in workers {
        let _ = worker.join();
    }
    for (client, stream) in &clients {
        client.pause();
        if let Err(e) = endpoint.on_pause(stream) {
            log::warn!("Pause failed: {}", e);
        }
        let (pos, time) = endpoint.on_update_handle_info(stream)?;
        log::debug!("Client handled {} frames @ {}", pos, time);
    }
    for (_, stream) in &clients {
        endpoint.unlink_process_stream(stream)?;
    }

    println!("{}", endpoint.dump());
    let counters = device.counters();
    if cli.capture {
        println!("Hardware wrote {} spans", counters.capture_spans());
        println!("Clients received {} spans", received.load(Ordering::Relaxed));
    } else {
        println!(
            "Hardware read {} spans ({} with audio)",
            counters.render_spans(),
            counters.nonsilent_render_spans()
        );
    }
    println!("Elapsed: {:.2} s", started.elapsed().as_secs_f64());

    endpoint.release();
    Ok(())
}

/// 客户端线程：按 span 节奏读写自己的 ring buffer
struct ClientWorker {
    info: AudioStreamInfo,
    span_frames: u32,
    tone_hz: f32,
    gain: f32,
}

impl ClientWorker {
    /// buffer 满或空时的重试间隔（四分之一 span）
    fn retry_ns(&self) -> i64 {
        (self.info.frames_to_ns(self.span_frames as u64) / 4).max(100_000)
    }

    fn render(&self, client: &ClientStream, running: &AtomicBool) {
        let channels = self.info.channels as usize;
        let amplitude = self.info.format.max_value() as f32 * 0.8;
        let step = self.tone_hz / self.info.sample_rate as f32;
        let mut phase = 0.0f32;
        let mut samples = vec![0i32; self.span_frames as usize * channels];
        let mut bytes = vec![0u8; client.span_bytes()];
        let ramp = VolumeRamp::from_gain(self.gain, self.gain);

        let mut pending = false;
        while running.load(Ordering::Relaxed) {
            if !pending {
                for frame in samples.chunks_exact_mut(channels) {
                    let value = ((phase * TAU).sin() * amplitude) as i32;
                    frame.fill(value);
                    phase = (phase + step).fract();
                }
                self.info.samples_to_bytes(&samples, &mut bytes);
                pending = true;
            }
            match client.write_span(&bytes, ramp, false) {
                Ok(true) => pending = false,
                Ok(false) => relative_sleep(self.retry_ns()),
                Err(e) => {
                    log::error!("Client write failed: {}", e);
                    break;
                }
            }
        }
    }

    fn capture(&self, client: &ClientStream, running: &AtomicBool, received: &AtomicU64) {
        let mut bytes = vec![0u8; client.span_bytes()];
        let silence = self.info.format.silence_byte();
        while running.load(Ordering::Relaxed) {
            match client.read_span(&mut bytes) {
                Ok(true) => {
                    if bytes.iter().any(|&b| b != silence) {
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(false) => relative_sleep(self.retry_ns()),
                Err(e) => {
                    log::error!("Client read failed: {}", e);
                    break;
                }
            }
        }
    }
}
