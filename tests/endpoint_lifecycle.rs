//! Endpoint 生命周期和端到端数据流（虚拟设备）

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use audio_endpoint::device::{AdapterError, DeviceAttr, HardwarePosition, MmapBufferInfo};
use audio_endpoint::endpoint::StatusTransition;
use audio_endpoint::{
    AudioStreamInfo, AudioStreamType, ClientStream, DeviceDescriptor, DeviceRole, DeviceType,
    Endpoint, EndpointConfig, EndpointError, EndpointStatus, EndpointType, HardwareIoAdapter,
    ProcessStream, SampleFormat, VirtualDevice, VirtualDeviceConfig, VolumeRamp,
};

const RATE: u32 = 48000;
const SPAN: u32 = 240;

fn info() -> AudioStreamInfo {
    AudioStreamInfo::new(RATE, 2, SampleFormat::S16Le)
}

fn test_config(always_running: bool) -> EndpointConfig {
    EndpointConfig {
        always_running_in_idle: always_running,
        realtime_priority: false,
        lock_memory: false,
        ..EndpointConfig::default()
    }
}

fn endpoint_for(role: DeviceRole, config: EndpointConfig, simulate: bool) -> (Endpoint, Arc<VirtualDevice>) {
    let device = Arc::new(VirtualDevice::new(VirtualDeviceConfig {
        simulate_hardware: simulate,
        ..VirtualDeviceConfig::default()
    }));
    let device_type = match role {
        DeviceRole::Output => DeviceType::Speaker,
        DeviceRole::Input => DeviceType::Mic,
    };
    let descriptor = DeviceDescriptor::local(role, device_type, RATE, 2, SampleFormat::S16Le);
    let mut endpoint = Endpoint::new(
        EndpointType::Mmap,
        Arc::clone(&device) as Arc<dyn HardwareIoAdapter>,
        config,
    );
    endpoint.config(&descriptor).unwrap();
    (endpoint, device)
}

/// 启动和停止都很慢的硬件
struct SlowDevice {
    inner: Arc<VirtualDevice>,
    start_delay: Duration,
    stop_delay: Duration,
}

impl HardwareIoAdapter for SlowDevice {
    fn init(&self, attr: &DeviceAttr) -> Result<(), AdapterError> {
        self.inner.init(attr)
    }

    fn is_inited(&self) -> bool {
        self.inner.is_inited()
    }

    fn start(&self) -> Result<(), AdapterError> {
        thread::sleep(self.start_delay);
        self.inner.start()
    }

    fn stop(&self) -> Result<(), AdapterError> {
        thread::sleep(self.stop_delay);
        self.inner.stop()
    }

    fn deinit(&self) -> Result<(), AdapterError> {
        self.inner.deinit()
    }

    fn mmap_buffer_info(&self) -> Result<MmapBufferInfo, AdapterError> {
        self.inner.mmap_buffer_info()
    }

    fn mmap_position(&self) -> Result<HardwarePosition, AdapterError> {
        self.inner.mmap_position()
    }

    fn set_volume(&self, left: f32, right: f32) -> Result<(), AdapterError> {
        self.inner.set_volume(left, right)
    }
}

fn slow_endpoint(config: EndpointConfig, start_delay: Duration, stop_delay: Duration) -> (Endpoint, Arc<VirtualDevice>) {
    let device = Arc::new(VirtualDevice::new(VirtualDeviceConfig::default()));
    let slow = SlowDevice {
        inner: Arc::clone(&device),
        start_delay,
        stop_delay,
    };
    let descriptor =
        DeviceDescriptor::local(DeviceRole::Output, DeviceType::Speaker, RATE, 2, SampleFormat::S16Le);
    let mut endpoint = Endpoint::new(EndpointType::Mmap, Arc::new(slow), config);
    endpoint.config(&descriptor).unwrap();
    (endpoint, device)
}

/// 设备在运行当且仅当还有流 link 着
fn assert_device_matches_links(endpoint: &Endpoint, device: &VirtualDevice) {
    let linked = endpoint.linked_count() > 0;
    assert_eq!(device.is_running(), linked, "status {}", endpoint.status());
    assert_eq!(endpoint.is_device_started(), linked);
}

fn client() -> (Arc<ClientStream>, Arc<dyn ProcessStream>) {
    let client = Arc::new(ClientStream::new(info(), SPAN, 4, AudioStreamType::Music).unwrap());
    let stream: Arc<dyn ProcessStream> = client.clone();
    (client, stream)
}

fn tone_span() -> Vec<u8> {
    let samples: Vec<i32> = (0..SPAN as i32 * 2).map(|i| (i % 96 - 48) * 400).collect();
    let mut bytes = vec![0u8; SPAN as usize * 4];
    info().samples_to_bytes(&samples, &mut bytes);
    bytes
}

fn assert_all_legal(history: &[StatusTransition]) {
    for t in history {
        assert!(t.legal, "illegal transition {} -> {}", t.from, t.to);
        assert!(t.from.can_transition_to(t.to));
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_always_running_lifecycle() {
    let (endpoint, device) = endpoint_for(DeviceRole::Output, test_config(true), false);
    let (client, stream) = client();

    endpoint.link_process_stream(Arc::clone(&stream)).unwrap();
    // 设备在 link 时就启动，但没有流在播放
    assert_eq!(endpoint.status(), EndpointStatus::Idle);
    assert!(endpoint.is_device_started());
    assert!(device.is_running());

    client.start();
    endpoint.on_start(&stream).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Running);

    client.pause();
    endpoint.on_pause(&stream).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Idle);

    endpoint.unlink_process_stream(&stream).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Unlinked);
    assert!(!endpoint.is_device_started());
    assert!(!device.is_running());

    let history = endpoint.status_history();
    assert_all_legal(&history);
    let path: Vec<EndpointStatus> = history.iter().map(|t| t.to).collect();
    assert!(path.contains(&EndpointStatus::Starting));
    assert!(path.ends_with(&[
        EndpointStatus::Stopping,
        EndpointStatus::Stopped,
        EndpointStatus::Unlinked
    ]));
}

#[test]
fn test_on_demand_start() {
    let (endpoint, device) = endpoint_for(DeviceRole::Output, test_config(false), false);
    let (client, stream) = client();

    endpoint.link_process_stream(Arc::clone(&stream)).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Idle);
    assert!(!device.is_running());

    client.start();
    endpoint.on_start(&stream).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Running);
    assert!(device.is_running());

    endpoint.unlink_process_stream(&stream).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Unlinked);
    assert_all_legal(&endpoint.status_history());
}

#[test]
fn test_link_running_stream_starts_running() {
    let (endpoint, _device) = endpoint_for(DeviceRole::Output, test_config(false), false);
    let (client, stream) = client();
    client.start();

    endpoint.link_process_stream(stream).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Running);
}

#[test]
fn test_start_failure_rolls_back_link() {
    let (endpoint, device) = endpoint_for(DeviceRole::Output, test_config(true), false);
    device.set_fail_start(true);
    let (_client, stream) = client();

    assert!(matches!(
        endpoint.link_process_stream(Arc::clone(&stream)),
        Err(EndpointError::Adapter(_))
    ));
    assert_eq!(endpoint.linked_count(), 0);
    assert_eq!(endpoint.status(), EndpointStatus::Unlinked);
    assert!(!endpoint.is_device_started());
    assert_all_legal(&endpoint.status_history());

    // 恢复后可以重新 link
    device.set_fail_start(false);
    endpoint.link_process_stream(stream).unwrap();
    assert!(endpoint.is_device_started());
}

#[test]
fn test_second_stream_keeps_device_running() {
    let (endpoint, device) = endpoint_for(DeviceRole::Output, test_config(true), false);
    let (_a, stream_a) = client();
    let (_b, stream_b) = client();

    endpoint.link_process_stream(Arc::clone(&stream_a)).unwrap();
    endpoint.link_process_stream(Arc::clone(&stream_b)).unwrap();
    assert_eq!(endpoint.linked_count(), 2);

    endpoint.unlink_process_stream(&stream_a).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Idle);
    assert!(device.is_running());

    endpoint.unlink_process_stream(&stream_b).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Unlinked);
    assert!(!device.is_running());
}

#[test]
fn test_render_reaches_hardware() {
    let (endpoint, device) = endpoint_for(DeviceRole::Output, test_config(true), true);
    let (client, stream) = client();
    endpoint.link_process_stream(Arc::clone(&stream)).unwrap();
    client.start();
    endpoint.on_start(&stream).unwrap();

    let counters = device.counters();
    let span = tone_span();
    let reached = wait_until(Duration::from_secs(2), || {
        // 客户端尽量保持 buffer 满
        while client.write_span(&span, VolumeRamp::UNITY, false).unwrap() {}
        counters.nonsilent_render_spans() > 0
    });
    assert!(reached, "no audible span reached the hardware");
    assert!(endpoint.stats().cycle_count() > 0);
    assert!(endpoint.stats().resync_count() > 0);

    // handle info 在每个周期开始时发布
    assert!(wait_until(Duration::from_secs(1), || {
        while client.write_span(&span, VolumeRamp::UNITY, false).unwrap() {}
        endpoint.on_update_handle_info(&stream).unwrap().0 > 0
    }));
    let (pos, time) = endpoint.on_update_handle_info(&stream).unwrap();
    assert_eq!(pos % SPAN as u64, 0);
    assert!(time > 0);

    endpoint.unlink_process_stream(&stream).unwrap();
}

#[test]
fn test_capture_reaches_client() {
    let (endpoint, _device) = endpoint_for(DeviceRole::Input, test_config(true), true);
    let (client, stream) = client();
    endpoint.link_process_stream(Arc::clone(&stream)).unwrap();
    client.start();
    endpoint.on_start(&stream).unwrap();

    let mut out = vec![0u8; client.span_bytes()];
    let mut audible = 0;
    let done = wait_until(Duration::from_secs(2), || {
        while client.read_span(&mut out).unwrap() {
            if out.iter().any(|&b| b != 0) {
                audible += 1;
            }
        }
        audible > 0
    });
    assert!(done, "client never received captured audio");

    let (pos, _) = endpoint.on_update_handle_info(&stream).unwrap();
    assert_eq!(pos % SPAN as u64, 0);
    endpoint.unlink_process_stream(&stream).unwrap();
}

#[test]
fn test_position_failure_is_counted() {
    let (endpoint, device) = endpoint_for(DeviceRole::Output, test_config(true), true);
    device.set_fail_position(true);
    let (client, stream) = client();
    endpoint.link_process_stream(Arc::clone(&stream)).unwrap();
    client.start();
    endpoint.on_start(&stream).unwrap();

    let stats = Arc::clone(endpoint.stats());
    assert!(wait_until(Duration::from_secs(2), || stats.position_query_failures() > 0));
    // 没有位置就不执行周期
    assert_eq!(stats.cycle_count(), 0);

    device.set_fail_position(false);
    assert!(wait_until(Duration::from_secs(2), || stats.cycle_count() > 0));
    endpoint.release();
}

#[test]
fn test_unlink_during_start_stops_device() {
    let (endpoint, device) =
        slow_endpoint(test_config(true), Duration::from_millis(50), Duration::ZERO);
    let (_client, stream) = client();

    thread::scope(|s| {
        let linker = s.spawn(|| endpoint.link_process_stream(Arc::clone(&stream)));
        assert!(wait_until(Duration::from_secs(1), || {
            endpoint.status() == EndpointStatus::Starting
        }));
        thread::sleep(Duration::from_millis(15));
        // unlink 等到启动结束之后再停设备
        endpoint.unlink_process_stream(&stream).unwrap();
        linker.join().unwrap().unwrap();
    });

    assert_eq!(endpoint.status(), EndpointStatus::Unlinked);
    assert_eq!(endpoint.linked_count(), 0);
    assert_device_matches_links(&endpoint, &device);
    assert_all_legal(&endpoint.status_history());
}

#[test]
fn test_start_outlasting_unlink_wait_is_undone() {
    let config = EndpointConfig {
        start_wait_timeout: Duration::from_millis(20),
        ..test_config(true)
    };
    let (endpoint, device) = slow_endpoint(config, Duration::from_millis(100), Duration::ZERO);
    let (_client, stream) = client();

    thread::scope(|s| {
        let linker = s.spawn(|| endpoint.link_process_stream(Arc::clone(&stream)));
        assert!(wait_until(Duration::from_secs(1), || {
            endpoint.status() == EndpointStatus::Starting
        }));
        // 等待超时后照样 unlink，硬件启动完成时发现没有流了
        endpoint.unlink_process_stream(&stream).unwrap();
        assert!(matches!(
            linker.join().unwrap(),
            Err(EndpointError::InvalidState(_))
        ));
    });

    assert_eq!(endpoint.status(), EndpointStatus::Unlinked);
    assert_eq!(endpoint.linked_count(), 0);
    assert_device_matches_links(&endpoint, &device);
    assert_all_legal(&endpoint.status_history());
}

#[test]
fn test_link_during_stop_restarts_device() {
    let (endpoint, device) =
        slow_endpoint(test_config(true), Duration::ZERO, Duration::from_millis(50));
    let (_a, stream_a) = client();
    let (_b, stream_b) = client();
    endpoint.link_process_stream(Arc::clone(&stream_a)).unwrap();
    assert!(device.is_running());

    thread::scope(|s| {
        let unlinker = s.spawn(|| endpoint.unlink_process_stream(&stream_a));
        assert!(wait_until(Duration::from_secs(1), || {
            endpoint.status() == EndpointStatus::Stopping
        }));
        // link 等 STOPPING 结束，再从 UNLINKED 重新启动设备
        endpoint.link_process_stream(Arc::clone(&stream_b)).unwrap();
        unlinker.join().unwrap().unwrap();
    });

    assert_eq!(endpoint.linked_count(), 1);
    assert_eq!(endpoint.status(), EndpointStatus::Idle);
    assert_device_matches_links(&endpoint, &device);

    endpoint.unlink_process_stream(&stream_b).unwrap();
    assert_device_matches_links(&endpoint, &device);
    assert_all_legal(&endpoint.status_history());
}

#[test]
fn test_racing_first_links_start_device_once() {
    let (endpoint, device) =
        slow_endpoint(test_config(true), Duration::from_millis(50), Duration::ZERO);
    let (_a, stream_a) = client();
    let (_b, stream_b) = client();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        let handles: Vec<_> = [&stream_a, &stream_b]
            .into_iter()
            .map(|stream| {
                let endpoint = &endpoint;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    endpoint.link_process_stream(Arc::clone(stream))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    });

    assert_eq!(endpoint.linked_count(), 2);
    assert_eq!(endpoint.status(), EndpointStatus::Idle);
    assert_device_matches_links(&endpoint, &device);
    let history = endpoint.status_history();
    assert_all_legal(&history);
    let starts = history
        .iter()
        .filter(|t| t.to == EndpointStatus::Starting)
        .count();
    assert_eq!(starts, 1);

    endpoint.unlink_process_stream(&stream_a).unwrap();
    assert_device_matches_links(&endpoint, &device);
    endpoint.unlink_process_stream(&stream_b).unwrap();
    assert_device_matches_links(&endpoint, &device);
    assert_all_legal(&endpoint.status_history());
}
