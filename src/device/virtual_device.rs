//! 虚拟 mmap 设备
//!
//! 用单调时钟模拟硬件 DMA：启动后位置按 `elapsed * rate` 前进。
//! 开启 `simulate_hardware` 时，后台线程模拟硬件对数据区的访问：
//! - render：统计硬件"读到"的非静音 span
//! - capture：在硬件"写过"的 span 中填入正弦波
//!
//! 另外提供故障注入开关，用于测试启动失败和位置查询失败。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::{
    AdapterError, DeviceAttr, DeviceRole, HardwareIoAdapter, HardwarePosition, MmapBufferInfo,
};
use crate::audio::timing::{now_ns, relative_sleep};
use crate::audio::{AudioStreamInfo, NANOS_PER_SECOND};
use crate::buffer::SharedMemory;

/// 模拟硬件线程的轮询间隔
const HARDWARE_TICK_NS: i64 = 1_000_000;

/// 虚拟设备配置
#[derive(Clone, Debug)]
pub struct VirtualDeviceConfig {
    /// 每个 span 的帧数
    pub span_frames: u32,
    /// span 数量
    pub span_count: u32,
    /// 是否运行模拟硬件线程
    pub simulate_hardware: bool,
    /// capture 方向填入的正弦波频率
    pub tone_hz: f32,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            // 5ms @ 48kHz
            span_frames: 240,
            span_count: 4,
            simulate_hardware: true,
            tone_hz: 440.0,
        }
    }
}

/// 模拟硬件观察到的数据
#[derive(Debug, Default)]
pub struct VirtualDeviceCounters {
    render_spans: AtomicU64,
    nonsilent_render_spans: AtomicU64,
    capture_spans: AtomicU64,
}

impl VirtualDeviceCounters {
    /// 硬件读过的 render span 数
    pub fn render_spans(&self) -> u64 {
        self.render_spans.load(Ordering::Relaxed)
    }

    /// 其中含有非静音数据的 span 数
    pub fn nonsilent_render_spans(&self) -> u64 {
        self.nonsilent_render_spans.load(Ordering::Relaxed)
    }

    /// 硬件写过的 capture span 数
    pub fn capture_spans(&self) -> u64 {
        self.capture_spans.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug)]
struct DeviceClock {
    started_at: i64,
    base_frames: u64,
    sample_rate: u32,
}

impl DeviceClock {
    fn position_at(&self, now: i64) -> HardwarePosition {
        let elapsed = (now - self.started_at).max(0) as i128;
        let frames = elapsed * self.sample_rate as i128 / NANOS_PER_SECOND as i128;
        let nano_time =
            self.started_at + (frames * NANOS_PER_SECOND as i128 / self.sample_rate as i128) as i64;
        HardwarePosition {
            frames: self.base_frames + frames as u64,
            nano_time,
        }
    }
}

#[derive(Default)]
struct DeviceState {
    attr: Option<DeviceAttr>,
    memory: Option<Arc<SharedMemory>>,
    clock: Option<DeviceClock>,
    stopped_at: HardwarePosition,
    hardware_thread: Option<JoinHandle<()>>,
}

/// 时钟驱动的虚拟 mmap 设备
pub struct VirtualDevice {
    config: VirtualDeviceConfig,
    state: Mutex<DeviceState>,
    inited: AtomicBool,
    running: Arc<AtomicBool>,
    fail_start: AtomicBool,
    fail_position: AtomicBool,
    counters: Arc<VirtualDeviceCounters>,
    volume: Mutex<(f32, f32)>,
}

impl VirtualDevice {
    pub fn new(config: VirtualDeviceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DeviceState::default()),
            inited: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            fail_start: AtomicBool::new(false),
            fail_position: AtomicBool::new(false),
            counters: Arc::new(VirtualDeviceCounters::default()),
            volume: Mutex::new((1.0, 1.0)),
        }
    }

    pub fn config(&self) -> &VirtualDeviceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> Arc<VirtualDeviceCounters> {
        Arc::clone(&self.counters)
    }

    /// 让后续 `start` 失败
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Release);
    }

    /// 让后续 `mmap_position` 失败
    pub fn set_fail_position(&self, fail: bool) {
        self.fail_position.store(fail, Ordering::Release);
    }

    pub fn last_volume(&self) -> (f32, f32) {
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_locked(&self, state: &mut DeviceState) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = state.hardware_thread.take() {
            let _ = handle.join();
        }
        if let Some(clock) = state.clock.take() {
            state.stopped_at = clock.position_at(now_ns());
        }
        log::debug!("Virtual device stopped at frame {}", state.stopped_at.frames);
    }

    fn spawn_hardware(
        &self,
        role: DeviceRole,
        info: AudioStreamInfo,
        clock: DeviceClock,
        memory: Arc<SharedMemory>,
    ) -> Result<JoinHandle<()>, AdapterError> {
        let hardware = SimulatedHardware {
            role,
            info,
            clock,
            memory,
            span_frames: self.config.span_frames as u64,
            span_count: self.config.span_count as u64,
            tone_hz: self.config.tone_hz,
            running: Arc::clone(&self.running),
            counters: Arc::clone(&self.counters),
        };
        thread::Builder::new()
            .name("virtual-hw".to_string())
            .spawn(move || hardware.run())
            .map_err(|e| AdapterError::Unavailable(e.to_string()))
    }
}

impl HardwareIoAdapter for VirtualDevice {
    fn init(&self, attr: &DeviceAttr) -> Result<(), AdapterError> {
        let mut state = self.lock_state();
        if self.inited.load(Ordering::Acquire) {
            self.stop_locked(&mut state);
        }

        let bytes = self.config.span_frames as usize
            * self.config.span_count as usize
            * attr.stream_info.bytes_per_frame();
        let memory = SharedMemory::create("virtual-device", bytes)
            .map_err(|e| AdapterError::Unavailable(e.to_string()))?;

        state.attr = Some(attr.clone());
        state.memory = Some(Arc::new(memory));
        state.stopped_at = HardwarePosition {
            frames: 0,
            nano_time: now_ns(),
        };
        self.inited.store(true, Ordering::Release);
        log::debug!(
            "Virtual {} device inited: {}, {} x {} frames",
            attr.role,
            attr.stream_info,
            self.config.span_count,
            self.config.span_frames
        );
        Ok(())
    }

    fn is_inited(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    fn start(&self) -> Result<(), AdapterError> {
        if !self.is_inited() {
            return Err(AdapterError::NotInited);
        }
        if self.fail_start.load(Ordering::Acquire) {
            return Err(AdapterError::Failed {
                op: "start",
                code: -1,
            });
        }

        let mut state = self.lock_state();
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let (attr, memory) = match (state.attr.clone(), state.memory.clone()) {
            (Some(attr), Some(memory)) => (attr, memory),
            _ => return Err(AdapterError::NotInited),
        };

        let clock = DeviceClock {
            started_at: now_ns(),
            base_frames: state.stopped_at.frames,
            sample_rate: attr.stream_info.sample_rate,
        };
        state.clock = Some(clock);
        self.running.store(true, Ordering::Release);

        if self.config.simulate_hardware {
            match self.spawn_hardware(attr.role, attr.stream_info, clock, memory) {
                Ok(handle) => state.hardware_thread = Some(handle),
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    state.clock = None;
                    return Err(e);
                }
            }
        }
        log::debug!("Virtual device started at frame {}", clock.base_frames);
        Ok(())
    }

    fn stop(&self) -> Result<(), AdapterError> {
        if !self.is_inited() {
            return Err(AdapterError::NotInited);
        }
        let mut state = self.lock_state();
        self.stop_locked(&mut state);
        Ok(())
    }

    fn deinit(&self) -> Result<(), AdapterError> {
        let mut state = self.lock_state();
        self.stop_locked(&mut state);
        state.memory = None;
        state.attr = None;
        self.inited.store(false, Ordering::Release);
        Ok(())
    }

    fn mmap_buffer_info(&self) -> Result<MmapBufferInfo, AdapterError> {
        let state = self.lock_state();
        match (&state.attr, &state.memory) {
            (Some(attr), Some(memory)) => Ok(MmapBufferInfo {
                memory: Arc::clone(memory),
                total_frames: self.config.span_frames * self.config.span_count,
                span_frames: self.config.span_frames,
                bytes_per_frame: attr.stream_info.bytes_per_frame() as u32,
            }),
            _ => Err(AdapterError::NotInited),
        }
    }

    fn mmap_position(&self) -> Result<HardwarePosition, AdapterError> {
        if self.fail_position.load(Ordering::Acquire) {
            return Err(AdapterError::Failed {
                op: "position",
                code: -5,
            });
        }
        if !self.is_inited() {
            return Err(AdapterError::NotInited);
        }
        let state = self.lock_state();
        Ok(match state.clock {
            Some(clock) => clock.position_at(now_ns()),
            None => state.stopped_at,
        })
    }

    fn set_volume(&self, left: f32, right: f32) -> Result<(), AdapterError> {
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner) = (left, right);
        Ok(())
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        let mut state = self.lock_state();
        self.stop_locked(&mut state);
    }
}

/// 模拟硬件线程
struct SimulatedHardware {
    role: DeviceRole,
    info: AudioStreamInfo,
    clock: DeviceClock,
    memory: Arc<SharedMemory>,
    span_frames: u64,
    span_count: u64,
    tone_hz: f32,
    running: Arc<AtomicBool>,
    counters: Arc<VirtualDeviceCounters>,
}

impl SimulatedHardware {
    fn run(self) {
        let mut next_span = self.clock.base_frames / self.span_frames;
        while self.running.load(Ordering::Acquire) {
            let pos = self.clock.position_at(now_ns()).frames;
            let current = pos / self.span_frames;
            match self.role {
                // 位置进入 span k 时硬件开始读 span k
                DeviceRole::Output => {
                    while next_span <= current {
                        self.inspect_render_span(next_span);
                        next_span += 1;
                    }
                }
                // 位置离开 span k 时硬件已写完 span k
                DeviceRole::Input => {
                    while next_span < current {
                        self.fill_capture_span(next_span);
                        next_span += 1;
                    }
                }
            }
            relative_sleep(HARDWARE_TICK_NS);
        }
    }

    fn span_bytes(&self) -> usize {
        self.span_frames as usize * self.info.bytes_per_frame()
    }

    // 模拟 DMA：和 Endpoint 并发访问同一块内存
    #[allow(clippy::mut_from_ref)]
    fn span_slice(&self, span: u64) -> &mut [u8] {
        let span_bytes = self.span_bytes();
        let offset = (span % self.span_count) as usize * span_bytes;
        unsafe { std::slice::from_raw_parts_mut(self.memory.as_ptr().add(offset), span_bytes) }
    }

    fn inspect_render_span(&self, span: u64) {
        let silence = self.info.format.silence_byte();
        let data = self.span_slice(span);
        self.counters.render_spans.fetch_add(1, Ordering::Relaxed);
        if data.iter().any(|&b| b != silence) {
            self.counters
                .nonsilent_render_spans
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fill_capture_span(&self, span: u64) {
        let format = self.info.format;
        let width = format.bytes_per_sample();
        let channels = self.info.channels as usize;
        let amplitude = format.max_value() as f64 / 4.0;
        let step = 2.0 * std::f64::consts::PI * self.tone_hz as f64 / self.info.sample_rate as f64;
        let first_frame = span * self.span_frames;

        let data = self.span_slice(span);
        for (i, frame) in data.chunks_exact_mut(width * channels).enumerate() {
            let n = (first_frame + i as u64) as f64;
            let value = ((n * step).sin() * amplitude) as i32;
            for sample in frame.chunks_exact_mut(width) {
                format.encode(value, sample);
            }
        }
        self.counters.capture_spans.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;
    use crate::device::DeviceType;
    use std::time::Duration;

    fn output_attr() -> DeviceAttr {
        DeviceAttr {
            role: DeviceRole::Output,
            device_type: DeviceType::Speaker,
            network_id: crate::device::LOCAL_NETWORK_ID.to_string(),
            stream_info: AudioStreamInfo::new(48000, 2, SampleFormat::S16Le),
        }
    }

    fn quiet_device() -> VirtualDevice {
        VirtualDevice::new(VirtualDeviceConfig {
            simulate_hardware: false,
            ..VirtualDeviceConfig::default()
        })
    }

    #[test]
    fn test_requires_init() {
        let device = quiet_device();
        assert!(matches!(device.start(), Err(AdapterError::NotInited)));
        assert!(device.mmap_buffer_info().is_err());
        assert!(device.mmap_position().is_err());
    }

    #[test]
    fn test_buffer_info_matches_config() {
        let device = quiet_device();
        device.init(&output_attr()).unwrap();
        let info = device.mmap_buffer_info().unwrap();
        assert_eq!(info.total_frames, 960);
        assert_eq!(info.span_frames, 240);
        assert_eq!(info.bytes_per_frame, 4);
        assert_eq!(info.memory.len(), 960 * 4);
    }

    #[test]
    fn test_position_advances_with_clock() {
        let device = quiet_device();
        device.init(&output_attr()).unwrap();
        device.start().unwrap();

        let p1 = device.mmap_position().unwrap();
        thread::sleep(Duration::from_millis(20));
        let p2 = device.mmap_position().unwrap();
        assert!(p2.frames > p1.frames);
        assert!(p2.nano_time > p1.nano_time);
        // 20ms @ 48kHz 约 960 帧
        assert!(p2.frames - p1.frames >= 700, "advanced {}", p2.frames - p1.frames);

        device.stop().unwrap();
        let frozen = device.mmap_position().unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(device.mmap_position().unwrap(), frozen);
    }

    #[test]
    fn test_fault_injection() {
        let device = quiet_device();
        device.init(&output_attr()).unwrap();
        device.set_fail_start(true);
        assert!(matches!(device.start(), Err(AdapterError::Failed { op: "start", .. })));
        device.set_fail_start(false);
        device.start().unwrap();

        device.set_fail_position(true);
        assert!(device.mmap_position().is_err());
        device.set_fail_position(false);
        assert!(device.mmap_position().is_ok());
    }

    #[test]
    fn test_capture_hardware_writes_tone() {
        let device = VirtualDevice::new(VirtualDeviceConfig::default());
        let mut attr = output_attr();
        attr.role = DeviceRole::Input;
        attr.device_type = DeviceType::Mic;
        device.init(&attr).unwrap();
        device.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        device.stop().unwrap();

        assert!(device.counters().capture_spans() > 0);
        let info = device.mmap_buffer_info().unwrap();
        let raw = unsafe { std::slice::from_raw_parts(info.memory.as_ptr(), info.memory.len()) };
        assert!(raw.iter().any(|&b| b != 0));
    }
}
