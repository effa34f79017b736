//! Endpoint：客户端 ring buffer 与一个硬件 mmap 设备之间的桥
//!
//! 核心设计：
//! - 每个 Endpoint 一个工作线程（混音/分发）和一个位置轮询线程
//! - 数据交接只用 span 状态标签和游标原子量，热路径不加锁
//! - link 列表用 Mutex 保护，工作线程在整个混音周期内持有它，
//!   所以 link/unlink 最多被推迟一个周期
//!
//! 生命周期：`new`（INVALID）→ `config`（UNLINKED）→ link/unlink/start/pause → `release`

pub mod mixer;
pub mod poller;
pub mod status;
pub mod time_model;
pub mod worker;

use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::audio::{AudioStreamInfo, EndpointStats};
use crate::buffer::{
    AudioRingBuffer, BufferError, BufferGeometry, BufferHolder, SpanStatus, StreamStatus,
};
use crate::device::{
    AdapterError, AdapterRegistry, DeviceAttr, DeviceDescriptor, DeviceRole, DeviceType,
    HardwareIoAdapter,
};
use crate::stream::{AudioStreamType, ProcessStream, VolumeProvider};

pub use mixer::SpanMixer;
pub use poller::PositionPoller;
pub use status::{EndpointStatus, StatusCell, StatusTransition};
pub use time_model::{FrameStamp, PositionTimeModel};

/// span 时长上限
pub const MAX_SPAN_DURATION_NS: i64 = 100_000_000;

/// render 唤醒提前量的下限
pub const MIN_SERVER_AHEAD_NS: i64 = 1_000_000;

/// Endpoint 类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointType {
    /// 普通低时延 mmap 通路
    Mmap,
    /// 通话专用 mmap 通路
    VoipMmap,
}

impl EndpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mmap => "mmap",
            Self::VoipMmap => "voip_mmap",
        }
    }
}

/// Endpoint 配置
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// 没有流在播放时也保持设备运行
    pub always_running_in_idle: bool,
    /// link 时等待 STARTING 结束的最长时间
    pub start_wait_timeout: Duration,
    /// 位置轮询线程的超时唤醒间隔
    pub poll_timeout: Duration,
    /// 最多 link 的流数
    pub max_linked_streams: usize,
    /// 重同步后前 N 个 span 每个都请求位置查询
    pub resync_start_spans: u64,
    /// 之后每 M 个 span 请求一次
    pub resync_period_spans: u64,
    /// mlock 设备 buffer
    pub lock_memory: bool,
    /// 尝试提升工作线程优先级
    pub realtime_priority: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            always_running_in_idle: true,
            start_wait_timeout: Duration::from_millis(400),
            poll_timeout: Duration::from_millis(1000),
            max_linked_streams: 6,
            resync_start_spans: 20,
            resync_period_spans: 40,
            lock_memory: true,
            realtime_priority: true,
        }
    }
}

/// Endpoint 错误
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("too many linked streams (max {max})")]
    TooManyLinks { max: usize },
    #[error("incompatible stream: {0}")]
    IncompatibleStream(String),
    #[error("stream already linked")]
    AlreadyLinked,
    #[error("stream not linked")]
    NotLinked,
    #[error("operation not allowed in status {0}")]
    InvalidState(EndpointStatus),
    #[error("failed to spawn endpoint thread: {0}")]
    Spawn(#[source] io::Error),
}

/// 一个已 link 的客户端流
#[derive(Clone)]
pub struct ProcessLink {
    pub stream: Arc<dyn ProcessStream>,
    pub buffer: Arc<AudioRingBuffer>,
    pub info: AudioStreamInfo,
    pub stream_type: AudioStreamType,
}

impl ProcessLink {
    fn new(stream: Arc<dyn ProcessStream>) -> Self {
        Self {
            buffer: stream.stream_buffer(),
            info: stream.stream_info(),
            stream_type: stream.stream_type(),
            stream,
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.buffer.stream_status() == StreamStatus::Running
    }
}

/// 系统音量查询（只对本地设备生效）
#[derive(Clone)]
pub struct VolumeLookup {
    provider: Option<Arc<dyn VolumeProvider>>,
    device_type: DeviceType,
    remote: bool,
}

impl VolumeLookup {
    pub fn new(provider: Option<Arc<dyn VolumeProvider>>, device_type: DeviceType, remote: bool) -> Self {
        Self {
            provider,
            device_type,
            remote,
        }
    }

    /// 没有 provider、远端设备、或没有设置时都是原始音量
    pub fn gain(&self, stream_type: AudioStreamType) -> f32 {
        if self.remote {
            return 1.0;
        }
        self.provider
            .as_ref()
            .and_then(|p| p.shared_volume(stream_type.volume_type(), self.device_type))
            .map_or(1.0, |v| v.effective_gain())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 工作线程和控制路径共享的状态
pub(crate) struct EndpointCore {
    name: String,
    role: DeviceRole,
    config: EndpointConfig,
    info: AudioStreamInfo,
    span_frames: u32,
    span_duration_ns: i64,
    /// render 唤醒提前量
    server_ahead_ns: i64,
    adapter: Arc<dyn HardwareIoAdapter>,
    dst_buffer: Arc<AudioRingBuffer>,
    volume: VolumeLookup,
    status: StatusCell,
    links: Mutex<Vec<ProcessLink>>,
    poller: PositionPoller,
    stats: Arc<EndpointStats>,
    active: AtomicBool,
    device_started: AtomicBool,
    need_resync: AtomicBool,
    any_running: AtomicBool,
    work_lock: Mutex<()>,
    work_changed: Condvar,
}

impl EndpointCore {
    #[inline]
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    fn is_device_started(&self) -> bool {
        self.device_started.load(Ordering::Acquire)
    }

    /// 工作线程是否应该执行周期
    fn keep_running(&self) -> bool {
        match self.status.get() {
            EndpointStatus::Running => true,
            EndpointStatus::Idle => self.config.always_running_in_idle && self.is_device_started(),
            _ => false,
        }
    }

    /// 工作线程空闲时等待状态变化
    fn wait_for_work(&self, timeout: Duration) {
        let guard = lock(&self.work_lock);
        let _ = self
            .work_changed
            .wait_timeout_while(guard, timeout, |_| self.is_active() && !self.keep_running())
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn notify_work(&self) {
        let _guard = lock(&self.work_lock);
        self.work_changed.notify_all();
    }

    fn silence_device_buffer(&self) {
        self.dst_buffer.fill_data(self.info.format.silence_byte());
    }

    fn init_device_spans(&self) {
        let status = match self.role {
            DeviceRole::Output => SpanStatus::ReadDone,
            DeviceRole::Input => SpanStatus::WriteDone,
        };
        self.dst_buffer.init_spans(status);
    }

    /// 重新计算是否有流在运行
    fn recompute_running(&self, links: &[ProcessLink]) -> bool {
        let any = links.iter().any(ProcessLink::is_running);
        self.any_running.store(any, Ordering::Release);
        any
    }

    /// 根据是否有流在运行切换 IDLE ↔ RUNNING
    fn update_run_status(&self) {
        let any = self.any_running.load(Ordering::Acquire);
        if any && self.is_device_started() {
            self.status.transition_if(EndpointStatus::Idle, EndpointStatus::Running);
        } else if !any {
            self.status.transition_if(EndpointStatus::Running, EndpointStatus::Idle);
        }
        self.notify_work();
    }

    /// 启动硬件：IDLE → STARTING → RUNNING/IDLE
    ///
    /// 另一个调用方正在启动时等它结束。启动期间最后一个流被 unlink 的话，
    /// 硬件会被重新停掉，返回 `InvalidState`
    fn start_device(&self) -> Result<(), EndpointError> {
        if self.is_device_started() {
            return Ok(());
        }
        if !self.status.transition_if(EndpointStatus::Idle, EndpointStatus::Starting) {
            let status = self
                .status
                .wait_while(self.config.start_wait_timeout, |s| s == EndpointStatus::Starting);
            if self.is_device_started() {
                return Ok(());
            }
            return Err(EndpointError::InvalidState(status));
        }

        if let Err(e) = self.adapter.start() {
            log::error!("Endpoint {}: device start failed: {}", self.name, e);
            self.status.transition_if(EndpointStatus::Starting, EndpointStatus::Idle);
            return Err(e.into());
        }
        self.device_started.store(true, Ordering::Release);

        // 和 unlink 的“最后一个流”判断在同一把锁下提交
        let committed = {
            let links = lock(&self.links);
            let next = if self.any_running.load(Ordering::Acquire) {
                EndpointStatus::Running
            } else {
                EndpointStatus::Idle
            };
            (!links.is_empty() && self.status.transition_if(EndpointStatus::Starting, next))
                .then_some(next)
        };
        let Some(next) = committed else {
            log::warn!(
                "Endpoint {}: all streams unlinked while starting, stopping device",
                self.name
            );
            if let Err(e) = self.stop_device() {
                log::warn!("Endpoint {}: stop after aborted start failed: {}", self.name, e);
            }
            self.status.transition_if(EndpointStatus::Starting, EndpointStatus::Idle);
            return Err(EndpointError::InvalidState(self.status.get()));
        };

        self.need_resync.store(true, Ordering::Release);
        self.poller.set_enabled(true);
        self.poller.signal();
        self.notify_work();
        log::info!("Endpoint {}: device started ({})", self.name, next);
        Ok(())
    }

    fn stop_device(&self) -> Result<(), AdapterError> {
        self.poller.set_enabled(false);
        if !self.device_started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.adapter.stop();
        match &result {
            Ok(()) => log::info!("Endpoint {}: device stopped", self.name),
            Err(e) => log::error!("Endpoint {}: device stop failed: {}", self.name, e),
        }
        result
    }

    fn find_link(&self, stream: &Arc<dyn ProcessStream>) -> Option<ProcessLink> {
        let buffer = stream.stream_buffer();
        lock(&self.links)
            .iter()
            .find(|link| Arc::ptr_eq(&link.buffer, &buffer))
            .cloned()
    }
}

/// 低时延 mmap Endpoint
pub struct Endpoint {
    endpoint_type: EndpointType,
    config: EndpointConfig,
    adapter: Arc<dyn HardwareIoAdapter>,
    volume_provider: Option<Arc<dyn VolumeProvider>>,
    stats: Arc<EndpointStats>,
    core: Option<Arc<EndpointCore>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl Endpoint {
    pub fn new(
        endpoint_type: EndpointType,
        adapter: Arc<dyn HardwareIoAdapter>,
        config: EndpointConfig,
    ) -> Self {
        Self {
            endpoint_type,
            config,
            adapter,
            volume_provider: None,
            stats: Arc::new(EndpointStats::new()),
            core: None,
            worker: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// 设置系统音量来源（`config` 之前调用）
    pub fn with_volume_provider(mut self, provider: Arc<dyn VolumeProvider>) -> Self {
        self.volume_provider = Some(provider);
        self
    }

    /// 从注册表选择适配器并完成配置
    pub fn create(
        endpoint_type: EndpointType,
        device: &DeviceDescriptor,
        registry: &AdapterRegistry,
        config: EndpointConfig,
        volume_provider: Option<Arc<dyn VolumeProvider>>,
    ) -> Result<Self, EndpointError> {
        let adapter = registry.adapter_for(device).ok_or_else(|| {
            EndpointError::InvalidConfig(format!(
                "no adapter registered for {} {:?}",
                device.role,
                device.location()
            ))
        })?;
        let mut endpoint = Self::new(endpoint_type, adapter, config);
        endpoint.volume_provider = volume_provider;
        endpoint.config(device)?;
        Ok(endpoint)
    }

    /// 绑定设备：初始化硬件、映射设备 buffer、启动线程
    ///
    /// 失败时不保留任何状态（适配器被 deinit）
    pub fn config(&mut self, device: &DeviceDescriptor) -> Result<(), EndpointError> {
        if self.core.is_some() || self.released.load(Ordering::Acquire) {
            return Err(EndpointError::InvalidState(self.status()));
        }
        let info = device.stream_info().ok_or_else(|| {
            EndpointError::InvalidConfig("device has no sample rate or channel count".to_string())
        })?;

        let attr = DeviceAttr {
            role: device.role,
            device_type: device.device_type,
            network_id: device.network_id.clone(),
            stream_info: info,
        };
        self.adapter.init(&attr)?;
        if !self.adapter.is_inited() {
            return Err(EndpointError::Adapter(AdapterError::NotInited));
        }

        match self.build_core(device, info) {
            Ok(core) => {
                self.core = Some(core);
                Ok(())
            }
            Err(e) => {
                if let Err(deinit) = self.adapter.deinit() {
                    log::warn!("Adapter deinit after failed config: {}", deinit);
                }
                Err(e)
            }
        }
    }

    fn build_core(
        &self,
        device: &DeviceDescriptor,
        info: AudioStreamInfo,
    ) -> Result<Arc<EndpointCore>, EndpointError> {
        let mmap = self.adapter.mmap_buffer_info()?;
        if mmap.bytes_per_frame as usize != info.bytes_per_frame() {
            return Err(EndpointError::InvalidConfig(format!(
                "device reports {} bytes per frame, stream format needs {}",
                mmap.bytes_per_frame,
                info.bytes_per_frame()
            )));
        }
        let span_duration_ns = info.frames_to_ns(mmap.span_frames as u64);
        if span_duration_ns <= 0 || span_duration_ns >= MAX_SPAN_DURATION_NS {
            return Err(EndpointError::InvalidConfig(format!(
                "span duration {}ns out of range",
                span_duration_ns
            )));
        }

        let geometry = BufferGeometry::new(mmap.total_frames, mmap.span_frames, mmap.bytes_per_frame);
        let dst_buffer = Arc::new(AudioRingBuffer::create_from_remote(
            geometry,
            BufferHolder::ServerOnly,
            mmap.memory,
        )?);
        if self.config.lock_memory && !dst_buffer.lock_memory() {
            log::debug!("Device buffer not locked, continuing");
        }

        if device.role == DeviceRole::Output {
            if let Err(e) = self.adapter.set_volume(1.0, 1.0) {
                log::warn!("Failed to set device volume: {}", e);
            }
        }

        let name = format!(
            "{}_{}_{}_{}",
            device.network_id,
            device.device_id,
            device.role,
            self.endpoint_type.as_str()
        );
        let core = Arc::new(EndpointCore {
            name,
            role: device.role,
            config: self.config.clone(),
            info,
            span_frames: mmap.span_frames,
            span_duration_ns,
            server_ahead_ns: (span_duration_ns * 3 / 5).max(MIN_SERVER_AHEAD_NS),
            adapter: Arc::clone(&self.adapter),
            dst_buffer,
            volume: VolumeLookup::new(
                self.volume_provider.clone(),
                device.device_type,
                device.is_remote(),
            ),
            status: StatusCell::new(EndpointStatus::Invalid),
            links: Mutex::new(Vec::with_capacity(self.config.max_linked_streams)),
            poller: PositionPoller::new(
                Arc::clone(&self.adapter),
                Arc::clone(&self.stats),
                self.config.poll_timeout,
            ),
            stats: Arc::clone(&self.stats),
            active: AtomicBool::new(true),
            device_started: AtomicBool::new(false),
            need_resync: AtomicBool::new(true),
            any_running: AtomicBool::new(false),
            work_lock: Mutex::new(()),
            work_changed: Condvar::new(),
        });
        core.init_device_spans();
        core.silence_device_buffer();

        core.poller.start().map_err(EndpointError::Spawn)?;
        let worker_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name("audio-ep-loop".to_string())
            .spawn(move || worker::run(worker_core))
            .map_err(|e| {
                core.poller.stop();
                EndpointError::Spawn(e)
            })?;
        *lock(&self.worker) = Some(handle);

        core.status.set(EndpointStatus::Unlinked);
        log::info!(
            "Endpoint {} configured: {}, span {} frames ({:.2} ms), {} spans",
            core.name,
            info,
            mmap.span_frames,
            span_duration_ns as f64 / 1_000_000.0,
            geometry.span_count()
        );
        Ok(core)
    }

    fn core(&self) -> Result<&Arc<EndpointCore>, EndpointError> {
        match &self.core {
            Some(core) if !self.released.load(Ordering::Acquire) => Ok(core),
            _ => Err(EndpointError::InvalidState(EndpointStatus::Invalid)),
        }
    }

    pub fn name(&self) -> &str {
        self.core.as_ref().map_or("", |core| core.name.as_str())
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    pub fn status(&self) -> EndpointStatus {
        self.core
            .as_ref()
            .map_or(EndpointStatus::Invalid, |core| core.status.get())
    }

    /// 最近的状态转换
    pub fn status_history(&self) -> Vec<StatusTransition> {
        self.core
            .as_ref()
            .map_or_else(Vec::new, |core| core.status.history())
    }

    pub fn stats(&self) -> &Arc<EndpointStats> {
        &self.stats
    }

    pub fn stream_info(&self) -> Option<AudioStreamInfo> {
        self.core.as_ref().map(|core| core.info)
    }

    /// 设备侧 ring buffer
    pub fn device_buffer(&self) -> Option<Arc<AudioRingBuffer>> {
        self.core.as_ref().map(|core| Arc::clone(&core.dst_buffer))
    }

    /// 客户端应使用的 buffer 大小：(总帧数, span 帧数)
    pub fn prefer_buffer_info(&self) -> Option<(u32, u32)> {
        self.core
            .as_ref()
            .map(|core| (core.dst_buffer.total_frames(), core.span_frames))
    }

    pub fn linked_count(&self) -> usize {
        self.core.as_ref().map_or(0, |core| lock(&core.links).len())
    }

    pub fn is_device_started(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|core| core.is_device_started())
    }

    fn check_compatible(core: &EndpointCore, link: &ProcessLink) -> Result<(), EndpointError> {
        if link.info != core.info {
            return Err(EndpointError::IncompatibleStream(format!(
                "stream {} does not match device {}",
                link.info, core.info
            )));
        }
        let span_frames = link.buffer.span_frames();
        if span_frames != core.span_frames {
            return Err(EndpointError::IncompatibleStream(format!(
                "stream span {} frames does not match device span {} frames",
                span_frames, core.span_frames
            )));
        }
        Ok(())
    }

    /// link 一个客户端流
    pub fn link_process_stream(&self, stream: Arc<dyn ProcessStream>) -> Result<(), EndpointError> {
        let core = self.core()?;
        let link = ProcessLink::new(stream);
        Self::check_compatible(core, &link)?;

        let stream_running = link.is_running();
        let buffer = Arc::clone(&link.buffer);
        let mut link = Some(link);
        // unlink 在 links 锁下进入 STOPPING，所以这里拿到锁后要再检查一次
        let status = loop {
            let status = core.status.wait_while(self.config.start_wait_timeout, |s| {
                matches!(
                    s,
                    EndpointStatus::Starting | EndpointStatus::Stopping | EndpointStatus::Stopped
                )
            });
            if matches!(status, EndpointStatus::Stopping | EndpointStatus::Stopped) {
                log::warn!("Endpoint {}: link timed out in status {}", core.name, status);
                return Err(EndpointError::InvalidState(status));
            }
            if status == EndpointStatus::Starting {
                log::warn!(
                    "Endpoint {}: device still starting after {:?}, linking anyway",
                    core.name,
                    self.config.start_wait_timeout
                );
            }

            let mut links = lock(&core.links);
            let status = core.status.get();
            if matches!(status, EndpointStatus::Stopping | EndpointStatus::Stopped) {
                continue;
            }
            if links.iter().any(|l| Arc::ptr_eq(&l.buffer, &buffer)) {
                return Err(EndpointError::AlreadyLinked);
            }
            if links.len() >= self.config.max_linked_streams {
                return Err(EndpointError::TooManyLinks {
                    max: self.config.max_linked_streams,
                });
            }
            if let Some(link) = link.take() {
                links.push(link);
            }
            core.recompute_running(&links);
            if status == EndpointStatus::Unlinked {
                core.status.transition_if(EndpointStatus::Unlinked, EndpointStatus::Idle);
            }
            break status;
        };

        let result = match status {
            EndpointStatus::Unlinked if self.config.always_running_in_idle || stream_running => {
                core.start_device()
            }
            EndpointStatus::Idle | EndpointStatus::Starting
                if stream_running && !core.is_device_started() =>
            {
                core.start_device()
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            let mut links = lock(&core.links);
            links.retain(|l| !Arc::ptr_eq(&l.buffer, &buffer));
            core.recompute_running(&links);
            if links.is_empty() {
                core.status.transition_if(EndpointStatus::Idle, EndpointStatus::Unlinked);
            }
            return Err(e);
        }

        core.update_run_status();
        log::info!(
            "Endpoint {}: stream linked ({} total), status {}",
            core.name,
            self.linked_count(),
            core.status.get()
        );
        Ok(())
    }

    /// unlink 一个客户端流；最后一个流 unlink 时停止设备
    pub fn unlink_process_stream(&self, stream: &Arc<dyn ProcessStream>) -> Result<(), EndpointError> {
        let core = self.core()?;
        let buffer = stream.stream_buffer();
        let status = core
            .status
            .wait_while(self.config.start_wait_timeout, |s| s == EndpointStatus::Starting);
        if status == EndpointStatus::Starting {
            log::warn!(
                "Endpoint {}: device still starting after {:?}, unlinking anyway",
                core.name,
                self.config.start_wait_timeout
            );
        }

        // 最后一个流离开时在 links 锁下进入 STOPPING，和 link、start_device 互斥
        let remaining = {
            let mut links = lock(&core.links);
            let index = links
                .iter()
                .position(|l| Arc::ptr_eq(&l.buffer, &buffer))
                .ok_or(EndpointError::NotLinked)?;
            links.remove(index);
            core.recompute_running(&links);
            if links.is_empty() {
                core.status.set(EndpointStatus::Stopping);
            }
            links.len()
        };
        log::info!("Endpoint {}: stream unlinked ({} left)", core.name, remaining);

        if remaining > 0 {
            core.update_run_status();
            return Ok(());
        }

        core.notify_work();
        core.silence_device_buffer();
        let result = core.stop_device();
        core.status.set(EndpointStatus::Stopped);
        core.status.set(EndpointStatus::Unlinked);
        core.notify_work();
        result.map_err(EndpointError::from)
    }

    /// 客户端开始播放/录音
    pub fn on_start(&self, stream: &Arc<dyn ProcessStream>) -> Result<(), EndpointError> {
        let core = self.core()?;
        if core.find_link(stream).is_none() {
            return Err(EndpointError::NotLinked);
        }
        core.recompute_running(&lock(&core.links));
        if !core.is_device_started() && core.status.get() == EndpointStatus::Idle {
            core.start_device()?;
        }
        core.update_run_status();
        Ok(())
    }

    /// 客户端暂停
    pub fn on_pause(&self, stream: &Arc<dyn ProcessStream>) -> Result<(), EndpointError> {
        let core = self.core()?;
        if core.find_link(stream).is_none() {
            return Err(EndpointError::NotLinked);
        }
        core.recompute_running(&lock(&core.links));
        core.update_run_status();
        Ok(())
    }

    /// 客户端查询处理进度：(帧位置, 时间)
    ///
    /// capture 方向用最近一个写完的 span 更新 handle info
    pub fn on_update_handle_info(&self, stream: &Arc<dyn ProcessStream>) -> Result<(u64, i64), EndpointError> {
        let core = self.core()?;
        let link = core.find_link(stream).ok_or(EndpointError::NotLinked)?;
        if core.role == DeviceRole::Input {
            let (pos, time) = worker::last_write_done_info(&link.buffer);
            link.buffer.set_handle_info(pos, time);
        }
        Ok(link.buffer.handle_info())
    }

    /// 状态快照（用于调试）
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let Some(core) = &self.core else {
            let _ = writeln!(out, "Endpoint ({}) not configured", self.endpoint_type.as_str());
            return out;
        };
        let dst = &core.dst_buffer;
        let _ = writeln!(out, "Endpoint {} [{}]", core.name, core.status.get());
        let _ = writeln!(
            out,
            "  device: {} {}, span {} frames, {} spans, started: {}",
            core.role,
            core.info,
            core.span_frames,
            dst.span_count(),
            core.is_device_started()
        );
        let _ = writeln!(
            out,
            "  device cursors: read {} write {}",
            dst.cur_read_frame(),
            dst.cur_write_frame()
        );
        for (index, link) in lock(&core.links).iter().enumerate() {
            let (handle_pos, handle_time) = link.buffer.handle_info();
            let _ = writeln!(
                out,
                "  link {}: {:?} {:?}, read {} write {}, handled {} @ {}",
                index,
                link.stream_type,
                link.buffer.stream_status(),
                link.buffer.cur_read_frame(),
                link.buffer.cur_write_frame(),
                handle_pos,
                handle_time
            );
        }
        let _ = write!(out, "{}", self.stats.report(core.span_frames, core.info.sample_rate));
        out
    }

    /// 停止线程、停止并释放硬件；可以重复调用
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(core) = &self.core else {
            return;
        };

        core.active.store(false, Ordering::Release);
        core.notify_work();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        core.poller.stop();

        if let Err(e) = core.stop_device() {
            log::warn!("Endpoint {}: stop on release failed: {}", core.name, e);
        }
        if let Err(e) = core.adapter.deinit() {
            log::warn!("Endpoint {}: deinit failed: {}", core.name, e);
        }
        let remaining = lock(&core.links).len();
        if remaining > 0 {
            log::warn!("Endpoint {} released with {} linked streams", core.name, remaining);
        }
        core.status.set(EndpointStatus::Invalid);
        log::info!("Endpoint {} released", core.name);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.release();
    }
}
