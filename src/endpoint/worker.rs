//! Endpoint 工作线程
//!
//! render 周期：
//! 1. 检查运行中的客户端是否都写好了下一个 span（没有就有界地等一次）
//! 2. 持有 link 锁：把就绪的 span 混音到设备 span，提交游标和状态标签
//! 3. 用位置-时间模型预测下一个 span 的硬件读时间，提前 guard 唤醒（绝对睡眠）
//!
//! capture 周期相反：等硬件写完一个 span 后 4ms 醒来，分发给每个客户端。
//!
//! 单个客户端没赶上只影响它自己这一个周期（render 贡献静音，capture 丢一个 span）。

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::mixer::SpanMixer;
use super::time_model::PositionTimeModel;
use super::{lock, EndpointCore, ProcessLink, VolumeLookup};
use crate::audio::timing::{absolute_sleep, now_ns, relative_sleep};
use crate::audio::{AudioStreamInfo, EndpointStats};
use crate::buffer::{AudioRingBuffer, BufferError, SpanStatus};
use crate::device::{DeviceRole, HardwarePosition};

/// 等客户端时相对预测读时间的提前量
const WRITE_TO_HARDWARE_AHEAD_NS: i64 = 1_000_000;

/// 离预测读时间太近时，等客户端至少睡这么久
const MIN_READY_WAIT_NS: i64 = 1_000_000;

/// capture 在硬件写完 span 之后多久醒来
const CAPTURE_AFTER_WRITE_NS: i64 = 4_000_000;

/// 未运行客户端的 handle time 偏移
const IDLE_HANDLE_OFFSET_NS: i64 = 5_000_000;

/// 空闲时等待状态变化的时间
const IDLE_WAIT: Duration = Duration::from_millis(400);

/// 唤醒迟到超过此值时告警
const LATE_WARN_NS: i64 = 3_000_000;

/// 唤醒迟到超过此值时记 debug 日志
const LATE_DEBUG_NS: i64 = 1_000_000;

/// 一次 render 周期的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderOutcome {
    /// 写入的设备位置
    pub device_pos: u64,
    /// 被消费的客户端 span 数
    pub consumed: usize,
    /// 运行中但没有就绪 span 的客户端数
    pub missed: usize,
}

/// 一次 capture 周期的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub device_pos: u64,
    /// 收到数据的客户端数
    pub delivered: usize,
    /// buffer 没有空位而被跳过的客户端数
    pub overflowed: usize,
}

/// render 混音通道：混音器和本周期消费的客户端 span
pub struct RenderPass {
    mixer: SpanMixer,
    silence: u8,
    consumed: Vec<(usize, u64)>,
}

impl RenderPass {
    pub fn new(info: AudioStreamInfo, span_frames: u32, max_links: usize) -> Self {
        Self {
            mixer: SpanMixer::new(info, span_frames),
            silence: info.format.silence_byte(),
            consumed: Vec::with_capacity(max_links),
        }
    }

    /// 把所有就绪的客户端 span 混音到设备写游标处的 span，然后提交
    ///
    /// 设备 span 拿不到时不动任何客户端状态
    pub fn process(
        &mut self,
        dst: &AudioRingBuffer,
        links: &[ProcessLink],
        volume: &VolumeLookup,
        stats: &EndpointStats,
    ) -> Result<RenderOutcome, BufferError> {
        let device_pos = dst.cur_write_frame();
        let span_frames = dst.span_frames() as u64;
        let dst_desc = dst.write_buffer(device_pos)?;
        let dst_span = dst.span(device_pos);

        let mut outcome = RenderOutcome {
            device_pos,
            ..RenderOutcome::default()
        };
        self.mixer.begin();
        self.consumed.clear();
        let now = now_ns();

        for (index, link) in links.iter().enumerate() {
            if !link.is_running() {
                continue;
            }
            let buffer = &link.buffer;
            let pos = buffer.cur_read_frame();
            let span = buffer.span(pos);
            if span
                .compare_exchange_status(SpanStatus::WriteDone, SpanStatus::Reading)
                .is_err()
            {
                stats.record_missed_span();
                outcome.missed += 1;
                continue;
            }
            span.set_read_start_time(now);

            let src = match buffer.read_buffer(pos) {
                Ok(desc) => desc,
                Err(e) => {
                    log::warn!("Client span at {} unreadable: {}", pos, e);
                    stats.record_protocol_violation();
                    span.store_status(SpanStatus::WriteDone);
                    continue;
                }
            };
            if !span.is_mute() {
                let gain = volume.gain(link.stream_type);
                if gain > 0.0 {
                    // SAFETY: span 处于本方设置的 READING 状态
                    self.mixer
                        .accumulate(unsafe { src.as_slice() }, span.volume_ramp(), gain);
                }
            }
            self.consumed.push((index, pos));
        }

        dst_span.set_write_start_time(now);
        // SAFETY: 设备 buffer 的写端只有工作线程
        self.mixer.finish(unsafe { dst_desc.as_mut_slice() });
        dst_span.set_offset_in_frame(device_pos);
        dst_span.set_write_done_time(now_ns());

        // 设备游标前进一个 span（读写游标一起）
        dst.set_cur_write_frame(device_pos + span_frames)?;
        dst.set_cur_read_frame(device_pos + span_frames)?;

        for &(index, pos) in &self.consumed {
            let buffer = &links[index].buffer;
            let span = buffer.span(pos);
            // SAFETY: span 仍处于本方设置的 READING 状态
            unsafe { buffer.buffer_by_frame(pos).as_mut_slice() }.fill(self.silence);
            span.set_read_done_time(now_ns());
            if let Err(e) = buffer.set_cur_read_frame(pos + span_frames) {
                log::warn!("Client read cursor rejected: {}", e);
                stats.record_protocol_violation();
            }
            span.store_status(SpanStatus::ReadDone);
        }
        outcome.consumed = self.consumed.len();
        Ok(outcome)
    }
}

/// 把设备读游标处的 span 分发给每个运行中的客户端，然后提交
pub fn capture_span(
    src: &AudioRingBuffer,
    links: &[ProcessLink],
    silence: u8,
    stats: &EndpointStats,
) -> Result<CaptureOutcome, BufferError> {
    let device_pos = src.cur_read_frame();
    let span_frames = src.span_frames() as u64;
    let src_desc = src.read_buffer(device_pos)?;
    let src_span = src.span(device_pos);
    let now = now_ns();

    src_span.store_status(SpanStatus::Reading);
    src_span.set_read_start_time(now);
    // SAFETY: 设备 buffer 的读端只有工作线程
    let data = unsafe { src_desc.as_slice() };

    let mut outcome = CaptureOutcome {
        device_pos,
        ..CaptureOutcome::default()
    };
    for link in links {
        if !link.is_running() {
            continue;
        }
        match write_client_span(&link.buffer, data, now) {
            Ok(true) => outcome.delivered += 1,
            Ok(false) => {
                stats.record_overflow();
                outcome.overflowed += 1;
            }
            Err(e) => {
                log::warn!("Client capture span rejected: {}", e);
                stats.record_protocol_violation();
            }
        }
    }

    // SAFETY: 同上；硬件在下一轮之前不会再写这个 span
    unsafe { src_desc.as_mut_slice() }.fill(silence);
    src_span.set_read_done_time(now_ns());
    src_span.store_status(SpanStatus::ReadDone);

    src.set_cur_write_frame(device_pos + span_frames)?;
    src.set_cur_read_frame(device_pos + span_frames)?;
    Ok(outcome)
}

/// 写客户端的下一个 span；没有空位返回 `Ok(false)`
fn write_client_span(buffer: &AudioRingBuffer, data: &[u8], now: i64) -> Result<bool, BufferError> {
    let pos = buffer.cur_write_frame();
    if pos - buffer.cur_read_frame() >= buffer.total_frames() as u64 {
        return Ok(false);
    }
    let span = buffer.span(pos);
    let previous = if span
        .compare_exchange_status(SpanStatus::ReadDone, SpanStatus::Writing)
        .is_ok()
    {
        SpanStatus::ReadDone
    } else if span
        .compare_exchange_status(SpanStatus::Idle, SpanStatus::Writing)
        .is_ok()
    {
        SpanStatus::Idle
    } else {
        return Ok(false);
    };

    span.set_write_start_time(now);
    let desc = match buffer.write_buffer(pos) {
        Ok(desc) => desc,
        Err(e) => {
            span.store_status(previous);
            return Err(e);
        }
    };
    // SAFETY: span 处于本方设置的 WRITING 状态
    let out = unsafe { desc.as_mut_slice() };
    let len = out.len().min(data.len());
    out[..len].copy_from_slice(&data[..len]);
    span.set_offset_in_frame(pos);
    let done = now_ns();
    span.set_write_done_time(done);
    buffer.set_handle_info(pos, done);

    if let Err(e) = buffer.set_cur_write_frame(pos + buffer.span_frames() as u64) {
        span.store_status(previous);
        return Err(e);
    }
    span.store_status(SpanStatus::WriteDone);
    Ok(true)
}

/// 检查运行中的客户端是否都写好了下一个 span，同时发布 handle info
pub fn check_clients_ready(links: &[ProcessLink], now: i64) -> bool {
    let mut all_ready = true;
    for link in links {
        let buffer = &link.buffer;
        let pos = buffer.cur_read_frame();
        if !link.is_running() {
            buffer.set_handle_info(pos, now + IDLE_HANDLE_OFFSET_NS);
            continue;
        }
        buffer.set_handle_info(pos, now);
        if buffer.span(pos).status() != SpanStatus::WriteDone {
            all_ready = false;
        }
    }
    all_ready
}

/// 客户端没写好时的一次等待
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyWait {
    /// 相对睡眠（纳秒）
    For(i64),
    /// 睡到绝对时间
    Until(i64),
}

/// 等到硬件预计读 `write_pos` 之前 1ms；离得太近就至少睡 1ms
pub fn ready_wait(predicted_read: i64, now: i64) -> ReadyWait {
    let target = predicted_read - WRITE_TO_HARDWARE_AHEAD_NS;
    if target - now < MIN_READY_WAIT_NS {
        ReadyWait::For(MIN_READY_WAIT_NS)
    } else {
        ReadyWait::Until(target)
    }
}

/// 客户端最近一个写完的 span：从写游标往回找第一个 WRITE_DONE 的 span
///
/// 退到第一个 span 或读游标之前就停下，返回 (帧位置, 写完时间)
pub fn last_write_done_info(buffer: &AudioRingBuffer) -> (u64, i64) {
    let span = buffer.span_frames() as u64;
    let read = buffer.cur_read_frame();
    let mut pos = buffer.cur_write_frame();
    loop {
        let info = buffer.span(pos);
        if info.status() == SpanStatus::WriteDone || pos < span || pos < read {
            return (pos, info.write_done_time());
        }
        pos -= span;
    }
}

/// 工作线程入口
pub(crate) fn run(core: Arc<EndpointCore>) {
    if core.config.realtime_priority {
        set_worker_priority(core.span_frames, core.info.sample_rate);
    }
    log::debug!("Endpoint {} worker started", core.name);
    WorkLoop::new(core).run();
}

struct WorkLoop {
    core: Arc<EndpointCore>,
    model: PositionTimeModel,
    render: RenderPass,
    spans_since_resync: u64,
    last_sample: Option<HardwarePosition>,
    parked: bool,
}

impl WorkLoop {
    fn new(core: Arc<EndpointCore>) -> Self {
        let render = RenderPass::new(core.info, core.span_frames, core.config.max_linked_streams);
        Self {
            model: PositionTimeModel::new(core.info.sample_rate),
            render,
            spans_since_resync: 0,
            last_sample: None,
            parked: true,
            core,
        }
    }

    fn run(&mut self) {
        while self.core.is_active() {
            if !self.core.keep_running() {
                if !self.parked {
                    self.core.silence_device_buffer();
                    self.parked = true;
                    log::debug!("Endpoint {} worker parked", self.core.name);
                }
                self.core.wait_for_work(IDLE_WAIT);
                continue;
            }

            let resync_requested = self.core.need_resync.swap(false, Ordering::AcqRel);
            if self.parked || resync_requested {
                if !self.resync() {
                    relative_sleep(self.core.span_duration_ns);
                    continue;
                }
                self.parked = false;
            }

            match self.core.role {
                DeviceRole::Output => self.render_cycle(),
                DeviceRole::Input => self.capture_cycle(),
            }
        }
        log::debug!("Endpoint {} worker exited", self.core.name);
    }

    /// 用硬件位置重新对齐设备游标和时间模型
    fn resync(&mut self) -> bool {
        let position = match self.core.adapter.mmap_position() {
            Ok(position) => position,
            Err(e) => {
                self.core.stats.record_position_failure();
                log::warn!("Endpoint {}: resync position query failed: {}", self.core.name, e);
                return false;
            }
        };
        let span = self.core.span_frames as u64;
        let aligned = position.frames / span * span;
        // render 写硬件正在读的下一个 span；capture 读硬件正在写的这个 span
        let cursor = match self.core.role {
            DeviceRole::Output => aligned + span,
            DeviceRole::Input => aligned,
        };

        let dst = &self.core.dst_buffer;
        if let Err(e) = dst.reset_cur_read_write_pos(cursor, cursor) {
            log::error!("Endpoint {}: resync rejected: {}", self.core.name, e);
            return false;
        }
        self.core.init_device_spans();
        dst.set_handle_info(position.frames, position.nano_time);
        self.model.reset_frame_stamp(position.frames, position.nano_time);
        self.last_sample = Some(position);
        self.spans_since_resync = 0;
        self.core.stats.record_resync();
        self.core.poller.signal();
        log::debug!(
            "Endpoint {} resynced at hardware frame {}, cursor {}",
            self.core.name,
            position.frames,
            cursor
        );
        true
    }

    /// 按节奏请求位置查询，并消费轮询线程的最新样本
    fn refresh_model(&mut self) {
        self.spans_since_resync += 1;
        let config = &self.core.config;
        if self.spans_since_resync <= config.resync_start_spans
            || self.spans_since_resync % config.resync_period_spans.max(1) == 0
        {
            self.core.poller.signal();
        }

        if let Some(sample) = self.core.poller.latest() {
            if self.last_sample != Some(sample) {
                self.last_sample = Some(sample);
                if !self.model.update_frame_stamp(sample.frames, sample.nano_time) {
                    self.core.stats.record_rejected_stamp();
                    log::debug!(
                        "Endpoint {}: rejected position sample {} @ {}",
                        self.core.name,
                        sample.frames,
                        sample.nano_time
                    );
                }
            }
        }
    }

    fn sleep_until(&self, wake: i64) -> i64 {
        absolute_sleep(wake);
        let late = now_ns() - wake;
        if late > LATE_WARN_NS {
            self.core.stats.record_late_wakeup();
            log::warn!(
                "Endpoint {}: woke {:.3} ms late",
                self.core.name,
                late as f64 / 1_000_000.0
            );
        } else if late > LATE_DEBUG_NS {
            log::debug!(
                "Endpoint {}: woke {:.3} ms late",
                self.core.name,
                late as f64 / 1_000_000.0
            );
        }
        late
    }

    fn render_cycle(&mut self) {
        let core = Arc::clone(&self.core);
        let dst = &core.dst_buffer;
        let span = core.span_frames as u64;
        let write_pos = dst.cur_write_frame();

        let now = now_ns();
        let ready = check_clients_ready(&lock(&core.links), now);
        if !ready {
            match ready_wait(self.model.time_of_pos(write_pos), now) {
                ReadyWait::For(ns) => relative_sleep(ns),
                ReadyWait::Until(target) => absolute_sleep(target),
            }
        }

        {
            let links = lock(&core.links);
            if let Err(e) = self.render.process(dst, &links, &core.volume, &core.stats) {
                log::error!("Endpoint {}: render cycle failed: {}", core.name, e);
                core.stats.record_protocol_violation();
                core.need_resync.store(true, Ordering::Release);
            }
        }

        self.refresh_model();
        let wake = self.model.time_of_pos(write_pos + span) - core.server_ahead_ns;
        let late = self.sleep_until(wake);
        core.stats.on_cycle(span, late);
    }

    fn capture_cycle(&mut self) {
        let core = Arc::clone(&self.core);
        let dst = &core.dst_buffer;
        let span = core.span_frames as u64;
        let read_pos = dst.cur_read_frame();

        let wake = self.model.time_of_pos(read_pos + span) + CAPTURE_AFTER_WRITE_NS;
        let late = self.sleep_until(wake);
        if !core.is_active() || !core.keep_running() {
            return;
        }

        {
            let links = lock(&core.links);
            if let Err(e) = capture_span(dst, &links, core.info.format.silence_byte(), &core.stats) {
                log::error!("Endpoint {}: capture cycle failed: {}", core.name, e);
                core.stats.record_protocol_violation();
                core.need_resync.store(true, Ordering::Release);
            }
        }
        self.refresh_model();
        core.stats.on_cycle(span, late);
    }
}

/// 提升工作线程优先级
///
/// 优先尝试 SCHED_FIFO，失败（通常是没有权限）时退回 nice -10
#[cfg(target_os = "linux")]
fn set_worker_priority(span_frames: u32, sample_rate: u32) {
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = 2;
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
            log::debug!(
                "Realtime priority set for {} frames @ {}Hz",
                span_frames,
                sample_rate
            );
            return;
        }
        log::debug!(
            "SCHED_FIFO unavailable ({}), falling back to nice -10",
            std::io::Error::last_os_error()
        );
        libc::setpriority(libc::PRIO_PROCESS, 0, -10);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_worker_priority(_span_frames: u32, _sample_rate: u32) {
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, -10);
    }
}
