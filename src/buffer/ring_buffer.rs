//! 共享内存 span 环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者和消费者只通过 span 状态标签（CAS）和游标原子量交接数据
//! - 零分配：所有内存在创建时映射
//! - 跨进程：布局固定，另一个进程 mmap 同一个 fd 就能看到同样的状态
//!
//! 内存布局（little-endian，偏移单位字节）：
//!
//! ```text
//! header (64B)     total_frames u32 | span_frames u32 | bytes_per_frame u32 | stream_status u32
//!                  cur_read u64 | cur_write u64 | handle_pos u64 | handle_time i64 | reserved
//! span[i] (64B)    status u32 | is_mute u32 | offset_in_frame u64
//!                  write_start i64 | write_done i64 | read_start i64 | read_done i64
//!                  volume_start i32 | volume_end i32 | reserved
//! data             total_frames * bytes_per_frame
//! ```
//!
//! 游标是单调递增的帧计数，span 下标 = `(pos / span_frames) % span_count`。
//! 不变量：`cur_write - cur_read <= total_frames`，每个游标只由拥有它的一方推进。
//! 推进顺序：先推进游标，最后释放 span 标签；看到标签的一方一定能看到游标。

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use super::shared_memory::{SharedMemory, SharedRegion};
use crate::audio::timing::now_ns;

/// header 大小（一个 cache line）
pub const HEADER_SIZE: usize = 64;

/// 每个 span 描述符大小
pub const SPAN_INFO_SIZE: usize = 64;

/// Q16 定点音量，`1 << 16` 表示原始音量
pub const UNITY_VOLUME: i32 = 1 << 16;

mod header {
    pub const TOTAL_FRAMES: usize = 0;
    pub const SPAN_FRAMES: usize = 4;
    pub const BYTES_PER_FRAME: usize = 8;
    pub const STREAM_STATUS: usize = 12;
    pub const CUR_READ: usize = 16;
    pub const CUR_WRITE: usize = 24;
    pub const HANDLE_POS: usize = 32;
    pub const HANDLE_TIME: usize = 40;
}

mod span {
    pub const STATUS: usize = 0;
    pub const IS_MUTE: usize = 4;
    pub const OFFSET_IN_FRAME: usize = 8;
    pub const WRITE_START: usize = 16;
    pub const WRITE_DONE: usize = 24;
    pub const READ_START: usize = 32;
    pub const READ_DONE: usize = 40;
    pub const VOLUME_START: usize = 48;
    pub const VOLUME_END: usize = 52;
}

/// 缓冲区错误
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("invalid buffer geometry: total {total_frames} frames, span {span_frames} frames, {bytes_per_frame} bytes/frame")]
    InvalidGeometry {
        total_frames: u32,
        span_frames: u32,
        bytes_per_frame: u32,
    },
    #[error("position {pos} does not map to a span (read cursor {read}, total {total})")]
    PositionOutOfRange { pos: u64, read: u64, total: u32 },
    #[error("cannot move {cursor} cursor from {current} to {requested}")]
    InvalidCursor {
        cursor: &'static str,
        current: u64,
        requested: u64,
    },
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("shared memory mapping failed: {0}")]
    Map(#[from] io::Error),
}

/// span 状态
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanStatus {
    Idle = 0,
    Writing,
    WriteDone,
    Reading,
    ReadDone,
    Invalid,
}

impl SpanStatus {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Writing,
            2 => Self::WriteDone,
            3 => Self::Reading,
            4 => Self::ReadDone,
            _ => Self::Invalid,
        }
    }
}

/// 流状态（由拥有 buffer 的客户端设置）
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Idle = 0,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Released,
    Invalid,
}

impl StreamStatus {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Pausing,
            4 => Self::Paused,
            5 => Self::Stopping,
            6 => Self::Stopped,
            7 => Self::Released,
            _ => Self::Invalid,
        }
    }
}

/// buffer 的持有方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferHolder {
    /// 客户端从服务端收到的 buffer
    Client,
    /// 服务端创建并与客户端共享
    ServerShared,
    /// 服务端与硬件共享（数据区来自驱动）
    ServerOnly,
    /// 独立流
    ServerIndependent,
}

/// 缓冲区几何参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferGeometry {
    pub total_frames: u32,
    pub span_frames: u32,
    pub bytes_per_frame: u32,
}

impl BufferGeometry {
    pub fn new(total_frames: u32, span_frames: u32, bytes_per_frame: u32) -> Self {
        Self {
            total_frames,
            span_frames,
            bytes_per_frame,
        }
    }

    /// `total_frames` 必须是 `span_frames` 的整数倍
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.total_frames == 0
            || self.span_frames == 0
            || self.bytes_per_frame == 0
            || self.total_frames % self.span_frames != 0
        {
            return Err(BufferError::InvalidGeometry {
                total_frames: self.total_frames,
                span_frames: self.span_frames,
                bytes_per_frame: self.bytes_per_frame,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn span_count(&self) -> u32 {
        self.total_frames / self.span_frames
    }

    #[inline]
    pub fn span_bytes(&self) -> usize {
        self.span_frames as usize * self.bytes_per_frame as usize
    }

    #[inline]
    pub fn data_bytes(&self) -> usize {
        self.total_frames as usize * self.bytes_per_frame as usize
    }

    #[inline]
    pub fn info_bytes(&self) -> usize {
        HEADER_SIZE + self.span_count() as usize * SPAN_INFO_SIZE
    }
}

/// 线性音量斜坡（Q16）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeRamp {
    pub start: i32,
    pub end: i32,
}

impl VolumeRamp {
    pub const UNITY: Self = Self {
        start: UNITY_VOLUME,
        end: UNITY_VOLUME,
    };

    pub const SILENT: Self = Self { start: 0, end: 0 };

    pub fn constant(volume: i32) -> Self {
        Self {
            start: volume,
            end: volume,
        }
    }

    /// 从浮点增益构造（1.0 = 原始音量）
    pub fn from_gain(start: f32, end: f32) -> Self {
        Self {
            start: (start * UNITY_VOLUME as f32) as i32,
            end: (end * UNITY_VOLUME as f32) as i32,
        }
    }

    /// 第 `frame` 帧（共 `frames` 帧）的增益
    #[inline]
    pub fn gain_at(&self, frame: usize, frames: usize) -> i64 {
        if frames == 0 || self.start == self.end {
            return self.start as i64;
        }
        let delta = self.end as i64 - self.start as i64;
        self.start as i64 + delta * frame as i64 / frames as i64
    }
}

impl Default for VolumeRamp {
    fn default() -> Self {
        Self::UNITY
    }
}

/// 一个 span 的描述符视图
pub struct SpanInfo<'a> {
    region: &'a SharedRegion,
    base: usize,
}

impl<'a> SpanInfo<'a> {
    #[inline]
    pub fn status(&self) -> SpanStatus {
        SpanStatus::from_raw(
            self.region
                .atomic_u32(self.base + span::STATUS)
                .load(Ordering::Acquire),
        )
    }

    /// CAS 状态转换，失败时返回实际观察到的状态
    #[inline]
    pub fn compare_exchange_status(
        &self,
        current: SpanStatus,
        new: SpanStatus,
    ) -> Result<(), SpanStatus> {
        self.region
            .atomic_u32(self.base + span::STATUS)
            .compare_exchange(
                current as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(SpanStatus::from_raw)
    }

    #[inline]
    pub fn store_status(&self, status: SpanStatus) {
        self.region
            .atomic_u32(self.base + span::STATUS)
            .store(status as u32, Ordering::Release);
    }

    pub fn offset_in_frame(&self) -> u64 {
        self.region
            .atomic_u64(self.base + span::OFFSET_IN_FRAME)
            .load(Ordering::Relaxed)
    }

    pub fn set_offset_in_frame(&self, pos: u64) {
        self.region
            .atomic_u64(self.base + span::OFFSET_IN_FRAME)
            .store(pos, Ordering::Relaxed);
    }

    pub fn write_start_time(&self) -> i64 {
        self.load_time(span::WRITE_START)
    }

    pub fn write_done_time(&self) -> i64 {
        self.load_time(span::WRITE_DONE)
    }

    pub fn read_start_time(&self) -> i64 {
        self.load_time(span::READ_START)
    }

    pub fn read_done_time(&self) -> i64 {
        self.load_time(span::READ_DONE)
    }

    pub fn set_write_start_time(&self, ns: i64) {
        self.store_time(span::WRITE_START, ns);
    }

    pub fn set_write_done_time(&self, ns: i64) {
        self.store_time(span::WRITE_DONE, ns);
    }

    pub fn set_read_start_time(&self, ns: i64) {
        self.store_time(span::READ_START, ns);
    }

    pub fn set_read_done_time(&self, ns: i64) {
        self.store_time(span::READ_DONE, ns);
    }

    pub fn volume_ramp(&self) -> VolumeRamp {
        VolumeRamp {
            start: self
                .region
                .atomic_i32(self.base + span::VOLUME_START)
                .load(Ordering::Relaxed),
            end: self
                .region
                .atomic_i32(self.base + span::VOLUME_END)
                .load(Ordering::Relaxed),
        }
    }

    pub fn set_volume_ramp(&self, ramp: VolumeRamp) {
        self.region
            .atomic_i32(self.base + span::VOLUME_START)
            .store(ramp.start, Ordering::Relaxed);
        self.region
            .atomic_i32(self.base + span::VOLUME_END)
            .store(ramp.end, Ordering::Relaxed);
    }

    pub fn is_mute(&self) -> bool {
        self.region
            .atomic_u32(self.base + span::IS_MUTE)
            .load(Ordering::Relaxed)
            != 0
    }

    pub fn set_mute(&self, mute: bool) {
        self.region
            .atomic_u32(self.base + span::IS_MUTE)
            .store(mute as u32, Ordering::Relaxed);
    }

    /// 重置描述符：清时间戳、音量归一、取消静音
    pub fn reset(&self, status: SpanStatus) {
        self.set_offset_in_frame(0);
        self.set_read_start_time(0);
        self.set_read_done_time(0);
        self.set_write_start_time(0);
        self.set_write_done_time(0);
        self.set_volume_ramp(VolumeRamp::UNITY);
        self.set_mute(false);
        self.store_status(status);
    }

    #[inline]
    fn load_time(&self, field: usize) -> i64 {
        self.region
            .atomic_i64(self.base + field)
            .load(Ordering::Relaxed)
    }

    #[inline]
    fn store_time(&self, field: usize, ns: i64) {
        self.region
            .atomic_i64(self.base + field)
            .store(ns, Ordering::Relaxed);
    }
}

/// 数据区中一个 span 的指针和长度
///
/// 谁能访问由 span 状态决定：只有把 span 转换到 WRITING/READING 的一方
/// 才能在该状态期间访问对应数据
#[derive(Clone, Copy)]
pub struct BufferDesc<'a> {
    ptr: *mut u8,
    len: usize,
    _marker: PhantomData<&'a SharedRegion>,
}

impl<'a> BufferDesc<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// # Safety
    ///
    /// 调用方必须持有该 span 的读权限（span 处于本方设置的 READING/WRITING
    /// 状态，或 buffer 只有本方访问），且期间没有其它写者
    #[inline]
    pub unsafe fn as_slice(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    ///
    /// 调用方必须独占该 span（span 处于本方设置的 WRITING/READING 状态，
    /// 或 buffer 只有本方访问），且返回的切片不与其它切片重叠
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// 共享内存 span 环形缓冲区
pub struct AudioRingBuffer {
    holder: BufferHolder,
    geometry: BufferGeometry,
    span_count: u32,
    info: SharedRegion,
    data: SharedRegion,
}

impl AudioRingBuffer {
    /// 在本地创建（服务端创建后共享给客户端）
    ///
    /// header、span 描述符和数据区在同一段共享内存中，新映射全零，
    /// 所有 span 初始为 IDLE
    pub fn create_local(geometry: BufferGeometry) -> Result<Self, BufferError> {
        geometry.validate()?;
        let info_len = geometry.info_bytes();
        let memory = Arc::new(SharedMemory::create(
            "audio-ring-buffer",
            info_len + geometry.data_bytes(),
        )?);
        let buffer = Self::split(geometry, BufferHolder::ServerShared, memory)?;
        buffer.write_header();
        buffer.init_spans(SpanStatus::Idle);
        Ok(buffer)
    }

    /// 附加到另一方创建的整段共享内存（header + span + 数据）
    ///
    /// header 中的几何参数必须与 `geometry` 一致
    pub fn attach(
        geometry: BufferGeometry,
        holder: BufferHolder,
        memory: Arc<SharedMemory>,
    ) -> Result<Self, BufferError> {
        geometry.validate()?;
        let buffer = Self::split(geometry, holder, memory)?;
        let stored = buffer.stored_geometry();
        if stored != geometry {
            return Err(BufferError::InvalidGeometry {
                total_frames: stored.total_frames,
                span_frames: stored.span_frames,
                bytes_per_frame: stored.bytes_per_frame,
            });
        }
        Ok(buffer)
    }

    /// 数据区来自别处（例如硬件 mmap），状态区在本地创建
    pub fn create_from_remote(
        geometry: BufferGeometry,
        holder: BufferHolder,
        data: Arc<SharedMemory>,
    ) -> Result<Self, BufferError> {
        geometry.validate()?;
        let data_len = geometry.data_bytes();
        let data = SharedRegion::slice(data, 0, data_len).ok_or(BufferError::SizeMismatch {
            expected: data_len,
            actual: 0,
        })?;
        let info_memory = Arc::new(SharedMemory::create(
            "audio-ring-buffer-info",
            geometry.info_bytes(),
        )?);
        let buffer = Self {
            holder,
            geometry,
            span_count: geometry.span_count(),
            info: SharedRegion::whole(info_memory),
            data,
        };
        buffer.write_header();
        buffer.init_spans(SpanStatus::Idle);
        Ok(buffer)
    }

    fn split(
        geometry: BufferGeometry,
        holder: BufferHolder,
        memory: Arc<SharedMemory>,
    ) -> Result<Self, BufferError> {
        let info_len = geometry.info_bytes();
        let data_len = geometry.data_bytes();
        let actual = memory.len();
        let info = SharedRegion::slice(Arc::clone(&memory), 0, info_len);
        let data = SharedRegion::slice(memory, info_len, data_len);
        match (info, data) {
            (Some(info), Some(data)) => Ok(Self {
                holder,
                geometry,
                span_count: geometry.span_count(),
                info,
                data,
            }),
            _ => Err(BufferError::SizeMismatch {
                expected: info_len + data_len,
                actual,
            }),
        }
    }

    fn write_header(&self) {
        self.info
            .atomic_u32(header::TOTAL_FRAMES)
            .store(self.geometry.total_frames, Ordering::Relaxed);
        self.info
            .atomic_u32(header::SPAN_FRAMES)
            .store(self.geometry.span_frames, Ordering::Relaxed);
        self.info
            .atomic_u32(header::BYTES_PER_FRAME)
            .store(self.geometry.bytes_per_frame, Ordering::Relaxed);
        self.set_stream_status(StreamStatus::Idle);
        self.info.atomic_u64(header::CUR_READ).store(0, Ordering::Relaxed);
        self.info.atomic_u64(header::CUR_WRITE).store(0, Ordering::Release);
    }

    fn stored_geometry(&self) -> BufferGeometry {
        BufferGeometry {
            total_frames: self
                .info
                .atomic_u32(header::TOTAL_FRAMES)
                .load(Ordering::Acquire),
            span_frames: self
                .info
                .atomic_u32(header::SPAN_FRAMES)
                .load(Ordering::Acquire),
            bytes_per_frame: self
                .info
                .atomic_u32(header::BYTES_PER_FRAME)
                .load(Ordering::Acquire),
        }
    }

    /// 把所有 span 描述符重置为指定状态
    pub fn init_spans(&self, status: SpanStatus) {
        for index in 0..self.span_count {
            if let Some(span) = self.span_by_index(index) {
                span.reset(status);
            }
        }
    }

    pub fn holder(&self) -> BufferHolder {
        self.holder
    }

    pub fn size_parameter(&self) -> BufferGeometry {
        self.geometry
    }

    #[inline]
    pub fn span_count(&self) -> u32 {
        self.span_count
    }

    #[inline]
    pub fn span_frames(&self) -> u32 {
        self.geometry.span_frames
    }

    #[inline]
    pub fn total_frames(&self) -> u32 {
        self.geometry.total_frames
    }

    /// 状态区所在的共享内存（用于把 fd 传给另一方）
    pub fn info_memory(&self) -> &Arc<SharedMemory> {
        self.info.memory()
    }

    /// 数据区所在的共享内存
    pub fn data_memory(&self) -> &Arc<SharedMemory> {
        self.data.memory()
    }

    /// 锁定状态区和数据区内存
    pub fn lock_memory(&self) -> bool {
        let info = self.info.memory().lock_memory();
        let data = self.data.memory().lock_memory();
        info && data
    }

    #[inline]
    pub fn stream_status(&self) -> StreamStatus {
        StreamStatus::from_raw(
            self.info
                .atomic_u32(header::STREAM_STATUS)
                .load(Ordering::Acquire),
        )
    }

    #[inline]
    pub fn set_stream_status(&self, status: StreamStatus) {
        self.info
            .atomic_u32(header::STREAM_STATUS)
            .store(status as u32, Ordering::Release);
    }

    pub fn handle_info(&self) -> (u64, i64) {
        let frames = self
            .info
            .atomic_u64(header::HANDLE_POS)
            .load(Ordering::Acquire);
        let time = self
            .info
            .atomic_i64(header::HANDLE_TIME)
            .load(Ordering::Acquire);
        (frames, time)
    }

    pub fn set_handle_info(&self, frames: u64, nano_time: i64) {
        self.info
            .atomic_u64(header::HANDLE_POS)
            .store(frames, Ordering::Release);
        self.info
            .atomic_i64(header::HANDLE_TIME)
            .store(nano_time, Ordering::Release);
    }

    #[inline]
    pub fn cur_read_frame(&self) -> u64 {
        self.info.atomic_u64(header::CUR_READ).load(Ordering::Acquire)
    }

    #[inline]
    pub fn cur_write_frame(&self) -> u64 {
        self.info.atomic_u64(header::CUR_WRITE).load(Ordering::Acquire)
    }

    /// 已写入未读取的帧数
    pub fn available_data_frames(&self) -> u64 {
        let read = self.cur_read_frame();
        self.cur_write_frame().saturating_sub(read)
    }

    /// 推进写游标
    ///
    /// 只能按整 span 前进，且不能超过读游标一个 buffer 的容量
    pub fn set_cur_write_frame(&self, write_frame: u64) -> Result<(), BufferError> {
        let old = self.cur_write_frame();
        if write_frame == old {
            return Ok(());
        }
        let read = self.cur_read_frame();
        let span = self.geometry.span_frames as u64;
        if write_frame < old
            || (write_frame - old) % span != 0
            || write_frame - read > self.geometry.total_frames as u64
        {
            return Err(BufferError::InvalidCursor {
                cursor: "write",
                current: old,
                requested: write_frame,
            });
        }
        self.info
            .atomic_u64(header::CUR_WRITE)
            .store(write_frame, Ordering::Release);
        Ok(())
    }

    /// 推进读游标，不能越过写游标
    pub fn set_cur_read_frame(&self, read_frame: u64) -> Result<(), BufferError> {
        let old = self.cur_read_frame();
        if read_frame == old {
            return Ok(());
        }
        let write = self.cur_write_frame();
        if read_frame < old || read_frame > write {
            return Err(BufferError::InvalidCursor {
                cursor: "read",
                current: old,
                requested: read_frame,
            });
        }
        self.info
            .atomic_u64(header::CUR_READ)
            .store(read_frame, Ordering::Release);
        Ok(())
    }

    /// 同时重置读写游标（位置重同步时使用）
    pub fn reset_cur_read_write_pos(&self, read_frame: u64, write_frame: u64) -> Result<(), BufferError> {
        if write_frame < read_frame
            || write_frame - read_frame > self.geometry.total_frames as u64
        {
            return Err(BufferError::InvalidCursor {
                cursor: "read/write",
                current: self.cur_read_frame(),
                requested: read_frame,
            });
        }
        self.info
            .atomic_u64(header::CUR_READ)
            .store(read_frame, Ordering::Release);
        self.info
            .atomic_u64(header::CUR_WRITE)
            .store(write_frame, Ordering::Release);
        Ok(())
    }

    #[inline]
    fn span_index(&self, pos: u64) -> u32 {
        ((pos / self.geometry.span_frames as u64) % self.span_count as u64) as u32
    }

    /// 位置所在 span 的描述符
    #[inline]
    pub fn span(&self, pos: u64) -> SpanInfo<'_> {
        SpanInfo {
            region: &self.info,
            base: HEADER_SIZE + self.span_index(pos) as usize * SPAN_INFO_SIZE,
        }
    }

    pub fn span_by_index(&self, index: u32) -> Option<SpanInfo<'_>> {
        if index >= self.span_count {
            return None;
        }
        Some(SpanInfo {
            region: &self.info,
            base: HEADER_SIZE + index as usize * SPAN_INFO_SIZE,
        })
    }

    /// 位置必须按 span 对齐，且落在 `[cur_read, cur_read + total)` 内
    fn check_pos(&self, pos: u64) -> Result<(), BufferError> {
        let read = self.cur_read_frame();
        let total = self.geometry.total_frames;
        if pos % self.geometry.span_frames as u64 != 0
            || pos < read
            || pos - read >= total as u64
        {
            return Err(BufferError::PositionOutOfRange { pos, read, total });
        }
        Ok(())
    }

    /// 按帧位置取数据区（不检查游标窗口）
    pub fn buffer_by_frame(&self, pos: u64) -> BufferDesc<'_> {
        let span_bytes = self.geometry.span_bytes();
        let offset = self.span_index(pos) as usize * span_bytes;
        BufferDesc {
            ptr: self.data.ptr_at(offset, span_bytes),
            len: span_bytes,
            _marker: PhantomData,
        }
    }

    pub fn write_buffer(&self, pos: u64) -> Result<BufferDesc<'_>, BufferError> {
        self.check_pos(pos)?;
        Ok(self.buffer_by_frame(pos))
    }

    pub fn read_buffer(&self, pos: u64) -> Result<BufferDesc<'_>, BufferError> {
        self.check_pos(pos)?;
        Ok(self.buffer_by_frame(pos))
    }

    /// 用指定字节填充整个数据区
    pub fn fill_data(&self, value: u8) {
        self.data.fill(0, self.data.len(), value);
    }

    /// 清零整个数据区
    pub fn clear_data(&self) {
        self.fill_data(0);
    }

    /// 客户端写一个 span（生产者）
    ///
    /// 返回 `Ok(false)` 表示 buffer 已满或该 span 尚未被消费
    pub fn try_write_span(&self, data: &[u8], ramp: VolumeRamp, mute: bool) -> Result<bool, BufferError> {
        let span_bytes = self.geometry.span_bytes();
        if data.len() != span_bytes {
            return Err(BufferError::SizeMismatch {
                expected: span_bytes,
                actual: data.len(),
            });
        }

        let pos = self.cur_write_frame();
        if pos - self.cur_read_frame() >= self.geometry.total_frames as u64 {
            return Ok(false);
        }

        let span = self.span(pos);
        let previous = match span.compare_exchange_status(SpanStatus::ReadDone, SpanStatus::Writing) {
            Ok(()) => SpanStatus::ReadDone,
            Err(SpanStatus::Idle) => {
                if span
                    .compare_exchange_status(SpanStatus::Idle, SpanStatus::Writing)
                    .is_err()
                {
                    return Ok(false);
                }
                SpanStatus::Idle
            }
            Err(_) => return Ok(false),
        };

        span.set_write_start_time(now_ns());
        span.set_offset_in_frame(pos);
        let desc = match self.write_buffer(pos) {
            Ok(desc) => desc,
            Err(e) => {
                span.store_status(previous);
                return Err(e);
            }
        };
        // SAFETY: span 处于本方设置的 WRITING 状态
        unsafe { desc.as_mut_slice() }.copy_from_slice(data);
        span.set_volume_ramp(ramp);
        span.set_mute(mute);
        span.set_write_done_time(now_ns());

        if let Err(e) = self.set_cur_write_frame(pos + self.geometry.span_frames as u64) {
            span.store_status(previous);
            return Err(e);
        }
        span.store_status(SpanStatus::WriteDone);
        Ok(true)
    }

    /// 客户端读一个 span（消费者）
    ///
    /// 返回 `Ok(false)` 表示下一个 span 还没写完
    pub fn try_read_span(&self, out: &mut [u8]) -> Result<bool, BufferError> {
        let span_bytes = self.geometry.span_bytes();
        if out.len() != span_bytes {
            return Err(BufferError::SizeMismatch {
                expected: span_bytes,
                actual: out.len(),
            });
        }

        let pos = self.cur_read_frame();
        let span = self.span(pos);
        if span
            .compare_exchange_status(SpanStatus::WriteDone, SpanStatus::Reading)
            .is_err()
        {
            return Ok(false);
        }

        span.set_read_start_time(now_ns());
        let desc = match self.read_buffer(pos) {
            Ok(desc) => desc,
            Err(e) => {
                span.store_status(SpanStatus::WriteDone);
                return Err(e);
            }
        };
        // SAFETY: span 处于本方设置的 READING 状态
        out.copy_from_slice(unsafe { desc.as_slice() });
        span.set_read_done_time(now_ns());

        if let Err(e) = self.set_cur_read_frame(pos + self.geometry.span_frames as u64) {
            span.store_status(SpanStatus::WriteDone);
            return Err(e);
        }
        span.store_status(SpanStatus::ReadDone);
        Ok(true)
    }
}

impl fmt::Debug for AudioRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioRingBuffer")
            .field("holder", &self.holder)
            .field("geometry", &self.geometry)
            .field("cur_read", &self.cur_read_frame())
            .field("cur_write", &self.cur_write_frame())
            .field("stream_status", &self.stream_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stereo_s16(total: u32, span: u32) -> AudioRingBuffer {
        AudioRingBuffer::create_local(BufferGeometry::new(total, span, 4)).unwrap()
    }

    fn span_of(value: u8, bytes: usize) -> Vec<u8> {
        vec![value; bytes]
    }

    #[test]
    fn test_geometry_validation() {
        assert!(BufferGeometry::new(960, 240, 4).validate().is_ok());
        assert!(BufferGeometry::new(1000, 240, 4).validate().is_err());
        assert!(BufferGeometry::new(960, 0, 4).validate().is_err());
        assert!(BufferGeometry::new(960, 240, 0).validate().is_err());
        assert!(AudioRingBuffer::create_local(BufferGeometry::new(0, 240, 4)).is_err());
    }

    #[test]
    fn test_layout_sizes() {
        let geometry = BufferGeometry::new(960, 240, 4);
        assert_eq!(geometry.span_count(), 4);
        assert_eq!(geometry.span_bytes(), 960);
        assert_eq!(geometry.info_bytes(), HEADER_SIZE + 4 * SPAN_INFO_SIZE);
    }

    #[test]
    fn test_write_then_read_is_byte_identical() {
        let rb = stereo_s16(960, 240);
        let data: Vec<u8> = (0..960).map(|i| (i * 7 % 251) as u8).collect();

        assert!(rb.try_write_span(&data, VolumeRamp::UNITY, false).unwrap());
        assert_eq!(rb.span(0).status(), SpanStatus::WriteDone);
        assert_eq!(rb.cur_write_frame(), 240);

        let mut out = vec![0u8; 960];
        assert!(rb.try_read_span(&mut out).unwrap());
        assert_eq!(out, data);
        assert_eq!(rb.span(0).status(), SpanStatus::ReadDone);
        assert_eq!(rb.cur_read_frame(), 240);
    }

    #[test]
    fn test_producer_never_overwrites_unconsumed_span() {
        let rb = stereo_s16(480, 240);
        let bytes = 960;

        assert!(rb.try_write_span(&span_of(1, bytes), VolumeRamp::UNITY, false).unwrap());
        assert!(rb.try_write_span(&span_of(2, bytes), VolumeRamp::UNITY, false).unwrap());
        // 满了
        assert!(!rb.try_write_span(&span_of(3, bytes), VolumeRamp::UNITY, false).unwrap());
        assert_eq!(rb.available_data_frames(), 480);

        let mut out = vec![0u8; bytes];
        assert!(rb.try_read_span(&mut out).unwrap());
        assert_eq!(out[0], 1);
        assert!(rb.try_write_span(&span_of(3, bytes), VolumeRamp::UNITY, false).unwrap());

        assert!(rb.try_read_span(&mut out).unwrap());
        assert_eq!(out[0], 2);
        assert!(rb.try_read_span(&mut out).unwrap());
        assert_eq!(out[0], 3);
        assert!(!rb.try_read_span(&mut out).unwrap());
    }

    #[test]
    fn test_consumer_skips_span_not_write_done() {
        let rb = stereo_s16(480, 240);
        rb.span(0).store_status(SpanStatus::Writing);
        let mut out = vec![0u8; 960];
        assert!(!rb.try_read_span(&mut out).unwrap());
        // 状态不被强制修改
        assert_eq!(rb.span(0).status(), SpanStatus::Writing);
    }

    #[test]
    fn test_span_ramp_and_mute_stored() {
        let rb = stereo_s16(480, 240);
        let ramp = VolumeRamp::from_gain(0.5, 0.25);
        assert!(rb.try_write_span(&span_of(0, 960), ramp, true).unwrap());
        let span = rb.span(0);
        assert_eq!(span.volume_ramp(), ramp);
        assert!(span.is_mute());
        assert!(span.write_done_time() >= span.write_start_time());
        assert_eq!(span.offset_in_frame(), 0);
    }

    #[test]
    fn test_buffer_pos_must_map_to_span() {
        let rb = stereo_s16(960, 240);
        assert!(rb.write_buffer(0).is_ok());
        assert!(rb.write_buffer(720).is_ok());
        // 未对齐
        assert!(matches!(
            rb.write_buffer(100),
            Err(BufferError::PositionOutOfRange { .. })
        ));
        // 超出窗口
        assert!(rb.read_buffer(960).is_err());

        rb.reset_cur_read_write_pos(480, 480).unwrap();
        assert!(rb.read_buffer(240).is_err());
        assert!(rb.read_buffer(1200).is_ok());
        assert_eq!(rb.read_buffer(1200).unwrap().len(), 960);
    }

    #[test]
    fn test_cursor_rules() {
        let rb = stereo_s16(960, 240);
        // 非整 span
        assert!(rb.set_cur_write_frame(100).is_err());
        // 超过容量
        assert!(rb.set_cur_write_frame(1200).is_err());
        rb.set_cur_write_frame(960).unwrap();
        // 读不能越过写
        assert!(rb.set_cur_read_frame(1200).is_err());
        rb.set_cur_read_frame(240).unwrap();
        // 不能后退
        assert!(rb.set_cur_read_frame(0).is_err());
        assert!(rb.set_cur_write_frame(720).is_err());
        assert!(rb.reset_cur_read_write_pos(0, 1200).is_err());
        assert!(rb.reset_cur_read_write_pos(100, 50).is_err());
    }

    #[test]
    fn test_stream_status_and_handle_info() {
        let rb = stereo_s16(960, 240);
        assert_eq!(rb.stream_status(), StreamStatus::Idle);
        rb.set_stream_status(StreamStatus::Running);
        assert_eq!(rb.stream_status(), StreamStatus::Running);

        rb.set_handle_info(480, 123_456);
        assert_eq!(rb.handle_info(), (480, 123_456));
    }

    #[test]
    fn test_attach_shares_state() {
        let geometry = BufferGeometry::new(960, 240, 4);
        let server = AudioRingBuffer::create_local(geometry).unwrap();
        let client =
            AudioRingBuffer::attach(geometry, BufferHolder::Client, Arc::clone(server.info_memory()))
                .unwrap();

        assert!(client.try_write_span(&span_of(9, 960), VolumeRamp::UNITY, false).unwrap());
        assert_eq!(server.cur_write_frame(), 240);
        let mut out = vec![0u8; 960];
        assert!(server.try_read_span(&mut out).unwrap());
        assert_eq!(out[0], 9);
        assert_eq!(client.cur_read_frame(), 240);

        // 几何参数不一致
        let wrong = BufferGeometry::new(480, 240, 4);
        assert!(AudioRingBuffer::attach(wrong, BufferHolder::Client, Arc::clone(server.info_memory())).is_err());
    }

    #[test]
    fn test_create_from_remote_uses_given_data() {
        let geometry = BufferGeometry::new(480, 240, 4);
        let data = Arc::new(SharedMemory::anonymous(geometry.data_bytes()).unwrap());
        let rb = AudioRingBuffer::create_from_remote(geometry, BufferHolder::ServerOnly, Arc::clone(&data))
            .unwrap();
        assert_eq!(rb.holder(), BufferHolder::ServerOnly);

        rb.fill_data(0x5A);
        let raw = unsafe { std::slice::from_raw_parts(data.as_ptr(), geometry.data_bytes()) };
        assert!(raw.iter().all(|&b| b == 0x5A));

        let small = Arc::new(SharedMemory::anonymous(100).unwrap());
        assert!(AudioRingBuffer::create_from_remote(geometry, BufferHolder::ServerOnly, small).is_err());
    }

    #[test]
    fn test_volume_ramp_interpolation() {
        let ramp = VolumeRamp {
            start: 0,
            end: UNITY_VOLUME,
        };
        assert_eq!(ramp.gain_at(0, 4), 0);
        assert_eq!(ramp.gain_at(2, 4), (UNITY_VOLUME / 2) as i64);
        assert_eq!(VolumeRamp::UNITY.gain_at(3, 4), UNITY_VOLUME as i64);

        // 斜坡跨越整个 i32 范围
        let full = VolumeRamp {
            start: i32::MIN,
            end: i32::MAX,
        };
        assert_eq!(full.gain_at(0, 2), i32::MIN as i64);
        assert_eq!(full.gain_at(1, 2), -1);
        assert_eq!(full.gain_at(2, 2), i32::MAX as i64);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(u8),
        Read,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u8>().prop_map(Op::Write), Just(Op::Read)]
    }

    proptest! {
        #[test]
        fn prop_cursor_bounds_and_fifo(
            span_count in 1u32..6,
            ops in proptest::collection::vec(op_strategy(), 1..64),
        ) {
            let span = 16u32;
            let rb = AudioRingBuffer::create_local(BufferGeometry::new(span * span_count, span, 2)).unwrap();
            let bytes = (span * 2) as usize;
            let mut expected = std::collections::VecDeque::new();
            let mut out = vec![0u8; bytes];

            for op in ops {
                match op {
                    Op::Write(v) => {
                        if rb.try_write_span(&vec![v; bytes], VolumeRamp::UNITY, false).unwrap() {
                            expected.push_back(v);
                        }
                    }
                    Op::Read => {
                        if rb.try_read_span(&mut out).unwrap() {
                            let v = expected.pop_front().unwrap();
                            prop_assert!(out.iter().all(|&b| b == v));
                        } else {
                            prop_assert!(expected.is_empty());
                        }
                    }
                }
                let used = rb.cur_write_frame() - rb.cur_read_frame();
                prop_assert!(used <= rb.total_frames() as u64);
                prop_assert_eq!(used, expected.len() as u64 * span as u64);
            }
        }
    }
}
