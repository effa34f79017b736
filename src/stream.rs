//! 客户端流
//!
//! Endpoint 通过 [`ProcessStream`] 看到一个客户端：它的共享 ring buffer、
//! 流格式和流类型。音量通过 [`VolumeProvider`] 按 (音量类型, 设备类型) 查询。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::audio::AudioStreamInfo;
use crate::buffer::{AudioRingBuffer, BufferError, BufferGeometry, StreamStatus, VolumeRamp};
use crate::device::DeviceType;

/// 流类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AudioStreamType {
    Default,
    Music,
    Movie,
    Game,
    Speech,
    Ring,
    Alarm,
    Notification,
    VoiceCall,
    VoiceAssistant,
    System,
    Accessibility,
}

/// 音量类型（多个流类型共用一个音量）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VolumeType {
    Music,
    Ring,
    Alarm,
    VoiceCall,
    VoiceAssistant,
    System,
    Accessibility,
}

impl AudioStreamType {
    pub fn volume_type(self) -> VolumeType {
        match self {
            Self::Default | Self::Music | Self::Movie | Self::Game | Self::Speech => VolumeType::Music,
            Self::Ring | Self::Notification => VolumeType::Ring,
            Self::Alarm => VolumeType::Alarm,
            Self::VoiceCall => VolumeType::VoiceCall,
            Self::VoiceAssistant => VolumeType::VoiceAssistant,
            Self::System => VolumeType::System,
            Self::Accessibility => VolumeType::Accessibility,
        }
    }
}

/// 共享音量
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Volume {
    pub is_mute: bool,
    /// 线性增益，1.0 为原始音量
    pub gain: f32,
}

impl Volume {
    pub const UNITY: Self = Self {
        is_mute: false,
        gain: 1.0,
    };

    /// 有效增益（静音时为 0）
    pub fn effective_gain(&self) -> f32 {
        if self.is_mute {
            0.0
        } else {
            self.gain
        }
    }
}

/// 系统音量来源
pub trait VolumeProvider: Send + Sync {
    /// `None` 表示没有设置，按原始音量处理
    fn shared_volume(&self, volume_type: VolumeType, device_type: DeviceType) -> Option<Volume>;
}

/// 进程内音量表
#[derive(Debug, Default)]
pub struct SharedVolumeTable {
    entries: RwLock<HashMap<(VolumeType, DeviceType), Volume>>,
}

impl SharedVolumeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_volume(&self, volume_type: VolumeType, device_type: DeviceType, volume: Volume) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((volume_type, device_type), volume);
    }

    pub fn remove(&self, volume_type: VolumeType, device_type: DeviceType) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(volume_type, device_type));
    }
}

impl VolumeProvider for SharedVolumeTable {
    fn shared_volume(&self, volume_type: VolumeType, device_type: DeviceType) -> Option<Volume> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(volume_type, device_type))
            .copied()
    }
}

/// Endpoint 看到的客户端流
pub trait ProcessStream: Send + Sync {
    fn stream_buffer(&self) -> Arc<AudioRingBuffer>;
    fn stream_info(&self) -> AudioStreamInfo;
    fn stream_type(&self) -> AudioStreamType;
}

/// 进程内客户端流：自己创建共享 buffer，并按 span 协议读写
#[derive(Debug)]
pub struct ClientStream {
    buffer: Arc<AudioRingBuffer>,
    info: AudioStreamInfo,
    stream_type: AudioStreamType,
}

impl ClientStream {
    pub fn new(
        info: AudioStreamInfo,
        span_frames: u32,
        span_count: u32,
        stream_type: AudioStreamType,
    ) -> Result<Self, BufferError> {
        let geometry = BufferGeometry::new(
            span_frames.saturating_mul(span_count),
            span_frames,
            info.bytes_per_frame() as u32,
        );
        let buffer = AudioRingBuffer::create_local(geometry)?;
        Ok(Self {
            buffer: Arc::new(buffer),
            info,
            stream_type,
        })
    }

    pub fn buffer(&self) -> &Arc<AudioRingBuffer> {
        &self.buffer
    }

    pub fn span_bytes(&self) -> usize {
        self.buffer.size_parameter().span_bytes()
    }

    pub fn status(&self) -> StreamStatus {
        self.buffer.stream_status()
    }

    pub fn start(&self) {
        self.buffer.set_stream_status(StreamStatus::Running);
    }

    pub fn pause(&self) {
        self.buffer.set_stream_status(StreamStatus::Paused);
    }

    pub fn stop(&self) {
        self.buffer.set_stream_status(StreamStatus::Stopped);
    }

    /// 写一个 span（render 客户端），满了返回 `Ok(false)`
    pub fn write_span(&self, data: &[u8], ramp: VolumeRamp, mute: bool) -> Result<bool, BufferError> {
        self.buffer.try_write_span(data, ramp, mute)
    }

    /// 读一个 span（capture 客户端），没有数据返回 `Ok(false)`
    pub fn read_span(&self, out: &mut [u8]) -> Result<bool, BufferError> {
        self.buffer.try_read_span(out)
    }

    /// Endpoint 最近发布的 (帧位置, 时间)
    pub fn handle_info(&self) -> (u64, i64) {
        self.buffer.handle_info()
    }
}

impl ProcessStream for ClientStream {
    fn stream_buffer(&self) -> Arc<AudioRingBuffer> {
        Arc::clone(&self.buffer)
    }

    fn stream_info(&self) -> AudioStreamInfo {
        self.info
    }

    fn stream_type(&self) -> AudioStreamType {
        self.stream_type
    }
}
