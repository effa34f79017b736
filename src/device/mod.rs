//! 硬件 IO 适配层
//!
//! Endpoint 只通过 [`HardwareIoAdapter`] 访问设备：初始化、启停、
//! 获取 mmap buffer、查询硬件位置。真实驱动适配在 crate 之外实现，
//! 这里提供注册表和一个时钟驱动的 [`VirtualDevice`]。

pub mod virtual_device;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::audio::{AudioStreamInfo, SampleFormat};
use crate::buffer::SharedMemory;

pub use virtual_device::{VirtualDevice, VirtualDeviceConfig, VirtualDeviceCounters};

/// 本地设备的 network id
pub const LOCAL_NETWORK_ID: &str = "LocalDevice";

/// 设备方向
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// 播放（render）
    Output,
    /// 录音（capture）
    Input,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => f.write_str("output"),
            Self::Input => f.write_str("input"),
        }
    }
}

/// 设备类型（音量查询按设备类型区分）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Speaker,
    Earpiece,
    WiredHeadset,
    WiredHeadphones,
    UsbHeadset,
    BluetoothSco,
    Mic,
}

/// 适配器位置：本机驱动或远端设备
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterLocation {
    Local,
    Remote,
}

/// 设备描述
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub role: DeviceRole,
    pub device_type: DeviceType,
    pub network_id: String,
    pub device_id: i32,
    pub device_name: String,
    /// 支持的采样率，使用最高的一个
    pub sample_rates: Vec<u32>,
    /// 支持的声道数，使用最多的一个
    pub channels: Vec<u16>,
    pub format: SampleFormat,
}

impl DeviceDescriptor {
    /// 本机设备
    pub fn local(
        role: DeviceRole,
        device_type: DeviceType,
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
    ) -> Self {
        Self {
            role,
            device_type,
            network_id: LOCAL_NETWORK_ID.to_string(),
            device_id: 0,
            device_name: String::new(),
            sample_rates: vec![sample_rate],
            channels: vec![channels],
            format,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.network_id != LOCAL_NETWORK_ID
    }

    pub fn location(&self) -> AdapterLocation {
        if self.is_remote() {
            AdapterLocation::Remote
        } else {
            AdapterLocation::Local
        }
    }

    /// 设备使用的流格式：最高采样率、最多声道
    pub fn stream_info(&self) -> Option<AudioStreamInfo> {
        let sample_rate = self.sample_rates.iter().copied().max()?;
        let channels = self.channels.iter().copied().max()?;
        if sample_rate == 0 || channels == 0 {
            return None;
        }
        Some(AudioStreamInfo::new(sample_rate, channels, self.format))
    }
}

/// 传给适配器 `init` 的设备属性
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceAttr {
    pub role: DeviceRole,
    pub device_type: DeviceType,
    pub network_id: String,
    pub stream_info: AudioStreamInfo,
}

/// 硬件 mmap buffer
#[derive(Clone)]
pub struct MmapBufferInfo {
    pub memory: Arc<SharedMemory>,
    pub total_frames: u32,
    pub span_frames: u32,
    pub bytes_per_frame: u32,
}

impl fmt::Debug for MmapBufferInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapBufferInfo")
            .field("len", &self.memory.len())
            .field("total_frames", &self.total_frames)
            .field("span_frames", &self.span_frames)
            .field("bytes_per_frame", &self.bytes_per_frame)
            .finish()
    }
}

/// 硬件位置：已处理帧数和对应的单调时间
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardwarePosition {
    pub frames: u64,
    pub nano_time: i64,
}

/// 适配器错误
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter {op} failed with code {code}")]
    Failed { op: &'static str, code: i32 },
    #[error("adapter is not initialised")]
    NotInited,
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
}

/// 硬件 IO 适配器
///
/// 所有方法都取 `&self`：worker、位置轮询线程和控制路径共享同一个适配器
pub trait HardwareIoAdapter: Send + Sync {
    fn init(&self, attr: &DeviceAttr) -> Result<(), AdapterError>;
    fn is_inited(&self) -> bool;
    fn start(&self) -> Result<(), AdapterError>;
    fn stop(&self) -> Result<(), AdapterError>;
    fn deinit(&self) -> Result<(), AdapterError>;
    fn mmap_buffer_info(&self) -> Result<MmapBufferInfo, AdapterError>;
    fn mmap_position(&self) -> Result<HardwarePosition, AdapterError>;
    fn set_volume(&self, left: f32, right: f32) -> Result<(), AdapterError>;
}

type AdapterFactory = Box<dyn Fn() -> Arc<dyn HardwareIoAdapter> + Send + Sync>;

/// 适配器注册表
///
/// 按 (方向, 位置) 注册工厂；进程启动时构造一次并注入
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<(DeviceRole, AdapterLocation), AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, role: DeviceRole, location: AdapterLocation, factory: F)
    where
        F: Fn() -> Arc<dyn HardwareIoAdapter> + Send + Sync + 'static,
    {
        if self
            .factories
            .insert((role, location), Box::new(factory))
            .is_some()
        {
            log::debug!("Adapter factory for {} {:?} replaced", role, location);
        }
    }

    pub fn adapter(&self, role: DeviceRole, location: AdapterLocation) -> Option<Arc<dyn HardwareIoAdapter>> {
        self.factories.get(&(role, location)).map(|factory| factory())
    }

    /// 按设备描述选择适配器
    pub fn adapter_for(&self, device: &DeviceDescriptor) -> Option<Arc<dyn HardwareIoAdapter>> {
        self.adapter(device.role, device.location())
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("entries", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
