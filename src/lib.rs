//! Audio Endpoint Library
//!
//! 低时延 mmap 音频通路：客户端通过共享内存 span ring buffer 交换音频，
//! Endpoint 的实时线程负责混音（render）或分发（capture），
//! 并用硬件位置-时间模型决定什么时候醒来。

pub mod audio;
pub mod buffer;
pub mod device;
pub mod endpoint;
pub mod stream;

pub use audio::{AudioStreamInfo, EndpointStats, SampleFormat};
pub use buffer::{AudioRingBuffer, BufferGeometry, SpanStatus, StreamStatus, VolumeRamp};
pub use device::{
    AdapterRegistry, DeviceDescriptor, DeviceRole, DeviceType, HardwareIoAdapter, VirtualDevice,
    VirtualDeviceConfig,
};
pub use endpoint::{Endpoint, EndpointConfig, EndpointError, EndpointStatus, EndpointType};
pub use stream::{AudioStreamType, ClientStream, ProcessStream, SharedVolumeTable, VolumeProvider};
