//! 共享内存缓冲区
//!
//! - SharedMemory: memfd/匿名映射 + mlock
//! - AudioRingBuffer: span 状态协议的环形缓冲区

pub mod ring_buffer;
pub mod shared_memory;

pub use ring_buffer::{
    AudioRingBuffer, BufferDesc, BufferError, BufferGeometry, BufferHolder, SpanInfo,
    SpanStatus, StreamStatus, VolumeRamp, UNITY_VOLUME,
};
pub use shared_memory::{SharedMemory, SharedRegion};
