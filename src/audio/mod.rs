//! 音频基础模块
//!
//! 包含：
//! - Format: 样本格式和编解码
//! - Timing: 单调时钟和绝对睡眠
//! - Stats: Endpoint 统计

pub mod format;
pub mod stats;
pub mod timing;

pub use format::{AudioStreamInfo, SampleFormat, NANOS_PER_SECOND};
pub use stats::{EndpointStats, StatsReport};
