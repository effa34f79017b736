//! 音频格式和样本编解码
//!
//! 混音使用原生数值表示（不做左对齐）：
//! - U8: 偏移二进制，解码后范围 [-128, 127]
//! - S16LE: [-32768, 32767]
//! - S24LE: 3 字节 little-endian，符号扩展到 i32
//! - S32LE: 完整 i32

use std::fmt;

/// 每秒纳秒数
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// 样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16Le,
    S24Le,
    S32Le,
}

impl SampleFormat {
    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::S32Le => 4,
        }
    }

    /// 可表示的最小值
    #[inline]
    pub fn min_value(self) -> i64 {
        match self {
            Self::U8 => -128,
            Self::S16Le => i16::MIN as i64,
            Self::S24Le => -(1 << 23),
            Self::S32Le => i32::MIN as i64,
        }
    }

    /// 可表示的最大值
    #[inline]
    pub fn max_value(self) -> i64 {
        match self {
            Self::U8 => 127,
            Self::S16Le => i16::MAX as i64,
            Self::S24Le => (1 << 23) - 1,
            Self::S32Le => i32::MAX as i64,
        }
    }

    /// 钳位到格式可表示范围
    #[inline]
    pub fn clamp(self, value: i64) -> i64 {
        value.clamp(self.min_value(), self.max_value())
    }

    /// 解码单个样本
    ///
    /// `bytes` 长度必须至少为 `bytes_per_sample()`
    #[inline]
    pub fn decode(self, bytes: &[u8]) -> i32 {
        match self {
            Self::U8 => bytes[0] as i32 - 128,
            Self::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            Self::S24Le => {
                // chunk[0] = LSB, chunk[2] = MSB (含符号位)
                let raw = (bytes[0] as i32) | ((bytes[1] as i32) << 8) | ((bytes[2] as i32) << 16);
                // 先左移把符号位移到 bit31，再算术右移恢复
                (raw << 8) >> 8
            }
            Self::S32Le => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// 编码单个样本（调用方保证 value 已经钳位）
    #[inline]
    pub fn encode(self, value: i32, out: &mut [u8]) {
        match self {
            Self::U8 => out[0] = (value + 128) as u8,
            Self::S16Le => out[..2].copy_from_slice(&(value as i16).to_le_bytes()),
            Self::S24Le => {
                out[0] = (value & 0xFF) as u8;
                out[1] = ((value >> 8) & 0xFF) as u8;
                out[2] = ((value >> 16) & 0xFF) as u8;
            }
            Self::S32Le => out[..4].copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// 静音对应的字节值
    ///
    /// U8 是偏移二进制，静音是 0x80，其它格式都是 0
    #[inline]
    pub fn silence_byte(self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "U8",
            Self::S16Le => "S16LE",
            Self::S24Le => "S24LE",
            Self::S32Le => "S32LE",
        };
        f.write_str(name)
    }
}

/// 流格式信息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

impl AudioStreamInfo {
    pub fn new(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
        }
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// 帧数对应的时长（纳秒）
    #[inline]
    pub fn frames_to_ns(&self, frames: u64) -> i64 {
        (frames as i128 * NANOS_PER_SECOND as i128 / self.sample_rate as i128) as i64
    }

    /// 将字节解码为原生数值样本
    ///
    /// 返回实际解码的样本数
    pub fn bytes_to_samples(&self, bytes: &[u8], output: &mut [i32]) -> usize {
        let width = self.format.bytes_per_sample();
        let mut count = 0;
        for (chunk, slot) in bytes.chunks_exact(width).zip(output.iter_mut()) {
            *slot = self.format.decode(chunk);
            count += 1;
        }
        count
    }

    /// 将原生数值样本编码为字节（超出范围的值先钳位）
    pub fn samples_to_bytes(&self, samples: &[i32], output: &mut [u8]) {
        let width = self.format.bytes_per_sample();
        for (&sample, chunk) in samples.iter().zip(output.chunks_exact_mut(width)) {
            let clamped = self.format.clamp(sample as i64) as i32;
            self.format.encode(clamped, chunk);
        }
    }
}

impl fmt::Display for AudioStreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz {}ch {}", self.sample_rate, self.channels, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_16bit_roundtrip() {
        let info = AudioStreamInfo::new(48000, 1, SampleFormat::S16Le);

        let input_bytes = [0x00, 0x40, 0x00, 0xC0]; // +16384, -16384
        let mut samples = [0i32; 2];
        assert_eq!(info.bytes_to_samples(&input_bytes, &mut samples), 2);
        assert_eq!(samples, [16384, -16384]);

        let mut output_bytes = [0u8; 4];
        info.samples_to_bytes(&samples, &mut output_bytes);
        assert_eq!(input_bytes, output_bytes);
    }

    #[test]
    fn test_24bit_sign_extend() {
        let format = SampleFormat::S24Le;

        // 最大正值: 0x7FFFFF
        assert_eq!(format.decode(&[0xFF, 0xFF, 0x7F]), 0x7FFFFF);
        // 最小负值: 0x800000 = -8388608
        assert_eq!(format.decode(&[0x00, 0x00, 0x80]), -8388608);
        // -1: 0xFFFFFF
        assert_eq!(format.decode(&[0xFF, 0xFF, 0xFF]), -1);

        let mut out = [0u8; 3];
        format.encode(-8388608, &mut out);
        assert_eq!(out, [0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_u8_is_offset_binary() {
        let format = SampleFormat::U8;
        assert_eq!(format.decode(&[0x80]), 0);
        assert_eq!(format.decode(&[0x00]), -128);
        assert_eq!(format.silence_byte(), 0x80);

        let mut out = [0u8; 1];
        format.encode(127, &mut out);
        assert_eq!(out, [0xFF]);
    }

    #[test]
    fn test_samples_to_bytes_clamps() {
        let info = AudioStreamInfo::new(48000, 2, SampleFormat::S16Le);
        let mut out = [0u8; 4];
        info.samples_to_bytes(&[100_000, -100_000], &mut out);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), i16::MIN);
    }

    #[test]
    fn test_frames_to_ns() {
        let info = AudioStreamInfo::new(48000, 2, SampleFormat::S16Le);
        assert_eq!(info.bytes_per_frame(), 4);
        assert_eq!(info.frames_to_ns(240), 5_000_000);
        assert_eq!(info.frames_to_ns(48000), NANOS_PER_SECOND);
    }
}
