//! Span 混音
//!
//! 累加器用 i64：多个满幅 S32 样本叠加也不会溢出，最后统一钳位到输出格式。
//! 增益都是 Q16 定点：`sample * gain >> 16`。

use crate::audio::AudioStreamInfo;
use crate::buffer::{VolumeRamp, UNITY_VOLUME};

/// 可复用的 span 混音器
///
/// 每个周期 `begin` → 若干次 `accumulate` → `finish`，热路径上不分配内存
pub struct SpanMixer {
    info: AudioStreamInfo,
    span_frames: usize,
    acc: Vec<i64>,
    sources: usize,
}

impl SpanMixer {
    pub fn new(info: AudioStreamInfo, span_frames: u32) -> Self {
        let samples = span_frames as usize * info.channels as usize;
        Self {
            info,
            span_frames: span_frames as usize,
            acc: vec![0; samples],
            sources: 0,
        }
    }

    pub fn span_bytes(&self) -> usize {
        self.span_frames * self.info.bytes_per_frame()
    }

    /// 本周期混入的源数量
    pub fn sources(&self) -> usize {
        self.sources
    }

    pub fn begin(&mut self) {
        self.acc.fill(0);
        self.sources = 0;
    }

    /// 混入一个源 span
    ///
    /// `ramp` 是 span 自带的线性音量斜坡，`gain` 是系统音量（1.0 为原始音量）。
    /// 斜坡来自客户端共享内存，每帧增益钳位到 `[0, UNITY_VOLUME]`
    pub fn accumulate(&mut self, src: &[u8], ramp: VolumeRamp, gain: f32) {
        let format = self.info.format;
        let width = format.bytes_per_sample();
        let channels = self.info.channels as usize;
        let system_gain = (gain as f64 * UNITY_VOLUME as f64).round().max(0.0) as i64;

        for (frame_index, frame) in src
            .chunks_exact(width * channels)
            .take(self.span_frames)
            .enumerate()
        {
            let ramp_gain = ramp
                .gain_at(frame_index, self.span_frames)
                .clamp(0, UNITY_VOLUME as i64);
            let frame_gain = (ramp_gain * system_gain) >> 16;
            let base = frame_index * channels;
            for (channel, sample) in frame.chunks_exact(width).enumerate() {
                self.acc[base + channel] += (format.decode(sample) as i64 * frame_gain) >> 16;
            }
        }
        self.sources += 1;
    }

    /// 钳位并编码到目标 span；没有任何源时写静音
    pub fn finish(&self, dst: &mut [u8]) {
        let format = self.info.format;
        if self.sources == 0 {
            dst.fill(format.silence_byte());
            return;
        }
        let width = format.bytes_per_sample();
        for (value, out) in self.acc.iter().zip(dst.chunks_exact_mut(width)) {
            format.encode(format.clamp(*value) as i32, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;

    const SPAN: u32 = 4;

    fn stereo_s16() -> AudioStreamInfo {
        AudioStreamInfo::new(48000, 2, SampleFormat::S16Le)
    }

    fn constant_span(info: AudioStreamInfo, value: i32) -> Vec<u8> {
        let samples = vec![value; SPAN as usize * info.channels as usize];
        let mut bytes = vec![0u8; SPAN as usize * info.bytes_per_frame()];
        info.samples_to_bytes(&samples, &mut bytes);
        bytes
    }

    fn decode_all(info: AudioStreamInfo, bytes: &[u8]) -> Vec<i32> {
        let mut samples = vec![0i32; bytes.len() / info.format.bytes_per_sample()];
        info.bytes_to_samples(bytes, &mut samples);
        samples
    }

    #[test]
    fn test_no_sources_is_silence() {
        let info = stereo_s16();
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        let mut dst = vec![0xAAu8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        assert!(dst.iter().all(|&b| b == 0));

        let u8_info = AudioStreamInfo::new(8000, 1, SampleFormat::U8);
        let mut mixer = SpanMixer::new(u8_info, SPAN);
        mixer.begin();
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        assert!(dst.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_single_source_unity() {
        let info = stereo_s16();
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        mixer.accumulate(&constant_span(info, -1234), VolumeRamp::UNITY, 1.0);
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        assert!(decode_all(info, &dst).iter().all(|&s| s == -1234));
    }

    #[test]
    fn test_two_sources_sum_with_gain() {
        let info = stereo_s16();
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        mixer.accumulate(&constant_span(info, 1000), VolumeRamp::constant(UNITY_VOLUME / 2), 1.0);
        mixer.accumulate(&constant_span(info, 3000), VolumeRamp::UNITY, 0.25);
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        // 1000 * 0.5 + 3000 * 0.25
        assert!(decode_all(info, &dst).iter().all(|&s| s == 1250));
        assert_eq!(mixer.sources(), 2);
    }

    #[test]
    fn test_many_sources_clamp() {
        let info = stereo_s16();
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        for _ in 0..8 {
            mixer.accumulate(&constant_span(info, 20000), VolumeRamp::UNITY, 1.0);
        }
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        assert!(decode_all(info, &dst).iter().all(|&s| s == i16::MAX as i32));

        mixer.begin();
        for _ in 0..8 {
            mixer.accumulate(&constant_span(info, -20000), VolumeRamp::UNITY, 1.0);
        }
        mixer.finish(&mut dst);
        assert!(decode_all(info, &dst).iter().all(|&s| s == i16::MIN as i32));
    }

    #[test]
    fn test_ramp_interpolates_per_frame() {
        let info = AudioStreamInfo::new(48000, 1, SampleFormat::S16Le);
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        let ramp = VolumeRamp {
            start: 0,
            end: UNITY_VOLUME,
        };
        mixer.accumulate(&constant_span(info, 4000), ramp, 1.0);
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        assert_eq!(decode_all(info, &dst), vec![0, 1000, 2000, 3000]);
    }

    #[test]
    fn test_out_of_range_ramp_is_clamped() {
        let info = AudioStreamInfo::new(48000, 1, SampleFormat::S16Le);
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        let ramp = VolumeRamp {
            start: i32::MIN,
            end: i32::MAX,
        };
        mixer.accumulate(&constant_span(info, 4000), ramp, 1.0);
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        // 负增益按静音处理，超过 UNITY 的按 UNITY 处理
        assert_eq!(decode_all(info, &dst), vec![0, 0, 0, 4000]);
    }

    #[test]
    fn test_s24_and_u8_formats() {
        let info = AudioStreamInfo::new(48000, 1, SampleFormat::S24Le);
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        mixer.accumulate(&constant_span(info, 5_000_000), VolumeRamp::UNITY, 1.0);
        mixer.accumulate(&constant_span(info, 5_000_000), VolumeRamp::UNITY, 1.0);
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        assert!(decode_all(info, &dst).iter().all(|&s| s == (1 << 23) - 1));

        let info = AudioStreamInfo::new(8000, 1, SampleFormat::U8);
        let mut mixer = SpanMixer::new(info, SPAN);
        mixer.begin();
        mixer.accumulate(&constant_span(info, 40), VolumeRamp::UNITY, 1.0);
        mixer.accumulate(&constant_span(info, -10), VolumeRamp::UNITY, 1.0);
        let mut dst = vec![0u8; mixer.span_bytes()];
        mixer.finish(&mut dst);
        assert!(decode_all(info, &dst).iter().all(|&s| s == 30));
    }
}
