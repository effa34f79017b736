//! 位置-时间模型
//!
//! 以一个锚点 (帧位置, 单调时间) 和采样率做线性外推：
//! `time(p) = anchor_time + (p - anchor_pos) * 1e9 / rate`。
//! 中间计算用 i128，避免长时间运行后的溢出。

use crate::audio::NANOS_PER_SECOND;

/// 新锚点与当前预测的最大允许偏差
pub const MAX_STAMP_DEVIATION_NS: i64 = 10_000_000;

/// 锚点
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStamp {
    pub frames: u64,
    pub nano_time: i64,
}

#[derive(Clone, Debug)]
pub struct PositionTimeModel {
    sample_rate: u32,
    anchor: FrameStamp,
    anchored: bool,
}

impl PositionTimeModel {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            anchor: FrameStamp::default(),
            anchored: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// 采样率为 0 时忽略
    pub fn config_sample_rate(&mut self, sample_rate: u32) -> bool {
        if sample_rate == 0 {
            log::warn!("Ignoring zero sample rate for time model");
            return false;
        }
        self.sample_rate = sample_rate;
        true
    }

    /// 无条件重设锚点
    pub fn reset_frame_stamp(&mut self, frames: u64, nano_time: i64) {
        self.anchor = FrameStamp { frames, nano_time };
        self.anchored = true;
    }

    /// 用硬件样本更新锚点
    ///
    /// 与当前预测偏差超过 [`MAX_STAMP_DEVIATION_NS`] 的样本被拒绝，保留原锚点
    pub fn update_frame_stamp(&mut self, frames: u64, nano_time: i64) -> bool {
        if !self.anchored {
            self.reset_frame_stamp(frames, nano_time);
            return true;
        }
        let predicted = self.time_of_pos(frames);
        if (predicted - nano_time).abs() > MAX_STAMP_DEVIATION_NS {
            return false;
        }
        self.anchor = FrameStamp { frames, nano_time };
        true
    }

    pub fn frame_stamp(&self) -> FrameStamp {
        self.anchor
    }

    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    /// 帧位置对应的预测时间
    #[inline]
    pub fn time_of_pos(&self, pos: u64) -> i64 {
        let delta = pos as i128 - self.anchor.frames as i128;
        let offset = delta * NANOS_PER_SECOND as i128 / self.sample_rate as i128;
        (self.anchor.nano_time as i128 + offset) as i64
    }

    /// 时间对应的预测帧位置（早于位置 0 的时间返回 0）
    pub fn pos_of_time(&self, nano_time: i64) -> u64 {
        let delta = nano_time as i128 - self.anchor.nano_time as i128;
        let frames = self.anchor.frames as i128 + delta * self.sample_rate as i128 / NANOS_PER_SECOND as i128;
        frames.max(0) as u64
    }
}
