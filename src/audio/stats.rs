//! Endpoint 统计模块
//!
//! 在工作循环中收集统计信息，采用降频采样策略减少开销。
//! 稳态下的单周期错误（某个客户端没赶上、位置查询失败）只计数，不拆除 Endpoint。

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use super::timing::now_ns;

/// 统计采样间隔：每 N 个周期才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 时间间隔缓冲区大小
const INTERVAL_BUFFER_SIZE: usize = 256;

/// Endpoint 统计收集器
///
/// 所有操作都是 lock-free 的，适合在工作循环中使用
pub struct EndpointStats {
    cycle_count: AtomicU64,
    last_sampled_ns: AtomicI64,

    // 存储采样间隔（纳秒）
    interval_buffer: Box<[AtomicU64; INTERVAL_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 每次唤醒相对计划时间的延迟
    max_wakeup_late_ns: AtomicU64,
    late_wakeups: AtomicU64,

    // 客户端 span 未就绪（render）
    missed_spans: AtomicU64,
    // 客户端 buffer 未消费，丢弃一个 span（capture）
    overflow_spans: AtomicU64,
    // 状态标签不符合预期
    protocol_violations: AtomicU64,

    resync_count: AtomicU64,
    position_query_failures: AtomicU64,
    rejected_stamps: AtomicU64,

    frames_processed: AtomicU64,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self {
            cycle_count: AtomicU64::new(0),
            last_sampled_ns: AtomicI64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            max_wakeup_late_ns: AtomicU64::new(0),
            late_wakeups: AtomicU64::new(0),
            missed_spans: AtomicU64::new(0),
            overflow_spans: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            resync_count: AtomicU64::new(0),
            position_query_failures: AtomicU64::new(0),
            rejected_stamps: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
        }
    }

    /// 每个处理周期调用一次
    ///
    /// `late_ns`: 实际唤醒时间减去计划唤醒时间
    #[inline]
    pub fn on_cycle(&self, frames: u64, late_ns: i64) {
        let count = self.cycle_count.fetch_add(1, Ordering::Relaxed);
        self.frames_processed.fetch_add(frames, Ordering::Relaxed);

        if late_ns > 0 {
            self.max_wakeup_late_ns
                .fetch_max(late_ns as u64, Ordering::Relaxed);
        }

        // 只在采样点才读时钟
        if count.is_multiple_of(SAMPLE_INTERVAL) {
            let now = now_ns();
            let last = self.last_sampled_ns.swap(now, Ordering::Relaxed);

            if last > 0 {
                let interval = now.saturating_sub(last).max(0) as u64;
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                    % INTERVAL_BUFFER_SIZE;
                self.interval_buffer[idx].store(interval, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn record_late_wakeup(&self) {
        self.late_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_missed_span(&self) {
        self.missed_spans.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overflow(&self) {
        self.overflow_spans.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resync(&self) {
        self.resync_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_failure(&self) {
        self.position_query_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected_stamp(&self) {
        self.rejected_stamps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::Relaxed)
    }

    pub fn missed_spans(&self) -> u64 {
        self.missed_spans.load(Ordering::Relaxed)
    }

    pub fn overflow_spans(&self) -> u64 {
        self.overflow_spans.load(Ordering::Relaxed)
    }

    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    pub fn resync_count(&self) -> u64 {
        self.resync_count.load(Ordering::Relaxed)
    }

    pub fn position_query_failures(&self) -> u64 {
        self.position_query_failures.load(Ordering::Relaxed)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `span_frames`/`sample_rate` 用于计算期望的周期间隔
    pub fn report(&self, span_frames: u32, sample_rate: u32) -> StatsReport {
        let expected_cycle_ns = (span_frames as u64 * 1_000_000_000) / sample_rate.max(1) as u64;
        let expected_sampled_interval_ns = expected_cycle_ns * SAMPLE_INTERVAL;

        let intervals: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&ns| ns > 0)
            .collect();

        let interval_stats = IntervalStats {
            min_ns: intervals.iter().copied().min().unwrap_or(0),
            max_ns: intervals.iter().copied().max().unwrap_or(0),
            avg_ns: if intervals.is_empty() {
                0
            } else {
                intervals.iter().sum::<u64>() / intervals.len() as u64
            },
        };

        StatsReport {
            cycle_count: self.cycle_count(),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns,
            interval_stats,
            max_wakeup_late_ns: self.max_wakeup_late_ns.load(Ordering::Relaxed),
            late_wakeups: self.late_wakeups.load(Ordering::Relaxed),
            missed_spans: self.missed_spans(),
            overflow_spans: self.overflow_spans(),
            protocol_violations: self.protocol_violations(),
            resync_count: self.resync_count(),
            position_query_failures: self.position_query_failures(),
            rejected_stamps: self.rejected_stamps.load(Ordering::Relaxed),
            frames_processed: self.frames_processed(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.cycle_count.store(0, Ordering::Relaxed);
        self.last_sampled_ns.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.max_wakeup_late_ns.store(0, Ordering::Relaxed);
        self.late_wakeups.store(0, Ordering::Relaxed);
        self.missed_spans.store(0, Ordering::Relaxed);
        self.overflow_spans.store(0, Ordering::Relaxed);
        self.protocol_violations.store(0, Ordering::Relaxed);
        self.resync_count.store(0, Ordering::Relaxed);
        self.position_query_failures.store(0, Ordering::Relaxed);
        self.rejected_stamps.store(0, Ordering::Relaxed);
        self.frames_processed.store(0, Ordering::Relaxed);

        for slot in self.interval_buffer.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub cycle_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub max_wakeup_late_ns: u64,
    pub late_wakeups: u64,
    pub missed_spans: u64,
    pub overflow_spans: u64,
    pub protocol_violations: u64,
    pub resync_count: u64,
    pub position_query_failures: u64,
    pub rejected_stamps: u64,
    pub frames_processed: u64,
}

#[derive(Debug, Clone)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Endpoint Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total cycles: {}", self.cycle_count)?;
        writeln!(f, "Frames processed: {}", self.frames_processed)?;
        writeln!(f)?;

        writeln!(f, "Cycle Timing (per {} cycles):", self.sample_interval)?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            self.expected_sampled_interval_ns as f64 / 1_000_000.0
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(f, "    Min: {:.2} ms", self.interval_stats.min_ns as f64 / 1_000_000.0)?;
        writeln!(f, "    Max: {:.2} ms", self.interval_stats.max_ns as f64 / 1_000_000.0)?;
        writeln!(f, "    Avg: {:.2} ms", self.interval_stats.avg_ns as f64 / 1_000_000.0)?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        let jitter_pct = if self.expected_sampled_interval_ns > 0 {
            jitter_ns as f64 / self.expected_sampled_interval_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            f,
            "  Jitter: {:.2} ms ({:.1}%)",
            jitter_ns as f64 / 1_000_000.0,
            jitter_pct
        )?;
        writeln!(
            f,
            "  Worst wake-up lateness: {:.3} ms ({} late wake-ups)",
            self.max_wakeup_late_ns as f64 / 1_000_000.0,
            self.late_wakeups
        )?;
        writeln!(f)?;

        writeln!(f, "Missed client spans: {}", self.missed_spans)?;
        writeln!(f, "Capture overflows: {}", self.overflow_spans)?;
        writeln!(f, "Protocol violations: {}", self.protocol_violations)?;
        writeln!(f, "Position resyncs: {}", self.resync_count)?;
        writeln!(
            f,
            "Position query failures: {} (rejected stamps: {})",
            self.position_query_failures, self.rejected_stamps
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = EndpointStats::new();
        stats.on_cycle(240, 0);
        stats.on_cycle(240, 2_000_000);
        stats.record_missed_span();
        stats.record_overflow();
        stats.record_resync();

        let report = stats.report(240, 48000);
        assert_eq!(report.cycle_count, 2);
        assert_eq!(report.frames_processed, 480);
        assert_eq!(report.missed_spans, 1);
        assert_eq!(report.overflow_spans, 1);
        assert_eq!(report.resync_count, 1);
        assert_eq!(report.max_wakeup_late_ns, 2_000_000);
        // 5ms * 16
        assert_eq!(report.expected_sampled_interval_ns, 80_000_000);

        stats.reset();
        assert_eq!(stats.cycle_count(), 0);
        assert_eq!(stats.missed_spans(), 0);
    }

    #[test]
    fn test_report_display() {
        let stats = EndpointStats::new();
        stats.on_cycle(240, 0);
        let text = stats.report(240, 48000).to_string();
        assert!(text.contains("Total cycles: 1"));
        assert!(text.contains("Missed client spans: 0"));
    }
}
