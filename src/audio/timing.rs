//! 单调时钟与精确睡眠
//!
//! 所有时间戳都是 CLOCK_MONOTONIC 纳秒，和硬件位置查询返回的时间同一时基。
//! 绝对睡眠（TIMER_ABSTIME）避免相对睡眠的累积漂移。

use std::time::Duration;

/// 获取当前单调时间（纳秒）
#[cfg(unix)]
#[inline]
pub fn now_ns() -> i64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // CLOCK_MONOTONIC 在所有 unix 平台上都可用，不会失败
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

#[cfg(not(unix))]
#[inline]
pub fn now_ns() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

/// 睡眠到指定的单调时间点
///
/// 如果时间点已过，立即返回
#[cfg(target_os = "linux")]
pub fn absolute_sleep(deadline_ns: i64) {
    if deadline_ns <= 0 {
        return;
    }
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = (deadline_ns / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (deadline_ns % 1_000_000_000) as _;
    loop {
        let ret = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        // 被信号打断时继续睡到同一个绝对时间点
        if ret != libc::EINTR {
            break;
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn absolute_sleep(deadline_ns: i64) {
    let remaining = deadline_ns - now_ns();
    if remaining > 0 {
        std::thread::sleep(Duration::from_nanos(remaining as u64));
    }
}

/// 相对睡眠（纳秒）
#[inline]
pub fn relative_sleep(ns: i64) {
    if ns > 0 {
        std::thread::sleep(Duration::from_nanos(ns as u64));
    }
}
