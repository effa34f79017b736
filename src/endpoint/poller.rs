//! 硬件位置轮询线程
//!
//! 硬件位置查询可能很慢（跨进程/驱动调用），不能放在热路径上。
//! 轮询线程每 `timeout` 醒一次，或被热路径 [`PositionPoller::signal`] 提前唤醒，
//! 查询结果通过 seqlock 发布，热路径只做无锁读。

use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::audio::EndpointStats;
use crate::device::{HardwareIoAdapter, HardwarePosition};

/// seqlock 发布的最新位置
struct PositionCell {
    seq: CachePadded<AtomicU64>,
    frames: AtomicU64,
    nano_time: AtomicI64,
}

impl PositionCell {
    fn new() -> Self {
        Self {
            seq: CachePadded::new(AtomicU64::new(0)),
            frames: AtomicU64::new(0),
            nano_time: AtomicI64::new(0),
        }
    }

    // 只有轮询线程写
    fn publish(&self, position: HardwarePosition) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.frames.store(position.frames, Ordering::Relaxed);
        self.nano_time.store(position.nano_time, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn load(&self) -> Option<HardwarePosition> {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before == 0 {
                return None;
            }
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let frames = self.frames.load(Ordering::Relaxed);
            let nano_time = self.nano_time.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return Some(HardwarePosition { frames, nano_time });
            }
        }
    }
}

struct PollerShared {
    adapter: Arc<dyn HardwareIoAdapter>,
    stats: Arc<EndpointStats>,
    cell: PositionCell,
    running: AtomicBool,
    enabled: AtomicBool,
    pending: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
    timeout: Duration,
}

pub struct PositionPoller {
    shared: Arc<PollerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PositionPoller {
    pub fn new(adapter: Arc<dyn HardwareIoAdapter>, stats: Arc<EndpointStats>, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                adapter,
                stats,
                cell: PositionCell::new(),
                running: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
                timeout,
            }),
            thread: Mutex::new(None),
        }
    }

    /// 启动轮询线程
    pub fn start(&self) -> std::io::Result<()> {
        let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("audio-ep-update".to_string())
            .spawn(move || shared.run())
            .inspect_err(|_| self.shared.running.store(false, Ordering::Release))?;
        *slot = Some(handle);
        Ok(())
    }

    /// 停止并等待轮询线程退出
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let _guard = self.shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.shared.wake.notify_all();
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// 设备启动后才查询位置
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
    }

    /// 请求尽快查询一次（热路径调用，不加锁）
    ///
    /// 错过的唤醒最多延迟一个 timeout
    #[inline]
    pub fn signal(&self) {
        self.shared.pending.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// 最新发布的位置
    #[inline]
    pub fn latest(&self) -> Option<HardwarePosition> {
        self.shared.cell.load()
    }
}

impl Drop for PositionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PollerShared {
    fn run(&self) {
        log::debug!("Position poller started, timeout {:?}", self.timeout);
        while self.running.load(Ordering::Acquire) {
            {
                let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = self
                    .wake
                    .wait_timeout_while(guard, self.timeout, |_| {
                        !self.pending.load(Ordering::Acquire) && self.running.load(Ordering::Acquire)
                    })
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.pending.store(false, Ordering::Release);
            if !self.enabled.load(Ordering::Acquire) {
                continue;
            }

            match self.adapter.mmap_position() {
                Ok(position) => self.cell.publish(position),
                Err(e) => {
                    self.stats.record_position_failure();
                    log::warn!("Hardware position query failed: {}", e);
                }
            }
        }
        log::debug!("Position poller exited");
    }
}
