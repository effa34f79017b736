//! Endpoint 状态机
//!
//! 所有状态变化都经过 [`StatusCell`]：原子量给热路径读，
//! Mutex + Condvar 给控制路径做有界等待，同时保留最近的转换历史用于 dump。

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::audio::timing::now_ns;

/// 保留的转换历史条数
const HISTORY_CAPACITY: usize = 64;

/// Endpoint 状态
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointStatus {
    Invalid = 0,
    Unlinked,
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl EndpointStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Unlinked,
            2 => Self::Idle,
            3 => Self::Starting,
            4 => Self::Running,
            5 => Self::Stopping,
            6 => Self::Stopped,
            _ => Self::Invalid,
        }
    }

    /// 合法转换（同状态赋值总是允许）
    pub fn can_transition_to(self, next: Self) -> bool {
        use EndpointStatus::*;
        if self == next || next == Invalid {
            return true;
        }
        matches!(
            (self, next),
            (Invalid, Unlinked)
                | (Unlinked, Idle)
                | (Idle, Starting | Running | Stopping | Unlinked)
                | (Starting, Running | Idle | Stopping)
                | (Running, Idle | Stopping)
                | (Stopping, Stopped | Unlinked)
                | (Stopped, Unlinked)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Unlinked => "UNLINKED",
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次状态转换
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: EndpointStatus,
    pub to: EndpointStatus,
    pub legal: bool,
    pub at_ns: i64,
}

pub struct StatusCell {
    status: AtomicU8,
    history: Mutex<VecDeque<StatusTransition>>,
    changed: Condvar,
}

impl StatusCell {
    pub fn new(initial: EndpointStatus) -> Self {
        Self {
            status: AtomicU8::new(initial as u8),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn get(&self) -> EndpointStatus {
        EndpointStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// 设置状态，返回转换是否合法
    ///
    /// 非法转换同样生效，但会记录为错误
    pub fn set(&self, next: EndpointStatus) -> bool {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let legal = self.apply(&mut history, next);
        drop(history);
        self.changed.notify_all();
        legal
    }

    /// 只在当前状态为 `expected` 时切换
    pub fn transition_if(&self, expected: EndpointStatus, next: EndpointStatus) -> bool {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if self.get() != expected {
            return false;
        }
        self.apply(&mut history, next);
        drop(history);
        self.changed.notify_all();
        true
    }

    fn apply(&self, history: &mut VecDeque<StatusTransition>, next: EndpointStatus) -> bool {
        let from = self.get();
        let legal = from.can_transition_to(next);
        if !legal {
            log::error!("Illegal endpoint status transition {} -> {}", from, next);
        }
        self.status.store(next as u8, Ordering::Release);

        if from != next {
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(StatusTransition {
                from,
                to: next,
                legal,
                at_ns: now_ns(),
            });
            log::debug!("Endpoint status {} -> {}", from, next);
        }
        legal
    }

    /// 在 `blocked` 为真时等待，最多 `timeout`，返回等待结束时的状态
    pub fn wait_while<F>(&self, timeout: Duration, mut blocked: F) -> EndpointStatus
    where
        F: FnMut(EndpointStatus) -> bool,
    {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let (_history, _timeout) = self
            .changed
            .wait_timeout_while(history, timeout, |_| blocked(self.get()))
            .unwrap_or_else(PoisonError::into_inner);
        self.get()
    }

    /// 最近的状态转换
    pub fn history(&self) -> Vec<StatusTransition> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCell").field("status", &self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use EndpointStatus::*;

    #[test]
    fn test_legal_edges() {
        assert!(Invalid.can_transition_to(Unlinked));
        assert!(Unlinked.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Unlinked));
        assert!(Running.can_transition_to(Invalid));
        assert!(Idle.can_transition_to(Idle));

        assert!(!Unlinked.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Invalid.can_transition_to(Idle));
    }

    #[test]
    fn test_set_records_history() {
        let cell = StatusCell::new(Invalid);
        assert!(cell.set(Unlinked));
        assert!(cell.set(Idle));
        assert!(cell.set(Idle));
        assert!(!cell.set(Stopped));

        let history = cell.history();
        assert_eq!(history.len(), 3);
        assert_eq!((history[0].from, history[0].to), (Invalid, Unlinked));
        assert!(!history[2].legal);
        assert_eq!(cell.get(), Stopped);
    }

    #[test]
    fn test_history_is_bounded() {
        let cell = StatusCell::new(Idle);
        for _ in 0..100 {
            cell.set(Running);
            cell.set(Idle);
        }
        assert_eq!(cell.history().len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_transition_if() {
        let cell = StatusCell::new(Idle);
        assert!(!cell.transition_if(Running, Idle));
        assert!(cell.transition_if(Idle, Running));
        assert_eq!(cell.get(), Running);
    }

    #[test]
    fn test_wait_while_wakes_on_change() {
        let cell = Arc::new(StatusCell::new(Starting));
        let setter = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set(Running);
        });

        let status = cell.wait_while(Duration::from_secs(2), |s| s == Starting);
        assert_eq!(status, Running);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_while_times_out() {
        let cell = StatusCell::new(Starting);
        let start = std::time::Instant::now();
        let status = cell.wait_while(Duration::from_millis(30), |s| s == Starting);
        assert_eq!(status, Starting);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
