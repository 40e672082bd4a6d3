//! 进度上报节流
//!
//! 每个任务一个节流器，CAS 抢占最近一次上报时间，
//! 并发调用时最多一个赢家，输家直接丢弃本次上报。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 固定间隔节流器
pub struct ProgressThrottler {
    interval_ms: u64,
    /// 上次放行的时间戳 (ms)，0 表示从未放行
    last_emit: AtomicU64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_emit: AtomicU64::new(0),
        }
    }

    /// 尝试放行一次上报；间隔未到或被并发赢家抢先时返回 false
    pub fn try_acquire(&self) -> bool {
        let now = now_millis();
        let last = self.last_emit.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_emit
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_acquire_passes() {
        let throttler = ProgressThrottler::new(Duration::from_secs(3));
        assert!(throttler.try_acquire());
        // 间隔内的第二次被拒
        assert!(!throttler.try_acquire());
    }

    #[test]
    fn test_passes_after_interval() {
        let throttler = ProgressThrottler::new(Duration::from_millis(0));
        assert!(throttler.try_acquire());
        assert!(throttler.try_acquire());
    }

    #[test]
    fn test_concurrent_single_winner() {
        use std::sync::Arc;
        let throttler = Arc::new(ProgressThrottler::new(Duration::from_secs(3)));
        let winners: usize = (0..8)
            .map(|_| {
                let throttler = throttler.clone();
                std::thread::spawn(move || throttler.try_acquire() as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }
}
