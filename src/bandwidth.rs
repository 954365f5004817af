//! bandwidth.rs - 下载带宽的滑动窗口统计。

use log::trace;

/// 滑动窗口的槽位数，每秒采样一次即最近 30 秒。
pub(crate) const BANDWIDTH_WINDOW: usize = 30;

/// 平均每秒字节数低于该值视为停滞。
pub(crate) const STALL_THRESHOLD: f64 = 0.01;

/// 按固定间隔记录缓冲增量的环形窗口。
///
/// 平均值只统计已填充的槽位，窗口未满时不会被空槽稀释。
#[derive(Clone, Debug)]
pub struct BandwidthTracker {
    slots: [f64; BANDWIDTH_WINDOW],
    index: usize,
    filled: usize,
    last_len: u64,
}

impl BandwidthTracker {
    /// 建立跟踪器。`seed_len` 为起始缓冲长度，续传时已有的字节不计入速率。
    pub fn new(seed_len: u64) -> Self {
        Self {
            slots: [0.0; BANDWIDTH_WINDOW],
            index: 0,
            filled: 0,
            last_len: seed_len,
        }
    }

    /// 记录一次采样，写入距上次采样的字节增量。
    pub fn record(&mut self, current_len: u64) {
        let delta = current_len.saturating_sub(self.last_len) as f64;
        self.last_len = current_len;
        self.slots[self.index] = delta;
        self.index = (self.index + 1) % BANDWIDTH_WINDOW;
        self.filled = (self.filled + 1).min(BANDWIDTH_WINDOW);
        trace!("[Bandwidth] 采样 {} 字节，窗口填充 {}", delta, self.filled);
    }

    /// 窗口内的平均每秒字节数，尚无采样时返回 `None`。
    pub fn average(&self) -> Option<f64> {
        if self.filled == 0 {
            return None;
        }
        let sum: f64 = self.slots[..self.filled].iter().sum();
        Some(sum / self.filled as f64)
    }

    /// 是否已停滞：平均速率存在且低于阈值。
    pub fn stalled(&self) -> bool {
        matches!(self.average(), Some(avg) if avg < STALL_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_is_none_before_sampling() {
        let tracker = BandwidthTracker::new(0);
        assert_eq!(tracker.average(), None);
        assert!(!tracker.stalled());
    }

    #[test]
    fn test_average_covers_filled_slots_only() {
        let mut tracker = BandwidthTracker::new(0);
        tracker.record(5);
        tracker.record(10);
        tracker.record(15);
        // 三次增量各为 5，空槽不参与。
        assert_eq!(tracker.average(), Some(5.0));
    }

    #[test]
    fn test_window_evicts_oldest_samples() {
        let mut tracker = BandwidthTracker::new(0);
        let mut len = 0;
        // 先填满整个窗口，每秒 100 字节。
        for _ in 0..BANDWIDTH_WINDOW {
            len += 100;
            tracker.record(len);
        }
        assert_eq!(tracker.average(), Some(100.0));
        // 再记录一整窗的零增量，旧样本全部被覆盖。
        for _ in 0..BANDWIDTH_WINDOW {
            tracker.record(len);
        }
        assert_eq!(tracker.average(), Some(0.0));
    }

    #[test]
    fn test_seed_excludes_resumed_bytes() {
        let mut tracker = BandwidthTracker::new(1000);
        tracker.record(1200);
        assert_eq!(tracker.average(), Some(200.0));
    }

    #[test]
    fn test_stall_detection() {
        let mut tracker = BandwidthTracker::new(0);
        tracker.record(50);
        assert!(!tracker.stalled());

        let mut idle = BandwidthTracker::new(0);
        for _ in 0..3 {
            idle.record(0);
        }
        assert!(idle.stalled());
    }
}
