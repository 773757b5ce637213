use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub at: Instant,
    pub confidence: f64,
    pub success: bool,
    pub area: f64,
}

/// Recent per-cycle results, bounded both by age and by count.
#[derive(Debug, Clone)]
pub struct DetectionHistory {
    entries: VecDeque<HistoryEntry>,
    window: Duration,
    max_len: usize,
}

impl DetectionHistory {
    pub fn new(window: Duration, max_len: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_len.min(64)),
            window,
            max_len: max_len.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.max_len {
            self.entries.pop_front();
        }
        self.prune(entry.at);
    }

    /// Keeps only entries strictly younger than the window.
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) >= self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(at: Instant, confidence: f64) -> HistoryEntry {
        HistoryEntry {
            at,
            confidence,
            success: true,
            area: 1.0,
        }
    }

    #[test]
    fn test_prunes_by_age() {
        let start = Instant::now();
        let mut history = DetectionHistory::new(Duration::from_secs(5), 100);
        history.push(entry(start, 0.1));
        history.push(entry(start + Duration::from_secs(3), 0.2));
        assert_eq!(history.len(), 2);

        history.push(entry(start + Duration::from_secs(5), 0.3));
        assert_eq!(history.len(), 2);
        assert_eq!(history.recent(1).next().map(|e| e.confidence), Some(0.3));
    }

    #[test]
    fn test_bounded_by_count() {
        let start = Instant::now();
        let mut history = DetectionHistory::new(Duration::from_secs(60), 4);
        for i in 0..10 {
            history.push(entry(start + Duration::from_millis(i * 10), i as f64));
        }
        assert_eq!(history.len(), 4);
        let recent: Vec<f64> = history.recent(2).map(|e| e.confidence).collect();
        assert_eq!(recent, vec![8.0, 9.0]);
    }

    #[test]
    fn test_recent_with_short_history() {
        let mut history = DetectionHistory::new(Duration::from_secs(5), 10);
        history.push(entry(Instant::now(), 0.5));
        assert_eq!(history.recent(3).count(), 1);
        history.clear();
        assert!(history.is_empty());
    }
}
