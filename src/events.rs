use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;

use crate::monitor::EdgeEvent;

/// Fan-out for delivered edge events: a broadcast channel for live
/// listeners plus a bounded history per line.
pub struct EventHub {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

impl EventHub {
    pub fn new(
        lines: impl IntoIterator<Item = u32>,
        broadcast_capacity: usize,
        event_history_capacity: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        let event_history = lines
            .into_iter()
            .map(|id| (id, RwLock::new(VecDeque::new())))
            .collect();

        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        if let Some(history_lock) = self.event_history.get(&event.line) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // no live listeners is fine
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_tx.subscribe()
    }

    /// Oldest first; `limit` keeps the most recent ones.
    pub fn history(&self, line: u32, limit: Option<usize>) -> Vec<EdgeEvent> {
        self.event_history
            .get(&line)
            .map(|d| {
                let history = d.read();
                let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn last(&self, line: u32) -> Option<EdgeEvent> {
        self.event_history
            .get(&line)
            .and_then(|d| d.read().back().cloned())
    }
}

pub type EventHandler = Arc<EventHub>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Edge;

    fn event(line: u32, timestamp_ms: u64) -> EdgeEvent {
        EdgeEvent {
            line,
            edge: Edge::Rising,
            timestamp_ms,
            tool_timestamp_ms: None,
        }
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let hub = EventHub::new([17], 8, 2);
        for t in 1..=3 {
            hub.dispatch(event(17, t));
        }
        let stamps: Vec<u64> = hub.history(17, None).iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![2, 3]);
        assert_eq!(hub.history(17, Some(1))[0].timestamp_ms, 3);
        assert_eq!(hub.last(17).map(|e| e.timestamp_ms), Some(3));
    }

    #[test]
    fn unknown_lines_have_no_history_but_still_broadcast() {
        let hub = EventHub::new([17], 8, 4);
        let mut rx = hub.subscribe();
        hub.dispatch(event(99, 5));
        assert!(hub.history(99, None).is_empty());
        assert_eq!(rx.try_recv().unwrap().line, 99);
    }
}
