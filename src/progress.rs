use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::time::{Duration, Instant};

use crate::domain::Timestamp;
use crate::fetch::FetchStatus;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ScanPhase {
        message: String,
    },
    ScanProgress {
        current: usize,
        total: usize,
        eta: Option<Duration>,
    },
    FetchStatus {
        timestamp: Timestamp,
        status: FetchStatus,
        attempts: u32,
    },
    FetchProgress {
        completed: usize,
        total: usize,
    },
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Bounded-buffer event stream. Producers never block: when the consumer
/// lags behind the buffer capacity, events are dropped rather than stalling
/// the scanning or fetching loop.
pub struct ChannelSink {
    tx: SyncSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = sync_channel(capacity);
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn event(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Cooperative cancellation flag shared between a caller and the workers it
/// started. Checked at loop boundaries and between download chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rate limiter for progress emission so a tight scanning loop cannot flood
/// a slow consumer.
pub struct ProgressThrottle {
    min_gap: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_gap => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (sink, rx) = ChannelSink::bounded(1);
        sink.event(ProgressEvent::FetchProgress {
            completed: 1,
            total: 2,
        });
        sink.event(ProgressEvent::FetchProgress {
            completed: 2,
            total: 2,
        });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn throttle_limits_emission() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
    }
}
