//! Send-side backpressure for one data channel.
//!
//! Sends go straight to the transport while its buffered amount stays at or
//! below the high watermark. Above it the channel pauses and messages queue in
//! FIFO order until the transport reports the low watermark, at which point
//! [`FlowController::drain`] flushes the queue. Each channel owns its own
//! controller, so a paused channel never holds up another.

use std::collections::VecDeque;

use tether_protocol::{Channel, FlowConfig};
use tracing::{debug, warn};

use crate::error::SendError;
use crate::link::{DataSink, Payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub payload: Payload,
    /// Critical messages are evicted last on overrun
    pub critical: bool,
}

impl Outbound {
    pub fn normal(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            critical: false,
        }
    }

    pub fn critical(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            critical: true,
        }
    }
}

/// The pending queue hit its depth limit and dropped messages. Non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{channel} send queue overran at depth {depth}, dropped {dropped} message(s)")]
pub struct FlowOverrun {
    pub channel: Channel,
    pub dropped: usize,
    pub depth: usize,
}

/// What happened to one [`FlowController::send`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Messages handed to the transport
    pub delivered: usize,
    pub queued: bool,
    pub overrun: Option<FlowOverrun>,
}

#[derive(Debug)]
pub struct FlowController {
    channel: Channel,
    high_watermark: usize,
    low_watermark: usize,
    max_depth: usize,
    paused: bool,
    queue: VecDeque<Outbound>,
}

impl FlowController {
    pub fn new(channel: Channel, config: &FlowConfig) -> Self {
        Self {
            channel,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            max_depth: config.max_queue_depth.max(1),
            paused: false,
            queue: VecDeque::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// True when queued messages can go out at this buffered amount.
    pub fn should_drain(&self, buffered: usize) -> bool {
        !self.queue.is_empty() && buffered <= self.low_watermark
    }

    pub async fn send(
        &mut self,
        sink: &dyn DataSink,
        msg: Outbound,
    ) -> Result<Dispatch, SendError> {
        // Anything already waiting goes first
        if self.paused || !self.queue.is_empty() {
            let overrun = self.enqueue(msg);
            return Ok(Dispatch {
                delivered: 0,
                queued: true,
                overrun,
            });
        }

        let buffered = sink.buffered_amount().await;
        if buffered > self.high_watermark {
            self.paused = true;
            debug!(
                channel = %self.channel,
                buffered,
                high = self.high_watermark,
                "Buffered amount above high watermark, pausing channel"
            );
            let overrun = self.enqueue(msg);
            return Ok(Dispatch {
                delivered: 0,
                queued: true,
                overrun,
            });
        }

        sink.send(&msg.payload).await?;
        Ok(Dispatch {
            delivered: 1,
            ..Dispatch::default()
        })
    }

    /// Flush the queue in order until it is empty or the transport is above
    /// the high watermark again. Returns the number of messages delivered.
    pub async fn drain(&mut self, sink: &dyn DataSink) -> Result<usize, SendError> {
        let mut delivered = 0;
        while let Some(next) = self.queue.pop_front() {
            if sink.buffered_amount().await > self.high_watermark {
                self.queue.push_front(next);
                self.paused = true;
                debug!(
                    channel = %self.channel,
                    delivered,
                    remaining = self.queue.len(),
                    "Drain stopped at high watermark"
                );
                return Ok(delivered);
            }
            if let Err(e) = sink.send(&next.payload).await {
                self.queue.push_front(next);
                return Err(e);
            }
            delivered += 1;
        }
        if self.paused {
            debug!(channel = %self.channel, delivered, "Send queue drained, resuming channel");
        }
        self.paused = false;
        Ok(delivered)
    }

    /// Drop everything pending (session teardown).
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.paused = false;
        dropped
    }

    fn enqueue(&mut self, msg: Outbound) -> Option<FlowOverrun> {
        let mut dropped = 0;
        while self.queue.len() >= self.max_depth {
            let victim = self
                .queue
                .iter()
                .position(|m| !m.critical)
                .unwrap_or(0);
            self.queue.remove(victim);
            dropped += 1;
        }
        self.queue.push_back(msg);

        if dropped == 0 {
            return None;
        }
        let overrun = FlowOverrun {
            channel: self.channel,
            dropped,
            depth: self.max_depth,
        };
        warn!(
            channel = %self.channel,
            dropped,
            depth = self.max_depth,
            "Send queue overrun, dropping oldest messages"
        );
        Some(overrun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records sends; buffered amount is driven by the test, optionally
    /// growing by `grow_per_send` bytes on every send.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Payload>>,
        buffered: AtomicUsize,
        grow_per_send: usize,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|p| String::from_utf8_lossy(p.as_bytes()).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl DataSink for RecordingSink {
        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn send(&self, payload: &Payload) -> Result<(), SendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SendError::Transport("closed".to_string()));
            }
            self.sent.lock().unwrap().push(payload.clone());
            self.buffered
                .fetch_add(self.grow_per_send, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(depth: usize) -> FlowConfig {
        FlowConfig {
            high_watermark: 1000,
            low_watermark: 100,
            max_queue_depth: depth,
        }
    }

    #[tokio::test]
    async fn sends_directly_below_high_watermark() {
        let sink = RecordingSink::default();
        let mut flow = FlowController::new(Channel::Control, &config(10));

        let dispatch = flow.send(&sink, Outbound::normal("a")).await.unwrap();
        assert_eq!(dispatch.delivered, 1);
        assert!(!dispatch.queued);
        assert!(!flow.is_paused());
        assert_eq!(sink.texts(), vec!["a"]);
    }

    #[tokio::test]
    async fn paused_channel_preserves_order_on_drain() {
        let sink = RecordingSink::default();
        sink.buffered.store(5000, Ordering::SeqCst);
        let mut flow = FlowController::new(Channel::Control, &config(10));

        for text in ["A", "B", "C"] {
            let dispatch = flow.send(&sink, Outbound::normal(text)).await.unwrap();
            assert!(dispatch.queued);
        }
        assert!(flow.is_paused());
        assert_eq!(flow.queued(), 3);
        assert!(sink.texts().is_empty());

        sink.buffered.store(50, Ordering::SeqCst);
        assert!(flow.should_drain(50));
        assert_eq!(flow.drain(&sink).await.unwrap(), 3);
        assert!(!flow.is_paused());

        flow.send(&sink, Outbound::normal("D")).await.unwrap();
        assert_eq!(sink.texts(), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn exactly_at_high_watermark_still_sends() {
        let sink = RecordingSink::default();
        sink.buffered.store(1000, Ordering::SeqCst);
        let mut flow = FlowController::new(Channel::Control, &config(10));
        let dispatch = flow.send(&sink, Outbound::normal("x")).await.unwrap();
        assert_eq!(dispatch.delivered, 1);
    }

    #[tokio::test]
    async fn drain_stops_when_buffer_climbs_back() {
        let sink = RecordingSink {
            grow_per_send: 600,
            ..Default::default()
        };
        sink.buffered.store(2000, Ordering::SeqCst);
        let mut flow = FlowController::new(Channel::Media, &config(10));
        for text in ["1", "2", "3", "4"] {
            flow.send(&sink, Outbound::normal(text)).await.unwrap();
        }

        sink.buffered.store(0, Ordering::SeqCst);
        // 0 -> 600 -> 1200: third message waits
        assert_eq!(flow.drain(&sink).await.unwrap(), 2);
        assert!(flow.is_paused());
        assert_eq!(flow.queued(), 2);

        sink.buffered.store(0, Ordering::SeqCst);
        assert_eq!(flow.drain(&sink).await.unwrap(), 2);
        assert_eq!(sink.texts(), vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn overrun_drops_oldest_non_critical() {
        let sink = RecordingSink::default();
        sink.buffered.store(5000, Ordering::SeqCst);
        let mut flow = FlowController::new(Channel::Control, &config(3));

        flow.send(&sink, Outbound::critical("c1")).await.unwrap();
        flow.send(&sink, Outbound::normal("n1")).await.unwrap();
        flow.send(&sink, Outbound::normal("n2")).await.unwrap();
        let dispatch = flow.send(&sink, Outbound::normal("n3")).await.unwrap();

        assert_eq!(
            dispatch.overrun,
            Some(FlowOverrun {
                channel: Channel::Control,
                dropped: 1,
                depth: 3,
            })
        );
        sink.buffered.store(0, Ordering::SeqCst);
        flow.drain(&sink).await.unwrap();
        assert_eq!(sink.texts(), vec!["c1", "n2", "n3"]);
    }

    #[tokio::test]
    async fn overrun_with_only_critical_drops_oldest() {
        let sink = RecordingSink::default();
        sink.buffered.store(5000, Ordering::SeqCst);
        let mut flow = FlowController::new(Channel::Control, &config(2));

        flow.send(&sink, Outbound::critical("c1")).await.unwrap();
        flow.send(&sink, Outbound::critical("c2")).await.unwrap();
        let dispatch = flow.send(&sink, Outbound::critical("c3")).await.unwrap();
        assert_eq!(dispatch.overrun.map(|o| o.dropped), Some(1));

        sink.buffered.store(0, Ordering::SeqCst);
        flow.drain(&sink).await.unwrap();
        assert_eq!(sink.texts(), vec!["c2", "c3"]);
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let control_sink = RecordingSink::default();
        let media_sink = RecordingSink::default();
        control_sink.buffered.store(5000, Ordering::SeqCst);

        let mut control = FlowController::new(Channel::Control, &config(10));
        let mut media = FlowController::new(Channel::Media, &config(10));

        control
            .send(&control_sink, Outbound::normal("stuck"))
            .await
            .unwrap();
        let dispatch = media
            .send(&media_sink, Outbound::normal("flows"))
            .await
            .unwrap();

        assert!(control.is_paused());
        assert!(!media.is_paused());
        assert_eq!(dispatch.delivered, 1);
        assert_eq!(media_sink.texts(), vec!["flows"]);
    }

    #[tokio::test]
    async fn failed_drain_keeps_message_at_front() {
        let sink = RecordingSink::default();
        sink.buffered.store(5000, Ordering::SeqCst);
        let mut flow = FlowController::new(Channel::Control, &config(10));
        flow.send(&sink, Outbound::normal("A")).await.unwrap();
        flow.send(&sink, Outbound::normal("B")).await.unwrap();

        sink.buffered.store(0, Ordering::SeqCst);
        sink.fail.store(true, Ordering::SeqCst);
        assert!(flow.drain(&sink).await.is_err());
        assert_eq!(flow.queued(), 2);

        sink.fail.store(false, Ordering::SeqCst);
        flow.drain(&sink).await.unwrap();
        assert_eq!(sink.texts(), vec!["A", "B"]);
    }

    #[test]
    fn clear_resets_pause() {
        let mut flow = FlowController::new(Channel::Control, &config(10));
        flow.paused = true;
        flow.queue.push_back(Outbound::normal("x"));
        assert_eq!(flow.clear(), 1);
        assert!(!flow.is_paused());
    }
}
