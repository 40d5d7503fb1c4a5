//! Per-agent shutdown state machine.
//!
//! An agent that received the `[stop, flush, shutdown]` sequence is expected
//! to answer with four signals: the stop ack, the flush ack, a final summary
//! and the shutdown ack. Signals may arrive in any order; the phase reported
//! is the furthest step reached without a gap.

use crate::protocol::{AgentMessage, CommandKind};
use serde::Serialize;
use std::time::{Duration, Instant};

/// One of the four responses the shutdown sequence waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownSignal {
    StopAck,
    FlushAck,
    Summary,
    ShutdownAck,
}

impl ShutdownSignal {
    /// In protocol order.
    pub const ALL: [ShutdownSignal; 4] = [
        ShutdownSignal::StopAck,
        ShutdownSignal::FlushAck,
        ShutdownSignal::Summary,
        ShutdownSignal::ShutdownAck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::StopAck => "stop_ack",
            ShutdownSignal::FlushAck => "flush_ack",
            ShutdownSignal::Summary => "summary",
            ShutdownSignal::ShutdownAck => "shutdown_ack",
        }
    }

    /// The signal a message carries, if any.
    pub fn from_message(message: &AgentMessage) -> Option<Self> {
        match message {
            AgentMessage::Summary(_) => Some(ShutdownSignal::Summary),
            AgentMessage::Ack(_) => match message.acked_command()? {
                CommandKind::Stop => Some(ShutdownSignal::StopAck),
                CommandKind::Flush => Some(ShutdownSignal::FlushAck),
                CommandKind::Shutdown => Some(ShutdownSignal::ShutdownAck),
                _ => None,
            },
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    SequenceSent,
    StopAcked,
    FlushAcked,
    SummaryReceived,
    ShutdownAcked,
    /// Every signal arrived and the process is gone (or about to be killed).
    Done,
    /// Resolved with at least one signal missing.
    TimedOut,
}

impl ShutdownPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownPhase::SequenceSent => "sequence_sent",
            ShutdownPhase::StopAcked => "stop_acked",
            ShutdownPhase::FlushAcked => "flush_acked",
            ShutdownPhase::SummaryReceived => "summary_received",
            ShutdownPhase::ShutdownAcked => "shutdown_acked",
            ShutdownPhase::Done => "done",
            ShutdownPhase::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShutdownPhase::Done | ShutdownPhase::TimedOut)
    }

    /// Phase after `contiguous` signals in protocol order.
    fn after(contiguous: usize) -> Self {
        match contiguous {
            0 => ShutdownPhase::SequenceSent,
            1 => ShutdownPhase::StopAcked,
            2 => ShutdownPhase::FlushAcked,
            3 => ShutdownPhase::SummaryReceived,
            _ => ShutdownPhase::ShutdownAcked,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownTracker {
    phase: ShutdownPhase,
    /// Furthest non-terminal phase, kept after resolution for reporting.
    progress: ShutdownPhase,
    received: [bool; 4],
    timeout: Duration,
    deadline: Instant,
    delivered: bool,
    exited: bool,
}

impl ShutdownTracker {
    /// Start tracking at `now`. `delivered` is false when the sequence could
    /// not be written; the deadline applies either way.
    pub fn new(timeout: Duration, now: Instant, delivered: bool) -> Self {
        Self {
            phase: ShutdownPhase::SequenceSent,
            progress: ShutdownPhase::SequenceSent,
            received: [false; 4],
            timeout,
            deadline: now + timeout,
            delivered,
            exited: false,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    /// Furthest step reached, ignoring resolution.
    pub fn progress(&self) -> ShutdownPhase {
        self.progress
    }

    pub fn delivered(&self) -> bool {
        self.delivered
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn has_received(&self, signal: ShutdownSignal) -> bool {
        self.received[signal.index()]
    }

    pub fn all_received(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    /// Signals still outstanding, in protocol order.
    pub fn missing(&self) -> Vec<ShutdownSignal> {
        ShutdownSignal::ALL
            .into_iter()
            .filter(|s| !self.has_received(*s))
            .collect()
    }

    /// The single transition function.
    pub fn on_signal(&mut self, signal: ShutdownSignal) -> ShutdownPhase {
        if self.is_terminal() {
            return self.phase;
        }
        self.received[signal.index()] = true;

        let contiguous = self.received.iter().take_while(|r| **r).count();
        self.progress = ShutdownPhase::after(contiguous);
        self.phase = if self.all_received() && self.exited {
            ShutdownPhase::Done
        } else {
            self.progress
        };
        self.phase
    }

    /// Any message pushes the deadline forward; shutdown signals also advance.
    pub fn on_message(&mut self, message: &AgentMessage, now: Instant) -> ShutdownPhase {
        if self.is_terminal() {
            return self.phase;
        }
        self.deadline = now + self.timeout;
        match ShutdownSignal::from_message(message) {
            Some(signal) => self.on_signal(signal),
            None => self.phase,
        }
    }

    /// The process has exited.
    pub fn on_exit(&mut self) -> ShutdownPhase {
        self.exited = true;
        if !self.is_terminal() && self.all_received() {
            self.phase = ShutdownPhase::Done;
        }
        self.phase
    }

    /// Resolve once the deadline passed. Returns true if it just resolved.
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        if self.is_terminal() || now < self.deadline {
            return false;
        }
        self.resolve();
        true
    }

    /// Stop waiting: `Done` if nothing is missing, otherwise `TimedOut`.
    pub fn resolve(&mut self) -> ShutdownPhase {
        if !self.is_terminal() {
            self.phase = if self.all_received() {
                ShutdownPhase::Done
            } else {
                ShutdownPhase::TimedOut
            };
        }
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use serde_json::json;

    fn ack(command: &str) -> AgentMessage {
        let envelope = Envelope::new("keys", "keys-1", "1.0").with_data(json!({"command": command}));
        AgentMessage::Ack(envelope)
    }

    fn tracker() -> (ShutdownTracker, Instant) {
        let now = Instant::now();
        (ShutdownTracker::new(Duration::from_secs(2), now, true), now)
    }

    #[test]
    fn in_order_signals_walk_every_phase() {
        let (mut tracker, _) = tracker();
        assert_eq!(tracker.on_signal(ShutdownSignal::StopAck), ShutdownPhase::StopAcked);
        assert_eq!(tracker.on_signal(ShutdownSignal::FlushAck), ShutdownPhase::FlushAcked);
        assert_eq!(
            tracker.on_signal(ShutdownSignal::Summary),
            ShutdownPhase::SummaryReceived
        );
        assert_eq!(
            tracker.on_signal(ShutdownSignal::ShutdownAck),
            ShutdownPhase::ShutdownAcked
        );
        assert_eq!(tracker.on_exit(), ShutdownPhase::Done);
        assert!(tracker.missing().is_empty());
    }

    #[test]
    fn out_of_order_signals_report_the_contiguous_step() {
        let (mut tracker, _) = tracker();
        assert_eq!(
            tracker.on_signal(ShutdownSignal::Summary),
            ShutdownPhase::SequenceSent
        );
        assert_eq!(tracker.on_signal(ShutdownSignal::StopAck), ShutdownPhase::StopAcked);
        assert!(tracker.has_received(ShutdownSignal::Summary));
        assert_eq!(
            tracker.on_signal(ShutdownSignal::FlushAck),
            ShutdownPhase::SummaryReceived
        );
    }

    #[test]
    fn exit_before_the_last_signal_completes_on_arrival() {
        let (mut tracker, _) = tracker();
        for signal in [ShutdownSignal::StopAck, ShutdownSignal::FlushAck, ShutdownSignal::Summary] {
            tracker.on_signal(signal);
        }
        assert_eq!(tracker.on_exit(), ShutdownPhase::SummaryReceived);
        assert_eq!(tracker.on_signal(ShutdownSignal::ShutdownAck), ShutdownPhase::Done);
    }

    #[test]
    fn deadline_resolves_with_missing_signals() {
        let (mut tracker, now) = tracker();
        tracker.on_signal(ShutdownSignal::StopAck);
        tracker.on_signal(ShutdownSignal::FlushAck);

        assert!(!tracker.check_deadline(now + Duration::from_secs(1)));
        assert!(tracker.check_deadline(now + Duration::from_secs(2)));
        assert_eq!(tracker.phase(), ShutdownPhase::TimedOut);
        assert_eq!(tracker.progress(), ShutdownPhase::FlushAcked);
        assert_eq!(
            tracker.missing(),
            vec![ShutdownSignal::Summary, ShutdownSignal::ShutdownAck]
        );

        // Terminal phases ignore late signals.
        assert_eq!(
            tracker.on_signal(ShutdownSignal::Summary),
            ShutdownPhase::TimedOut
        );
    }

    #[test]
    fn any_message_pushes_the_deadline() {
        let (mut tracker, now) = tracker();
        let later = now + Duration::from_millis(1500);
        let heartbeat = AgentMessage::Heartbeat(Envelope::new("keys", "keys-1", "1.0"));

        tracker.on_message(&heartbeat, later);
        assert_eq!(tracker.deadline(), later + Duration::from_secs(2));
        assert!(!tracker.check_deadline(now + Duration::from_secs(2)));

        assert_eq!(tracker.on_message(&ack("stop"), later), ShutdownPhase::StopAcked);
        assert_eq!(tracker.on_message(&ack("status"), later), ShutdownPhase::StopAcked);
    }

    #[test]
    fn undelivered_sequence_still_times_out() {
        let now = Instant::now();
        let mut tracker = ShutdownTracker::new(Duration::from_millis(10), now, false);
        assert!(!tracker.delivered());
        assert!(tracker.check_deadline(now + Duration::from_millis(10)));
        assert_eq!(tracker.missing().len(), 4);
    }

    #[test]
    fn resolving_with_everything_received_is_done() {
        let (mut tracker, _) = tracker();
        for signal in ShutdownSignal::ALL {
            tracker.on_signal(signal);
        }
        assert_eq!(tracker.resolve(), ShutdownPhase::Done);
    }

    #[test]
    fn signals_are_read_from_messages() {
        assert_eq!(
            ShutdownSignal::from_message(&ack("flush")),
            Some(ShutdownSignal::FlushAck)
        );
        let summary = AgentMessage::Summary(Envelope::new("keys", "keys-1", "1.0"));
        assert_eq!(
            ShutdownSignal::from_message(&summary),
            Some(ShutdownSignal::Summary)
        );
        assert_eq!(ShutdownSignal::from_message(&ack("start")), None);
    }
}
