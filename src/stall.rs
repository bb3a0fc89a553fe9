//! Liveness detection for pending protocol responses.
//!
//! The output pump registers a deadline whenever it sends a message that
//! expects a reply; the input pump clears deadlines as replies arrive and
//! brackets application handlers so their latency extends outstanding
//! deadlines instead of tripping them. A periodic tick declares the peer
//! stalled once a deadline (plus accumulated handler time) has passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::message::{expected_responses, response_class};
use crate::peer::Peer;

/// Control events from the I/O pumps.
#[derive(Debug)]
pub enum StallEvent {
    /// A message is about to hit the wire; register deadlines for its
    /// expected replies. Keep-alive pings never emit this.
    MessageSent(&'static str),
    /// A message arrived; clear its deadline and its equivalence class.
    MessageReceived(&'static str),
    /// The input pump is entering an application handler.
    HandlerStart(&'static str),
    /// The input pump returned from an application handler.
    HandlerDone,
    /// Pump exit notifications; the monitor stops once both are in.
    InputDone,
    OutputDone,
}

/// The deadline state machine, kept free of I/O so it can be tested
/// directly against explicit instants.
pub struct StallMonitor {
    response_timeout: Duration,
    /// Pending reply command -> deadline.
    deadlines: HashMap<&'static str, Instant>,
    /// Set while an application handler is running on the input pump.
    handler_started: Option<Instant>,
    /// Handler time accumulated since the last clean tick.
    extension: Duration,
    input_done: bool,
    output_done: bool,
}

impl StallMonitor {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            response_timeout,
            deadlines: HashMap::new(),
            handler_started: None,
            extension: Duration::ZERO,
            input_done: false,
            output_done: false,
        }
    }

    pub fn apply(&mut self, event: StallEvent, now: Instant) {
        match event {
            StallEvent::MessageSent(command) => self.message_sent(command, now),
            StallEvent::MessageReceived(command) => self.message_received(command),
            StallEvent::HandlerStart(command) => self.handler_start(command, now),
            StallEvent::HandlerDone => self.handler_done(now),
            StallEvent::InputDone => self.input_done = true,
            StallEvent::OutputDone => self.output_done = true,
        }
    }

    /// Register deadlines for the replies `command` expects. An existing
    /// (earlier) deadline for the same reply is kept.
    pub fn message_sent(&mut self, command: &'static str, now: Instant) {
        for reply in expected_responses(command) {
            self.deadlines
                .entry(reply)
                .or_insert(now + self.response_timeout);
        }
    }

    /// Clear the deadline for `command` and every member of its response
    /// equivalence class (a getdata is satisfied by tx or notfound alike).
    pub fn message_received(&mut self, command: &str) {
        self.deadlines.remove(command);
        for member in response_class(command) {
            self.deadlines.remove(member);
        }
    }

    pub fn handler_start(&mut self, command: &str, now: Instant) {
        if self.handler_started.is_some() {
            // Unbalanced signalling is a pump bug, not fatal.
            warn!("⚠️ Handler for {} started while another is active", command);
            return;
        }
        self.handler_started = Some(now);
    }

    pub fn handler_done(&mut self, now: Instant) {
        match self.handler_started.take() {
            Some(started) => self.extension += now.saturating_duration_since(started),
            None => warn!("⚠️ Handler done signalled with no active handler"),
        }
    }

    /// Evaluate pending deadlines against `now`. Returns the first overdue
    /// reply command, clearing all deadlines so later ticks take no further
    /// action; otherwise resets the accumulated extension for the next
    /// tick window.
    pub fn tick(&mut self, now: Instant) -> Option<&'static str> {
        let effective = self.extension
            + self
                .handler_started
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::ZERO);

        for (&command, &deadline) in &self.deadlines {
            if now >= deadline + effective {
                self.deadlines.clear();
                return Some(command);
            }
        }

        self.extension = Duration::ZERO;
        None
    }

    /// Both pumps have exited; nothing left to watch.
    pub fn finished(&self) -> bool {
        self.input_done && self.output_done
    }

    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }
}

/// Stall monitor task: one of the four background tasks per connected peer.
pub(crate) async fn run(peer: Arc<Peer>, mut events: mpsc::UnboundedReceiver<StallEvent>) {
    let mut monitor = StallMonitor::new(peer.config().stall_response_timeout);
    let mut ticker = interval(peer.config().stall_tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        monitor.apply(event, Instant::now());
                        if monitor.finished() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if let Some(command) = monitor.tick(Instant::now()) {
                    warn!(
                        "⏰ Peer {} appears stalled: no {} within {:?} -- disconnecting",
                        peer.addr(),
                        command,
                        peer.config().stall_response_timeout
                    );
                    peer.disconnect();
                }
            }
        }
    }

    // Drain remaining control events so late senders are not left behind.
    while events.try_recv().is_ok() {}

    debug!("🔌 Stall monitor for {} done", peer.addr());
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_after_timeout() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        let t0 = Instant::now();

        monitor.message_sent("getdata", t0);
        assert_eq!(monitor.pending(), 2); // tx and notfound

        assert_eq!(monitor.tick(t0 + Duration::from_secs(29)), None);
        assert!(monitor.tick(t0 + Duration::from_secs(30)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_exactly_once() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        let t0 = Instant::now();

        monitor.message_sent("getdata", t0);
        assert!(monitor.tick(t0 + Duration::from_secs(31)).is_some());

        // Deadlines are cleared; subsequent ticks take no further action.
        assert_eq!(monitor.pending(), 0);
        assert_eq!(monitor.tick(t0 + Duration::from_secs(120)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_clears_equivalence_class() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        let t0 = Instant::now();

        monitor.message_sent("getdata", t0);
        // A notfound satisfies the request as well as the data would.
        monitor.message_received("notfound");
        assert_eq!(monitor.pending(), 0);
        assert_eq!(monitor.tick(t0 + Duration::from_secs(120)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_time_extends_deadline() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        let t0 = Instant::now();

        monitor.message_sent("getdata", t0);

        // A 20s application handler ran; its latency must not count
        // against the remote.
        monitor.handler_start("inv", t0 + Duration::from_secs(5));
        monitor.handler_done(t0 + Duration::from_secs(25));

        assert_eq!(monitor.tick(t0 + Duration::from_secs(45)), None);
        assert!(monitor.tick(t0 + Duration::from_secs(50)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_handler_counts_toward_extension() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        let t0 = Instant::now();

        monitor.message_sent("getdata", t0);
        monitor.handler_start("inv", t0);

        // Handler still running at the would-be deadline: no fire.
        assert_eq!(monitor.tick(t0 + Duration::from_secs(35)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_resets_after_clean_tick() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        let t0 = Instant::now();

        monitor.handler_start("inv", t0);
        monitor.handler_done(t0 + Duration::from_secs(10));

        // Clean tick with nothing pending consumes the extension.
        assert_eq!(monitor.tick(t0 + Duration::from_secs(15)), None);

        monitor.message_sent("getdata", t0 + Duration::from_secs(15));
        // Without the stale 10s extension this fires right at the deadline.
        assert!(monitor
            .tick(t0 + Duration::from_secs(45) + Duration::from_millis(1))
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbalanced_handler_signals_ignored() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        let t0 = Instant::now();

        monitor.handler_done(t0); // no active handler: warn and ignore
        monitor.handler_start("inv", t0);
        monitor.handler_start("tx", t0 + Duration::from_secs(1)); // ignored
        monitor.handler_done(t0 + Duration::from_secs(2));
        assert_eq!(monitor.extension, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_registers_no_deadline() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        monitor.message_sent("ping", Instant::now());
        assert_eq!(monitor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_requires_both_pumps() {
        let mut monitor = StallMonitor::new(TIMEOUT);
        monitor.apply(StallEvent::InputDone, Instant::now());
        assert!(!monitor.finished());
        monitor.apply(StallEvent::OutputDone, Instant::now());
        assert!(monitor.finished());
    }
}
