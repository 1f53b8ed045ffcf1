//! # Reliable Event Layer
//!
//! Per-connection sequencing, acknowledgment and retransmission of application
//! events over an unreliable transport.
//!
//! One [`EventManager`] exists per logical connection: a client keeps one for its
//! server, a server keeps one per connected client. The manager is a pure state
//! machine; it returns the messages to transmit and the events to deliver, and the
//! owning session does the I/O and invokes callbacks.
//!
//! ## Guarantees
//! - Each distinct event id is delivered **at most once**.
//! - Delivery is **not ordered**. An event is handed to the application as soon as
//!   it arrives; ids skipped by an early arrival are tracked in a gap list and
//!   delivered whenever they show up. Callers must not assume event `n - 1` is
//!   observed before event `n`.
//! - Unacknowledged events are retransmitted unchanged every confirmation timeout
//!   with no retry ceiling and no backoff, until confirmed or the connection is
//!   dropped.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;
use crate::protocol::registry::ApplicationEvent;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::CONFIRMATION_TIMEOUT;

/// Per-connection, per-direction event sequence number
pub type EventId = i32;

/// Most skipped ids that may be outstanding at once. An id that would push the
/// gap list past this is confirmed but not delivered, so a hostile peer cannot
/// grow it without bound.
pub const MAX_EVENT_GAP: i64 = 4096;

/// An event awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingSend<E> {
    pub event_id: EventId,
    pub event: E,
    pub last_sent: Instant,
}

/// Outcome of receiving one `Event` message
#[derive(Debug)]
pub struct Received<E> {
    /// Always present, including for duplicates
    pub confirmation: Message<E>,
    /// The event to hand to the application, if it was not delivered before
    pub delivered: Option<E>,
}

/// Both counters are kept wider than [`EventId`] so the last id can be used
/// once without wrapping.
#[derive(Debug)]
pub struct EventManager<E> {
    next_sending_id: i64,
    pending: Vec<PendingSend<E>>,
    next_receiving_id: i64,
    gaps: Vec<EventId>,
    confirmation_timeout: Duration,
}

impl<E: ApplicationEvent> Default for EventManager<E> {
    fn default() -> Self {
        Self::new(CONFIRMATION_TIMEOUT)
    }
}

impl<E: ApplicationEvent> EventManager<E> {
    pub fn new(confirmation_timeout: Duration) -> Self {
        Self {
            next_sending_id: 0,
            pending: Vec::new(),
            next_receiving_id: 0,
            gaps: Vec::new(),
            confirmation_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(sending: i64, receiving: i64) -> Self {
        Self {
            next_sending_id: sending,
            next_receiving_id: receiving,
            ..Self::new(CONFIRMATION_TIMEOUT)
        }
    }

    /// Assign the next id to `event`, remember it as pending and return the
    /// `Event` message to transmit.
    ///
    /// Fails with [`ProtocolError::EventIdsExhausted`] once every [`EventId`]
    /// has been used; the session must be re-established.
    pub fn send_event(&mut self, event: E, now: Instant) -> Result<Message<E>> {
        let event_id = EventId::try_from(self.next_sending_id).map_err(|_| {
            warn!("Event ids exhausted");
            ProtocolError::EventIdsExhausted
        })?;
        self.next_sending_id += 1;

        self.pending.push(PendingSend {
            event_id,
            event: event.clone(),
            last_sent: now,
        });
        global_metrics().event_sent();
        trace!(event_id, "Event queued for confirmation");

        Ok(Message::event(event_id, event))
    }

/// Handle an incoming event. A confirmation is produced for every receipt; the
    /// event itself is delivered only the first time its id is seen.
    pub fn on_receive_event(&mut self, event_id: EventId, event: E) -> Received<E> {
        let confirmation = Message::confirmation(event_id);
        let diff = i64::from(event_id) - self.next_receiving_id;

        let delivered = if diff >= 0 && self.gaps.len() as i64 + diff > MAX_EVENT_GAP {
            warn!(
                event_id,
                expected = self.next_receiving_id,
                outstanding = self.gaps.len(),
                "Event id too far ahead, dropped"
            );
            None
        } else if diff >= 0 {
            // everything between the watermark and this id is still outstanding;
            // the watermark is at most `event_id` here, so it fits an EventId
            let watermark = EventId::try_from(self.next_receiving_id).unwrap_or(event_id);
            self.gaps.extend(watermark..event_id);
            self.next_receiving_id = i64::from(event_id) + 1;
            if diff > 0 {
                debug!(event_id, skipped = diff, "Event arrived ahead of sequence");
            }
            Some(event)
        } else if let Some(pos) = self.gaps.iter().position(|&id| id == event_id) {
            self.gaps.swap_remove(pos);
            debug!(event_id, "Late event fills gap");
            Some(event)
        } else {
            global_metrics().event_duplicate();
            trace!(event_id, "Duplicate event ignored");
            None
        };

        if delivered.is_some() {
            global_metrics().event_delivered();
        }

        Received {
            confirmation,
            delivered,
        }
    }

    /// Drop the pending send matching `event_id`. Returns whether one existed.
    pub fn on_receive_confirmation(&mut self, event_id: EventId) -> bool {
        match self.pending.iter().position(|p| p.event_id == event_id) {
            Some(pos) => {
                self.pending.remove(pos);
                trace!(event_id, "Event confirmed");
                true
            }
            None => false,
        }
    }

    /// Retransmit every pending event older than the confirmation timeout,
    /// resetting its timestamp.
    pub fn tick(&mut self, now: Instant) -> Vec<Message<E>> {
        let timeout = self.confirmation_timeout;
        let mut resend = Vec::new();
        for pending in self
            .pending
            .iter_mut()
            .filter(|p| now.saturating_duration_since(p.last_sent) > timeout)
        {
            pending.last_sent = now;
            resend.push(Message::event(pending.event_id, pending.event.clone()));
        }

        if !resend.is_empty() {
            global_metrics().retransmissions(resend.len() as u64);
            debug!(count = resend.len(), "Retransmitting unconfirmed events");
        }
        resend
    }

    /// Events sent but not yet confirmed
    pub fn pending(&self) -> &[PendingSend<E>] {
        &self.pending
    }

    /// Ids skipped by out-of-order arrivals and still expected
    pub fn gaps(&self) -> &[EventId] {
        &self.gaps
    }

    pub fn next_sending_id(&self) -> i64 {
        self.next_sending_id
    }

    pub fn next_receiving_id(&self) -> i64 {
        self.next_receiving_id
    }
}
