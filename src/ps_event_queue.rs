//! Time-ordered event queue with deterministic tie-breaking.
//!
//! Events are ordered by:
//! 1. Time (earlier first)
//! 2. Sequence number (insertion order for equal times)
//!
//! The sequence counter belongs to the queue, so two simulations never share
//! it and a replay with the same seed produces the same order.

use crate::ps_error::{SimError, SimResult};
use crate::ps_interface::{Message, SimTime};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Clone, Debug)]
pub struct Event {
    pub time: SimTime,
    pub sequence: u64,
    pub message: Message,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Event {}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.total_cmp(&other.time) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.sequence.cmp(&other.sequence)
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
    now: SimTime,
    next_sequence: u64,
    // queued events that are not clock activations
    protocol_pending: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of queued peer-to-peer messages
    pub fn protocol_pending(&self) -> usize {
        self.protocol_pending
    }

    /// Queue `message` at absolute `time`, returning its sequence number.
    pub fn schedule(&mut self, time: SimTime, message: Message) -> SimResult<u64> {
        // also rejects NaN
        if !(time >= self.now) {
            return Err(SimError::OrderingViolation {
                time,
                now: self.now,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        if message.is_protocol() {
            self.protocol_pending += 1;
        }
        self.heap.push(Reverse(Event {
            time,
            sequence,
            message,
        }));
        Ok(sequence)
    }

    /// Queue `message` `delay` seconds from now.
    pub fn schedule_after(&mut self, delay: SimTime, message: Message) -> SimResult<u64> {
        self.schedule(self.now + delay, message)
    }

    /// Pop the next event and advance the clock to it.
    pub fn pop(&mut self) -> Option<Event> {
        let Reverse(event) = self.heap.pop()?;
        if event.message.is_protocol() {
            self.protocol_pending -= 1;
        }
        self.now = event.time;
        Some(event)
    }

    /// Pop the next event if it lies strictly before `horizon`.
    ///
    /// The first event at or past the horizon is not processed. A clock
    /// activation there is dropped; a peer message stays queued so a later
    /// `pop` can still deliver it. The clock is left at the last processed
    /// event.
    pub fn pop_before(&mut self, horizon: SimTime) -> Option<Event> {
        let Reverse(next) = self.heap.peek()?;
        if next.time >= horizon {
            if !next.message.is_protocol() {
                self.heap.pop();
            }
            return None;
        }
        self.pop()
    }

    /// Remove every queued clock activation, keeping peer messages.
    pub fn discard_clock_fires(&mut self) -> usize {
        let before = self.heap.len();
        self.heap.retain(|Reverse(event)| event.message.is_protocol());
        before - self.heap.len()
    }
}
