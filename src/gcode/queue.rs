// src/gcode/queue.rs - Fixed-capacity command ring and the emergency stop counter
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::command::Command;

/// Number of queued commands still to be discarded before normal processing
/// resumes. Zero means no stop is in progress.
///
/// The counter is written only while the queue lock is held; waits in the motion
/// and heater code read it lock-free to abort within one polling iteration.
#[derive(Debug, Clone, Default)]
pub struct EmergencyStop {
    pending: Arc<AtomicUsize>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.pending() > 0
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn set(&self, value: usize) {
        self.pending.store(value, Ordering::Release);
    }
}

/// Outcome of [`CommandQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// The ring was full; the sender recovers through the resend protocol.
    Dropped,
    /// The command was a stop/kill; nothing was queued.
    EmergencyStop { discarding: usize },
}

/// Outcome of [`CommandQueue::take_next`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued {
    Empty,
    Dispatch(Command),
    /// A command queued before an emergency stop was thrown away.
    Discarded(Command),
    /// The last step of an emergency stop; exactly one confirmation is owed.
    /// Carries the numbered stop lines so they can be sequenced.
    StopCompleted(Vec<Command>),
}

/// Fixed-capacity circular buffer of parsed commands.
#[derive(Debug)]
pub struct CommandQueue {
    slots: Box<[Command]>,
    /// Next slot to fill.
    head: usize,
    /// Next slot to process.
    tail: usize,
    len: usize,
    stop: EmergencyStop,
    /// Numbered stop lines received since the stop was armed, oldest first.
    stops: Vec<Command>,
    dropped: u64,
}

impl CommandQueue {
    pub fn new(capacity: usize, stop: EmergencyStop) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![Command::default(); capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
            stop,
            stops: Vec::new(),
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Lines lost to a full ring since start-up.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.stop
    }

    /// Store a parsed command, or arm the emergency stop if it is a stop/kill.
    pub fn enqueue(&mut self, command: Command) -> Enqueued {
        if command.is_emergency_stop() {
            let discarding = self.len;
            self.stop.set(discarding + 1);
            if command.n().is_some() {
                if self.stops.len() == self.slots.len() {
                    self.stops.remove(0);
                }
                self.stops.push(command);
            }
            tracing::warn!("Emergency stop received, discarding {} queued command(s)", discarding);
            return Enqueued::EmergencyStop { discarding };
        }
        if self.is_full() {
            self.dropped += 1;
            tracing::warn!("Command queue full, dropping '{}'", command);
            return Enqueued::Dropped;
        }
        self.slots[self.head] = command;
        self.head = (self.head + 1) % self.slots.len();
        self.len += 1;
        Enqueued::Queued
    }

    /// Next unit of work for the main loop.
    ///
    /// While a stop is pending the oldest slots are discarded one per call; commands
    /// enqueued after the stop arrived are not counted and survive it.
    pub fn take_next(&mut self) -> Dequeued {
        match self.stop.pending() {
            0 => match self.pop() {
                Some(command) => Dequeued::Dispatch(command),
                None => Dequeued::Empty,
            },
            1 => {
                self.stop.set(0);
                Dequeued::StopCompleted(std::mem::take(&mut self.stops))
            }
            pending => {
                self.stop.set(pending - 1);
                match self.pop() {
                    Some(command) => Dequeued::Discarded(command),
                    None => Dequeued::Empty,
                }
            }
        }
    }

    fn pop(&mut self) -> Option<Command> {
        if self.len == 0 {
            return None;
        }
        let command = std::mem::take(&mut self.slots[self.tail]);
        self.tail = (self.tail + 1) % self.slots.len();
        self.len -= 1;
        Some(command)
    }
}

/// The queue as shared between the receive side and the main loop. Holding the
/// lock is the critical section in which queue bookkeeping may change.
#[derive(Debug, Clone)]
pub struct SharedQueue {
    inner: Arc<Mutex<CommandQueue>>,
}

impl SharedQueue {
    pub fn new(queue: CommandQueue) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CommandQueue> {
        // A panic while holding the lock leaves the ring itself consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::parser::{parse_line, ParserConfig};

    fn cmd(line: &str) -> Command {
        parse_line(line, &ParserConfig::default())
    }

    #[test]
    fn test_fifo_order_and_wraparound() {
        let mut queue = CommandQueue::new(3, EmergencyStop::new());
        for round in 0..3 {
            assert_eq!(queue.enqueue(cmd(&format!("G1 X{}", round))), Enqueued::Queued);
            assert_eq!(queue.enqueue(cmd(&format!("G1 Y{}", round))), Enqueued::Queued);
            match queue.take_next() {
                Dequeued::Dispatch(c) => assert_eq!(c.x(), Some(round as f32)),
                other => panic!("unexpected {:?}", other),
            }
            match queue.take_next() {
                Dequeued::Dispatch(c) => assert_eq!(c.y(), Some(round as f32)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(queue.take_next(), Dequeued::Empty);
    }

    #[test]
    fn test_full_queue_drops_input() {
        let mut queue = CommandQueue::new(2, EmergencyStop::new());
        assert_eq!(queue.enqueue(cmd("G28")), Enqueued::Queued);
        assert_eq!(queue.enqueue(cmd("G90")), Enqueued::Queued);
        assert_eq!(queue.enqueue(cmd("G91")), Enqueued::Dropped);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_emergency_stop_drains_only_prior_commands() {
        let stop = EmergencyStop::new();
        let mut queue = CommandQueue::new(8, stop.clone());
        for line in ["G1 X1", "G1 X2", "G1 X3"] {
            queue.enqueue(cmd(line));
        }
        assert_eq!(queue.enqueue(cmd("M112")), Enqueued::EmergencyStop { discarding: 3 });
        assert!(stop.is_active());
        assert_eq!(stop.pending(), 4);

        // Arrives after the stop and must survive it.
        queue.enqueue(cmd("G1 X9"));

        for _ in 0..3 {
            assert!(matches!(queue.take_next(), Dequeued::Discarded(_)));
        }
        assert_eq!(queue.take_next(), Dequeued::StopCompleted(Vec::new()));
        assert!(!stop.is_active());
        match queue.take_next() {
            Dequeued::Dispatch(c) => assert_eq!(c.x(), Some(9.0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_emergency_stop_on_empty_queue() {
        let stop = EmergencyStop::new();
        let mut queue = CommandQueue::new(4, stop.clone());
        assert_eq!(queue.enqueue(cmd("M0")), Enqueued::EmergencyStop { discarding: 0 });
        assert_eq!(queue.take_next(), Dequeued::StopCompleted(Vec::new()));
        assert_eq!(queue.take_next(), Dequeued::Empty);
    }

    #[test]
    fn test_numbered_stops_are_handed_over() {
        let mut queue = CommandQueue::new(2, EmergencyStop::new());
        queue.enqueue(cmd("G1 X1"));
        for line in ["N1 M112", "M112", "N2 M112", "N3 M112"] {
            assert!(matches!(queue.enqueue(cmd(line)), Enqueued::EmergencyStop { .. }));
        }
        assert!(matches!(queue.take_next(), Dequeued::Discarded(_)));
        match queue.take_next() {
            Dequeued::StopCompleted(stops) => {
                let lines: Vec<_> = stops.iter().map(|c| c.n()).collect();
                assert_eq!(lines, vec![Some(2), Some(3)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.take_next(), Dequeued::Empty);
    }

    #[test]
    fn test_slots_are_recycled_empty() {
        let mut queue = CommandQueue::new(1, EmergencyStop::new());
        queue.enqueue(cmd("G1 X1"));
        let _ = queue.take_next();
        assert!(queue.slots[0].is_empty());
    }
}
