//! Millisecond Timer Facility
//!
//! Single-shot, re-armable timers driven by an external 1 ms tick. The
//! handler owns the timer table; protocol entities hold [`UniqueTimer`]
//! handles and receive expiries through the id returned by
//! [`TimerHandler::step_all`], so no callback ever captures the entity.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Opaque timer identifier, unique within one [`TimerHandler`]
pub type TimerId = u32;

/// Timer facility errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("No free timers left (capacity {0})")]
    Exhausted(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Stopped,
    Running { deadline: u64 },
    Expired,
}

#[derive(Debug)]
struct TimerSlot {
    duration: u32,
    started_at: u64,
    state: TimerState,
}

#[derive(Debug, Default)]
struct TimerTable {
    /// Milliseconds elapsed since creation
    now: u64,
    slots: Vec<Option<TimerSlot>>,
}

/// Timer service shared by all entities of a stack instance
#[derive(Debug)]
pub struct TimerHandler {
    capacity: usize,
    table: Mutex<TimerTable>,
}

impl TimerHandler {
    /// Create a handler able to hold `capacity` timers at once
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            table: Mutex::new(TimerTable::default()),
        })
    }

    /// Reserve a timer slot
    pub fn get_unique_timer(self: &Arc<Self>) -> Result<UniqueTimer, TimerError> {
        let mut table = self.table.lock();
        let slot = TimerSlot {
            duration: 0,
            started_at: table.now,
            state: TimerState::Stopped,
        };

        let id = match table.slots.iter().position(Option::is_none) {
            Some(free) => {
                table.slots[free] = Some(slot);
                free
            }
            None if table.slots.len() < self.capacity => {
                table.slots.push(Some(slot));
                table.slots.len() - 1
            }
            None => return Err(TimerError::Exhausted(self.capacity)),
        };

        debug!("Allocated timer id={}", id);
        Ok(UniqueTimer {
            id: id as TimerId,
            handler: Arc::clone(self),
        })
    }

    /// Advance time by one millisecond and return the timers that expired
    pub fn step_all(&self) -> Vec<TimerId> {
        let mut table = self.table.lock();
        table.now += 1;
        let now = table.now;

        let mut expired = Vec::new();
        for (id, slot) in table.slots.iter_mut().enumerate() {
            if let Some(slot) = slot {
                if let TimerState::Running { deadline } = slot.state {
                    if deadline <= now {
                        slot.state = TimerState::Expired;
                        expired.push(id as TimerId);
                    }
                }
            }
        }

        if !expired.is_empty() {
            trace!("tti={} expired timers {:?}", now, expired);
        }
        expired
    }

    /// Current time in milliseconds
    pub fn now(&self) -> u64 {
        self.table.lock().now
    }

    /// Number of armed timers
    pub fn nof_running_timers(&self) -> usize {
        self.table
            .lock()
            .slots
            .iter()
            .flatten()
            .filter(|s| matches!(s.state, TimerState::Running { .. }))
            .count()
    }

    /// Number of allocated timer slots
    pub fn nof_timers(&self) -> usize {
        self.table.lock().slots.iter().flatten().count()
    }

    fn with_slot<R>(&self, id: TimerId, f: impl FnOnce(&mut TimerSlot, u64) -> R) -> Option<R> {
        let mut table = self.table.lock();
        let now = table.now;
        table
            .slots
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .map(|slot| f(slot, now))
    }
}

/// Handle to a single timer slot, released on drop
#[derive(Debug)]
pub struct UniqueTimer {
    id: TimerId,
    handler: Arc<TimerHandler>,
}

impl UniqueTimer {
    /// Identifier reported by [`TimerHandler::step_all`]
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Set the duration in milliseconds, stopping the timer
    pub fn set(&self, duration_ms: u32) {
        self.handler.with_slot(self.id, |slot, _| {
            slot.duration = duration_ms;
            slot.state = TimerState::Stopped;
        });
    }

    /// Arm (or re-arm) the timer from the current time
    pub fn run(&self) {
        self.handler.with_slot(self.id, |slot, now| {
            slot.started_at = now;
            slot.state = TimerState::Running {
                deadline: now + slot.duration as u64,
            };
        });
    }

    pub fn stop(&self) {
        self.handler.with_slot(self.id, |slot, _| {
            slot.state = TimerState::Stopped;
        });
    }

    pub fn is_running(&self) -> bool {
        self.handler
            .with_slot(self.id, |slot, _| matches!(slot.state, TimerState::Running { .. }))
            .unwrap_or(false)
    }

    /// True once the timer fired and until it is re-armed or stopped
    pub fn is_expired(&self) -> bool {
        self.handler
            .with_slot(self.id, |slot, _| slot.state == TimerState::Expired)
            .unwrap_or(false)
    }

    pub fn duration(&self) -> u32 {
        self.handler
            .with_slot(self.id, |slot, _| slot.duration)
            .unwrap_or(0)
    }

    /// Milliseconds since the timer was last armed, 0 when stopped
    pub fn time_elapsed(&self) -> u64 {
        self.handler
            .with_slot(self.id, |slot, now| match slot.state {
                TimerState::Stopped => 0,
                _ => now - slot.started_at,
            })
            .unwrap_or(0)
    }
}

impl Drop for UniqueTimer {
    fn drop(&mut self) {
        let mut table = self.handler.table.lock();
        if let Some(slot) = table.slots.get_mut(self.id as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_expires_after_duration() {
        let timers = TimerHandler::new(4);
        let t = timers.get_unique_timer().unwrap();
        t.set(3);
        t.run();
        assert!(t.is_running());

        assert!(timers.step_all().is_empty());
        assert!(timers.step_all().is_empty());
        assert_eq!(t.time_elapsed(), 2);
        assert_eq!(timers.step_all(), vec![t.id()]);
        assert!(t.is_expired());
        assert!(!t.is_running());

        // single shot
        assert!(timers.step_all().is_empty());
    }

    #[test]
    fn test_timer_stop_and_rearm() {
        let timers = TimerHandler::new(4);
        let t = timers.get_unique_timer().unwrap();
        t.set(2);
        t.run();
        timers.step_all();
        t.stop();
        assert!(timers.step_all().is_empty());
        assert!(!t.is_expired());

        t.run();
        timers.step_all();
        t.run();
        timers.step_all();
        assert_eq!(timers.step_all(), vec![t.id()]);
    }

    #[test]
    fn test_timer_capacity_and_release() {
        let timers = TimerHandler::new(2);
        let a = timers.get_unique_timer().unwrap();
        let b = timers.get_unique_timer().unwrap();
        assert_eq!(timers.get_unique_timer().unwrap_err(), TimerError::Exhausted(2));
        assert_ne!(a.id(), b.id());

        let freed = a.id();
        drop(a);
        assert_eq!(timers.nof_timers(), 1);
        let c = timers.get_unique_timer().unwrap();
        assert_eq!(c.id(), freed);
    }

    #[test]
    fn test_nof_running_timers() {
        let timers = TimerHandler::new(4);
        let a = timers.get_unique_timer().unwrap();
        let b = timers.get_unique_timer().unwrap();
        a.set(5);
        b.set(1);
        a.run();
        b.run();
        assert_eq!(timers.nof_running_timers(), 2);
        timers.step_all();
        assert_eq!(timers.nof_running_timers(), 1);
        assert_eq!(timers.now(), 1);
    }
}
