//! State shared between the intake loop, command tasks and the telemetry loop.
//!
//! [`VoltageState`] is lock-free: each field has exactly one writer handle.
//! [`MeasuredWriter`] belongs to the telemetry loop, [`TargetWriter`] to command
//! execution. Neither handle is `Clone`, so no other component can write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Whether a command is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No command in flight.
    Idle,
    /// One command task is running.
    Executing,
}

/// Point-in-time copy of the voltages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageSnapshot {
    /// Last telemetry reading.
    pub measured: f64,
    /// Last requested setpoint.
    pub target: f64,
}

/// Measured and target voltage, stored as `f64` bits.
#[derive(Debug)]
pub struct VoltageState {
    measured: AtomicU64,
    target: AtomicU64,
}

impl VoltageState {
    /// Creates the state and its two writer handles.
    pub(crate) fn split(initial: f64) -> (Arc<Self>, MeasuredWriter, TargetWriter) {
        let state = Arc::new(Self {
            measured: AtomicU64::new(initial.to_bits()),
            target: AtomicU64::new(initial.to_bits()),
        });
        (
            Arc::clone(&state),
            MeasuredWriter(Arc::clone(&state)),
            TargetWriter(state),
        )
    }

    /// Last telemetry reading.
    pub fn measured(&self) -> f64 {
        f64::from_bits(self.measured.load(Ordering::Acquire))
    }

    /// Last requested setpoint.
    pub fn target(&self) -> f64 {
        f64::from_bits(self.target.load(Ordering::Acquire))
    }

    /// Both fields at once.
    pub fn snapshot(&self) -> VoltageSnapshot {
        VoltageSnapshot {
            measured: self.measured(),
            target: self.target(),
        }
    }
}

/// Sole writer of [`VoltageState::measured`].
#[derive(Debug)]
pub(crate) struct MeasuredWriter(Arc<VoltageState>);

impl MeasuredWriter {
    pub(crate) fn set(&self, voltage: f64) {
        self.0.measured.store(voltage.to_bits(), Ordering::Release);
    }
}

/// Sole writer of [`VoltageState::target`].
#[derive(Debug)]
pub(crate) struct TargetWriter(Arc<VoltageState>);

impl TargetWriter {
    pub(crate) fn set(&self, voltage: f64) {
        self.0.target.store(voltage.to_bits(), Ordering::Release);
    }
}

/// Single-flight slot. Holding an [`ExecutionGuard`] means `Executing`.
#[derive(Debug, Default)]
pub(crate) struct ExecutionSlot {
    busy: AtomicBool,
}

impl ExecutionSlot {
    /// Claims the slot, or returns `None` when a command is already executing.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<ExecutionGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExecutionGuard {
                slot: Arc::clone(self),
            })
    }

    pub(crate) fn state(&self) -> CoordinatorState {
        if self.busy.load(Ordering::Acquire) {
            CoordinatorState::Executing
        } else {
            CoordinatorState::Idle
        }
    }
}

/// Returns the slot to `Idle` when dropped, whatever way the command ended.
#[derive(Debug)]
pub(crate) struct ExecutionGuard {
    slot: Arc<ExecutionSlot>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writers_update_their_field_only() {
        let (state, measured, target) = VoltageState::split(0.0);
        measured.set(12.5);
        assert_eq!(state.snapshot(), VoltageSnapshot { measured: 12.5, target: 0.0 });
        target.set(-3.0);
        assert_eq!(state.snapshot(), VoltageSnapshot { measured: 12.5, target: -3.0 });
    }

    #[test]
    fn test_slot_is_single_flight_and_released_on_drop() {
        let slot = Arc::new(ExecutionSlot::default());
        assert_eq!(slot.state(), CoordinatorState::Idle);

        let guard = slot.try_acquire().unwrap();
        assert_eq!(slot.state(), CoordinatorState::Executing);
        assert!(slot.try_acquire().is_none());

        drop(guard);
        assert_eq!(slot.state(), CoordinatorState::Idle);
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let slot = Arc::new(ExecutionSlot::default());
        let cloned = Arc::clone(&slot);
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_acquire().unwrap();
            panic!("command blew up");
        });
        assert!(result.is_err());
        assert_eq!(slot.state(), CoordinatorState::Idle);
    }
}
