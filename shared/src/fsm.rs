//! Finite-state-machine harness shared by every server/client thread.
//!
//! Grounded on `original_source/core/fsm.py`'s `State`/`StateMachine` pair.
//! Each concrete machine implements one `action` per state and drives itself
//! with `run()`; `halt()` may be called from another task at any time, but
//! is only observed between actions, never mid-action — actions must keep
//! their own blocking operations short (1-2s timeouts) so a halt request is
//! never stuck behind a long syscall.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

/// Marker trait for a machine's state enum. Must include a `HALT` variant,
/// which implementors return from `halt_state()`.
pub trait MachineState: Copy + Eq + Debug + Send + Sync {
    fn halt_state() -> Self;
}

/// A finite state machine whose actions may perform I/O.
#[async_trait]
pub trait StateMachine: Send {
    type State: MachineState;

    fn state(&self) -> Self::State;
    fn set_state(&mut self, state: Self::State);

    /// Run exactly one action for the current state, returning the next one.
    async fn action(&mut self) -> Self::State;

    /// Run the machine until its state reaches `HALT`.
    async fn run(&mut self) {
        while self.state() != Self::State::halt_state() {
            let next = self.action().await;
            self.set_state(next);
        }
    }
}

/// A flag an owning task can poll-check and an external caller can trip.
/// Shared via `Arc` between the orchestrator and a running machine.
#[derive(Debug, Default)]
pub struct HaltFlag(AtomicBool);

impl HaltFlag {
    pub fn new() -> Self {
        HaltFlag(AtomicBool::new(false))
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Helper for actions to use at their entry point: if the flag is tripped,
/// short-circuit straight to `HALT` instead of running the state's body.
pub fn halt_if_tripped<S: MachineState>(flag: &HaltFlag) -> Option<S> {
    if flag.is_tripped() {
        Some(S::halt_state())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Counter {
        Tick,
        Halt,
    }

    impl MachineState for Counter {
        fn halt_state() -> Self {
            Counter::Halt
        }
    }

    struct CountingMachine {
        state: Counter,
        count: u32,
        flag: std::sync::Arc<HaltFlag>,
    }

    #[async_trait]
    impl StateMachine for CountingMachine {
        type State = Counter;

        fn state(&self) -> Counter {
            self.state
        }

        fn set_state(&mut self, state: Counter) {
            self.state = state;
        }

        async fn action(&mut self) -> Counter {
            if let Some(halt) = halt_if_tripped::<Counter>(&self.flag) {
                return halt;
            }
            self.count += 1;
            if self.count >= 3 {
                Counter::Halt
            } else {
                Counter::Tick
            }
        }
    }

    #[tokio::test]
    async fn runs_until_halt_state() {
        let flag = std::sync::Arc::new(HaltFlag::new());
        let mut machine = CountingMachine { state: Counter::Tick, count: 0, flag };
        machine.run().await;
        assert_eq!(machine.count, 3);
    }

    #[tokio::test]
    async fn external_halt_flag_short_circuits() {
        let flag = std::sync::Arc::new(HaltFlag::new());
        flag.trip();
        let mut machine = CountingMachine { state: Counter::Tick, count: 0, flag };
        machine.run().await;
        assert_eq!(machine.count, 0);
    }
}
