//! Abortable start barrier for synchronized observe runs.
//!
//! Every virtual server waits here after registering, and the coordinator
//! joins as the last party once the controller says go. Unlike
//! `std::sync::Barrier`, waiting can end in [`BarrierOutcome::Aborted`]:
//! [`StartBarrier::abort`] wakes every waiter, and any later arrival returns
//! immediately. An aborted barrier is a request to stop and clean up.

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    Released,
    Aborted,
}

#[derive(Debug)]
struct BarrierState {
    waiting: usize,
    generation: u64,
    aborted: bool,
}

/// A cyclic counting barrier with a cooperative abort.
#[derive(Debug)]
pub struct StartBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl StartBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
                aborted: false,
            }),
            released: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of parties currently blocked in [`wait`](Self::wait).
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Block until all parties arrive or the barrier is aborted.
    pub fn wait(&self) -> BarrierOutcome {
        let mut state = self.state.lock();
        if state.aborted {
            return BarrierOutcome::Aborted;
        }

        state.waiting += 1;
        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return BarrierOutcome::Released;
        }

        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.released.wait(&mut state);
        }

        if state.generation != generation {
            BarrierOutcome::Released
        } else {
            state.waiting -= 1;
            BarrierOutcome::Aborted
        }
    }

    /// Wake all waiters with [`BarrierOutcome::Aborted`].
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.released.notify_all();
    }
}
