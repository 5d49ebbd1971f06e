//! A process-wide cycle counter, with an interactive gate for `--step`
//! mode: when stepping is enabled, the simulator pauses after every cycle
//! until the user presses Enter, or quits on `q`.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks elapsed simulated cycles and, in stepping mode, gates progress on
/// user input.
pub struct Clock {
    cycles: AtomicU64,
    stepping: bool,
}

/// What the user asked for after a stepping pause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepAction {
    /// Advance one cycle.
    Continue,
    /// Stop the simulation early.
    Quit,
}

impl Clock {
    /// Create a clock. `stepping` enables the interactive Enter/`q` gate.
    pub fn new(stepping: bool) -> Clock {
        Clock {
            cycles: AtomicU64::new(0),
            stepping,
        }
    }

    /// Total cycles advanced so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Advance the clock by one cycle, blocking for user input first if
    /// stepping mode is enabled.
    pub fn tick(&self) -> StepAction {
        let action = if self.stepping {
            Clock::prompt()
        } else {
            StepAction::Continue
        };
        if action == StepAction::Continue {
            self.cycles.fetch_add(1, Ordering::Relaxed);
        }
        action
    }

    fn prompt() -> StepAction {
        print!("-- press Enter to step, 'q' to quit -- ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return StepAction::Quit;
        }
        if line.trim().eq_ignore_ascii_case("q") {
            StepAction::Quit
        } else {
            StepAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_stepping_clock_always_continues_and_counts() {
        let clock = Clock::new(false);
        assert_eq!(clock.tick(), StepAction::Continue);
        assert_eq!(clock.tick(), StepAction::Continue);
        assert_eq!(clock.cycles(), 2);
    }
}
