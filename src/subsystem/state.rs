use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle state of a subsystem.
///
/// The only edges are
/// `Idling -> Starting -> Running -> Stopping -> Idling`, plus the startup
/// abort edge `Starting -> Stopping` taken when setup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SubsystemState {
    /// Initial and terminal state; no bound thread is alive.
    Idling,
    /// Children and setup hook are being started.
    Starting,
    /// Setup completed and every child is running.
    Running,
    /// Threads have been signalled; waiting for them and for children to unwind.
    Stopping,
}

impl SubsystemState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: SubsystemState) -> bool {
        use SubsystemState::*;
        matches!(
            (self, next),
            (Idling, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Idling)
        )
    }

    /// `Stopping` and `Idling` both tell a bound thread to wind down.
    pub fn is_terminating(self) -> bool {
        matches!(self, SubsystemState::Stopping | SubsystemState::Idling)
    }
}
