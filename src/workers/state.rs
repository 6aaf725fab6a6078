//! Worker lifecycle states

/// Worker state machine
///
/// `Created` → `Running` ⇄ `Paused` → `Stopped`. A stopped worker never
/// leaves `Stopped`; a new worker has to be built instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Built but never started
    Created = 0,

    /// Executing cycles
    Running = 1,

    /// Alive but skipping cycle logic (can resume to Running)
    Paused = 2,

    /// Terminal
    Stopped = 3,
}

impl WorkerState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &WorkerState) -> bool {
        use WorkerState::*;

        match (self, target) {
            (Stopped, _) => false,
            (a, b) if a == b => true,
            (Created, Running) | (Created, Stopped) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Stopped) | (Paused, Stopped) => true,
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            WorkerState::Created => "Created",
            WorkerState::Running => "Running",
            WorkerState::Paused => "Paused",
            WorkerState::Stopped => "Stopped",
        }
    }

    /// Check if the worker is started and not yet stopped
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerState::Running | WorkerState::Paused)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, WorkerState::Running)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, WorkerState::Paused)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, WorkerState::Stopped)
    }

    pub(crate) fn from_u8(value: u8) -> WorkerState {
        match value {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::Paused,
            _ => WorkerState::Stopped,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
