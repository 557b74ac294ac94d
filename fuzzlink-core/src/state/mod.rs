mod executor;
mod host;
mod session;

pub use executor::{Assignment, ExecutorSnapshot, ExecutorState, ProcSlot};
pub use host::{Attempt, Completed, ExecState, HostState, Lost, TrackedExec};
pub use session::{Session, SessionPhase};
