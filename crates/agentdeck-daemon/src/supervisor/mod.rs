//! Agent process supervision: PTY spawn, output streaming, exit handling and
//! event fan-out.

mod error;
mod events;
mod manager;
mod output;
mod resolve;

pub use error::SupervisorError;
pub use events::{DEFAULT_EVENT_CAPACITY, DiagnosticKind, EventHub, OutputKind, SessionEvent};
pub use manager::{ProcessHandle, ProcessSupervisor, SpawnRequest, SupervisorConfig};
pub use output::{ERROR_KEYWORDS, Line, LineAssembler, classify, interpret, strip_ansi};
pub use resolve::{ExecutableResolver, LaunchPlan, LaunchStrategy, default_fallback_dirs};
