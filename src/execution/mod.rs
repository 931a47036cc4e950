pub mod orchestrator;
pub mod venue;

pub use orchestrator::{decide, AutomationFlags, DecisionInputs, EntryProposal, MoveCandidate};
pub use venue::{ExecutionVenue, FillResult, PaperVenue};
