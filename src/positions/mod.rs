pub mod capital;
pub mod manager;

pub use capital::{CapitalCheck, CapitalManager};
pub use manager::{LegFill, MoveOutcome, NewLeg, PositionManager, QuoteReport};
