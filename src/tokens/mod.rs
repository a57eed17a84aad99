//! Token counting and cost estimation.

mod counter;
mod pricing;

pub use counter::{estimate_tokens, HeuristicCounter, TokenCounter};
pub use pricing::{CostBreakdown, PriceTable};
