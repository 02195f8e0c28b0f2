//! Components D, E and F: the filter contracts, the filter stacks that
//! select and run them, and the standard header filter installed by
//! default.

pub mod predicate;
pub mod stack;
pub mod standard;
pub mod traits;

pub use predicate::{MatchPredicate, MatchPredicateBuilder, PredicateError};
pub use stack::{BodyFilterStack, BodyStackState, HeaderFilterStack, HeaderStackState};
pub use standard::StandardHeaderFilter;
pub use traits::{BodyFilter, HeaderFilter, MessageHead};
