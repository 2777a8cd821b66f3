//! Chain view: validation, connection, and the read-only queries the
//! block-ingest pipeline relies on.

pub mod genesis;
pub mod state;
pub mod validation;

pub use state::{
    accumulator_root_after, BlockError, ChainState, ChainStateError, ChainTip,
    DEFAULT_MAX_NULLIFIERS, DEFAULT_MAX_TXO_ROOTS,
};
pub use validation::{OrphanBlockError, RuleError};
