//! # gonet-core
//!
//! Shared vocabulary for the gonet training harness.
//!
//! ## Key Components
//!
//! - [`GoNetError`]: the single error type used across the workspace
//! - [`RunConfig`] / [`SessionConfig`]: run and device configuration
//! - [`Placeholder`]: shape contract for the three fed inputs
//! - [`RawBatch`] / [`Batch`]: raw and preprocessed training examples
//! - [`preprocess`] / [`remap_features`]: the batch preprocessor
//! - [`DataSource`] / [`ArraySource`]: shuffled fixed-size batch providers
//!
//! ## Architecture Rules
//!
//! - No model code here: variants and optimizers live in `gonet-model`.
//! - The colour-plane remap has exactly one implementation
//!   ([`remap_features`]); training, evaluation and inference all call it.

pub mod batch;
pub mod config;
pub mod data;
pub mod error;
pub mod placeholder;

pub use batch::{preprocess, remap_features, remap_outcomes, Batch, FeatureLayout, RawBatch};
pub use config::{Mode, RunConfig, SessionConfig, Variant};
pub use data::{ArraySource, DataSource};
pub use error::GoNetError;
pub use placeholder::{Placeholder, Placeholders};

/// Side length of a full Go board.
pub const BOARD_SIZE: usize = 19;

/// Number of feature planes per board position (8 own + 8 opponent history planes + colour).
pub const NUM_FEATURE_PLANES: usize = 17;

/// Index of the side-to-move plane; always the last plane.
pub const COLOR_PLANE: usize = NUM_FEATURE_PLANES - 1;

/// Number of move classes on a full board: every point plus pass.
pub const NUM_MOVES: usize = BOARD_SIZE * BOARD_SIZE + 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_board_layout() {
        assert_eq!(NUM_MOVES, 362);
        assert_eq!(COLOR_PLANE, 16);
    }
}
