//! Candidate generation, filtering and selection for one fork cycle.

mod types;
pub mod dialectic;
pub mod directive;
pub mod filter;
pub mod gate;
pub mod pareto;
pub mod ranker;
pub mod space;

pub use types::*;
pub use directive::{DirectiveGenerator, TextDistance, TokenOverlap, GATED_FALLBACK, STOP_LIST_FALLBACK};
pub use filter::{ConstantNoveltyScorer, FingerprintFilter, HashNoveltyScorer, NoveltyScorer};
pub use ranker::{composite_score, CompositeRanker};
pub use space::{generate, space_size, ConfigSpace};
