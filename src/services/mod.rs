pub mod circulation;
pub mod preferences;
pub mod recommendations;

pub use circulation::{ActivityOutcome, CirculationService};
pub use preferences::{build_preference, PreferenceAggregator};
pub use recommendations::RecommendationRanker;
