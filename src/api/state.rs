use std::sync::Arc;

use crate::{
    config::Config,
    db::{Cache, CatalogStore, LibraryStore, PreferenceStore, ReviewStore, UserStore},
    services::{CirculationService, PreferenceAggregator, RecommendationRanker},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub reviews: Arc<dyn ReviewStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub aggregator: Arc<PreferenceAggregator>,
    pub ranker: Arc<RecommendationRanker>,
    pub circulation: Arc<CirculationService>,
}

impl AppState {
    /// Wires every service over one backing store
    pub fn new<S: LibraryStore + 'static>(store: Arc<S>, cache: Option<Cache>, config: &Config) -> Self {
        let aggregator = Arc::new(PreferenceAggregator::new(store.clone(), store.clone()));

        let mut ranker =
            RecommendationRanker::new(store.clone(), store.clone(), store.clone(), store.clone());
        if let Some(cache) = cache {
            ranker = ranker.with_cache(Arc::new(cache), config.recommendation_cache_ttl);
        }

        let circulation = CirculationService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            aggregator.clone(),
            config.loan_period(),
        );

        Self {
            users: store.clone(),
            catalog: store.clone(),
            reviews: store.clone(),
            preferences: store,
            aggregator,
            ranker: Arc::new(ranker),
            circulation: Arc::new(circulation),
        }
    }
}
