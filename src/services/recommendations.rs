use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{
    db::{CacheKey, CatalogStore, LoanStore, PreferenceStore, RecommendationCache, UserStore},
    error::AppResult,
    models::{Book, UserPreference},
};

/// Default number of recommendations when the caller gives no limit
pub const DEFAULT_LIMIT: usize = 10;

/// Generates personalized book recommendations
///
/// Two tiers, stopping once `limit` books are gathered:
///
/// 1. Content-based: available books in the user's favorite genres, by id.
/// 2. Fallback: any other available book, newest first.
///
/// Books the user ever borrowed are never offered.
pub struct RecommendationRanker {
    users: Arc<dyn UserStore>,
    catalog: Arc<dyn CatalogStore>,
    loans: Arc<dyn LoanStore>,
    preferences: Arc<dyn PreferenceStore>,
    cache: Option<(Arc<dyn RecommendationCache>, u64)>,
}

impl RecommendationRanker {
    pub fn new(
        users: Arc<dyn UserStore>,
        catalog: Arc<dyn CatalogStore>,
        loans: Arc<dyn LoanStore>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self {
            users,
            catalog,
            loans,
            preferences,
            cache: None,
        }
    }

    /// Caches ranked ids for `ttl` seconds
    pub fn with_cache(mut self, cache: Arc<dyn RecommendationCache>, ttl: u64) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Up to `limit` books for `user_id`; an unknown user gets an empty list
    pub async fn recommend(&self, user_id: i64, limit: usize) -> AppResult<Vec<Book>> {
        if limit == 0 || self.users.find_user(user_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let preference = self.preferences.get_preference(user_id).await?;
        let excluded = self.loans.borrowed_book_ids(user_id).await?;

        let ranked = match &self.cache {
            Some((cache, ttl)) => {
                let key = CacheKey::Recommendations {
                    user_id,
                    limit,
                    version: preference.as_ref().map_or(0, UserPreference::version),
                };

                match self.from_cache(cache.as_ref(), &key, &excluded, limit).await? {
                    Some(books) => books,
                    None => {
                        let books = self.rank(preference.as_ref(), &excluded, limit).await?;
                        let book_ids: Vec<i64> = books.iter().map(|book| book.id).collect();
                        cache.store_ranking(&key, &book_ids, *ttl);
                        books
                    }
                }
            }
            None => self.rank(preference.as_ref(), &excluded, limit).await?,
        };

        tracing::info!(
            user_id,
            limit,
            returned = ranked.len(),
            "Recommendations generated"
        );

        Ok(ranked)
    }

    /// The cached ranking if every entry is still eligible, `None` to re-rank
    async fn from_cache(
        &self,
        cache: &dyn RecommendationCache,
        key: &CacheKey,
        excluded: &[i64],
        limit: usize,
    ) -> AppResult<Option<Vec<Book>>> {
        let book_ids = match cache.cached_ranking(key).await {
            Ok(Some(book_ids)) => book_ids,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Recommendation cache unavailable, ranking from the catalog"
                );
                return Ok(None);
            }
        };

        // A short list may predate books added since
        if book_ids.len() < limit {
            return Ok(None);
        }

        let books = self.catalog.get_books(&book_ids).await?;
        let ranked = still_eligible(&book_ids, books, excluded);
        if ranked.is_none() {
            tracing::debug!(key = %key, "Cached ranking is stale");
        }

        Ok(ranked)
    }

    async fn rank(
        &self,
        preference: Option<&UserPreference>,
        excluded: &[i64],
        limit: usize,
    ) -> AppResult<Vec<Book>> {
        let mut ranked: Vec<Book> = Vec::new();

        if let Some(preference) = preference.filter(|p| !p.favorite_genres.is_empty()) {
            ranked = self
                .catalog
                .available_in_genres(&preference.favorite_genres, excluded, store_limit(limit))
                .await?;
            ranked.truncate(limit);
        }

        let content_based = ranked.len();

        if ranked.len() < limit {
            // Tier A picks join the exclusion set so the fallback cannot repeat them
            let mut fallback_excluded = excluded.to_vec();
            fallback_excluded.extend(ranked.iter().map(|book| book.id));

            let fallback = self
                .catalog
                .newest_available(&fallback_excluded, store_limit(limit - ranked.len()))
                .await?;
            ranked.extend(fallback);
        }

        ranked.truncate(limit);

        tracing::debug!(
            content_based,
            fallback = ranked.len() - content_based,
            excluded = excluded.len(),
            "Ranked recommendation candidates"
        );

        Ok(ranked)
    }
}

fn store_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Rebuilds a cached ranking in its stored order
///
/// Yields `None` as soon as one entry is gone from the catalog, off the shelf,
/// or borrowed by the user since it was cached.
fn still_eligible(book_ids: &[i64], books: Vec<Book>, excluded: &[i64]) -> Option<Vec<Book>> {
    let excluded: HashSet<i64> = excluded.iter().copied().collect();
    let mut by_id: HashMap<i64, Book> = books.into_iter().map(|book| (book.id, book)).collect();

    book_ids
        .iter()
        .map(|id| {
            by_id
                .remove(id)
                .filter(|book| book.is_available() && !excluded.contains(&book.id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::{
        MockCatalogStore, MockLoanStore, MockPreferenceStore, MockRecommendationCache,
        MockUserStore,
    };
    use crate::models::fixtures;
    use crate::db::MemoryStore;
    use crate::error::AppError;
    use crate::models::NewBook;
    use crate::services::preferences::PreferenceAggregator;
    use chrono::{Duration, Utc};

    fn ranker_over(store: &Arc<MemoryStore>) -> RecommendationRanker {
        RecommendationRanker::new(store.clone(), store.clone(), store.clone(), store.clone())
    }

    async fn borrow_and_return(store: &MemoryStore, user_id: i64, book_id: i64) {
        let due = Utc::now() + Duration::days(14);
        store.borrow_book(user_id, book_id, due).await.unwrap();
        store.return_book(user_id, book_id).await.unwrap();
    }

    async fn add(store: &MemoryStore, title: &str, genre: Option<&str>) -> Book {
        store
            .add_book(NewBook::new(title, "Author", genre))
            .await
            .unwrap()
    }

    fn ids(books: &[Book]) -> Vec<i64> {
        books.iter().map(|b| b.id).collect()
    }

    #[tokio::test]
    async fn test_unknown_user_gets_nothing() {
        let store = Arc::new(MemoryStore::new());
        add(&store, "Anything", Some("Mystery")).await;

        let ranked = ranker_over(&store).recommend(77, 10).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_falls_back_to_newest() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("new", "new@example.com").await;
        let older = add(&store, "Older", Some("Mystery")).await;
        let newer = add(&store, "Newer", None).await;

        let ranked = ranker_over(&store).recommend(user.id, 10).await.unwrap();
        assert_eq!(ids(&ranked), vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn test_mystery_reader_gets_mystery_first() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("sleuth", "sleuth@example.com").await;

        let mut read = Vec::new();
        for i in 0..3 {
            read.push(add(&store, &format!("Read mystery {}", i), Some("Mystery")).await);
        }
        read.push(add(&store, "Read romance", Some("Romance")).await);
        let unread_a = add(&store, "Unread mystery A", Some("Mystery")).await;
        let unread_b = add(&store, "Unread mystery B", Some("Mystery")).await;
        add(&store, "Unread thriller", Some("Thriller")).await;

        for book in &read {
            borrow_and_return(&store, user.id, book.id).await;
        }
        PreferenceAggregator::new(store.clone(), store.clone())
            .recompute(user.id)
            .await
            .unwrap();

        let ranked = ranker_over(&store).recommend(user.id, 2).await.unwrap();
        assert_eq!(ids(&ranked), vec![unread_a.id, unread_b.id]);
        assert!(ranked
            .iter()
            .all(|b| b.genre.as_deref() == Some("Mystery")));
    }

    #[tokio::test]
    async fn test_exhausted_genres_fall_through_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;

        let mystery = add(&store, "Only mystery", Some("Mystery")).await;
        let first_other = add(&store, "Cookbook", Some("Cooking")).await;
        let second_other = add(&store, "Atlas", None).await;

        borrow_and_return(&store, user.id, mystery.id).await;
        PreferenceAggregator::new(store.clone(), store.clone())
            .recompute(user.id)
            .await
            .unwrap();

        let ranked = ranker_over(&store).recommend(user.id, 10).await.unwrap();
        assert_eq!(ids(&ranked), vec![second_other.id, first_other.id]);
    }

    #[tokio::test]
    async fn test_fallback_fills_to_available_catalog_size() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;

        let borrowed = add(&store, "Borrowed", Some("Mystery")).await;
        let _in_genre = add(&store, "Also mystery", Some("Mystery")).await;
        for i in 0..4 {
            add(&store, &format!("Other {}", i), Some("History")).await;
        }
        store
            .add_book(NewBook::new("Checked out", "A", Some("Mystery")).with_copies(0))
            .await
            .unwrap();

        borrow_and_return(&store, user.id, borrowed.id).await;
        PreferenceAggregator::new(store.clone(), store.clone())
            .recompute(user.id)
            .await
            .unwrap();

        let ranker = ranker_over(&store);
        // Five eligible books: one in genre, four fallback
        assert_eq!(ranker.recommend(user.id, 3).await.unwrap().len(), 3);
        assert_eq!(ranker.recommend(user.id, 5).await.unwrap().len(), 5);
        assert_eq!(ranker.recommend(user.id, 50).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_never_recommends_borrowed_or_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;

        let mut catalog = Vec::new();
        for i in 0..8 {
            let genre = if i % 2 == 0 { "Mystery" } else { "Poetry" };
            catalog.push(add(&store, &format!("Book {}", i), Some(genre)).await);
        }

        // Active and returned loans both count as borrowed
        let due = Utc::now() + Duration::days(14);
        store.borrow_book(user.id, catalog[0].id, due).await.unwrap();
        borrow_and_return(&store, user.id, catalog[3].id).await;
        PreferenceAggregator::new(store.clone(), store.clone())
            .recompute(user.id)
            .await
            .unwrap();

        let ranked = ranker_over(&store).recommend(user.id, 8).await.unwrap();
        let ranked_ids = ids(&ranked);

        assert!(!ranked_ids.contains(&catalog[0].id));
        assert!(!ranked_ids.contains(&catalog[3].id));
        let unique: HashSet<i64> = ranked_ids.iter().copied().collect();
        assert_eq!(unique.len(), ranked_ids.len());
        assert_eq!(ranked_ids.len(), 6);
    }

    #[tokio::test]
    async fn test_zero_limit_returns_nothing() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;
        add(&store, "Anything", None).await;

        assert!(ranker_over(&store).recommend(user.id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_excludes_tier_a_picks() {
        let mut users = MockUserStore::new();
        users
            .expect_find_user()
            .returning(|id| Ok(Some(test_user(id))));

        let mut preferences = MockPreferenceStore::new();
        preferences.expect_get_preference().returning(|id| {
            let mut preference = UserPreference::empty(id, Utc::now());
            preference.favorite_genres = vec!["Mystery".to_string()];
            Ok(Some(preference))
        });

        let mut loans = MockLoanStore::new();
        loans.expect_borrowed_book_ids().returning(|_| Ok(vec![1]));

        let mut catalog = MockCatalogStore::new();
        catalog
            .expect_available_in_genres()
            .withf(|genres, excluded, limit| {
                genres.to_vec() == vec!["Mystery".to_string()]
                    && excluded.to_vec() == vec![1]
                    && *limit == 3
            })
            .returning(|_, _, _| {
                Ok(vec![
                    fixtures::book(5, "A", Some("Mystery")),
                ])
            });
        catalog
            .expect_newest_available()
            .withf(|excluded, limit| excluded.to_vec() == vec![1, 5] && *limit == 2)
            .times(1)
            .returning(|_, _| {
                Ok(vec![
                    fixtures::book(9, "B", None),
                    fixtures::book(8, "C", None),
                ])
            });

        let ranker = RecommendationRanker::new(
            Arc::new(users),
            Arc::new(catalog),
            Arc::new(loans),
            Arc::new(preferences),
        );

        let ranked = ranker.recommend(1, 3).await.unwrap();
        assert_eq!(ids(&ranked), vec![5, 9, 8]);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut users = MockUserStore::new();
        users
            .expect_find_user()
            .returning(|id| Ok(Some(test_user(id))));
        let mut preferences = MockPreferenceStore::new();
        preferences
            .expect_get_preference()
            .returning(|_| Err(AppError::Database(sqlx::Error::PoolTimedOut)));

        let ranker = RecommendationRanker::new(
            Arc::new(users),
            Arc::new(MockCatalogStore::new()),
            Arc::new(MockLoanStore::new()),
            Arc::new(preferences),
        );

        let err = ranker.recommend(1, 10).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unbounded_limit_returns_whole_eligible_catalog() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;
        let read = add(&store, "Read", Some("Mystery")).await;
        for i in 0..4 {
            let genre = if i % 2 == 0 { Some("Mystery") } else { None };
            add(&store, &format!("Book {}", i), genre).await;
        }
        borrow_and_return(&store, user.id, read.id).await;
        PreferenceAggregator::new(store.clone(), store.clone())
            .recompute(user.id)
            .await
            .unwrap();

        let ranked = ranker_over(&store).recommend(user.id, usize::MAX).await.unwrap();
        assert_eq!(ranked.len(), 4);
        assert!(!ids(&ranked).contains(&read.id));
    }

    #[test]
    fn test_store_limit_saturates() {
        assert_eq!(store_limit(10), 10);
        assert_eq!(store_limit(usize::MAX), i64::MAX);
    }

    #[test]
    fn test_still_eligible_keeps_cached_order() {
        let books = vec![
            fixtures::book(1, "A", None),
            fixtures::book(2, "B", None),
            fixtures::book(3, "C", None),
        ];

        let ranked = still_eligible(&[3, 1, 2], books, &[]).unwrap();
        assert_eq!(ids(&ranked), vec![3, 1, 2]);
    }

    #[test]
    fn test_still_eligible_rejects_stale_entries() {
        let mut checked_out = fixtures::book(2, "B", None);
        checked_out.available_copies = 0;

        let shelf = vec![fixtures::book(1, "A", None), checked_out];
        assert!(still_eligible(&[1, 2], shelf, &[]).is_none());

        let shelf = vec![fixtures::book(1, "A", None), fixtures::book(2, "B", None)];
        assert!(still_eligible(&[1, 2], shelf, &[2]).is_none());

        let shelf = vec![fixtures::book(1, "A", None)];
        assert!(still_eligible(&[1, 2], shelf, &[]).is_none());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_ranking() {
        let mut users = MockUserStore::new();
        users
            .expect_find_user()
            .returning(|id| Ok(Some(test_user(id))));
        let mut preferences = MockPreferenceStore::new();
        preferences.expect_get_preference().returning(|_| Ok(None));
        let mut loans = MockLoanStore::new();
        loans.expect_borrowed_book_ids().returning(|_| Ok(vec![]));

        let mut catalog = MockCatalogStore::new();
        catalog
            .expect_get_books()
            .returning(|_| Ok(vec![fixtures::book(2, "B", None), fixtures::book(3, "C", None)]));
        catalog.expect_available_in_genres().never();
        catalog.expect_newest_available().never();

        let mut cache = MockRecommendationCache::new();
        cache
            .expect_cached_ranking()
            .withf(|key| key.to_string() == "recs:1:2:0")
            .returning(|_| Ok(Some(vec![3, 2])));
        cache.expect_store_ranking().never();

        let ranker = RecommendationRanker::new(
            Arc::new(users),
            Arc::new(catalog),
            Arc::new(loans),
            Arc::new(preferences),
        )
        .with_cache(Arc::new(cache), 300);

        let ranked = ranker.recommend(1, 2).await.unwrap();
        assert_eq!(ids(&ranked), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_reranked_and_replaced() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;
        let other = store.add_user("other", "other@example.com").await;
        let oldest = add(&store, "Oldest", None).await;
        let middle = add(&store, "Middle", None).await;
        let newest = add(&store, "Newest", None).await;

        // Ranked while every book was on the shelf, then the newest went out
        let cached_ids = vec![newest.id, middle.id];
        let due = Utc::now() + Duration::days(14);
        store.borrow_book(other.id, newest.id, due).await.unwrap();

        let expected = vec![middle.id, oldest.id];
        let stored = expected.clone();
        let mut cache = MockRecommendationCache::new();
        cache
            .expect_cached_ranking()
            .returning(move |_| Ok(Some(cached_ids.clone())));
        cache
            .expect_store_ranking()
            .withf(move |_, book_ids, ttl| book_ids.to_vec() == stored && *ttl == 60)
            .times(1)
            .return_const(());

        let ranker = ranker_over(&store).with_cache(Arc::new(cache), 60);
        let ranked = ranker.recommend(user.id, 2).await.unwrap();

        assert_eq!(ids(&ranked), expected);
        assert!(ranked.iter().all(Book::is_available));
    }

    #[tokio::test]
    async fn test_short_cached_list_is_reranked() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;
        let first = add(&store, "First", None).await;
        let second = add(&store, "Second", None).await;

        let cached_ids = vec![first.id];
        let mut cache = MockRecommendationCache::new();
        cache
            .expect_cached_ranking()
            .returning(move |_| Ok(Some(cached_ids.clone())));
        cache.expect_store_ranking().times(1).return_const(());

        let ranker = ranker_over(&store).with_cache(Arc::new(cache), 60);
        let ranked = ranker.recommend(user.id, 5).await.unwrap();

        assert_eq!(ids(&ranked), vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back_to_catalog() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("reader", "reader@example.com").await;
        let book = add(&store, "Still here", None).await;

        let mut cache = MockRecommendationCache::new();
        cache.expect_cached_ranking().returning(|_| {
            Err(AppError::Cache(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        });
        cache.expect_store_ranking().times(1).return_const(());

        let ranker = ranker_over(&store).with_cache(Arc::new(cache), 60);
        let ranked = ranker.recommend(user.id, 10).await.unwrap();

        assert_eq!(ids(&ranked), vec![book.id]);
    }

    fn test_user(id: i64) -> crate::models::User {
        crate::models::User {
            id,
            email: format!("user{}@example.com", id),
            username: format!("user{}", id),
            hashed_password: String::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}
