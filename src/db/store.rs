//! Store contracts the recommendation core reads and writes through
//!
//! Each trait covers one collaborator. `PgStore` and `MemoryStore` implement all
//! of them; services only hold the narrow handles they need.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::CacheKey,
    error::AppResult,
    models::{ActivitySnapshot, Book, BorrowRecord, NewReview, Review, User, UserPreference},
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, user_id: i64) -> AppResult<Option<User>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_book(&self, book_id: i64) -> AppResult<Option<Book>>;

    /// Books with any of the given ids, in no particular order; unknown ids are skipped
    async fn get_books(&self, book_ids: &[i64]) -> AppResult<Vec<Book>>;

    /// Available books in any of `genres`, skipping `excluded`, by id ascending
    async fn available_in_genres(
        &self,
        genres: &[String],
        excluded: &[i64],
        limit: i64,
    ) -> AppResult<Vec<Book>>;

    /// Available books skipping `excluded`, most recently added first
    async fn newest_available(&self, excluded: &[i64], limit: i64) -> AppResult<Vec<Book>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoanStore: Send + Sync {
    /// Distinct ids of every book the user ever borrowed, returned or not
    async fn borrowed_book_ids(&self, user_id: i64) -> AppResult<Vec<i64>>;

    async fn has_borrowed(&self, user_id: i64, book_id: i64) -> AppResult<bool>;

    /// Opens a loan and takes one copy off the shelf in a single atomic step
    ///
    /// Fails with `NotFound` for an unknown book and `Conflict` when no copy is
    /// left or the user already holds an active loan of the book.
    async fn borrow_book(
        &self,
        user_id: i64,
        book_id: i64,
        due_date: DateTime<Utc>,
    ) -> AppResult<BorrowRecord>;

    /// Closes the active loan and puts the copy back; `NotFound` without one
    async fn return_book(&self, user_id: i64, book_id: i64) -> AppResult<BorrowRecord>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Inserts a review; `Conflict` if the user already reviewed the book
    async fn create_review(
        &self,
        user_id: i64,
        book_id: i64,
        review: NewReview,
    ) -> AppResult<Review>;

    /// Reviews of one book, newest first
    async fn reviews_for_book(&self, book_id: i64) -> AppResult<Vec<Review>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Borrowed books and authored reviews read as one consistent view
    ///
    /// Returns `None` when the user does not exist.
    async fn activity_snapshot(&self, user_id: i64) -> AppResult<Option<ActivitySnapshot>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_preference(&self, user_id: i64) -> AppResult<Option<UserPreference>>;

    /// Writes the whole row unless the stored one was computed from a newer snapshot
    ///
    /// Returns whether the row was written.
    async fn upsert_preference(&self, preference: &UserPreference) -> AppResult<bool>;
}

/// Ranked recommendation ids kept between requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecommendationCache: Send + Sync {
    async fn cached_ranking(&self, key: &CacheKey) -> AppResult<Option<Vec<i64>>>;

    /// Stores `book_ids` under `key` for `ttl` seconds without waiting for the write
    fn store_ranking(&self, key: &CacheKey, book_ids: &[i64], ttl: u64);
}

/// Every collaborator contract at once, for wiring a single backend
pub trait LibraryStore:
    UserStore + CatalogStore + LoanStore + ReviewStore + ActivityStore + PreferenceStore
{
}

impl<T> LibraryStore for T where
    T: UserStore + CatalogStore + LoanStore + ReviewStore + ActivityStore + PreferenceStore
{
}
