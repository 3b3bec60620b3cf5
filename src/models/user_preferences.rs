use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Book, Review};

/// Cap on the favorite genre and favorite author lists
pub const MAX_FAVORITES: usize = 5;

/// A user's taste profile, derived entirely from borrow and review history
///
/// The row is a cache: it is always rebuilt from scratch and can be dropped at
/// any time without losing information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPreference {
    pub user_id: i64,
    /// Most borrowed genres, most frequent first
    pub favorite_genres: Vec<String>,
    /// Most borrowed authors, most frequent first
    pub favorite_authors: Vec<String>,
    /// Mean rating across the user's reviews, 0.0 without reviews
    pub avg_rating_given: f64,
    /// Lifetime borrow records, returned or not
    pub books_borrowed_count: i64,
    pub books_reviewed_count: i64,
    /// Share of genre-tagged borrows per genre
    pub genre_weights: BTreeMap<String, f64>,
    pub last_updated: DateTime<Utc>,
}

impl UserPreference {
    /// Profile of a user with no recorded activity
    pub fn empty(user_id: i64, last_updated: DateTime<Utc>) -> Self {
        Self {
            user_id,
            favorite_genres: Vec::new(),
            favorite_authors: Vec::new(),
            avg_rating_given: 0.0,
            books_borrowed_count: 0,
            books_reviewed_count: 0,
            genre_weights: BTreeMap::new(),
            last_updated,
        }
    }

    /// Version stamp used to key cached recommendations
    pub fn version(&self) -> i64 {
        self.last_updated.timestamp_millis()
    }

    /// Same derived content, ignoring when it was computed
    pub fn same_profile(&self, other: &UserPreference) -> bool {
        self.user_id == other.user_id
            && self.favorite_genres == other.favorite_genres
            && self.favorite_authors == other.favorite_authors
            && self.avg_rating_given == other.avg_rating_given
            && self.books_borrowed_count == other.books_borrowed_count
            && self.books_reviewed_count == other.books_reviewed_count
            && self.genre_weights == other.genre_weights
    }
}

/// One consistent read of everything a preference recompute needs
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySnapshot {
    pub user_id: i64,
    /// One entry per borrow record, in borrow order
    pub borrowed_books: Vec<Book>,
    pub reviews: Vec<Review>,
    pub taken_at: DateTime<Utc>,
}

impl ActivitySnapshot {
    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            borrowed_books: Vec::new(),
            reviews: Vec::new(),
            taken_at: Utc::now(),
        }
    }
}
