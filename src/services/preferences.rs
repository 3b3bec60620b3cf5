use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::{
    db::{ActivityStore, PreferenceStore},
    error::{AppError, AppResult},
    models::{ActivitySnapshot, UserPreference, MAX_FAVORITES},
};

/// Rebuilds a user's preference row from their complete activity history
pub struct PreferenceAggregator {
    activity: Arc<dyn ActivityStore>,
    preferences: Arc<dyn PreferenceStore>,
}

impl PreferenceAggregator {
    pub fn new(activity: Arc<dyn ActivityStore>, preferences: Arc<dyn PreferenceStore>) -> Self {
        Self {
            activity,
            preferences,
        }
    }

    /// Recomputes and stores the preference row for `user_id`
    ///
    /// Fails with `NotFound` for an unknown user. A user without activity gets
    /// an empty profile. Store failures propagate unchanged.
    pub async fn recompute(&self, user_id: i64) -> AppResult<()> {
        let snapshot = self
            .activity
            .activity_snapshot(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        let preference = build_preference(&snapshot);
        let written = self.preferences.upsert_preference(&preference).await?;

        if written {
            tracing::info!(
                user_id,
                borrowed = preference.books_borrowed_count,
                reviewed = preference.books_reviewed_count,
                favorite_genres = ?preference.favorite_genres,
                "User preferences recomputed"
            );
        } else {
            tracing::debug!(
                user_id,
                "Skipped preference write, a newer snapshot is already stored"
            );
        }

        Ok(())
    }
}

/// Derives a full preference profile from one activity snapshot
pub fn build_preference(snapshot: &ActivitySnapshot) -> UserPreference {
    let genres: Vec<&str> = snapshot
        .borrowed_books
        .iter()
        .filter_map(|book| book.genre.as_deref())
        .collect();
    let authors = snapshot.borrowed_books.iter().map(|book| book.author.as_str());

    let genre_counts = tally(genres.iter().copied());
    let author_counts = tally(authors);

    let avg_rating_given = if snapshot.reviews.is_empty() {
        0.0
    } else {
        let total: i64 = snapshot.reviews.iter().map(|r| r.rating as i64).sum();
        total as f64 / snapshot.reviews.len() as f64
    };

    let tagged = genres.len();
    let genre_weights: BTreeMap<String, f64> = if tagged == 0 {
        BTreeMap::new()
    } else {
        genre_counts
            .iter()
            .map(|(genre, count)| (genre.to_string(), *count as f64 / tagged as f64))
            .collect()
    };

    UserPreference {
        user_id: snapshot.user_id,
        favorite_genres: top_k(&genre_counts, MAX_FAVORITES),
        favorite_authors: top_k(&author_counts, MAX_FAVORITES),
        avg_rating_given,
        books_borrowed_count: snapshot.borrowed_books.len() as i64,
        books_reviewed_count: snapshot.reviews.len() as i64,
        genre_weights,
        last_updated: snapshot.taken_at,
    }
}

/// Occurrence counts in first-encountered order
fn tally<'a>(values: impl Iterator<Item = &'a str>) -> Vec<(&'a str, usize)> {
    let mut positions: HashMap<&'a str, usize> = HashMap::new();
    let mut counts: Vec<(&'a str, usize)> = Vec::new();

    for value in values {
        match positions.get(value) {
            Some(&index) => counts[index].1 += 1,
            None => {
                positions.insert(value, counts.len());
                counts.push((value, 1));
            }
        }
    }

    counts
}

/// The `k` most frequent values; equal counts keep first-encountered order
fn top_k(counts: &[(&str, usize)], k: usize) -> Vec<String> {
    let mut ranked = counts.to_vec();
    // Stable sort, so ties stay in encounter order
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .into_iter()
        .take(k)
        .map(|(value, _)| value.to_string())
        .collect()
}
