use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::{
    db::{CatalogStore, LoanStore, ReviewStore},
    error::{AppError, AppResult},
    models::{BorrowRecord, NewReview, Review, MAX_RATING, MIN_RATING},
    services::preferences::PreferenceAggregator,
};

/// A committed user action plus whether the preference row caught up with it
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOutcome<T> {
    pub record: T,
    pub preferences_refreshed: bool,
}

/// Borrow, return and review actions, each followed by a preference recompute
pub struct CirculationService {
    catalog: Arc<dyn CatalogStore>,
    loans: Arc<dyn LoanStore>,
    reviews: Arc<dyn ReviewStore>,
    aggregator: Arc<PreferenceAggregator>,
    loan_period: Duration,
}

impl CirculationService {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        loans: Arc<dyn LoanStore>,
        reviews: Arc<dyn ReviewStore>,
        aggregator: Arc<PreferenceAggregator>,
        loan_period: Duration,
    ) -> Self {
        Self {
            catalog,
            loans,
            reviews,
            aggregator,
            loan_period,
        }
    }

    pub async fn borrow(
        &self,
        user_id: i64,
        book_id: i64,
    ) -> AppResult<ActivityOutcome<BorrowRecord>> {
        let due_date = Utc::now()
            .checked_add_signed(self.loan_period)
            .ok_or_else(|| AppError::Internal("Loan due date is out of range".to_string()))?;
        let record = self.loans.borrow_book(user_id, book_id, due_date).await?;

        tracing::info!(user_id, book_id, due_date = %record.due_date, "Book borrowed");

        Ok(self.refresh(user_id, record).await)
    }

    pub async fn return_book(
        &self,
        user_id: i64,
        book_id: i64,
    ) -> AppResult<ActivityOutcome<BorrowRecord>> {
        let record = self.loans.return_book(user_id, book_id).await?;

        tracing::info!(user_id, book_id, "Book returned");

        Ok(self.refresh(user_id, record).await)
    }

    /// Records a review; only members who borrowed the book may review it
    pub async fn submit_review(
        &self,
        user_id: i64,
        book_id: i64,
        review: NewReview,
    ) -> AppResult<ActivityOutcome<Review>> {
        if !(MIN_RATING..=MAX_RATING).contains(&review.rating) {
            return Err(AppError::InvalidInput(format!(
                "Rating must be between {} and {}",
                MIN_RATING, MAX_RATING
            )));
        }

        if self.catalog.get_book(book_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Book {} not found", book_id)));
        }

        if !self.loans.has_borrowed(user_id, book_id).await? {
            return Err(AppError::Forbidden(
                "You must borrow this book before reviewing it".to_string(),
            ));
        }

        let record = self.reviews.create_review(user_id, book_id, review).await?;

        tracing::info!(user_id, book_id, rating = record.rating, "Review submitted");

        Ok(self.refresh(user_id, record).await)
    }

    async fn refresh<T>(&self, user_id: i64, record: T) -> ActivityOutcome<T> {
        let preferences_refreshed = match self.aggregator.recompute(user_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    error = %e,
                    "Preference recompute failed, row left stale"
                );
                false
            }
        };

        ActivityOutcome {
            record,
            preferences_refreshed,
        }
    }
}
