use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    models::{Book, BookSummary, NewReview, Review, ReviewAnalysis, UserPreference},
    services::recommendations::DEFAULT_LIMIT,
};

use super::{AppState, CurrentUser};

// Request/Response types

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct BorrowResponse {
    pub message: String,
    pub due_date: DateTime<Utc>,
    pub preferences_refreshed: bool,
}

#[derive(Debug, Serialize)]
pub struct ReturnResponse {
    pub message: String,
    pub returned_at: Option<DateTime<Utc>>,
    pub preferences_refreshed: bool,
}

#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    pub review: Review,
    pub preferences_refreshed: bool,
}

// Handlers

pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

pub async fn get_recommendations(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<RecommendationQuery>,
) -> AppResult<Json<Vec<BookSummary>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if limit < 1 {
        return Err(AppError::InvalidInput(
            "limit must be at least 1".to_string(),
        ));
    }

    let books = state.ranker.recommend(user.id, limit).await?;
    Ok(Json(books.into_iter().map(BookSummary::from).collect()))
}

pub async fn get_preferences(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<UserPreference>> {
    state
        .preferences
        .get_preference(user.id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No preferences recorded yet".to_string()))
}

pub async fn refresh_preferences(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<UserPreference>> {
    state.aggregator.recompute(user.id).await?;

    state
        .preferences
        .get_preference(user.id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::Internal("Preference row missing after recompute".to_string()))
}

pub async fn get_book(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(book_id): Path<i64>,
) -> AppResult<Json<Book>> {
    find_book(&state, book_id).await.map(Json)
}

pub async fn borrow_book(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(book_id): Path<i64>,
) -> AppResult<(StatusCode, Json<BorrowResponse>)> {
    let outcome = state.circulation.borrow(user.id, book_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(BorrowResponse {
            message: "Book borrowed successfully".to_string(),
            due_date: outcome.record.due_date,
            preferences_refreshed: outcome.preferences_refreshed,
        }),
    ))
}

pub async fn return_book(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(book_id): Path<i64>,
) -> AppResult<Json<ReturnResponse>> {
    let outcome = state.circulation.return_book(user.id, book_id).await?;

    Ok(Json(ReturnResponse {
        message: "Book returned successfully".to_string(),
        returned_at: outcome.record.returned_at,
        preferences_refreshed: outcome.preferences_refreshed,
    }))
}

pub async fn create_review(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(book_id): Path<i64>,
    Json(review): Json<NewReview>,
) -> AppResult<(StatusCode, Json<ReviewResponse>)> {
    let outcome = state
        .circulation
        .submit_review(user.id, book_id, review)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ReviewResponse {
            review: outcome.record,
            preferences_refreshed: outcome.preferences_refreshed,
        }),
    ))
}

pub async fn list_reviews(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(book_id): Path<i64>,
) -> AppResult<Json<Vec<Review>>> {
    find_book(&state, book_id).await?;
    let reviews = state.reviews.reviews_for_book(book_id).await?;
    Ok(Json(reviews))
}

pub async fn review_analysis(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(book_id): Path<i64>,
) -> AppResult<Json<ReviewAnalysis>> {
    let book = find_book(&state, book_id).await?;
    let reviews = state.reviews.reviews_for_book(book_id).await?;
    Ok(Json(ReviewAnalysis::from_reviews(&book, &reviews)))
}

async fn find_book(state: &AppState, book_id: i64) -> AppResult<Book> {
    state
        .catalog
        .get_book(book_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Book {} not found", book_id)))
}
