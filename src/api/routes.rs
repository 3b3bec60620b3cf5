use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;
use crate::middleware::{
    make_span_with_request_id, propagate_request_id_layer, set_request_id_layer,
};

/// Creates the application router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(set_request_id_layer())
                .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
                .layer(propagate_request_id_layer()),
        )
        .with_state(state)
}

/// API routes under /api/v1
fn api_routes() -> Router<AppState> {
    Router::new()
        // Recommendations
        .route("/recommendations", get(handlers::get_recommendations))
        // User preferences
        .route("/preferences", get(handlers::get_preferences))
        .route("/preferences/refresh", post(handlers::refresh_preferences))
        // Books and circulation
        .route("/books/:book_id", get(handlers::get_book))
        .route("/books/:book_id/borrow", post(handlers::borrow_book))
        .route("/books/:book_id/return", post(handlers::return_book))
        .route(
            "/books/:book_id/reviews",
            get(handlers::list_reviews).post(handlers::create_review),
        )
        .route("/books/:book_id/reviews/analysis", get(handlers::review_analysis))
}
