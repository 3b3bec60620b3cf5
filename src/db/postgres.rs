use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use std::collections::BTreeMap;

use crate::{
    db::store::{
        ActivityStore, CatalogStore, LoanStore, PreferenceStore, ReviewStore, UserStore,
    },
    error::{AppError, AppResult},
    models::{
        ActivitySnapshot, Book, BorrowRecord, NewReview, Review, SentimentLabel, User,
        UserPreference,
    },
};

/// Creates a PostgreSQL connection pool
///
/// Establishes a pool of database connections for efficient reuse.
/// The pool automatically manages connection lifecycle and limits.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Applies the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const BOOK_COLUMNS: &str = "b.id, b.title, b.author, b.isbn, b.description, b.published_year, \
     b.genre, b.file_path, b.file_type, b.file_size, b.ai_summary, b.summary_generated_at, \
     b.review_consensus, b.consensus_updated_at, b.total_copies, b.available_copies, \
     b.created_at, b.updated_at";

const LOAN_COLUMNS: &str = "id, user_id, book_id, borrowed_at, due_date, returned_at";

const REVIEW_COLUMNS: &str = "id, user_id, book_id, rating, review_text, sentiment_score, \
     sentiment_label, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct ReviewRow {
    id: i64,
    user_id: i64,
    book_id: i64,
    rating: i32,
    review_text: Option<String>,
    sentiment_score: Option<f64>,
    sentiment_label: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReviewRow> for Review {
    type Error = AppError;

    fn try_from(row: ReviewRow) -> Result<Self, Self::Error> {
        let sentiment_label = row
            .sentiment_label
            .as_deref()
            .map(str::parse::<SentimentLabel>)
            .transpose()
            .map_err(AppError::Internal)?;

        Ok(Review {
            id: row.id,
            user_id: row.user_id,
            book_id: row.book_id,
            rating: row.rating,
            review_text: row.review_text,
            sentiment_score: row.sentiment_score,
            sentiment_label,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PreferenceRow {
    user_id: i64,
    favorite_genres: Vec<String>,
    favorite_authors: Vec<String>,
    avg_rating_given: f64,
    books_borrowed_count: i64,
    books_reviewed_count: i64,
    genre_weights: Json<BTreeMap<String, f64>>,
    last_updated: DateTime<Utc>,
}

impl From<PreferenceRow> for UserPreference {
    fn from(row: PreferenceRow) -> Self {
        UserPreference {
            user_id: row.user_id,
            favorite_genres: row.favorite_genres,
            favorite_authors: row.favorite_authors,
            avg_rating_given: row.avg_rating_given,
            books_borrowed_count: row.books_borrowed_count,
            books_reviewed_count: row.books_reviewed_count,
            genre_weights: row.genre_weights.0,
            last_updated: row.last_updated,
        }
    }
}

/// Maps a unique-constraint violation to a `Conflict`, anything else to `Database`
fn conflict_on_unique(message: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| {
        if let sqlx::Error::Database(db_error) = &e {
            if db_error.is_unique_violation() {
                return AppError::Conflict(message.to_string());
            }
        }
        AppError::Database(e)
    }
}

/// Postgres-backed implementation of every store contract
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user(&self, user_id: i64) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, hashed_password, is_active, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn get_book(&self, book_id: i64) -> AppResult<Option<Book>> {
        let sql = format!("SELECT {} FROM books b WHERE b.id = $1", BOOK_COLUMNS);
        let book = sqlx::query_as::<_, Book>(&sql)
            .bind(book_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(book)
    }

    async fn get_books(&self, book_ids: &[i64]) -> AppResult<Vec<Book>> {
        let sql = format!("SELECT {} FROM books b WHERE b.id = ANY($1)", BOOK_COLUMNS);
        let books = sqlx::query_as::<_, Book>(&sql)
            .bind(book_ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(books)
    }

    async fn available_in_genres(
        &self,
        genres: &[String],
        excluded: &[i64],
        limit: i64,
    ) -> AppResult<Vec<Book>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM books b
            WHERE b.genre = ANY($1)
              AND NOT (b.id = ANY($2))
              AND b.available_copies > 0
            ORDER BY b.id ASC
            LIMIT $3
            "#,
            BOOK_COLUMNS
        );

        let books = sqlx::query_as::<_, Book>(&sql)
            .bind(genres)
            .bind(excluded)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(books)
    }

    async fn newest_available(&self, excluded: &[i64], limit: i64) -> AppResult<Vec<Book>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM books b
            WHERE NOT (b.id = ANY($1))
              AND b.available_copies > 0
            ORDER BY b.created_at DESC, b.id DESC
            LIMIT $2
            "#,
            BOOK_COLUMNS
        );

        let books = sqlx::query_as::<_, Book>(&sql)
            .bind(excluded)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(books)
    }
}

#[async_trait]
impl LoanStore for PgStore {
    async fn borrowed_book_ids(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT book_id
            FROM borrow_records
            WHERE user_id = $1
            ORDER BY book_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn has_borrowed(&self, user_id: i64, book_id: i64) -> AppResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM borrow_records WHERE user_id = $1 AND book_id = $2)",
        )
        .bind(user_id)
        .bind(book_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn borrow_book(
        &self,
        user_id: i64,
        book_id: i64,
        due_date: DateTime<Utc>,
    ) -> AppResult<BorrowRecord> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent borrows of the same book
        let available = sqlx::query_scalar::<_, i32>(
            "SELECT available_copies FROM books WHERE id = $1 FOR UPDATE",
        )
        .bind(book_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Book {} not found", book_id)))?;

        let already_active = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM borrow_records
                WHERE user_id = $1 AND book_id = $2 AND returned_at IS NULL
            )
            "#,
        )
        .bind(user_id)
        .bind(book_id)
        .fetch_one(&mut *tx)
        .await?;

        if already_active {
            return Err(AppError::Conflict(
                "You already have this book borrowed".to_string(),
            ));
        }

        if available <= 0 {
            return Err(AppError::Conflict("No copies available".to_string()));
        }

        let sql = format!(
            "INSERT INTO borrow_records (user_id, book_id, due_date) VALUES ($1, $2, $3) RETURNING {}",
            LOAN_COLUMNS
        );
        let record = sqlx::query_as::<_, BorrowRecord>(&sql)
            .bind(user_id)
            .bind(book_id)
            .bind(due_date)
            .fetch_one(&mut *tx)
            .await
            .map_err(conflict_on_unique("You already have this book borrowed"))?;

        let updated = sqlx::query(
            r#"
            UPDATE books
            SET available_copies = available_copies - 1, updated_at = now()
            WHERE id = $1 AND available_copies > 0
            "#,
        )
        .bind(book_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict("No copies available".to_string()));
        }

        tx.commit().await?;

        Ok(record)
    }

    async fn return_book(&self, user_id: i64, book_id: i64) -> AppResult<BorrowRecord> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE borrow_records
            SET returned_at = now()
            WHERE user_id = $1 AND book_id = $2 AND returned_at IS NULL
            RETURNING {}
            "#,
            LOAN_COLUMNS
        );
        let record = sqlx::query_as::<_, BorrowRecord>(&sql)
            .bind(user_id)
            .bind(book_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("No active borrow record found".to_string()))?;

        sqlx::query(
            r#"
            UPDATE books
            SET available_copies = LEAST(available_copies + 1, total_copies), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(book_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(record)
    }
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn create_review(
        &self,
        user_id: i64,
        book_id: i64,
        review: NewReview,
    ) -> AppResult<Review> {
        let sql = format!(
            r#"
            INSERT INTO reviews (user_id, book_id, rating, review_text)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            REVIEW_COLUMNS
        );

        let row = sqlx::query_as::<_, ReviewRow>(&sql)
            .bind(user_id)
            .bind(book_id)
            .bind(review.rating)
            .bind(review.review_text)
            .fetch_one(&self.pool)
            .await
            .map_err(conflict_on_unique("You have already reviewed this book"))?;

        row.try_into()
    }

    async fn reviews_for_book(&self, book_id: i64) -> AppResult<Vec<Review>> {
        let sql = format!(
            "SELECT {} FROM reviews WHERE book_id = $1 ORDER BY created_at DESC, id DESC",
            REVIEW_COLUMNS
        );

        sqlx::query_as::<_, ReviewRow>(&sql)
            .bind(book_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Review::try_from)
            .collect()
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn activity_snapshot(&self, user_id: i64) -> AppResult<Option<ActivitySnapshot>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        // now() would report the transaction start, which precedes the snapshot
        let taken_at = sqlx::query_scalar::<_, DateTime<Utc>>("SELECT clock_timestamp()")
            .fetch_one(&mut *tx)
            .await?;

        let user_exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        if !user_exists {
            tx.commit().await?;
            return Ok(None);
        }

        let sql = format!(
            r#"
            SELECT {}
            FROM borrow_records r
            JOIN books b ON b.id = r.book_id
            WHERE r.user_id = $1
            ORDER BY r.borrowed_at ASC, r.id ASC
            "#,
            BOOK_COLUMNS
        );
        let borrowed_books = sqlx::query_as::<_, Book>(&sql)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT {} FROM reviews WHERE user_id = $1 ORDER BY created_at ASC, id ASC",
            REVIEW_COLUMNS
        );
        let reviews = sqlx::query_as::<_, ReviewRow>(&sql)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(Review::try_from)
            .collect::<AppResult<Vec<_>>>()?;

        tx.commit().await?;

        Ok(Some(ActivitySnapshot {
            user_id,
            borrowed_books,
            reviews,
            taken_at,
        }))
    }
}

#[async_trait]
impl PreferenceStore for PgStore {
    async fn get_preference(&self, user_id: i64) -> AppResult<Option<UserPreference>> {
        let row = sqlx::query_as::<_, PreferenceRow>(
            r#"
            SELECT user_id, favorite_genres, favorite_authors, avg_rating_given,
                   books_borrowed_count, books_reviewed_count, genre_weights, last_updated
            FROM user_preferences
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserPreference::from))
    }

    async fn upsert_preference(&self, preference: &UserPreference) -> AppResult<bool> {
        // The WHERE clause keeps a row built from a newer snapshot
        let result = sqlx::query(
            r#"
            INSERT INTO user_preferences (
                user_id, favorite_genres, favorite_authors, avg_rating_given,
                books_borrowed_count, books_reviewed_count, genre_weights, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id) DO UPDATE SET
                favorite_genres = EXCLUDED.favorite_genres,
                favorite_authors = EXCLUDED.favorite_authors,
                avg_rating_given = EXCLUDED.avg_rating_given,
                books_borrowed_count = EXCLUDED.books_borrowed_count,
                books_reviewed_count = EXCLUDED.books_reviewed_count,
                genre_weights = EXCLUDED.genre_weights,
                last_updated = EXCLUDED.last_updated
            WHERE user_preferences.last_updated <= EXCLUDED.last_updated
            "#,
        )
        .bind(preference.user_id)
        .bind(preference.favorite_genres.as_slice())
        .bind(preference.favorite_authors.as_slice())
        .bind(preference.avg_rating_given)
        .bind(preference.books_borrowed_count)
        .bind(preference.books_reviewed_count)
        .bind(Json(&preference.genre_weights))
        .bind(preference.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
