use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use crate::{
    db::store::{
        ActivityStore, CatalogStore, LoanStore, PreferenceStore, ReviewStore, UserStore,
    },
    error::{AppError, AppResult},
    models::{
        ActivitySnapshot, Book, BorrowRecord, NewBook, NewReview, Review, User, UserPreference,
    },
};

/// In-process store backed by ordered maps behind one lock
///
/// Every mutation takes the write guard for its whole check-and-update, which
/// gives the same atomicity the Postgres store gets from transactions.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    users: BTreeMap<i64, User>,
    books: BTreeMap<i64, Book>,
    loans: Vec<BorrowRecord>,
    reviews: Vec<Review>,
    preferences: HashMap<i64, UserPreference>,
    next_id: i64,
}

impl MemoryStoreInner {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an active member
    pub async fn add_user(&self, username: &str, email: &str) -> User {
        let mut inner = self.inner.write().await;
        let user = User {
            id: inner.allocate_id(),
            email: email.to_string(),
            username: username.to_string(),
            hashed_password: String::new(),
            is_active: true,
            created_at: Utc::now(),
        };
        inner.users.insert(user.id, user.clone());
        user
    }

    pub async fn deactivate_user(&self, user_id: i64) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;
        user.is_active = false;
        Ok(())
    }

    /// Adds a catalog entry with every copy on the shelf
    pub async fn add_book(&self, new_book: NewBook) -> AppResult<Book> {
        if new_book.total_copies < 0 {
            return Err(AppError::InvalidInput(
                "total_copies must not be negative".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let book = Book {
            id: inner.allocate_id(),
            title: new_book.title,
            author: new_book.author,
            isbn: new_book.isbn,
            description: new_book.description,
            published_year: new_book.published_year,
            genre: new_book.genre,
            file_path: new_book.file_path,
            file_type: new_book.file_type,
            file_size: new_book.file_size,
            ai_summary: None,
            summary_generated_at: None,
            review_consensus: None,
            consensus_updated_at: None,
            total_copies: new_book.total_copies,
            available_copies: new_book.total_copies,
            created_at: now,
            updated_at: now,
        };
        inner.books.insert(book.id, book.clone());
        Ok(book)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, user_id: i64) -> AppResult<Option<User>> {
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_book(&self, book_id: i64) -> AppResult<Option<Book>> {
        Ok(self.inner.read().await.books.get(&book_id).cloned())
    }

    async fn get_books(&self, book_ids: &[i64]) -> AppResult<Vec<Book>> {
        let inner = self.inner.read().await;
        Ok(book_ids
            .iter()
            .filter_map(|id| inner.books.get(id).cloned())
            .collect())
    }

    async fn available_in_genres(
        &self,
        genres: &[String],
        excluded: &[i64],
        limit: i64,
    ) -> AppResult<Vec<Book>> {
        let inner = self.inner.read().await;
        let excluded: HashSet<i64> = excluded.iter().copied().collect();

        // BTreeMap iteration is already id ascending
        Ok(inner
            .books
            .values()
            .filter(|book| book.is_available() && !excluded.contains(&book.id))
            .filter(|book| {
                book.genre
                    .as_ref()
                    .is_some_and(|genre| genres.contains(genre))
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn newest_available(&self, excluded: &[i64], limit: i64) -> AppResult<Vec<Book>> {
        let inner = self.inner.read().await;
        let excluded: HashSet<i64> = excluded.iter().copied().collect();

        let mut candidates: Vec<&Book> = inner
            .books
            .values()
            .filter(|book| book.is_available() && !excluded.contains(&book.id))
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LoanStore for MemoryStore {
    async fn borrowed_book_ids(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let inner = self.inner.read().await;
        let mut seen = HashSet::new();
        Ok(inner
            .loans
            .iter()
            .filter(|loan| loan.user_id == user_id)
            .map(|loan| loan.book_id)
            .filter(|book_id| seen.insert(*book_id))
            .collect())
    }

    async fn has_borrowed(&self, user_id: i64, book_id: i64) -> AppResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .loans
            .iter()
            .any(|loan| loan.user_id == user_id && loan.book_id == book_id))
    }

    async fn borrow_book(
        &self,
        user_id: i64,
        book_id: i64,
        due_date: DateTime<Utc>,
    ) -> AppResult<BorrowRecord> {
        let mut inner = self.inner.write().await;

        if !inner.users.contains_key(&user_id) {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }

        let available = inner
            .books
            .get(&book_id)
            .map(|book| book.available_copies)
            .ok_or_else(|| AppError::NotFound(format!("Book {} not found", book_id)))?;

        if inner
            .loans
            .iter()
            .any(|loan| loan.user_id == user_id && loan.book_id == book_id && loan.is_active())
        {
            return Err(AppError::Conflict(
                "You already have this book borrowed".to_string(),
            ));
        }

        if available <= 0 {
            return Err(AppError::Conflict("No copies available".to_string()));
        }

        let now = Utc::now();
        let record = BorrowRecord {
            id: inner.allocate_id(),
            user_id,
            book_id,
            borrowed_at: now,
            due_date,
            returned_at: None,
        };
        inner.loans.push(record.clone());

        if let Some(book) = inner.books.get_mut(&book_id) {
            book.available_copies -= 1;
            book.updated_at = now;
        }

        Ok(record)
    }

    async fn return_book(&self, user_id: i64, book_id: i64) -> AppResult<BorrowRecord> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let record = inner
            .loans
            .iter_mut()
            .find(|loan| loan.user_id == user_id && loan.book_id == book_id && loan.is_active())
            .ok_or_else(|| AppError::NotFound("No active borrow record found".to_string()))?;
        record.returned_at = Some(now);
        let record = record.clone();

        if let Some(book) = inner.books.get_mut(&book_id) {
            book.available_copies = (book.available_copies + 1).min(book.total_copies);
            book.updated_at = now;
        }

        Ok(record)
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn create_review(
        &self,
        user_id: i64,
        book_id: i64,
        review: NewReview,
    ) -> AppResult<Review> {
        let mut inner = self.inner.write().await;

        if inner
            .reviews
            .iter()
            .any(|r| r.user_id == user_id && r.book_id == book_id)
        {
            return Err(AppError::Conflict(
                "You have already reviewed this book".to_string(),
            ));
        }

        let now = Utc::now();
        let review = Review {
            id: inner.allocate_id(),
            user_id,
            book_id,
            rating: review.rating,
            review_text: review.review_text,
            sentiment_score: None,
            sentiment_label: None,
            created_at: now,
            updated_at: now,
        };
        inner.reviews.push(review.clone());
        Ok(review)
    }

    async fn reviews_for_book(&self, book_id: i64) -> AppResult<Vec<Review>> {
        let inner = self.inner.read().await;
        let mut reviews: Vec<Review> = inner
            .reviews
            .iter()
            .filter(|r| r.book_id == book_id)
            .cloned()
            .collect();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(reviews)
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn activity_snapshot(&self, user_id: i64) -> AppResult<Option<ActivitySnapshot>> {
        let inner = self.inner.read().await;

        if !inner.users.contains_key(&user_id) {
            return Ok(None);
        }

        // Loans are appended in borrow order
        let borrowed_books = inner
            .loans
            .iter()
            .filter(|loan| loan.user_id == user_id)
            .filter_map(|loan| inner.books.get(&loan.book_id).cloned())
            .collect();

        let reviews = inner
            .reviews
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();

        Ok(Some(ActivitySnapshot {
            user_id,
            borrowed_books,
            reviews,
            taken_at: Utc::now(),
        }))
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn get_preference(&self, user_id: i64) -> AppResult<Option<UserPreference>> {
        Ok(self.inner.read().await.preferences.get(&user_id).cloned())
    }

    async fn upsert_preference(&self, preference: &UserPreference) -> AppResult<bool> {
        let mut inner = self.inner.write().await;

        if let Some(stored) = inner.preferences.get(&preference.user_id) {
            if stored.last_updated > preference.last_updated {
                return Ok(false);
            }
        }

        inner
            .preferences
            .insert(preference.user_id, preference.clone());
        Ok(true)
    }
}
