use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr};

mod user_preferences;

pub use user_preferences::{ActivitySnapshot, UserPreference, MAX_FAVORITES};

/// A library member
#[derive(Debug, Clone, Serialize, PartialEq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A catalog entry together with its stored content reference and copy counts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub description: Option<String>,
    pub published_year: Option<i32>,
    pub genre: Option<String>,
    pub file_path: String,
    pub file_type: String,
    pub file_size: i64,
    pub ai_summary: Option<String>,
    pub summary_generated_at: Option<DateTime<Utc>>,
    pub review_consensus: Option<String>,
    pub consensus_updated_at: Option<DateTime<Utc>>,
    pub total_copies: i32,
    pub available_copies: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    pub fn is_available(&self) -> bool {
        self.available_copies > 0
    }
}

/// Catalog fields needed to register a book
#[derive(Debug, Clone)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub description: Option<String>,
    pub published_year: Option<i32>,
    pub genre: Option<String>,
    pub file_path: String,
    pub file_type: String,
    pub file_size: i64,
    pub total_copies: i32,
}

impl NewBook {
    /// Minimal book with one copy and a placeholder content reference
    pub fn new(title: impl Into<String>, author: impl Into<String>, genre: Option<&str>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            isbn: None,
            description: None,
            published_year: None,
            genre: genre.map(str::to_string),
            file_path: String::new(),
            file_type: "txt".to_string(),
            file_size: 0,
            total_copies: 1,
        }
    }

    pub fn with_copies(mut self, total_copies: i32) -> Self {
        self.total_copies = total_copies;
        self
    }
}

/// Outward projection of a book returned by the recommendation endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookSummary {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub genre: Option<String>,
    pub published_year: Option<i32>,
    pub ai_summary: Option<String>,
    pub available_copies: i32,
}

impl From<Book> for BookSummary {
    fn from(book: Book) -> Self {
        Self {
            id: book.id,
            title: book.title,
            author: book.author,
            genre: book.genre,
            published_year: book.published_year,
            ai_summary: book.ai_summary,
            available_copies: book.available_copies,
        }
    }
}

/// One loan, active while `returned_at` is empty
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct BorrowRecord {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub borrowed_at: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
}

impl BorrowRecord {
    pub fn is_active(&self) -> bool {
        self.returned_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 3] = [
        SentimentLabel::Positive,
        SentimentLabel::Neutral,
        SentimentLabel::Negative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

impl FromStr for SentimentLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(SentimentLabel::Positive),
            "neutral" => Ok(SentimentLabel::Neutral),
            "negative" => Ok(SentimentLabel::Negative),
            other => Err(format!("unknown sentiment label: {}", other)),
        }
    }
}

/// A rating with optional text; sentiment fields are filled in by a later analysis pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub rating: i32,
    pub review_text: Option<String>,
    pub sentiment_score: Option<f64>,
    pub sentiment_label: Option<SentimentLabel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Review submission body
#[derive(Debug, Clone, Deserialize)]
pub struct NewReview {
    pub rating: i32,
    #[serde(default)]
    pub review_text: Option<String>,
}

pub const MIN_RATING: i32 = 1;
pub const MAX_RATING: i32 = 5;

/// Aggregated view over every review of one book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewAnalysis {
    pub book_id: i64,
    pub total_reviews: usize,
    pub average_rating: f64,
    pub sentiment_distribution: BTreeMap<SentimentLabel, usize>,
    pub consensus_summary: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ReviewAnalysis {
    pub fn from_reviews(book: &Book, reviews: &[Review]) -> Self {
        let total_reviews = reviews.len();
        let average_rating = if total_reviews == 0 {
            0.0
        } else {
            reviews.iter().map(|r| r.rating as f64).sum::<f64>() / total_reviews as f64
        };

        let mut sentiment_distribution: BTreeMap<SentimentLabel, usize> =
            SentimentLabel::ALL.iter().map(|label| (*label, 0)).collect();
        for label in reviews.iter().filter_map(|r| r.sentiment_label) {
            *sentiment_distribution.entry(label).or_default() += 1;
        }

        Self {
            book_id: book.id,
            total_reviews,
            average_rating,
            sentiment_distribution,
            consensus_summary: book.review_consensus.clone(),
            last_updated: book.consensus_updated_at,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_never_serializes_credential_hash() {
        let user = User {
            id: 1,
            email: "reader@example.com".to_string(),
            username: "reader".to_string(),
            hashed_password: "$argon2id$secret".to_string(),
            is_active: true,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("hashed_password").is_none());
        assert_eq!(json["username"], "reader");
    }

    #[test]
    fn test_sentiment_label_round_trips_through_text() {
        for label in SentimentLabel::ALL {
            assert_eq!(label.as_str().parse::<SentimentLabel>().unwrap(), label);
        }
        assert!("ecstatic".parse::<SentimentLabel>().is_err());
        assert_eq!(
            serde_json::to_string(&SentimentLabel::Negative).unwrap(),
            "\"negative\""
        );
    }

    #[test]
    fn test_book_summary_projection() {
        let book = fixtures::book(3, "Agatha Christie", Some("Mystery"));
        let summary = BookSummary::from(book);
        assert_eq!(summary.id, 3);
        assert_eq!(summary.genre.as_deref(), Some("Mystery"));
        assert_eq!(summary.available_copies, 1);
    }

    #[test]
    fn test_review_analysis_counts_labels() {
        let mut book = fixtures::book(1, "A", None);
        book.review_consensus = Some("Readers enjoyed it".to_string());

        let mut first = fixtures::review(1, 1, 1, 5);
        first.sentiment_label = Some(SentimentLabel::Positive);
        let mut second = fixtures::review(2, 2, 1, 2);
        second.sentiment_label = Some(SentimentLabel::Negative);
        let third = fixtures::review(3, 3, 1, 4);

        let analysis = ReviewAnalysis::from_reviews(&book, &[first, second, third]);
        assert_eq!(analysis.total_reviews, 3);
        assert!((analysis.average_rating - 11.0 / 3.0).abs() < 1e-9);
        assert_eq!(analysis.sentiment_distribution[&SentimentLabel::Positive], 1);
        assert_eq!(analysis.sentiment_distribution[&SentimentLabel::Negative], 1);
        assert_eq!(analysis.sentiment_distribution[&SentimentLabel::Neutral], 0);
        assert_eq!(analysis.consensus_summary.as_deref(), Some("Readers enjoyed it"));
    }

    #[test]
    fn test_review_analysis_without_reviews() {
        let book = fixtures::book(9, "A", None);
        let analysis = ReviewAnalysis::from_reviews(&book, &[]);
        assert_eq!(analysis.total_reviews, 0);
        assert_eq!(analysis.average_rating, 0.0);
    }
}
