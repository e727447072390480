//! Trust-weighted ranking of candidate documents.
//!
//! `score = 0.5 * relevance + 0.3 * trust + 0.2 * recency`, where relevance
//! is a case-insensitive substring match, trust comes from the document
//! grade and recency decays linearly to zero over a year.

use std::cmp::Ordering;

use chrono::{NaiveDate, Utc};
use gatehouse_contracts::{Document, RetrievalFilters, ScoredDocument};

use crate::parse_date;

pub const DEFAULT_MIN_SCORE: f64 = 0.4;
pub const DEFAULT_STATUS: &str = "active";

const RELEVANCE_WEIGHT: f64 = 0.5;
const TRUST_WEIGHT: f64 = 0.3;
const RECENCY_WEIGHT: f64 = 0.2;

const RELEVANCE_HIT: f64 = 1.0;
const RELEVANCE_MISS: f64 = 0.2;
const NEUTRAL_RECENCY: f64 = 0.5;
const RECENCY_HORIZON_DAYS: f64 = 365.0;

pub fn trust_for_grade(grade: Option<&str>) -> f64 {
    match grade {
        Some("A") => 1.0,
        Some("B") => 0.8,
        Some("C") => 0.5,
        _ => 0.1,
    }
}

/// Neutral for missing, unparsable or future dates.
pub fn recency(effective_date: Option<&str>, today: NaiveDate) -> f64 {
    let Some(date) = effective_date.and_then(parse_date) else {
        return NEUTRAL_RECENCY;
    };
    let days = (today - date).num_days();
    if days < 0 {
        return NEUTRAL_RECENCY;
    }
    (1.0 - days as f64 / RECENCY_HORIZON_DAYS).max(0.0)
}

pub fn relevance(document: &Document, query: &str) -> f64 {
    let text = format!("{} {}", document.title, document.snippet).to_lowercase();
    if text.contains(&query.to_lowercase()) {
        RELEVANCE_HIT
    } else {
        RELEVANCE_MISS
    }
}

fn round3(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone)]
pub struct RetrievalScorer {
    min_score_threshold: f64,
    default_status: String,
}

impl Default for RetrievalScorer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SCORE, DEFAULT_STATUS)
    }
}

impl RetrievalScorer {
    pub fn new(min_score_threshold: f64, default_status: impl Into<String>) -> Self {
        Self {
            min_score_threshold,
            default_status: default_status.into(),
        }
    }

    pub fn min_score_threshold(&self) -> f64 {
        self.min_score_threshold
    }

    /// Keeps documents whose `metadata.status` equals the requested status
    /// (the configured default when the filter omits one). `expire_date` is
    /// not consulted.
    pub fn apply_filters(
        &self,
        documents: Vec<Document>,
        filters: &RetrievalFilters,
    ) -> Vec<Document> {
        let target = filters
            .status
            .as_deref()
            .unwrap_or(self.default_status.as_str());
        documents
            .into_iter()
            .filter(|doc| doc.metadata.status.as_deref() == Some(target))
            .collect()
    }

    pub fn score(&self, document: &Document, query: &str) -> f64 {
        self.score_on(document, query, Utc::now().date_naive())
    }

    pub fn score_on(&self, document: &Document, query: &str, today: NaiveDate) -> f64 {
        let relevance = relevance(document, query);
        let trust = trust_for_grade(document.metadata.grade.as_deref());
        let recency = recency(document.metadata.effective_date.as_deref(), today);
        RELEVANCE_WEIGHT * relevance + TRUST_WEIGHT * trust + RECENCY_WEIGHT * recency
    }

    pub fn filter_by_score(&self, scored: Vec<(f64, Document)>) -> Vec<ScoredDocument> {
        self.filter_by_score_with(scored, self.min_score_threshold)
    }

    /// Drops documents below `threshold` and attaches the score rounded to
    /// three decimals. Input order is preserved.
    pub fn filter_by_score_with(
        &self,
        scored: Vec<(f64, Document)>,
        threshold: f64,
    ) -> Vec<ScoredDocument> {
        scored
            .into_iter()
            .filter(|(score, _)| *score >= threshold)
            .map(|(score, document)| ScoredDocument {
                document,
                score: round3(score),
            })
            .collect()
    }

    pub fn rank(
        &self,
        documents: Vec<Document>,
        query: &str,
        filters: &RetrievalFilters,
    ) -> Vec<ScoredDocument> {
        self.rank_on(documents, query, filters, Utc::now().date_naive())
    }

    /// Filter, score, threshold, then sort by descending score. Ties keep
    /// their input order.
    pub fn rank_on(
        &self,
        documents: Vec<Document>,
        query: &str,
        filters: &RetrievalFilters,
        today: NaiveDate,
    ) -> Vec<ScoredDocument> {
        let scored: Vec<(f64, Document)> = self
            .apply_filters(documents, filters)
            .into_iter()
            .map(|doc| (self.score_on(&doc, query, today), doc))
            .collect();
        let mut ranked = self.filter_by_score(scored);
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        ranked
    }
}
