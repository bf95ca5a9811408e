//! Priority scoring for discovered papers
//!
//! `score = distance_decay^d * 1 / (1 + age * k_recency) * max(log10(c + 1), citation_floor)`
//!
//! Missing year or citation count contributes nothing rather than failing.
//! Distances past the point where the decay term would underflow are
//! clamped, so every score stays positive.

use crate::client::PaperSummary;
use chrono::Datelike;
use citegraph_common::config::WeightConfig;

/// Inputs the score depends on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperAttributes {
    pub year: Option<i32>,
    pub citation_count: Option<i64>,
}

impl From<&PaperSummary> for PaperAttributes {
    fn from(summary: &PaperSummary) -> Self {
        Self {
            year: summary.year,
            citation_count: summary.citation_count,
        }
    }
}

/// Smallest decay term kept; well above `f64::MIN_POSITIVE`
const MIN_BASE_SCORE: f64 = 1e-200;

/// Pure scoring function; the reference year is fixed at construction so
/// scores stay comparable for the whole run.
#[derive(Debug, Clone)]
pub struct WeightCalculator {
    distance_decay: f64,
    k_recency: f64,
    citation_floor: f64,
    seed_priority: f64,
    reference_year: i32,
    max_distance: u32,
}

impl WeightCalculator {
    pub fn new(config: &WeightConfig) -> Self {
        Self::with_reference_year(config, chrono::Utc::now().year())
    }

    pub fn with_reference_year(config: &WeightConfig, reference_year: i32) -> Self {
        let decay = config.distance_decay;
        let max_distance = if decay > 0.0 && decay < 1.0 {
            (MIN_BASE_SCORE.ln() / decay.ln()).floor() as u32
        } else {
            u32::MAX
        };

        Self {
            distance_decay: decay,
            k_recency: config.k_recency.max(0.0),
            citation_floor: config.citation_floor,
            seed_priority: config.seed_priority,
            reference_year,
            max_distance,
        }
    }

    /// Priority assigned to user-supplied seeds
    pub fn seed_priority(&self) -> f64 {
        self.seed_priority
    }

    pub fn score(&self, attrs: &PaperAttributes, distance: u32) -> f64 {
        self.base_score(distance) * self.recency_factor(attrs.year) * self.citation_factor(attrs.citation_count)
    }

    fn base_score(&self, distance: u32) -> f64 {
        let d = distance.min(self.max_distance).min(i32::MAX as u32);
        self.distance_decay.powi(d as i32)
    }

    fn recency_factor(&self, year: Option<i32>) -> f64 {
        let age = year
            .map(|y| (self.reference_year - y).max(0))
            .unwrap_or(0) as f64;
        1.0 / (1.0 + age * self.k_recency)
    }

    fn citation_factor(&self, citation_count: Option<i64>) -> f64 {
        let count = citation_count.unwrap_or(0).max(0) as f64;
        (count + 1.0).log10().max(self.citation_floor)
    }
}
