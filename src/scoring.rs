//! Merge request priority scoring.
//!
//! A pure function of the MR's priority, age, retry count and convoy age.
//! Higher scores are processed first. The weights are tuned so that
//! priority dominates, age and retries prevent starvation, and convoy
//! members are pulled forward so batches land together.
//!
//! For otherwise-identical MRs the score never decreases when the MR is
//! older, has been retried more, belongs to a convoy (or an older convoy),
//! or has a more urgent priority.

use chrono::{DateTime, Utc};

use crate::types::MergeRequest;

/// Priority levels beyond this are treated as the least urgent level.
pub const LEAST_URGENT_PRIORITY: u32 = 4;

const PRIORITY_WEIGHT: f64 = 1000.0;
const AGE_WEIGHT_PER_HOUR: f64 = 10.0;
const MAX_AGE_HOURS: f64 = 24.0 * 7.0;
const RETRY_WEIGHT: f64 = 50.0;
const MAX_RETRIES_COUNTED: u32 = 5;
const CONVOY_BASE: f64 = 200.0;
const CONVOY_WEIGHT_PER_HOUR: f64 = 5.0;

/// Inputs to [`score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreInput {
    pub priority: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub convoy_created_at: Option<DateTime<Utc>>,
}

impl ScoreInput {
    pub fn from_mr(mr: &MergeRequest) -> Self {
        ScoreInput {
            priority: mr.priority,
            created_at: mr.created_at,
            retry_count: mr.retry_count,
            convoy_created_at: mr.convoy_created_at,
        }
    }
}

fn hours_since(then: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    then.map(|t| (now - t).num_seconds().max(0) as f64 / 3600.0)
        .unwrap_or(0.0)
        .min(MAX_AGE_HOURS)
}

/// Scores an MR at time `now`.
pub fn score(input: &ScoreInput, now: DateTime<Utc>) -> f64 {
    let urgency = LEAST_URGENT_PRIORITY - input.priority.min(LEAST_URGENT_PRIORITY);
    let mut total = f64::from(urgency) * PRIORITY_WEIGHT;

    total += hours_since(input.created_at, now) * AGE_WEIGHT_PER_HOUR;
    total += f64::from(input.retry_count.min(MAX_RETRIES_COUNTED)) * RETRY_WEIGHT;

    if input.convoy_created_at.is_some() {
        total += CONVOY_BASE + hours_since(input.convoy_created_at, now) * CONVOY_WEIGHT_PER_HOUR;
    }
    total
}

pub fn score_mr(mr: &MergeRequest, now: DateTime<Utc>) -> f64 {
    score(&ScoreInput::from_mr(mr), now)
}

/// Sorts MRs by descending score. Ties go to the older MR, then by ID.
pub fn rank(mrs: &mut [MergeRequest], now: DateTime<Utc>) {
    mrs.sort_by(|a, b| {
        score_mr(b, now)
            .total_cmp(&score_mr(a, now))
            .then_with(|| match (a.created_at, b.created_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}
