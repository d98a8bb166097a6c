//! Personal record (PR) analysis.
//!
//! Compares a finished activity against the best-known value of each record
//! category and reports the categories it strictly improves. The analyzer
//! never touches stored records; [`RecordAnalyzer::supersede`] only builds
//! the replacement values for the persistence layer.
//!
//! ## Categories
//! - Longest distance / longest duration
//! - Fastest average pace over activities of at least 5km and 10km
//! - Highest max speed
//! - Most elevation gain

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::session::ActivitySummary;

/// How two values of a category compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOrdering {
    HigherIsBetter,
    LowerIsBetter,
}

impl RecordOrdering {
    /// Strict comparison. Equal values are not better.
    pub fn is_better(self, candidate: f64, current: f64) -> bool {
        match self {
            RecordOrdering::HigherIsBetter => candidate > current,
            RecordOrdering::LowerIsBetter => candidate < current,
        }
    }
}

/// A personal record category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordCategory {
    /// Meters
    LongestDistance,
    /// Active seconds
    LongestDuration,
    /// Seconds per km, activities of at least 5km
    FastestPace5k,
    /// Seconds per km, activities of at least 10km
    FastestPace10k,
    /// Meters per second
    HighestMaxSpeed,
    /// Meters
    MostElevationGain,
}

impl RecordCategory {
    pub const ALL: [RecordCategory; 6] = [
        RecordCategory::LongestDistance,
        RecordCategory::LongestDuration,
        RecordCategory::FastestPace5k,
        RecordCategory::FastestPace10k,
        RecordCategory::HighestMaxSpeed,
        RecordCategory::MostElevationGain,
    ];

    pub fn ordering(self) -> RecordOrdering {
        match self {
            RecordCategory::FastestPace5k | RecordCategory::FastestPace10k => {
                RecordOrdering::LowerIsBetter
            }
            _ => RecordOrdering::HigherIsBetter,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordCategory::LongestDistance => "LONGEST_DISTANCE",
            RecordCategory::LongestDuration => "LONGEST_DURATION",
            RecordCategory::FastestPace5k => "FASTEST_PACE5K",
            RecordCategory::FastestPace10k => "FASTEST_PACE10K",
            RecordCategory::HighestMaxSpeed => "HIGHEST_MAX_SPEED",
            RecordCategory::MostElevationGain => "MOST_ELEVATION_GAIN",
        }
    }

    /// Human-readable name.
    pub fn label(self) -> &'static str {
        match self {
            RecordCategory::LongestDistance => "Longest Run",
            RecordCategory::LongestDuration => "Longest Time on Feet",
            RecordCategory::FastestPace5k => "Fastest 5K Pace",
            RecordCategory::FastestPace10k => "Fastest 10K Pace",
            RecordCategory::HighestMaxSpeed => "Top Speed",
            RecordCategory::MostElevationGain => "Biggest Climb",
        }
    }

    /// Minimum activity distance for the category to apply.
    pub fn min_distance_meters(self) -> f64 {
        match self {
            RecordCategory::FastestPace5k => 5_000.0,
            RecordCategory::FastestPace10k => 10_000.0,
            _ => 0.0,
        }
    }

    /// Candidate value of this category for an activity.
    ///
    /// `None` when the activity does not qualify or the value is not
    /// positive.
    pub fn extract(self, summary: &ActivitySummary) -> Option<f64> {
        let m = &summary.metrics;
        if m.distance_meters < self.min_distance_meters() {
            return None;
        }
        let value = match self {
            RecordCategory::LongestDistance => m.distance_meters,
            RecordCategory::LongestDuration => m.duration_seconds,
            RecordCategory::FastestPace5k | RecordCategory::FastestPace10k => {
                m.average_pace_sec_per_km?
            }
            RecordCategory::HighestMaxSpeed => m.max_speed_mps,
            RecordCategory::MostElevationGain => m.elevation_gain_meters,
        };
        (value.is_finite() && value > 0.0).then_some(value)
    }

    /// Format a value of this category for display.
    pub fn format_value(self, value: f64) -> String {
        match self {
            RecordCategory::LongestDistance | RecordCategory::MostElevationGain => {
                format_distance(value)
            }
            RecordCategory::LongestDuration => format_duration(value),
            RecordCategory::FastestPace5k | RecordCategory::FastestPace10k => format_pace(value),
            RecordCategory::HighestMaxSpeed => format!("{:.1}km/h", value * 3.6),
        }
    }
}

impl fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordCategory {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        RecordCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| TrackerError::corrupt(format!("unknown record category '{}'", s)))
    }
}

/// Best-known value of one category. One record per category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalRecord {
    pub category: RecordCategory,
    pub value: f64,
    pub source_session_id: String,
    pub achieved_at: DateTime<Utc>,
    pub previous_value: Option<f64>,
}

impl PersonalRecord {
    /// Storage identifier. Records are keyed by category.
    pub fn id(&self) -> &'static str {
        self.category.as_str()
    }
}

/// A category strictly improved by an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordImprovement {
    pub category: RecordCategory,
    pub new_value: f64,
    pub previous_value: Option<f64>,
    /// Absolute difference to the previous value; 0 for a first record
    pub improvement: f64,
    /// `improvement / previous * 100`; `None` when there is no usable previous
    pub improvement_percent: Option<f64>,
}

impl RecordImprovement {
    pub fn is_first(&self) -> bool {
        self.previous_value.is_none()
    }
}

/// Detects personal records in finished activities.
#[derive(Debug, Clone)]
pub struct RecordAnalyzer {
    categories: Vec<RecordCategory>,
}

impl Default for RecordAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordAnalyzer {
    /// Analyzer over every category.
    pub fn new() -> Self {
        Self {
            categories: RecordCategory::ALL.to_vec(),
        }
    }

    /// Analyzer over a subset of categories.
    pub fn with_categories(categories: impl IntoIterator<Item = RecordCategory>) -> Self {
        let mut list: Vec<RecordCategory> = Vec::new();
        for c in categories {
            if !list.contains(&c) {
                list.push(c);
            }
        }
        Self { categories: list }
    }

    pub fn categories(&self) -> &[RecordCategory] {
        &self.categories
    }

    /// Compare an activity against the best-known value per category.
    ///
    /// A category absent from `best` is a new record whenever the activity
    /// yields a value for it. Otherwise the value must be strictly better.
    pub fn analyze(
        &self,
        summary: &ActivitySummary,
        best: &HashMap<RecordCategory, f64>,
    ) -> Vec<RecordImprovement> {
        let mut improvements = Vec::new();

        for &category in &self.categories {
            let candidate = match category.extract(summary) {
                Some(v) => v,
                None => continue,
            };
            let previous = best.get(&category).copied();

            let improved = match previous {
                Some(current) => category.ordering().is_better(candidate, current),
                None => true,
            };
            if !improved {
                debug!(
                    "[Records] {} {}: {} does not beat {:?}",
                    summary.session_id, category, candidate, previous
                );
                continue;
            }

            let improvement = previous.map_or(0.0, |p| (candidate - p).abs());
            let improvement_percent = previous
                .filter(|&p| p != 0.0)
                .map(|p| improvement / p.abs() * 100.0);

            info!(
                "[Records] {} new {}: {}",
                summary.session_id,
                category,
                category.format_value(candidate)
            );
            improvements.push(RecordImprovement {
                category,
                new_value: candidate,
                previous_value: previous,
                improvement,
                improvement_percent,
            });
        }

        improvements
    }

    /// [`analyze`](Self::analyze) against stored records.
    pub fn analyze_records(
        &self,
        summary: &ActivitySummary,
        records: &[PersonalRecord],
    ) -> Vec<RecordImprovement> {
        let mut best: HashMap<RecordCategory, f64> = HashMap::new();
        for record in records {
            best.entry(record.category)
                .and_modify(|current| {
                    if record.category.ordering().is_better(record.value, *current) {
                        *current = record.value;
                    }
                })
                .or_insert(record.value);
        }
        self.analyze(summary, &best)
    }

    /// Records that replace the stored ones for each improvement.
    pub fn supersede(
        &self,
        summary: &ActivitySummary,
        improvements: &[RecordImprovement],
    ) -> Vec<PersonalRecord> {
        improvements
            .iter()
            .map(|imp| PersonalRecord {
                category: imp.category,
                value: imp.new_value,
                source_session_id: summary.session_id.clone(),
                achieved_at: summary.ended_at,
                previous_value: imp.previous_value,
            })
            .collect()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub(crate) fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}min", seconds / 60)
    } else {
        let hours = seconds / 3600;
        let mins = (seconds % 3600) / 60;
        if mins > 0 {
            format!("{}h {}min", hours, mins)
        } else {
            format!("{}h", hours)
        }
    }
}

pub(crate) fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{}m", meters as i64)
    } else {
        format!("{:.1}km", meters / 1000.0)
    }
}

pub(crate) fn format_pace(seconds_per_km: f64) -> String {
    if !(seconds_per_km.is_finite() && seconds_per_km > 0.0) {
        return "N/A".to_string();
    }
    let total = seconds_per_km.round() as u64;
    format!("{}:{:02}/km", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;
    use chrono::TimeZone;

    fn summary(id: &str, distance: f64, duration: f64) -> ActivitySummary {
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let mut metrics = MetricsSnapshot::empty(end);
        metrics.distance_meters = distance;
        metrics.duration_seconds = duration;
        metrics.average_pace_sec_per_km = crate::metrics::average_pace(duration, distance);
        metrics.max_speed_mps = 4.2;
        metrics.elevation_gain_meters = 35.0;
        ActivitySummary {
            session_id: id.to_string(),
            started_at: end - chrono::Duration::seconds(duration as i64),
            ended_at: end,
            metrics,
            sample_count: 100,
            bounds: None,
        }
    }

    #[test]
    fn test_first_time_policy() {
        let analyzer = RecordAnalyzer::new();
        let improvements = analyzer.analyze(&summary("a1", 6_000.0, 1_800.0), &HashMap::new());

        // 10k pace does not apply to a 6km run
        assert_eq!(improvements.len(), 5);
        assert!(improvements.iter().all(|i| i.is_first()));
        assert!(improvements.iter().all(|i| i.improvement_percent.is_none()));
        assert!(!improvements
            .iter()
            .any(|i| i.category == RecordCategory::FastestPace10k));
    }

    #[test]
    fn test_lower_is_better_for_pace() {
        let analyzer = RecordAnalyzer::with_categories([RecordCategory::FastestPace5k]);
        let best = HashMap::from([(RecordCategory::FastestPace5k, 330.0)]);

        // 5km in 1500s is 300 s/km
        let improvements = analyzer.analyze(&summary("a2", 5_000.0, 1_500.0), &best);
        assert_eq!(improvements.len(), 1);
        let imp = &improvements[0];
        assert!((imp.new_value - 300.0).abs() < 1e-9);
        assert!((imp.improvement - 30.0).abs() < 1e-9);
        let pct = imp.improvement_percent.unwrap();
        assert!((pct - 30.0 / 330.0 * 100.0).abs() < 1e-9);

        // Slower run is not a record
        let slower = analyzer.analyze(&summary("a3", 5_000.0, 1_800.0), &best);
        assert!(slower.is_empty());
    }

    #[test]
    fn test_tie_is_not_a_record() {
        let analyzer = RecordAnalyzer::with_categories([RecordCategory::LongestDistance]);
        let best = HashMap::from([(RecordCategory::LongestDistance, 8_000.0)]);
        assert!(analyzer
            .analyze(&summary("a4", 8_000.0, 2_400.0), &best)
            .is_empty());
        assert_eq!(
            analyzer
                .analyze(&summary("a5", 8_000.5, 2_400.0), &best)
                .len(),
            1
        );
    }

    #[test]
    fn test_zero_previous_has_no_percentage() {
        let analyzer = RecordAnalyzer::with_categories([RecordCategory::MostElevationGain]);
        let best = HashMap::from([(RecordCategory::MostElevationGain, 0.0)]);
        let improvements = analyzer.analyze(&summary("a6", 3_000.0, 900.0), &best);
        assert_eq!(improvements[0].improvement, 35.0);
        assert!(improvements[0].improvement_percent.is_none());
    }

    #[test]
    fn test_empty_activity_yields_nothing() {
        let analyzer = RecordAnalyzer::new();
        assert!(analyzer
            .analyze(&summary("a7", 0.0, 0.0), &HashMap::new())
            .iter()
            .all(|i| matches!(
                i.category,
                RecordCategory::HighestMaxSpeed | RecordCategory::MostElevationGain
            )));
    }

    #[test]
    fn test_supersede_builds_new_records() {
        let analyzer = RecordAnalyzer::with_categories([RecordCategory::LongestDistance]);
        let stored = vec![PersonalRecord {
            category: RecordCategory::LongestDistance,
            value: 5_000.0,
            source_session_id: "old".to_string(),
            achieved_at: Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap(),
            previous_value: None,
        }];
        let s = summary("a8", 7_500.0, 2_500.0);
        let improvements = analyzer.analyze_records(&s, &stored);
        let records = analyzer.supersede(&s, &improvements);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 7_500.0);
        assert_eq!(records[0].previous_value, Some(5_000.0));
        assert_eq!(records[0].source_session_id, "a8");
        assert_eq!(records[0].achieved_at, s.ended_at);
        // Stored list untouched
        assert_eq!(stored[0].value, 5_000.0);
    }

    #[test]
    fn test_category_names_round_trip() {
        for category in RecordCategory::ALL {
            assert_eq!(category.as_str().parse::<RecordCategory>().unwrap(), category);
        }
        assert!("FASTEST_MILE".parse::<RecordCategory>().is_err());
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_duration(90.0), "1min");
        assert_eq!(format_duration(3900.0), "1h 5min");
        assert_eq!(format_distance(850.0), "850m");
        assert_eq!(format_distance(5_000.0), "5.0km");
        assert_eq!(format_pace(330.0), "5:30/km");
        assert_eq!(format_pace(0.0), "N/A");
    }
}
