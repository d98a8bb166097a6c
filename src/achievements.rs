//! Achievement detection.
//!
//! Achievements are described by data, not code: every catalog entry is an
//! [`AchievementCriteria`] (a type plus a target value) evaluated by the same
//! predicate. The criteria pair is also the deduplication key, so an
//! achievement already in the earned list never fires again.
//!
//! ## Criteria
//! - Single-activity distance, duration and pace thresholds
//! - Lifetime distance and activity-count milestones
//! - Consecutive-day streaks
//! - Calendar-month distance and frequency
//!
//! ## Example
//! ```rust,ignore
//! use run_tracker::AchievementDetector;
//!
//! let detector = AchievementDetector::new();
//! let earned = detector.detect(&summary, &history, &already_earned);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Utc};
use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::records::{format_distance, format_duration, format_pace};
use crate::session::ActivitySummary;

/// Minimum distance for an activity to count towards pace achievements.
const PACE_MIN_DISTANCE_METERS: f64 = 5_000.0;

/// Kind of achievement criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AchievementType {
    /// At least `target` activities ever (the catalog uses 1)
    FirstActivity,
    /// One activity of at least `target` meters
    SingleDistance,
    /// One activity of at least `target` active seconds
    SingleDuration,
    /// One activity of 5km or more at `target` s/km or faster
    SinglePace,
    /// Lifetime distance of at least `target` meters
    TotalDistance,
    /// Lifetime count of at least `target` activities
    ActivityCount,
    /// `target` consecutive calendar days ending on the activity's day
    StreakDays,
    /// `target` meters within the activity's calendar month
    MonthlyDistance,
    /// `target` activities within the activity's calendar month
    MonthlyActivityCount,
}

impl AchievementType {
    pub const ALL: [AchievementType; 9] = [
        AchievementType::FirstActivity,
        AchievementType::SingleDistance,
        AchievementType::SingleDuration,
        AchievementType::SinglePace,
        AchievementType::TotalDistance,
        AchievementType::ActivityCount,
        AchievementType::StreakDays,
        AchievementType::MonthlyDistance,
        AchievementType::MonthlyActivityCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AchievementType::FirstActivity => "FIRST_ACTIVITY",
            AchievementType::SingleDistance => "SINGLE_DISTANCE",
            AchievementType::SingleDuration => "SINGLE_DURATION",
            AchievementType::SinglePace => "SINGLE_PACE",
            AchievementType::TotalDistance => "TOTAL_DISTANCE",
            AchievementType::ActivityCount => "ACTIVITY_COUNT",
            AchievementType::StreakDays => "STREAK_DAYS",
            AchievementType::MonthlyDistance => "MONTHLY_DISTANCE",
            AchievementType::MonthlyActivityCount => "MONTHLY_ACTIVITY_COUNT",
        }
    }
}

impl fmt::Display for AchievementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AchievementType {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        AchievementType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TrackerError::corrupt(format!("unknown achievement type '{}'", s)))
    }
}

/// A criterion and its threshold. Also the deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AchievementCriteria {
    pub achievement_type: AchievementType,
    pub target_value: u32,
}

impl AchievementCriteria {
    pub const fn new(achievement_type: AchievementType, target_value: u32) -> Self {
        Self {
            achievement_type,
            target_value,
        }
    }

    fn is_met(&self, ctx: &EvaluationContext<'_>) -> bool {
        let target = self.target_value as f64;
        let m = &ctx.current.metrics;
        match self.achievement_type {
            AchievementType::FirstActivity => ctx.activity_count >= self.target_value as usize,
            AchievementType::SingleDistance => m.distance_meters >= target,
            AchievementType::SingleDuration => m.duration_seconds >= target,
            AchievementType::SinglePace => {
                m.distance_meters >= PACE_MIN_DISTANCE_METERS
                    && m.average_pace_sec_per_km.is_some_and(|pace| pace <= target)
            }
            AchievementType::TotalDistance => ctx.total_distance >= target,
            AchievementType::ActivityCount => ctx.activity_count >= self.target_value as usize,
            AchievementType::StreakDays => ctx.streak_days >= self.target_value,
            AchievementType::MonthlyDistance => ctx.month_distance >= target,
            AchievementType::MonthlyActivityCount => {
                ctx.month_count >= self.target_value as usize
            }
        }
    }
}

/// An achievement, either a catalog template or an earned instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Achievement {
    pub achievement_type: AchievementType,
    pub title: String,
    pub description: String,
    pub criteria: AchievementCriteria,
    /// Completion time of the activity that earned it
    pub earned_at: Option<DateTime<Utc>>,
    pub source_session_id: Option<String>,
    /// Importance score (higher = more significant)
    pub importance: u8,
}

impl Achievement {
    /// Stable storage identifier derived from the deduplication key.
    pub fn id(&self) -> String {
        format!(
            "{}-{}",
            self.criteria.achievement_type.as_str(),
            self.criteria.target_value
        )
    }

    pub fn is_earned(&self) -> bool {
        self.earned_at.is_some()
    }
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AchievementRule {
    pub criteria: AchievementCriteria,
    pub title: String,
    pub description: String,
    pub importance: u8,
}

impl AchievementRule {
    /// Build a rule with generated title and description.
    pub fn new(achievement_type: AchievementType, target_value: u32, importance: u8) -> Self {
        let (title, description) = describe(achievement_type, target_value);
        Self {
            criteria: AchievementCriteria::new(achievement_type, target_value),
            title,
            description,
            importance,
        }
    }

    fn earn(&self, summary: &ActivitySummary) -> Achievement {
        Achievement {
            achievement_type: self.criteria.achievement_type,
            title: self.title.clone(),
            description: self.description.clone(),
            criteria: self.criteria,
            earned_at: Some(summary.ended_at),
            source_session_id: Some(summary.session_id.clone()),
            importance: self.importance,
        }
    }
}

/// `(type, target, importance)` for every built-in achievement.
const CATALOG_ENTRIES: &[(AchievementType, u32, u8)] = &[
    (AchievementType::FirstActivity, 1, 80),
    (AchievementType::SingleDistance, 5_000, 50),
    (AchievementType::SingleDistance, 10_000, 60),
    (AchievementType::SingleDistance, 21_097, 80),
    (AchievementType::SingleDistance, 42_195, 100),
    (AchievementType::SingleDuration, 3_600, 50),
    (AchievementType::SingleDuration, 7_200, 65),
    (AchievementType::SinglePace, 360, 50),
    (AchievementType::SinglePace, 300, 70),
    (AchievementType::SinglePace, 240, 90),
    (AchievementType::TotalDistance, 100_000, 55),
    (AchievementType::TotalDistance, 500_000, 75),
    (AchievementType::TotalDistance, 1_000_000, 90),
    (AchievementType::ActivityCount, 10, 50),
    (AchievementType::ActivityCount, 50, 70),
    (AchievementType::ActivityCount, 100, 85),
    (AchievementType::StreakDays, 3, 45),
    (AchievementType::StreakDays, 7, 65),
    (AchievementType::StreakDays, 30, 95),
    (AchievementType::MonthlyDistance, 50_000, 55),
    (AchievementType::MonthlyDistance, 100_000, 70),
    (AchievementType::MonthlyActivityCount, 8, 45),
    (AchievementType::MonthlyActivityCount, 12, 60),
];

/// Built-in achievement catalog.
pub static CATALOG: Lazy<Vec<AchievementRule>> = Lazy::new(|| {
    CATALOG_ENTRIES
        .iter()
        .map(|&(t, target, importance)| AchievementRule::new(t, target, importance))
        .collect()
});

/// Aggregates shared by every criterion for one evaluation.
struct EvaluationContext<'a> {
    current: &'a ActivitySummary,
    activity_count: usize,
    total_distance: f64,
    streak_days: u32,
    month_distance: f64,
    month_count: usize,
}

/// Evaluates finished activities against the achievement catalog.
#[derive(Debug, Clone)]
pub struct AchievementDetector {
    rules: Vec<AchievementRule>,
    offset: FixedOffset,
}

impl Default for AchievementDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AchievementDetector {
    /// Detector over the built-in catalog with UTC calendar days.
    pub fn new() -> Self {
        Self {
            rules: CATALOG.to_vec(),
            offset: utc(),
        }
    }

    /// Detector over a custom rule set. Rules repeating an earlier rule's
    /// criteria are dropped; the first one wins.
    pub fn with_rules(rules: Vec<AchievementRule>) -> Self {
        let mut seen = HashSet::new();
        let rules = rules
            .into_iter()
            .filter(|rule| seen.insert(rule.criteria))
            .collect();
        Self {
            rules,
            offset: utc(),
        }
    }

    /// Use `offset` to decide calendar days and months.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn rules(&self) -> &[AchievementRule] {
        &self.rules
    }

    /// Every rule as an unearned achievement, for display.
    pub fn templates(&self) -> Vec<Achievement> {
        self.rules
            .iter()
            .map(|rule| Achievement {
                achievement_type: rule.criteria.achievement_type,
                title: rule.title.clone(),
                description: rule.description.clone(),
                criteria: rule.criteria,
                earned_at: None,
                source_session_id: None,
                importance: rule.importance,
            })
            .collect()
    }

    /// Achievements newly earned by `summary`.
    ///
    /// `history` may or may not already contain `summary`; it is counted
    /// exactly once either way. Activities that ended after `summary` are
    /// ignored. Rules whose criteria appear in `earned` never fire.
    pub fn detect(
        &self,
        summary: &ActivitySummary,
        history: &[ActivitySummary],
        earned: &[Achievement],
    ) -> Vec<Achievement> {
        let ctx = self.context(summary, history);
        let earned_keys: HashSet<AchievementCriteria> = earned.iter().map(|a| a.criteria).collect();

        let mut achievements: Vec<Achievement> = self
            .rules
            .iter()
            .filter(|rule| !earned_keys.contains(&rule.criteria))
            .filter(|rule| rule.criteria.is_met(&ctx))
            .map(|rule| rule.earn(summary))
            .collect();

        // Sort by importance (highest first)
        achievements.sort_by(|a, b| b.importance.cmp(&a.importance));

        if achievements.is_empty() {
            debug!("[Achievements] {}: nothing new", summary.session_id);
        } else {
            info!(
                "[Achievements] {} earned {} achievement(s)",
                summary.session_id,
                achievements.len()
            );
        }
        achievements
    }

    fn context<'a>(
        &self,
        current: &'a ActivitySummary,
        history: &'a [ActivitySummary],
    ) -> EvaluationContext<'a> {
        // Dedup by session id; the current summary wins over a stored copy
        let mut sessions: HashMap<&str, &ActivitySummary> = history
            .iter()
            .filter(|s| s.ended_at <= current.ended_at)
            .map(|s| (s.session_id.as_str(), s))
            .collect();
        sessions.insert(current.session_id.as_str(), current);

        let day = self.local_date(current);
        let mut days: BTreeSet<NaiveDate> = BTreeSet::new();
        let mut total_distance = 0.0;
        let mut month_distance = 0.0;
        let mut month_count = 0;

        for s in sessions.values() {
            let d = self.local_date(s);
            days.insert(d);
            total_distance += s.metrics.distance_meters;
            if d.year() == day.year() && d.month() == day.month() {
                month_distance += s.metrics.distance_meters;
                month_count += 1;
            }
        }

        EvaluationContext {
            current,
            activity_count: sessions.len(),
            total_distance,
            streak_days: streak_ending_on(&days, day),
            month_distance,
            month_count,
        }
    }

    fn local_date(&self, summary: &ActivitySummary) -> NaiveDate {
        summary.started_at.with_timezone(&self.offset).date_naive()
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Consecutive days with an activity, counting back from `day`.
fn streak_ending_on(days: &BTreeSet<NaiveDate>, day: NaiveDate) -> u32 {
    let mut streak = 0;
    let mut cursor = Some(day);
    while let Some(d) = cursor.filter(|d| days.contains(d)) {
        streak += 1;
        cursor = d.pred_opt();
    }
    streak
}

/// Title and description for a criterion.
fn describe(achievement_type: AchievementType, target: u32) -> (String, String) {
    let t = target as f64;
    match achievement_type {
        AchievementType::FirstActivity => (
            "First Run!".to_string(),
            "Congratulations on recording your first run!".to_string(),
        ),
        AchievementType::SingleDistance => (
            format!("{} Run", distance_name(target)),
            format!("Complete a single run of {}", format_distance(t)),
        ),
        AchievementType::SingleDuration => (
            format!("{} on Your Feet", format_duration(t)),
            format!("Run for {} without stopping the session", format_duration(t)),
        ),
        AchievementType::SinglePace => (
            format!("Sub-{} Pace", format_pace(t)),
            format!(
                "Average {} or faster over at least {}",
                format_pace(t),
                format_distance(PACE_MIN_DISTANCE_METERS)
            ),
        ),
        AchievementType::TotalDistance => (
            format!("{} Total!", format_distance(t)),
            format!("You've covered {} in total!", format_distance(t)),
        ),
        AchievementType::ActivityCount => (
            format!("{} Runs!", target),
            format!("You've completed {} runs. Keep it up!", target),
        ),
        AchievementType::StreakDays => (
            format!("{}-Day Streak", target),
            format!("Run on {} consecutive days", target),
        ),
        AchievementType::MonthlyDistance => (
            format!("{} Month", format_distance(t)),
            format!("Cover {} within one calendar month", format_distance(t)),
        ),
        AchievementType::MonthlyActivityCount => (
            format!("{} Runs in a Month", target),
            format!("Complete {} runs within one calendar month", target),
        ),
    }
}

fn distance_name(meters: u32) -> String {
    match meters {
        21_097 => "Half Marathon".to_string(),
        42_195 => "Marathon".to_string(),
        m if m % 1000 == 0 => format!("{}K", m / 1000),
        m => format_distance(m as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;
    use chrono::{Duration, TimeZone};

    fn run(id: &str, day: u32, distance: f64, duration: f64) -> ActivitySummary {
        let start = Utc.with_ymd_and_hms(2024, 5, day, 7, 0, 0).unwrap();
        let end = start + Duration::seconds(duration as i64);
        let mut metrics = MetricsSnapshot::empty(end);
        metrics.distance_meters = distance;
        metrics.duration_seconds = duration;
        metrics.average_pace_sec_per_km = crate::metrics::average_pace(duration, distance);
        ActivitySummary {
            session_id: id.to_string(),
            started_at: start,
            ended_at: end,
            metrics,
            sample_count: 10,
            bounds: None,
        }
    }

    fn has(list: &[Achievement], t: AchievementType, target: u32) -> bool {
        list.iter()
            .any(|a| a.criteria == AchievementCriteria::new(t, target))
    }

    #[test]
    fn test_first_activity() {
        let detector = AchievementDetector::new();
        let s = run("a1", 1, 3_000.0, 1_200.0);
        let earned = detector.detect(&s, &[], &[]);

        assert!(has(&earned, AchievementType::FirstActivity, 1));
        let first = earned
            .iter()
            .find(|a| a.achievement_type == AchievementType::FirstActivity)
            .unwrap();
        assert_eq!(first.source_session_id.as_deref(), Some("a1"));
        assert_eq!(first.earned_at, Some(s.ended_at));
    }

    #[test]
    fn test_rerun_with_updated_earned_list_is_idempotent() {
        let detector = AchievementDetector::new();
        let s = run("a1", 1, 10_500.0, 3_000.0);
        let first = detector.detect(&s, &[], &[]);
        assert!(has(&first, AchievementType::SingleDistance, 5_000));
        assert!(has(&first, AchievementType::SingleDistance, 10_000));
        assert!(has(&first, AchievementType::SinglePace, 300));

        let second = detector.detect(&s, &[s.clone()], &first);
        assert!(second.is_empty());
    }

    #[test]
    fn test_current_session_counted_once() {
        let detector = AchievementDetector::with_rules(vec![AchievementRule::new(
            AchievementType::ActivityCount,
            2,
            50,
        )]);
        let s = run("a1", 1, 3_000.0, 1_200.0);
        // History already containing the current session twice is still one activity
        assert!(detector.detect(&s, &[s.clone(), s.clone()], &[]).is_empty());

        let mut earlier = run("a0", 1, 2_000.0, 600.0);
        earlier.started_at -= Duration::hours(2);
        earlier.ended_at -= Duration::hours(2);
        assert_eq!(detector.detect(&s, &[earlier], &[]).len(), 1);
    }

    #[test]
    fn test_streak_stops_at_first_gap() {
        let detector = AchievementDetector::with_rules(vec![
            AchievementRule::new(AchievementType::StreakDays, 3, 45),
            AchievementRule::new(AchievementType::StreakDays, 4, 50),
        ]);
        // Days 1, 3, 4, 5: gap on day 2
        let history = vec![
            run("d1", 1, 3_000.0, 900.0),
            run("d3", 3, 3_000.0, 900.0),
            run("d4", 4, 3_000.0, 900.0),
        ];
        let today = run("d5", 5, 3_000.0, 900.0);
        let earned = detector.detect(&today, &history, &[]);

        assert!(has(&earned, AchievementType::StreakDays, 3));
        assert!(!has(&earned, AchievementType::StreakDays, 4));
    }

    #[test]
    fn test_streak_uses_local_calendar_day() {
        let rules = vec![AchievementRule::new(AchievementType::StreakDays, 2, 45)];
        // 23:30 UTC on May 1st and 07:00 UTC on May 2nd
        let mut late = run("late", 1, 3_000.0, 900.0);
        late.started_at += Duration::minutes(16 * 60 + 30);
        late.ended_at += Duration::minutes(16 * 60 + 30);
        let morning = run("morning", 2, 3_000.0, 900.0);

        let utc_detector = AchievementDetector::with_rules(rules.clone());
        assert_eq!(utc_detector.detect(&morning, &[late.clone()], &[]).len(), 1);

        // At UTC+2 both runs fall on May 2nd
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let local_detector = AchievementDetector::with_rules(rules).with_offset(offset);
        assert!(local_detector.detect(&morning, &[late], &[]).is_empty());
    }

    #[test]
    fn test_monthly_totals_ignore_other_months_and_future() {
        let detector = AchievementDetector::with_rules(vec![AchievementRule::new(
            AchievementType::MonthlyDistance,
            20_000,
            55,
        )]);
        let mut april = run("april", 30, 15_000.0, 5_000.0);
        april.started_at -= Duration::days(30);
        april.ended_at -= Duration::days(30);
        let later = run("later", 20, 15_000.0, 5_000.0);
        let today = run("today", 10, 8_000.0, 2_800.0);

        assert!(detector.detect(&today, &[april, later], &[]).is_empty());

        let may = run("may", 3, 12_500.0, 4_000.0);
        assert_eq!(detector.detect(&today, &[may], &[]).len(), 1);
    }

    #[test]
    fn test_pace_requires_minimum_distance() {
        let detector = AchievementDetector::new();
        // Very fast but short
        let sprint = run("sprint", 1, 1_000.0, 200.0);
        let earned = detector.detect(&sprint, &[], &[]);
        assert!(!earned
            .iter()
            .any(|a| a.achievement_type == AchievementType::SinglePace));
    }

    #[test]
    fn test_results_sorted_by_importance() {
        let detector = AchievementDetector::new();
        let earned = detector.detect(&run("m", 1, 42_500.0, 14_000.0), &[], &[]);
        assert!(earned.windows(2).all(|w| w[0].importance >= w[1].importance));
        assert_eq!(earned[0].criteria, AchievementCriteria::new(AchievementType::SingleDistance, 42_195));
    }

    #[test]
    fn test_catalog_is_unique_and_titled() {
        let keys: HashSet<_> = CATALOG.iter().map(|r| r.criteria).collect();
        assert_eq!(keys.len(), CATALOG.len());
        assert!(CATALOG.iter().all(|r| !r.title.is_empty()));
        let half = CATALOG
            .iter()
            .find(|r| r.criteria.target_value == 21_097)
            .unwrap();
        assert_eq!(half.title, "Half Marathon Run");
        assert_eq!(
            AchievementRule::new(AchievementType::SinglePace, 300, 1).title,
            "Sub-5:00/km Pace"
        );
    }

    #[test]
    fn test_duplicate_rules_fire_once() {
        let detector = AchievementDetector::with_rules(vec![
            AchievementRule::new(AchievementType::SingleDistance, 5_000, 40),
            AchievementRule::new(AchievementType::SingleDistance, 5_000, 90),
            AchievementRule::new(AchievementType::FirstActivity, 1, 80),
        ]);
        assert_eq!(detector.rules().len(), 2);
        assert_eq!(detector.rules()[0].importance, 40);

        let earned = detector.detect(&run("r", 1, 6_000.0, 1_800.0), &[], &[]);
        assert_eq!(earned.len(), 2);
        assert_eq!(
            earned
                .iter()
                .filter(|a| a.achievement_type == AchievementType::SingleDistance)
                .count(),
            1
        );
    }

    #[test]
    fn test_type_names_round_trip() {
        for t in AchievementType::ALL {
            assert_eq!(t.as_str().parse::<AchievementType>().unwrap(), t);
        }
    }
}
