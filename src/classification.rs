//! Post-activity classification.
//!
//! Runs a finished activity through the [`RecordAnalyzer`] and the
//! [`AchievementDetector`] and hands their outputs to the record and
//! achievement repositories.

use std::sync::Arc;

use log::info;

use crate::achievements::{Achievement, AchievementDetector};
use crate::error::Result;
use crate::records::{PersonalRecord, RecordAnalyzer, RecordImprovement};
use crate::session::ActivitySummary;
use crate::store::{AchievementRepository, ActivityRepository, RecordRepository};
use crate::TrackerConfig;

/// What a finished activity earned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub improvements: Vec<RecordImprovement>,
    pub new_records: Vec<PersonalRecord>,
    pub new_achievements: Vec<Achievement>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.new_records.is_empty() && self.new_achievements.is_empty()
    }
}

/// Classifies finished activities against stored history.
pub struct ActivityClassifier {
    activities: Arc<dyn ActivityRepository>,
    records: Arc<dyn RecordRepository>,
    achievements: Arc<dyn AchievementRepository>,
    analyzer: RecordAnalyzer,
    detector: AchievementDetector,
}

impl ActivityClassifier {
    pub fn new(
        activities: Arc<dyn ActivityRepository>,
        records: Arc<dyn RecordRepository>,
        achievements: Arc<dyn AchievementRepository>,
    ) -> Self {
        Self {
            activities,
            records,
            achievements,
            analyzer: RecordAnalyzer::new(),
            detector: AchievementDetector::new(),
        }
    }

    /// Use the configured UTC offset for calendar-day achievements.
    pub fn with_config(mut self, config: &TrackerConfig) -> Self {
        if let Some(offset) = config.utc_offset() {
            self.detector = self.detector.with_offset(offset);
        }
        self
    }

    pub fn with_analyzer(mut self, analyzer: RecordAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_detector(mut self, detector: AchievementDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Classify `summary` and persist new records and achievements.
    ///
    /// Safe to call again for the same activity: records it already holds
    /// are ties, and earned achievements are deduplicated.
    pub async fn classify(&self, summary: &ActivitySummary) -> Result<Classification> {
        let stored = self.records.find_all().await?;
        let improvements = self.analyzer.analyze_records(summary, &stored);
        let new_records = self.analyzer.supersede(summary, &improvements);

        let history: Vec<ActivitySummary> = self
            .activities
            .find_all()
            .await?
            .iter()
            .filter_map(|s| s.summary())
            .collect();
        let earned = self.achievements.find_all().await?;
        let new_achievements = self.detector.detect(summary, &history, &earned);

        for record in &new_records {
            self.records.save(record).await?;
        }
        for achievement in &new_achievements {
            self.achievements.save(achievement).await?;
        }

        info!(
            "[Classify] {}: {} record(s), {} achievement(s)",
            summary.session_id,
            new_records.len(),
            new_achievements.len()
        );
        Ok(Classification {
            improvements,
            new_records,
            new_achievements,
        })
    }
}
