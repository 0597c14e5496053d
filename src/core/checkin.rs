use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::runner::PluginData;

/// Timestamp format the server expects on every batch entry.
pub const SERVER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinEntry {
    pub plugin_id: Option<u64>,
    pub created_at: String,
    pub fields: Value,
}

/// One transmission's worth of aggregated plugin output. Built fresh each
/// pass, consumed exactly once by the transport, then discarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckinBatch {
    pub reports: Vec<CheckinEntry>,
    pub alerts: Vec<CheckinEntry>,
    pub errors: Vec<CheckinEntry>,
    pub summaries: Vec<CheckinEntry>,
}

impl CheckinBatch {
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
            && self.alerts.is_empty()
            && self.errors.is_empty()
            && self.summaries.is_empty()
    }

    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.reports.len(),
            self.alerts.len(),
            self.errors.len(),
            self.summaries.len(),
        )
    }
}

/// Accumulates normalized plugin output across one pass. A plugin that
/// produced nothing contributes zero entries, not a placeholder.
#[derive(Default)]
pub struct CheckinAggregator {
    batch: CheckinBatch,
}

impl CheckinAggregator {
    pub fn absorb(&mut self, plugin_id: Option<u64>, data: &PluginData) {
        let created_at = Utc::now().format(SERVER_TIME_FORMAT).to_string();
        for (bucket, values) in [
            (&mut self.batch.reports, &data.reports),
            (&mut self.batch.alerts, &data.alerts),
            (&mut self.batch.errors, &data.errors),
            (&mut self.batch.summaries, &data.summaries),
        ] {
            bucket.extend(values.iter().map(|fields| CheckinEntry {
                plugin_id,
                created_at: created_at.clone(),
                fields: fields.clone(),
            }));
        }
    }

    /// Folds a plugin failure into the batch as a single error entry.
    pub fn absorb_error(&mut self, plugin_id: Option<u64>, subject: &str, body: Option<&str>) {
        let mut fields = json!({ "subject": subject });
        if let Some(body) = body {
            fields["body"] = json!(body);
        }
        self.batch.errors.push(CheckinEntry {
            plugin_id,
            created_at: Utc::now().format(SERVER_TIME_FORMAT).to_string(),
            fields,
        });
    }

    /// Hands the batch over and leaves the aggregator empty.
    pub fn finalize(&mut self) -> CheckinBatch {
        std::mem::take(&mut self.batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_with(reports: usize, alerts: usize) -> PluginData {
        PluginData {
            reports: (0..reports).map(|i| json!({"n": i})).collect(),
            alerts: (0..alerts).map(|i| json!({"subject": i.to_string()})).collect(),
            ..PluginData::default()
        }
    }

    #[test]
    fn entries_are_tagged_and_timestamped() {
        let mut aggregator = CheckinAggregator::default();
        aggregator.absorb(Some(7), &data_with(2, 1));

        let batch = aggregator.finalize();
        assert_eq!(batch.counts(), (2, 1, 0, 0));
        for entry in batch.reports.iter().chain(batch.alerts.iter()) {
            assert_eq!(entry.plugin_id, Some(7));
            // "YYYY-MM-DD HH:MM:SS"
            assert_eq!(entry.created_at.len(), 19);
            assert_eq!(&entry.created_at[4..5], "-");
            assert_eq!(&entry.created_at[13..14], ":");
        }
        assert_eq!(batch.reports[0].fields, json!({"n": 0}));
        assert_eq!(batch.reports[1].fields, json!({"n": 1}));
    }

    #[test]
    fn failures_become_error_entries() {
        let mut aggregator = CheckinAggregator::default();
        aggregator.absorb_error(None, "Plugin would not compile.", Some("expected token"));

        let batch = aggregator.finalize();
        assert_eq!(batch.counts(), (0, 0, 1, 0));
        assert_eq!(batch.errors[0].fields["subject"], "Plugin would not compile.");
        assert_eq!(batch.errors[0].fields["body"], "expected token");
    }

    #[test]
    fn finalize_clears_the_accumulator() {
        let mut aggregator = CheckinAggregator::default();
        aggregator.absorb(Some(1), &data_with(1, 0));
        assert!(!aggregator.finalize().is_empty());
        assert!(aggregator.finalize().is_empty());
    }

    #[test]
    fn nothing_produced_means_nothing_batched() {
        let mut aggregator = CheckinAggregator::default();
        aggregator.absorb(Some(1), &PluginData::default());
        assert!(aggregator.finalize().is_empty());
    }
}
