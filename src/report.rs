//! The JSON record handed back to the pipeline.

use crate::delivery::{DeliveryOutcome, DeliveryStatus, RecipientStatus, EMPTY_BODY_NOTE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version stamp: when the record was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Capture time, serialized as RFC 3339 UTC.
    pub time: DateTime<Utc>,
}

/// One `name`/`value` pair in the metadata list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    /// Item name.
    pub name: String,
    /// Item value.
    pub value: String,
}

impl MetadataItem {
    /// Creates an item.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Output of the `out` step.
///
/// Building a report cannot fail, so it is available whether delivery
/// succeeded, was skipped or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Version stamp.
    pub version: Version,
    /// Metadata shown by the pipeline.
    pub metadata: Vec<MetadataItem>,
}

impl Report {
    /// Creates a report stamped with the current time.
    #[must_use]
    pub fn new(smtp_host: &str, subject: &str, version: &str) -> Self {
        Self::at(Utc::now(), smtp_host, subject, version)
    }

    /// Creates a report with an explicit timestamp.
    #[must_use]
    pub fn at(time: DateTime<Utc>, smtp_host: &str, subject: &str, version: &str) -> Self {
        Self {
            version: Version { time },
            metadata: vec![
                MetadataItem::new("smtp_host", smtp_host),
                MetadataItem::new("subject", subject),
                MetadataItem::new("version", version),
            ],
        }
    }

    /// Appends the skip note and soft-rejected recipients of a delivery.
    #[must_use]
    pub fn with_outcome(mut self, outcome: &DeliveryOutcome) -> Self {
        if outcome.status == DeliveryStatus::SkippedEmptyBody {
            self.metadata.push(MetadataItem::new("skipped", EMPTY_BODY_NOTE));
        }
        for recipient in outcome.skipped() {
            if let RecipientStatus::Skipped { reason } = &recipient.status {
                self.metadata.push(MetadataItem::new(
                    "skipped_recipient",
                    format!("{}: {reason}", recipient.address),
                ));
            }
        }
        if let Some(quit_error) = &outcome.quit_error {
            self.metadata.push(MetadataItem::new("quit_error", quit_error.as_str()));
        }
        self
    }

    /// Value of the first item named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.value.as_str())
    }
}
