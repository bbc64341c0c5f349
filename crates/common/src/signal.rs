//! Crisis signals produced by the classifier.

use crate::{now_millis, LifelineError, Result};
use serde::{Deserialize, Serialize};

/// Lowest severity a classifier may report.
pub const MIN_SEVERITY: u8 = 1;
/// Highest severity a classifier may report.
pub const MAX_SEVERITY: u8 = 10;

/// Urgency label attached by the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyTag {
    Low,
    #[default]
    Moderate,
    High,
    Critical,
}

/// Coarse bucket of the 1..=10 crisis scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityCategory {
    Low,
    Moderate,
    High,
    Critical,
}

impl SeverityCategory {
    pub fn from_severity(severity: u8) -> Self {
        match severity {
            0..=3 => Self::Low,
            4..=6 => Self::Moderate,
            7..=8 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// An emergency detected in one patient message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisSignal {
    /// Patient the message came from
    pub source_user_id: String,

    /// Crisis level, 1 (mild) to 10 (imminent danger)
    pub severity: u8,

    #[serde(default)]
    pub urgency: UrgencyTag,

    /// Matched keywords, in classifier order
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Short excerpt of the triggering message
    #[serde(default)]
    pub excerpt: String,

    /// When the message was analyzed (Unix millis)
    #[serde(default = "now_millis")]
    pub observed_at: u64,
}

impl CrisisSignal {
    pub fn new(source_user_id: impl Into<String>, severity: u8) -> Self {
        Self {
            source_user_id: source_user_id.into(),
            severity,
            urgency: UrgencyTag::default(),
            keywords: Vec::new(),
            excerpt: String::new(),
            observed_at: now_millis(),
        }
    }

    pub fn with_urgency(mut self, urgency: UrgencyTag) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = excerpt.into();
        self
    }

    /// Reject signals the registry must never see.
    pub fn validate(&self) -> Result<()> {
        if self.source_user_id.trim().is_empty() {
            return Err(LifelineError::InvalidSignal(
                "source_user_id must not be empty".into(),
            ));
        }
        if !(MIN_SEVERITY..=MAX_SEVERITY).contains(&self.severity) {
            return Err(LifelineError::InvalidSignal(format!(
                "severity {} is outside {}..={}",
                self.severity, MIN_SEVERITY, MAX_SEVERITY
            )));
        }
        Ok(())
    }

    pub fn category(&self) -> SeverityCategory {
        SeverityCategory::from_severity(self.severity)
    }

    /// Response time therapists are expected to meet for this severity.
    pub fn response_target(&self) -> &'static str {
        match self.severity {
            9..=u8::MAX => "Immediate (< 1 minute)",
            7..=8 => "Urgent (< 5 minutes)",
            5..=6 => "High Priority (< 15 minutes)",
            _ => "Standard (< 1 hour)",
        }
    }
}
