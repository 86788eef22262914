use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CheckConfig;

/// Severity rank of a finding, derived from its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f32) -> Self {
        if score <= 0.0 {
            Severity::None
        } else if score < 4.0 {
            Severity::Low
        } else if score < 7.0 {
            Severity::Medium
        } else if score < 9.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "None",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<Vulnerability>,
}

impl Vulnerability {
    pub fn new(summary: impl Into<String>, score: f32) -> Self {
        Self {
            summary: summary.into(),
            score,
            ..Default::default()
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::from_score(self.score)
    }

    pub fn add_vulnerabilities(&mut self, vulns: impl IntoIterator<Item = Vulnerability>) {
        self.vulnerabilities.extend(vulns);
    }
}

/// What a check produced. Owned by the check body, embedded in the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultData {
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl ResultData {
    pub fn add_vulnerabilities(&mut self, vulns: impl IntoIterator<Item = Vulnerability>) {
        self.vulnerabilities.extend(vulns);
    }

    /// Highest severity among the top level findings.
    pub fn max_severity(&self) -> Severity {
        self.vulnerabilities
            .iter()
            .map(Vulnerability::severity)
            .max()
            .unwrap_or(Severity::None)
    }

    /// Findings ordered from most to least severe.
    pub fn ranked(&self) -> Vec<&Vulnerability> {
        let mut ranked: Vec<&Vulnerability> = self.vulnerabilities.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}

/// Check metadata plus its result, the payload pushed with every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub check_id: String,
    #[serde(default)]
    pub checktype_name: String,
    #[serde(default)]
    pub checktype_version: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub options: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub result: ResultData,
}

impl Report {
    pub fn from_config(config: &CheckConfig) -> Self {
        Self {
            check_id: config.check_id.clone(),
            checktype_name: config.checktype_name.clone(),
            checktype_version: config.checktype_version.clone(),
            target: config.target.clone(),
            options: config.options.clone(),
            ..Default::default()
        }
    }
}
