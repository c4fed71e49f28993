//! Structured representation of model analysis replies.
//!
//! These types model the contract the completion endpoint must satisfy: one
//! analysis per submitted job, every score inside [0, 1], and a complete
//! category/subgroup breakdown for any job the model considers assessable.
//! They stay pure, provide JSON schema generation for prompting, and expose
//! validation so downstream code can refuse malformed payloads before
//! anything reaches the result store.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{AsRefStr, EnumIter, EnumString};
use thiserror::Error;

/// Top-level reply covering a whole batch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchAnalysisReply {
    pub analyses: Vec<JobAnalysis>,
}

/// The model's verdict on a single job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobAnalysis {
    /// Must echo the submitted job identifier.
    pub job_id: String,
    /// True when the subject lacks a coherent theme to assess; scores are
    /// absent and `explanation` says why.
    #[serde(default)]
    pub no_coherent_theme: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<OverallAssessment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<CategoryAssessment>,
}

/// Whole-subject assessment.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OverallAssessment {
    pub bias_score: f64,
    pub benefit_score: f64,
    pub confidence: ConfidenceLabel,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
}

impl ConfidenceLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceLabel::High => "high",
            ConfidenceLabel::Medium => "medium",
            ConfidenceLabel::Low => "low",
        }
    }
}

/// Demographic dimensions the analysis is scored along.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    AsRefStr,
    EnumIter,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DemographicCategory {
    Race,
    Religion,
    Gender,
    Age,
    Nationality,
    SexualOrientation,
    Veterans,
    Disability,
    Socioeconomic,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CategoryAssessment {
    pub category: DemographicCategory,
    pub bias_score: f64,
    pub benefit_score: f64,
    #[serde(default)]
    pub subgroups: Vec<SubgroupAssessment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubgroupAssessment {
    /// Short subgroup code, e.g. `BH` or `OA`.
    pub code: String,
    pub bias_score: f64,
    pub benefit_score: f64,
    pub evidence: String,
}

impl BatchAnalysisReply {
    /// Generate a JSON schema describing this payload, embedded into the
    /// system instruction at request build time.
    pub fn schema() -> JsonValue {
        let schema = schemars::schema_for!(BatchAnalysisReply);
        serde_json::to_value(&schema).expect("schema is serializable")
    }
}

impl JobAnalysis {
    /// Validate semantic constraints beyond plain JSON typing.
    pub fn validate(&self) -> Result<(), AnalysisValidationError> {
        let mut issues = Vec::new();

        if self.job_id.trim().is_empty() {
            issues.push("job_id must not be empty".to_string());
        }

        if self.no_coherent_theme {
            if self
                .explanation
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
            {
                issues.push("no_coherent_theme requires an explanation".to_string());
            }
        } else {
            match &self.overall {
                None => issues.push("overall assessment is required".to_string()),
                Some(overall) => {
                    if !in_unit_range(overall.bias_score) {
                        issues.push(format!(
                            "overall.bias_score must be within [0, 1], got {}",
                            overall.bias_score
                        ));
                    }
                    if !in_unit_range(overall.benefit_score) {
                        issues.push(format!(
                            "overall.benefit_score must be within [0, 1], got {}",
                            overall.benefit_score
                        ));
                    }
                }
            }

            if self.categories.is_empty() {
                issues.push("categories must contain at least one entry".to_string());
            }

            for (idx, category) in self.categories.iter().enumerate() {
                if !in_unit_range(category.bias_score) {
                    issues.push(format!(
                        "categories[{idx}].bias_score must be within [0, 1], got {}",
                        category.bias_score
                    ));
                }
                if !in_unit_range(category.benefit_score) {
                    issues.push(format!(
                        "categories[{idx}].benefit_score must be within [0, 1], got {}",
                        category.benefit_score
                    ));
                }
                for (sub_idx, subgroup) in category.subgroups.iter().enumerate() {
                    if subgroup.code.trim().is_empty() {
                        issues.push(format!(
                            "categories[{idx}].subgroups[{sub_idx}].code must not be empty"
                        ));
                    }
                    if !in_unit_range(subgroup.bias_score) {
                        issues.push(format!(
                            "categories[{idx}].subgroups[{sub_idx}].bias_score must be within [0, 1], got {}",
                            subgroup.bias_score
                        ));
                    }
                    if !in_unit_range(subgroup.benefit_score) {
                        issues.push(format!(
                            "categories[{idx}].subgroups[{sub_idx}].benefit_score must be within [0, 1], got {}",
                            subgroup.benefit_score
                        ));
                    }
                    if subgroup.evidence.trim().is_empty() {
                        issues.push(format!(
                            "categories[{idx}].subgroups[{sub_idx}].evidence must not be empty"
                        ));
                    }
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(AnalysisValidationError { issues })
        }
    }
}

fn in_unit_range(score: f64) -> bool {
    score.is_finite() && (0.0..=1.0).contains(&score)
}

/// Validation failures aggregated into a single error.
#[derive(Debug, Error)]
#[error("analysis validation failed: {issues:?}")]
pub struct AnalysisValidationError {
    pub issues: Vec<String>,
}

impl AnalysisValidationError {
    pub fn with_issue(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}
