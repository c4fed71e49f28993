//! Domain types flowing through the analysis pipeline.

pub mod analysis;
pub mod subject;

pub use analysis::{
    AnalysisValidationError, BatchAnalysisReply, CategoryAssessment, ConfidenceLabel,
    DemographicCategory, JobAnalysis, OverallAssessment, SubgroupAssessment,
};
pub use subject::{
    AmendmentRef, BillProfile, ClusterBillRef, ClusterProfile, SponsorRef, SubjectError,
    SubjectKind, SubjectProfile, load_profile,
};
