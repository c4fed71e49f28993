//! Cross-cutting application constants.

/// Heuristic token cost of one sponsor entry in the serialized prompt.
pub const TOKENS_PER_SPONSOR: u32 = 12;

/// Heuristic token cost of one subject tag.
pub const TOKENS_PER_SUBJECT_TAG: u32 = 8;

/// Heuristic token cost of one amendment (title + description).
pub const TOKENS_PER_AMENDMENT: u32 = 125;

/// Fixed per-job overhead for the required JSON envelope fields.
pub const JOB_JSON_OVERHEAD_TOKENS: u32 = 6;

/// Token cost of the job identifier field.
pub const JOB_ID_TOKENS: u32 = 3;

/// Token cost of the status field.
pub const JOB_STATUS_TOKENS: u32 = 5;

/// Description length assumed for an average-sized job.
pub const AVERAGE_DESCRIPTION_TOKENS: u32 = 500;

/// Fraction of the context window the batch is allowed to fill.
pub const BATCH_SAFETY_MARGIN: f64 = 0.8;

/// Context window assumed when the configuration does not override it.
pub const DEFAULT_CONTEXT_WINDOW_TOKENS: u32 = 128_000;

/// Tokens reserved for the system instruction and reply schema.
pub const DEFAULT_PROMPT_OVERHEAD_TOKENS: u32 = 1_000;

/// Ceiling on jobs per model call regardless of the budget estimate.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 5;

/// Failed jobs return to the queue until this many attempts are spent.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Recently-failed jobs are excluded from reclaiming for this long.
pub const DEFAULT_STALENESS_WINDOW_SECS: u64 = 3_600;

/// Throttle applied to completion-endpoint requests.
pub const MODEL_REQUESTS_PER_SECOND: u32 = 2;
