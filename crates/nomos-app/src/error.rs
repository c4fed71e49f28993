//! Application-level error type shared by the binary and services.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::pipeline::subject::SubjectError;
use crate::services::model::ModelError;
use crate::services::processor::ProcessorError;
use crate::services::queue::QueueError;
use crate::services::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Subject(#[from] SubjectError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
