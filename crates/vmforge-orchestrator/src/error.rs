use crate::exporter::ExportError;

/// Errors surfaced by the migration orchestrator. Every variant maps onto
/// a distinct failure kind (validation, not-found, transient transport,
/// checksum mismatch, external-command, cancellation, internal);
/// `is_transient` is what the job engine consults to decide whether a
/// failure should feed the retry budget or fail the job outright.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("export error: {0}")]
    Export(#[from] ExportError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] vmforge_checkpoint::CheckpointError),
    #[error("manifest error: {0}")]
    Manifest(#[from] vmforge_manifest::ManifestError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] vmforge_pipeline::PipelineError),
    #[error("upload error: {0}")]
    Upload(String),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    #[error("blocking task join error: {0}")]
    Join(String),
    #[error("migration cancelled")]
    Cancelled,
    #[error("no exporter registered for provider {0}")]
    NoExporter(String),
}

impl OrchestratorError {
    /// Classifies this failure for the engine's retry budget: transient
    /// transport errors are retried with backoff; checksum mismatches,
    /// validation errors and cancellation are not.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Export(e) => e.is_transient(),
            OrchestratorError::Io(_) => true,
            _ => false,
        }
    }
}
