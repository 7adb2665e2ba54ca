//! The external collaborator seam this crate depends on instead of any
//! concrete hypervisor SDK.
//!
//! Providers (vSphere NFC/OVF, EC2 export, ...) are out of scope; this
//! module only defines the trait and the small data shapes the migration
//! orchestrator needs from whatever implements it.

use std::io::Read;

use async_trait::async_trait;
use vmforge_manifest::{DiskType, NicEntry, SourceFormat, SourceMetadata, VmMetadata};

/// One file an [`Exporter`] will hand back a reader for. vmforge treats
/// every exported file as a disk image; an implementation that exports
/// auxiliary files (logs, OVF descriptors) filters them out before they
/// reach the orchestrator.
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub relative_path: String,
    pub source_url: Option<String>,
    pub total_bytes: u64,
    pub source_format: SourceFormat,
    pub disk_type: DiskType,
    pub boot_order_hint: u32,
}

/// Source/guest metadata an [`Exporter`] can surface alongside the file
/// list, folded into the manifest's optional `source`/`vm`/`nics` blocks.
#[derive(Debug, Clone, Default)]
pub struct ExportedVmInfo {
    pub source: SourceMetadata,
    pub vm: VmMetadata,
    pub nics: Vec<NicEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("vm {0:?} not found")]
    NotFound(String),
    #[error("transient export error: {0}")]
    Transient(String),
    #[error("export error: {0}")]
    Other(String),
}

impl ExportError {
    /// Whether this error should feed the engine's transient-retry budget
    ///, as opposed to a fatal not-found/validation failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExportError::Transient(_))
    }
}

/// Abstract export source for one VM. Implementations wrap the real
/// provider SDK call (vSphere NFC/OVF, EC2 export, Hyper-V, ...); vmforge's
/// core only depends on this trait.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// List every disk file that should be downloaded for `vm_path`.
    async fn list_files(&self, vm_path: &str) -> Result<Vec<ExportFile>, ExportError>;

    /// Source/guest metadata to fold into the manifest, if the provider
    /// can supply it.
    async fn vm_info(&self, vm_path: &str) -> Result<ExportedVmInfo, ExportError>;

    /// Open a reader for `file`, starting at `offset` bytes in — on resume,
    /// the transfer loop seeks every partial file to its checkpointed
    /// `downloaded_bytes` before reading further. A fresh transfer passes
    /// `offset = 0`. The returned reader is synchronous because the transfer loop
    /// drives it from a blocking task, the same way [`vmforge_throttle`]
    /// wraps `std::io::Read`.
    async fn open_reader(&self, vm_path: &str, file: &ExportFile, offset: u64) -> Result<Box<dyn Read + Send>, ExportError>;
}
