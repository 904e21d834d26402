use thiserror::Error;

use crate::artifact::Artifact;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("storage write failed: {0}")]
    Io(String),
}

/// External collaborator the recorder hands finished artifacts to. The
/// filesystem layout (`${DataPath}/${StationName}_YYYYMMDD/eventNNN/`) is
/// the sink's concern, not this crate's.
pub trait StorageSink: Send {
    fn persist(&self, event_id: u64, artifact: Artifact) -> Result<(), RecorderError>;
}
