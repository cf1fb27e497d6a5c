pub mod job;
pub mod plan;

pub use job::{JobStatus, SourceFile, UploadJob};
pub use plan::{
    AssetDetails, ChunkPlan, ChunkRecord, ChunkStatus, CompletedPart, RemoteCompletion,
};
