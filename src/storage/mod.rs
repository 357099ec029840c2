pub mod blobs;
pub mod manifests;
pub mod paths;

pub use blobs::BlobStore;
pub use manifests::ManifestStore;
