#[path = "package_db.rs"]
mod inner;
mod http;
mod simple_api;

pub use inner::{PackageDB, PackageMetadata, Source, SourcePriority};
pub use simple_api::ArtifactInfo;
