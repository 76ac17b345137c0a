mod artifact_formats;
mod artifact_hash;
mod artifact_name;
mod core_metadata;
mod dependency;
mod environment;
mod extra;
pub mod marker;
mod package_name;
mod requirement;
mod requires_python;
mod rfc822ish;
mod specifier;
mod version;

// All this stuff is also re-exported from crate::prelude::*

pub use self::artifact_formats::{Artifact, Sdist, SdistMetadata, Wheel, WheelVitals};
pub use self::artifact_hash::{ArtifactHash, HashChecker};
pub use self::artifact_name::{
    ArtifactName, ArtifactNameUnwrap, DistInfoDirName, SdistFormat, SdistName, WheelName,
};
pub use self::core_metadata::WheelCoreMetadata;
pub use self::dependency::{Dependency, DependencySource, GitRef, PathLocation};
pub use self::environment::Environment;
pub use self::extra::Extra;
pub use self::package_name::PackageName;
pub use self::requirement::{PackageRequirement, ParseExtra, Requirement, UserRequirement};
pub use self::requires_python::RequiresPython;
pub use self::specifier::{CompareOp, Specifier, Specifiers};
pub use self::version::{Version, VERSION_INFINITY, VERSION_ZERO};
