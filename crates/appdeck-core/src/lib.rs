pub mod config;
pub mod manifest;
pub mod types;
pub mod version;

pub use config::DaemonConfig;
pub use manifest::{ManifestError, TemplateManifest};
pub use types::*;
pub use version::{VersionError, parse_version};
