pub mod digest;
pub mod manifest;
pub mod platform;
pub mod reference;

pub use digest::Digest;
pub use manifest::{Descriptor, ManifestKind, ParsedManifest};
pub use platform::{Platform, PlatformFilter};
pub use reference::Reference;
