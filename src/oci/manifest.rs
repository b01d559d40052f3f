use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::RegistryV2Error;
use crate::oci::{Digest, Platform, PlatformFilter};

pub const MEDIA_TYPE_DOCKER_IMAGE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_IMAGE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// All manifest media types that can be pushed into or served by this registry.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_DOCKER_LIST,
    MEDIA_TYPE_DOCKER_IMAGE,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_IMAGE,
];

/// A content descriptor, as used for config blobs, layers, child manifests
/// and subjects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: i32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    subject: Option<Descriptor>,
    #[serde(default)]
    annotations: HashMap<String, String>,
    #[serde(default)]
    artifact_type: Option<String>,
}

/// The four supported manifest kinds. Image kinds reference blobs; list kinds
/// reference submanifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    DockerImage,
    DockerList,
    OciImage,
    OciIndex,
}

impl ManifestKind {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            MEDIA_TYPE_DOCKER_IMAGE => Some(Self::DockerImage),
            MEDIA_TYPE_DOCKER_LIST => Some(Self::DockerList),
            MEDIA_TYPE_OCI_IMAGE => Some(Self::OciImage),
            MEDIA_TYPE_OCI_INDEX => Some(Self::OciIndex),
            _ => None,
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            Self::DockerImage => MEDIA_TYPE_DOCKER_IMAGE,
            Self::DockerList => MEDIA_TYPE_DOCKER_LIST,
            Self::OciImage => MEDIA_TYPE_OCI_IMAGE,
            Self::OciIndex => MEDIA_TYPE_OCI_INDEX,
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, Self::DockerImage | Self::OciImage)
    }
}

/// A manifest parsed into a shape that all four media types share, so that
/// reference resolution, replication and validation do not need to care about
/// the concrete format.
#[derive(Debug)]
pub struct ParsedManifest {
    kind: ManifestKind,
    raw: RawManifest,
}

impl ParsedManifest {
    /// Parses manifest bytes that were declared (via Content-Type or a
    /// descriptor) to have the given media type.
    pub fn parse(media_type: &str, contents: &[u8]) -> Result<Self, RegistryV2Error> {
        let kind = ManifestKind::from_media_type(media_type)
            .ok_or_else(|| RegistryV2Error::ManifestInvalid(format!("unsupported manifest media type: {media_type:?}")))?;

        let raw: RawManifest = serde_json::from_slice(contents)
            .map_err(|err| RegistryV2Error::ManifestInvalid(err.to_string()))?;

        if let Some(embedded) = &raw.media_type {
            if embedded != media_type {
                return Err(RegistryV2Error::ManifestInvalid(format!(
                    "mediaType in manifest body ({embedded}) contradicts declared media type ({media_type})"
                )));
            }
        }

        if kind.is_image() {
            if raw.config.is_none() {
                return Err(RegistryV2Error::ManifestInvalid("image manifest has no config descriptor".into()));
            }
            if !raw.manifests.is_empty() {
                return Err(RegistryV2Error::ManifestInvalid("image manifest must not contain submanifests".into()));
            }
        } else if raw.config.is_some() || !raw.layers.is_empty() {
            return Err(RegistryV2Error::ManifestInvalid("list manifest must not contain blobs".into()));
        }

        Ok(ParsedManifest { kind, raw })
    }

    pub fn kind(&self) -> ManifestKind {
        self.kind
    }

    pub fn media_type(&self) -> &'static str {
        self.kind.media_type()
    }

    /// All blobs referenced by this manifest (config first, then layers).
    /// Empty for list manifests.
    pub fn blob_references(&self) -> Vec<Descriptor> {
        let mut refs = Vec::with_capacity(self.raw.layers.len() + 1);
        if let Some(config) = &self.raw.config {
            refs.push(config.clone());
        }
        refs.extend(self.raw.layers.iter().cloned());
        refs
    }

    /// The descriptor of the image configuration blob, where one exists that
    /// we know how to inspect. ORAS-style artifacts carry application-specific
    /// config media types that cannot be parsed as image configurations.
    pub fn image_config_blob(&self) -> Option<&Descriptor> {
        let config = self.raw.config.as_ref()?;
        match self.kind {
            ManifestKind::DockerImage => Some(config),
            ManifestKind::OciImage if config.media_type == MEDIA_TYPE_OCI_CONFIG => Some(config),
            _ => None,
        }
    }

    pub fn layer_blobs(&self) -> &[Descriptor] {
        &self.raw.layers
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.raw.annotations
    }

    pub fn artifact_type(&self) -> Option<String> {
        if let Some(artifact_type) = &self.raw.artifact_type {
            return Some(artifact_type.clone());
        }
        // conformance behavior: an OCI image without an explicit artifactType
        // reports its config media type instead
        if self.kind == ManifestKind::OciImage {
            return self.raw.config.as_ref().map(|c| c.media_type.clone());
        }
        None
    }

    pub fn subject(&self) -> Option<&Descriptor> {
        self.raw.subject.as_ref()
    }

    /// All submanifests referenced by this manifest, with the account's
    /// platform filter applied. Empty for image manifests.
    pub fn manifest_references(&self, filter: &PlatformFilter) -> Vec<Descriptor> {
        self.raw
            .manifests
            .iter()
            .filter(|m| match &m.platform {
                Some(platform) => filter.includes(platform),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// The subset of `manifest_references` that may be served in place of this
    /// manifest when the client's Accept header does not cover the manifest's
    /// own media type.
    ///
    /// A Docker v2 manifest list asked for by a client that only accepts
    /// Docker v2 schema 2 is answered with the linux/amd64 child manifest.
    /// This keeps tagged multi-arch images working with plain `docker pull`.
    pub fn acceptable_alternates(&self, filter: &PlatformFilter) -> Vec<Descriptor> {
        if self.kind != ManifestKind::DockerList {
            return Vec::new();
        }
        self.manifest_references(filter)
            .into_iter()
            .filter(|m| {
                m.media_type == MEDIA_TYPE_DOCKER_IMAGE
                    && m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
            })
            .collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use serde_json::json;

    pub fn image_manifest_bytes(config_digest: &Digest, layer_digest: &Digest) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_DOCKER_IMAGE,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": config_digest.to_string(),
                "size": 1102,
            },
            "layers": [{
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": layer_digest.to_string(),
                "size": 2789670,
            }],
        }))
        .unwrap()
    }

    pub fn list_manifest_bytes(children: &[(&Digest, &str, &str)]) -> Vec<u8> {
        let manifests: Vec<_> = children
            .iter()
            .map(|(digest, os, arch)| {
                json!({
                    "mediaType": MEDIA_TYPE_DOCKER_IMAGE,
                    "digest": digest.to_string(),
                    "size": 1367,
                    "platform": {"os": os, "architecture": arch},
                })
            })
            .collect();
        serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_DOCKER_LIST,
            "manifests": manifests,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_docker_image_manifest() {
        let config = Digest::of_bytes(b"config");
        let layer = Digest::of_bytes(b"layer");
        let bytes = image_manifest_bytes(&config, &layer);

        let manifest = ParsedManifest::parse(MEDIA_TYPE_DOCKER_IMAGE, &bytes).unwrap();
        assert_eq!(manifest.kind(), ManifestKind::DockerImage);

        let blobs = manifest.blob_references();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].digest, config);
        assert_eq!(blobs[1].digest, layer);
        assert_eq!(manifest.image_config_blob().unwrap().digest, config);
        assert!(manifest.manifest_references(&PlatformFilter::default()).is_empty());
    }

    #[test]
    fn test_parse_all_four_media_types() {
        let config = Digest::of_bytes(b"config");
        let layer = Digest::of_bytes(b"layer");
        let child = Digest::of_bytes(b"child");

        for media_type in MANIFEST_MEDIA_TYPES {
            let kind = ManifestKind::from_media_type(media_type).unwrap();
            let bytes = if kind.is_image() {
                serde_json::to_vec(&json!({
                    "schemaVersion": 2,
                    "mediaType": media_type,
                    "config": {"mediaType": MEDIA_TYPE_OCI_CONFIG, "digest": config.to_string(), "size": 10},
                    "layers": [{"mediaType": "application/octet-stream", "digest": layer.to_string(), "size": 20}],
                }))
                .unwrap()
            } else {
                serde_json::to_vec(&json!({
                    "schemaVersion": 2,
                    "mediaType": media_type,
                    "manifests": [{"mediaType": MEDIA_TYPE_OCI_IMAGE, "digest": child.to_string(), "size": 30,
                        "platform": {"os": "linux", "architecture": "arm64"}}],
                }))
                .unwrap()
            };
            let manifest = ParsedManifest::parse(media_type, &bytes).unwrap();
            assert_eq!(manifest.media_type(), *media_type);
            if kind.is_image() {
                assert_eq!(manifest.blob_references().len(), 2);
            } else {
                assert_eq!(manifest.manifest_references(&PlatformFilter::default()).len(), 1);
            }
        }
    }

    #[test]
    fn test_media_type_contradiction_rejected() {
        let config = Digest::of_bytes(b"config");
        let layer = Digest::of_bytes(b"layer");
        let bytes = image_manifest_bytes(&config, &layer);
        assert!(ParsedManifest::parse(MEDIA_TYPE_OCI_IMAGE, &bytes).is_err());
    }

    #[test]
    fn test_platform_filter_applies_to_references() {
        let amd = Digest::of_bytes(b"amd64");
        let arm = Digest::of_bytes(b"arm");
        let bytes = list_manifest_bytes(&[(&amd, "linux", "amd64"), (&arm, "linux", "arm")]);
        let manifest = ParsedManifest::parse(MEDIA_TYPE_DOCKER_LIST, &bytes).unwrap();

        let all = manifest.manifest_references(&PlatformFilter::default());
        assert_eq!(all.len(), 2);

        let filter = PlatformFilter(vec![Platform::new("linux", "amd64")]);
        let filtered = manifest.manifest_references(&filter);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].digest, amd);
    }

    #[test]
    fn test_acceptable_alternates_picks_linux_amd64() {
        let amd = Digest::of_bytes(b"amd64");
        let arm = Digest::of_bytes(b"arm");
        let bytes = list_manifest_bytes(&[(&arm, "linux", "arm"), (&amd, "linux", "amd64")]);
        let manifest = ParsedManifest::parse(MEDIA_TYPE_DOCKER_LIST, &bytes).unwrap();

        let alternates = manifest.acceptable_alternates(&PlatformFilter::default());
        assert_eq!(alternates.len(), 1);
        assert_eq!(alternates[0].digest, amd);
    }

    #[test]
    fn test_oci_index_has_no_alternates() {
        let child = Digest::of_bytes(b"child");
        let bytes = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [{"mediaType": MEDIA_TYPE_OCI_IMAGE, "digest": child.to_string(), "size": 30,
                "platform": {"os": "linux", "architecture": "amd64"}}],
        }))
        .unwrap();
        let manifest = ParsedManifest::parse(MEDIA_TYPE_OCI_INDEX, &bytes).unwrap();
        assert!(manifest.acceptable_alternates(&PlatformFilter::default()).is_empty());
    }

    #[test]
    fn test_artifact_type_falls_back_to_config_media_type() {
        let config = Digest::of_bytes(b"config");
        let layer = Digest::of_bytes(b"layer");
        let bytes = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_IMAGE,
            "config": {"mediaType": "application/vnd.example.config+json", "digest": config.to_string(), "size": 10},
            "layers": [{"mediaType": "application/octet-stream", "digest": layer.to_string(), "size": 20}],
        }))
        .unwrap();
        let manifest = ParsedManifest::parse(MEDIA_TYPE_OCI_IMAGE, &bytes).unwrap();
        assert_eq!(manifest.artifact_type().as_deref(), Some("application/vnd.example.config+json"));
        // application-specific config blobs cannot be inspected as image configs
        assert!(manifest.image_config_blob().is_none());
    }
}
