//! Registry manifest documents and layer selection.

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Layer holding a raw wasm binary.
pub const WASM_LAYER: &str = "application/vnd.module.wasm.content.layer.v1+wasm";

/// File extracted from tar.gz layers.
pub const PLUGIN_FILE: &str = "plugin.wasm";

/// `Accept` header for manifest requests.
pub fn accept_header() -> String {
    format!("{}, {}", OCI_MANIFEST, DOCKER_MANIFEST_V2)
}

/// Image manifest (OCI or Docker schema 2).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: Option<u32>,

    #[serde(default)]
    pub media_type: Option<String>,

    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Present only on indexes and manifest lists.
    #[serde(default)]
    pub manifests: Option<Vec<Descriptor>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// How the module is packaged inside its single layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFormat {
    /// The layer blob is the module.
    Wasm,
    /// The layer is a tar.gz containing [`PLUGIN_FILE`].
    TarGz,
}

impl Manifest {
    pub fn parse(url: &str, body: &[u8], content_type: Option<&str>) -> CacheResult<Self> {
        let mut manifest: Manifest = serde_json::from_slice(body)
            .map_err(|e| CacheError::fetch(url, format!("invalid manifest: {}", e)))?;
        if manifest.media_type.is_none() {
            manifest.media_type = content_type
                .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
        }
        Ok(manifest)
    }

    /// The single module layer and its packaging.
    pub fn module_layer(&self, url: &str) -> CacheResult<(&Descriptor, LayerFormat)> {
        let media_type = self.media_type.as_deref().unwrap_or(OCI_MANIFEST);
        if self.manifests.is_some() || media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
        {
            return Err(CacheError::fetch(url, "image indexes are not supported"));
        }

        if self.layers.len() != 1 {
            return Err(CacheError::fetch(
                url,
                format!("number of layers must be 1 but got {}", self.layers.len()),
            ));
        }
        let layer = &self.layers[0];

        let format = if media_type != DOCKER_MANIFEST_V2 && layer.media_type == WASM_LAYER {
            LayerFormat::Wasm
        } else {
            LayerFormat::TarGz
        };
        Ok((layer, format))
    }
}
