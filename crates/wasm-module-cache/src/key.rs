//! Identity of cached modules and of lookup requests.

use crate::digest::normalize_checksum;
use crate::reference::{normalize_scheme, ImageRef, OCI_PREFIX};

/// Content identity of a cached module.
///
/// Two identities are equal iff both `name` and `checksum` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentity {
    /// Scheme-normalised resource name (see [`module_name`]).
    pub name: String,

    /// Hex SHA-256 of the module. Empty only before resolution.
    pub checksum: String,
}

impl ModuleIdentity {
    pub fn new(name: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checksum: checksum.into(),
        }
    }

    /// Identity for `download_url`, normalising `checksum`.
    pub fn for_url(download_url: &str, checksum: &str) -> Self {
        Self::new(module_name(download_url), normalize_checksum(checksum))
    }

    /// Same name, resolved checksum.
    pub fn with_checksum(&self, checksum: impl Into<String>) -> Self {
        Self::new(self.name.clone(), checksum)
    }

    pub fn has_checksum(&self) -> bool {
        !self.checksum.is_empty()
    }
}

/// A lookup: identity plus the download URL that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub identity: ModuleIdentity,
    pub download_url: String,
}

impl LookupRequest {
    /// Request for `download_url`, whose scheme is lowercased.
    pub fn new(download_url: &str, checksum: &str) -> Self {
        let download_url = normalize_scheme(download_url);
        Self {
            identity: ModuleIdentity::for_url(&download_url, checksum),
            download_url,
        }
    }

    /// The same request with a now-known checksum.
    pub fn resolved(&self, checksum: &str) -> Self {
        Self {
            identity: self.identity.with_checksum(normalize_checksum(checksum)),
            download_url: self.download_url.clone(),
        }
    }
}

/// Resource name for a download reference.
///
/// OCI references lose their tag or digest so that differently tagged
/// references to one repository share a name. Unparsable OCI references and
/// every other scheme use the reference verbatim apart from a lowercased
/// scheme.
pub fn module_name(download_url: &str) -> String {
    let download_url = normalize_scheme(download_url);
    if !download_url.starts_with(OCI_PREFIX) {
        return download_url;
    }
    match ImageRef::parse_url(&download_url) {
        Ok(image) => format!("{}{}", OCI_PREFIX, image.name()),
        Err(_) => download_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_oci_name_strips_tag_and_digest() {
        assert_eq!(
            module_name("oci://ghcr.io/org/filter:v1"),
            "oci://ghcr.io/org/filter"
        );
        assert_eq!(
            module_name(&format!("oci://ghcr.io/org/filter@sha256:{}", HEX)),
            "oci://ghcr.io/org/filter"
        );
        assert_eq!(
            module_name("oci://ghcr.io/org/filter"),
            "oci://ghcr.io/org/filter"
        );
    }

    #[test]
    fn test_unparsable_oci_falls_back_to_raw() {
        assert_eq!(module_name("oci://Bad Ref"), "oci://Bad Ref");
    }

    #[test]
    fn test_http_name_is_verbatim() {
        assert_eq!(
            module_name("https://x/mod.wasm?v=1"),
            "https://x/mod.wasm?v=1"
        );
    }

    #[test]
    fn test_uppercase_oci_scheme_is_normalised() {
        assert_eq!(
            module_name("OCI://ghcr.io/org/filter:v1"),
            "oci://ghcr.io/org/filter"
        );
        let req = LookupRequest::new("OCI://ghcr.io/org/filter:v1", "");
        assert_eq!(req.download_url, "oci://ghcr.io/org/filter:v1");
        assert_eq!(
            req.identity,
            LookupRequest::new("oci://ghcr.io/org/filter:v2", "").identity
        );
    }

    #[test]
    fn test_identity_equality() {
        let a = ModuleIdentity::for_url("oci://ghcr.io/org/filter:v1", HEX);
        let b = ModuleIdentity::for_url("oci://ghcr.io/org/filter:v2", &format!("sha256:{}", HEX));
        assert_eq!(a, b);

        let c = ModuleIdentity::for_url("https://x/mod.wasm", HEX);
        assert_ne!(a, c);
    }

    #[test]
    fn test_request_resolution_keeps_url() {
        let req = LookupRequest::new("oci://ghcr.io/org/filter:v1", "");
        assert!(!req.identity.has_checksum());

        let resolved = req.resolved(HEX);
        assert_eq!(resolved.identity.checksum, HEX);
        assert_eq!(resolved.identity.name, req.identity.name);
        assert_eq!(resolved.download_url, "oci://ghcr.io/org/filter:v1");
    }
}
