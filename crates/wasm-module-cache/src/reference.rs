//! Download reference parsing.
//!
//! Supported reference formats:
//! - `http://host/path/filter.wasm`, `https://...` → plain download
//! - `oci://ghcr.io/org/filter` → OCI image, tag `latest`
//! - `oci://ghcr.io/org/filter:v1.2` → OCI image by (mutable) tag
//! - `oci://ghcr.io/org/filter@sha256:abc...` → OCI image pinned by digest

use crate::digest::{is_sha256_hex, SHA256_PREFIX};
use crate::error::{CacheError, CacheResult};

/// Scheme marker for OCI references.
pub const OCI_PREFIX: &str = "oci://";

/// Tag used when an OCI reference names neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed OCI image reference (without the `oci://` marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host, optionally with port (e.g. `ghcr.io`, `localhost:5000`).
    pub registry: String,

    /// Repository path inside the registry (e.g. `org/filter`).
    pub repository: String,

    /// Tag, if one was given.
    pub tag: Option<String>,

    /// Pinned digest as lowercase hex without the `sha256:` prefix.
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an `oci://` URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use wasm_module_cache::reference::ImageRef;
    ///
    /// let tagged = ImageRef::parse_url("oci://ghcr.io/org/filter:v1").unwrap();
    /// assert_eq!(tagged.registry, "ghcr.io");
    /// assert_eq!(tagged.repository, "org/filter");
    /// assert_eq!(tagged.reference(), "v1");
    ///
    /// let bare = ImageRef::parse_url("oci://localhost:5000/filter").unwrap();
    /// assert_eq!(bare.reference(), "latest");
    /// ```
    pub fn parse_url(url: &str) -> CacheResult<Self> {
        let rest = url
            .strip_prefix(OCI_PREFIX)
            .ok_or_else(|| invalid(url, "reference must start with 'oci://'"))?;
        Self::parse(rest).map_err(|e| match e {
            CacheError::InvalidReference { reason, .. } => invalid(url, reason),
            other => other,
        })
    }

    /// Parse `<host>/<repo>[:<tag>][@sha256:<hex>]`.
    pub fn parse(reference: &str) -> CacheResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let hex = digest
                    .strip_prefix(SHA256_PREFIX)
                    .ok_or_else(|| invalid(reference, "digest must start with 'sha256:'"))?;
                if !is_sha256_hex(hex) {
                    return Err(invalid(reference, "digest must be 64 hex characters"));
                }
                (name, Some(hex.to_ascii_lowercase()))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are ports.
        let last_slash = name.rfind('/');
        let (name, tag) = match name.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                (&name[..colon], Some(name[colon + 1..].to_string()))
            }
            _ => (name, None),
        };

        if let Some(tag) = &tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = name
            .split_once('/')
            .ok_or_else(|| invalid(reference, "reference must include a registry host"))?;

        validate_registry(reference, registry)?;
        validate_repository(reference, repository)?;

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// The manifest reference to request: `sha256:<hex>`, the tag, or `latest`.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{}{}", SHA256_PREFIX, digest),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// `<registry>/<repository>`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether the reference is pinned by digest.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", OCI_PREFIX, self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}{}", SHA256_PREFIX, digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageRef {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(OCI_PREFIX) {
            Some(_) => Self::parse_url(s),
            None => Self::parse(s),
        }
    }
}

/// Scheme of a download URL, lowercased.
///
/// References without `://` yield `UnsupportedScheme` with an empty scheme.
pub fn scheme(url: &str) -> CacheResult<String> {
    match url.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {
            Ok(scheme.to_ascii_lowercase())
        }
        _ => Err(CacheError::UnsupportedScheme {
            url: url.to_string(),
            scheme: String::new(),
        }),
    }
}

/// `url` with its scheme lowercased; the rest is left as is.
pub fn normalize_scheme(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) if scheme.bytes().any(|b| b.is_ascii_uppercase()) => {
            format!("{}://{}", scheme.to_ascii_lowercase(), rest)
        }
        _ => url.to_string(),
    }
}

/// Whether `url` is an OCI reference that does not pin a digest.
pub fn is_tagged_oci(url: &str) -> bool {
    url.starts_with(OCI_PREFIX) && !url.contains('@')
}

/// Digest pinned in the text of an OCI URL, if any.
pub fn pinned_digest(url: &str) -> Option<String> {
    if !url.starts_with(OCI_PREFIX) {
        return None;
    }
    ImageRef::parse_url(url).ok().and_then(|r| r.digest)
}

fn invalid(reference: &str, reason: impl Into<String>) -> CacheError {
    CacheError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

fn validate_registry(reference: &str, registry: &str) -> CacheResult<()> {
    if registry.is_empty() {
        return Err(invalid(reference, "registry host cannot be empty"));
    }
    if !registry
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
    {
        return Err(invalid(reference, "registry host contains invalid characters"));
    }
    Ok(())
}

fn validate_repository(reference: &str, repository: &str) -> CacheResult<()> {
    if repository.is_empty() {
        return Err(invalid(reference, "repository cannot be empty"));
    }

    for component in repository.split('/') {
        if component.is_empty() {
            return Err(invalid(reference, "repository has an empty path component"));
        }
        if !component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid(
                reference,
                "repository may only contain lowercase letters, digits, '.', '_' and '-'",
            ));
        }
        if !component
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        {
            return Err(invalid(
                reference,
                "repository components must start with a letter or digit",
            ));
        }
    }

    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> CacheResult<()> {
    if tag.is_empty() || tag.len() > 128 {
        return Err(invalid(reference, "tag must be 1 to 128 characters"));
    }
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(invalid(reference, "tag contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_parse_tagged() {
        let r = ImageRef::parse_url("oci://ghcr.io/org/filter:v1.2").unwrap();
        assert_eq!(
            r,
            ImageRef {
                registry: "ghcr.io".to_string(),
                repository: "org/filter".to_string(),
                tag: Some("v1.2".to_string()),
                digest: None,
            }
        );
        assert!(!r.is_pinned());
    }

    #[test]
    fn test_parse_default_tag() {
        let r = ImageRef::parse_url("oci://docker.io/istio/basic-auth").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.reference(), "latest");
    }

    #[test]
    fn test_parse_registry_port_is_not_a_tag() {
        let r = ImageRef::parse_url("oci://localhost:5000/filter").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "filter");
        assert_eq!(r.tag, None);

        let r = ImageRef::parse_url("oci://localhost:5000/filter:dev").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.tag.as_deref(), Some("dev"));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageRef::parse_url(&format!("oci://ghcr.io/org/filter@sha256:{}", HEX)).unwrap();
        assert_eq!(r.digest.as_deref(), Some(HEX));
        assert_eq!(r.reference(), format!("sha256:{}", HEX));
        assert!(r.is_pinned());
    }

    #[test]
    fn test_parse_tag_and_digest_prefers_digest() {
        let r =
            ImageRef::parse_url(&format!("oci://ghcr.io/org/filter:v1@sha256:{}", HEX)).unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.reference(), format!("sha256:{}", HEX));
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        let result = ImageRef::parse_url("oci://ghcr.io/org/filter@md5:abc");
        assert!(matches!(result, Err(CacheError::InvalidReference { .. })));

        let result = ImageRef::parse_url("oci://ghcr.io/org/filter@sha256:abc");
        assert!(matches!(result, Err(CacheError::InvalidReference { .. })));
    }

    #[test]
    fn test_parse_rejects_missing_registry() {
        let result = ImageRef::parse_url("oci://filter:v1");
        assert!(matches!(result, Err(CacheError::InvalidReference { .. })));
    }

    #[test]
    fn test_parse_rejects_uppercase_repository() {
        let result = ImageRef::parse_url("oci://ghcr.io/Org/Filter");
        assert!(matches!(result, Err(CacheError::InvalidReference { .. })));
    }

    #[test]
    fn test_parse_rejects_empty_tag() {
        let result = ImageRef::parse_url("oci://ghcr.io/org/filter:");
        assert!(matches!(result, Err(CacheError::InvalidReference { .. })));
    }

    #[test]
    fn test_parse_requires_prefix() {
        let result = ImageRef::parse_url("ghcr.io/org/filter");
        assert!(matches!(result, Err(CacheError::InvalidReference { .. })));
        assert!("ghcr.io/org/filter".parse::<ImageRef>().is_ok());
    }

    #[test]
    fn test_display_roundtrip() {
        for url in [
            "oci://ghcr.io/org/filter:v1".to_string(),
            "oci://ghcr.io/org/filter".to_string(),
            format!("oci://ghcr.io/org/filter@sha256:{}", HEX),
        ] {
            assert_eq!(ImageRef::parse_url(&url).unwrap().to_string(), url);
        }
    }

    #[test]
    fn test_scheme() {
        assert_eq!(scheme("https://x/mod.wasm").unwrap(), "https");
        assert_eq!(scheme("OCI://ghcr.io/org/f").unwrap(), "oci");
        assert!(matches!(
            scheme("mod.wasm"),
            Err(CacheError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_normalize_scheme() {
        assert_eq!(
            normalize_scheme("OCI://ghcr.io/org/filter:V1"),
            "oci://ghcr.io/org/filter:V1"
        );
        assert_eq!(normalize_scheme("Https://x/Mod.wasm"), "https://x/Mod.wasm");
        assert_eq!(normalize_scheme("mod.wasm"), "mod.wasm");
    }

    #[test]
    fn test_tagged_and_pinned_detection() {
        let pinned = format!("oci://ghcr.io/org/filter@sha256:{}", HEX);
        assert!(is_tagged_oci("oci://ghcr.io/org/filter:v1"));
        assert!(is_tagged_oci("oci://ghcr.io/org/filter"));
        assert!(!is_tagged_oci(&pinned));
        assert!(!is_tagged_oci("https://x/mod.wasm"));

        assert_eq!(pinned_digest(&pinned).as_deref(), Some(HEX));
        assert_eq!(pinned_digest("oci://ghcr.io/org/filter:v1"), None);
        assert_eq!(pinned_digest("https://x/mod.wasm@sha256:abc"), None);
    }
}
