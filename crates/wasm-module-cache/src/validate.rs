//! Binary-format checks and payload unboxing.
//!
//! Modules are accepted only if they start with the WebAssembly magic number.
//! HTTP payloads may arrive gzip'd and/or wrapped in a tar archive; those are
//! unboxed before the check.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// `\0asm`
pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// Magic plus the 4-byte version field.
const MIN_WASM_LEN: usize = 8;

/// Upper bound on decompressed sizes, guards against gzip bombs.
const MAX_UNBOXED_BYTES: u64 = 256 * 1024 * 1024;

/// Nesting depth at which unboxing gives up.
const MAX_UNBOX_DEPTH: usize = 4;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// Whether `bytes` looks like a WebAssembly binary.
pub fn is_wasm(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_WASM_LEN && bytes[..4] == WASM_MAGIC
}

/// Reject anything that is not a WebAssembly binary.
pub fn validate_module(url: &str, bytes: &[u8]) -> CacheResult<()> {
    if bytes.len() < MIN_WASM_LEN {
        return Err(CacheError::InvalidModule {
            url: url.to_string(),
            reason: format!(
                "binary is {} bytes, at least {} required",
                bytes.len(),
                MIN_WASM_LEN
            ),
        });
    }
    if bytes[..4] != WASM_MAGIC {
        return Err(CacheError::InvalidModule {
            url: url.to_string(),
            reason: format!("unexpected magic number {:02x?}", &bytes[..4]),
        });
    }
    Ok(())
}

/// Peel gzip and tar layers until a wasm binary appears.
///
/// Returns the input unchanged if it is already wasm, is neither gzip nor
/// tar, or if any layer fails to decode.
pub fn unbox(origin: Vec<u8>) -> Vec<u8> {
    let mut current = origin.clone();
    for _ in 0..=MAX_UNBOX_DEPTH {
        if is_wasm(&current) {
            return current;
        }
        let next = if is_gzip(&current) {
            gunzip(&current)
        } else if is_posix_tar(&current) {
            first_file_from_tar(&current)
        } else {
            return origin;
        };
        match next {
            Ok(bytes) => current = bytes,
            Err(e) => {
                debug!(error = %e, "payload unboxing failed, keeping original bytes");
                return origin;
            }
        }
    }
    origin
}

/// Extract the entry named `file_name` from a gzip'd tar archive.
pub(crate) fn file_from_tar_gz(bytes: &[u8], file_name: &str) -> std::io::Result<Vec<u8>> {
    let decoder = GzDecoder::new(bytes).take(MAX_UNBOXED_BYTES);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        if path.file_name() == Some(Path::new(file_name).as_os_str()) {
            let mut out = Vec::new();
            entry.read_to_end(&mut out)?;
            return Ok(out);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} not found in layer", file_name),
    ))
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() > 2 && bytes[..2] == GZIP_MAGIC
}

fn is_posix_tar(bytes: &[u8]) -> bool {
    bytes.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &bytes[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .take(MAX_UNBOXED_BYTES)
        .read_to_end(&mut out)?;
    Ok(out)
}

fn first_file_from_tar(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut out = Vec::new();
        entry.take(MAX_UNBOXED_BYTES).read_to_end(&mut out)?;
        return Ok(out);
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "tar archive has no regular file",
    ))
}
