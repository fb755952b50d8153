//! Encryption, compression, and package-structure validation for migration
//! packages: AES-256-GCM with a random 12-byte nonce prepended to the
//! ciphertext, gzip compression with a decompression-bomb guard (ratio and
//! absolute-size caps), and the required-field checks
//! `validate_package_structure` runs before trusting an uploaded package.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression as GzLevel;
use rand::RngCore;
use std::io::Read;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::migration::package::{CollectionMetadata, Compression, MigrationPackage};

const NONCE_LEN: usize = 12;

pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| ClusterError::Encryption(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(payload: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if payload.len() < NONCE_LEN {
        return Err(ClusterError::Encryption("ciphertext shorter than nonce".to_string()));
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| ClusterError::Encryption(e.to_string()))
}

pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(data, GzLevel::default());
            let mut out = Vec::new();
            encoder
                .read_to_end(&mut out)
                .map_err(|e| ClusterError::Internal(format!("gzip compression failed: {e}")))?;
            Ok(out)
        }
        Compression::Bzip2 => Err(ClusterError::Validation(
            "bzip2 compression is not supported by this build".to_string(),
        )),
    }
}

/// Decompresses `data`, enforcing the same decompression-bomb guard the
/// source applies before trusting the inflated size: a hard byte cap and a
/// compressed:decompressed ratio cap, either of which aborts the read.
pub fn decompress(data: &[u8], compression: Compression, cfg: &ClusterConfig) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let max_bytes = cfg.migration_max_decompressed_bytes as usize;
            let mut out = Vec::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = decoder
                    .read(&mut buf)
                    .map_err(|e| ClusterError::Internal(format!("gzip decompression failed: {e}")))?;
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
                if out.len() > max_bytes {
                    return Err(ClusterError::DecompressionBomb(format!(
                        "decompressed size exceeded {max_bytes} bytes"
                    )));
                }
                if !data.is_empty() && out.len() / data.len().max(1) > cfg.migration_max_decompression_ratio as usize {
                    return Err(ClusterError::DecompressionBomb(format!(
                        "decompression ratio exceeded {}:1",
                        cfg.migration_max_decompression_ratio
                    )));
                }
            }
            Ok(out)
        }
        Compression::Bzip2 => Err(ClusterError::Validation(
            "bzip2 compression is not supported by this build".to_string(),
        )),
    }
}

/// Checks the required-field structure of a deserialized package: metadata
/// must carry a version and at least one declared collection, every
/// declared collection must have a matching export block, and the global
/// checksum must match the concatenation of the per-collection checksums,
/// recomputed here rather than trusted from the package itself.
pub fn validate_package_structure(package: &MigrationPackage) -> Result<()> {
    if package.metadata.version.is_empty() {
        return Err(ClusterError::Validation("package metadata missing version".to_string()));
    }
    if package.metadata.collections.is_empty() {
        return Err(ClusterError::Validation(
            "package metadata declares no collections".to_string(),
        ));
    }
    for declared in &package.metadata.collections {
        if !package.collections.iter().any(|c| c.collection_name == declared.name) {
            return Err(ClusterError::Validation(format!(
                "package metadata declares collection '{}' with no matching export block",
                declared.name
            )));
        }
    }
    let expected = package_checksum(&package.metadata.collections);
    if expected != package.metadata.checksum {
        return Err(ClusterError::ChecksumMismatch {
            expected,
            actual: package.metadata.checksum.clone(),
        });
    }
    Ok(())
}

/// The package-level checksum: the hex SHA-256 of the concatenation of every
/// declared collection's own checksum, in declaration order. Computed both
/// when a package is written and again when one is read, so a corrupted or
/// hand-edited collection block is caught without trusting a caller-supplied
/// value.
pub fn package_checksum(collections: &[CollectionMetadata]) -> String {
    let concatenated: String = collections.iter().map(|c| c.checksum.as_str()).collect();
    checksum(concatenated.as_bytes())
}

pub fn checksum(data: &[u8]) -> String {
    crate::util::sha256_hex(data)
}

pub fn verify_checksum(data: &[u8], expected: &str) -> Result<()> {
    let actual = checksum(data);
    if actual != expected {
        return Err(ClusterError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::package::{CollectionExportData, CollectionMetadata, PackageMetadata};
    use serde_json::json;

    fn sample_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let key = sample_key();
        let plaintext = b"migration package bytes";
        let ciphertext = encrypt(plaintext, &key).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = decrypt(&ciphertext, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let key = sample_key();
        let mut ciphertext = encrypt(b"data", &key).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(decrypt(&ciphertext, &key).is_err());
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"hello world hello world hello world".repeat(50);
        let compressed = compress(&data, Compression::Gzip).unwrap();
        let cfg = ClusterConfig::default();
        let decompressed = decompress(&compressed, Compression::Gzip, &cfg).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn bzip2_is_rejected_as_unsupported() {
        assert!(compress(b"data", Compression::Bzip2).is_err());
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let data = b"abc";
        let good = checksum(data);
        assert!(verify_checksum(data, &good).is_ok());
        assert!(verify_checksum(data, "deadbeef").is_err());
    }

    #[test]
    fn validate_package_structure_requires_matching_collection_blocks() {
        let collection_meta = vec![CollectionMetadata {
            name: "users".to_string(),
            document_count: 0,
            size_bytes: 0,
            checksum: checksum(b"[]"),
            indexes: vec![],
        }];
        let package = MigrationPackage {
            metadata: PackageMetadata {
                version: "1".to_string(),
                system_version: "1".to_string(),
                export_timestamp: "now".to_string(),
                exported_by: "u1".to_string(),
                tenant_id: None,
                collections: collection_meta.clone(),
                total_documents: 0,
                total_size_bytes: 0,
                checksum: package_checksum(&collection_meta),
                compression: Compression::None,
                description: None,
            },
            collections: vec![],
        };
        assert!(validate_package_structure(&package).is_err());

        let mut fixed = package;
        fixed.collections.push(CollectionExportData {
            collection_name: "users".to_string(),
            documents: vec![json!({})],
            indexes: vec![],
            metadata: json!({}),
        });
        assert!(validate_package_structure(&fixed).is_ok());
    }

    #[test]
    fn validate_package_structure_rejects_tampered_checksum() {
        let collection_meta = vec![CollectionMetadata {
            name: "users".to_string(),
            document_count: 1,
            size_bytes: 2,
            checksum: checksum(b"[{}]"),
            indexes: vec![],
        }];
        let package = MigrationPackage {
            metadata: PackageMetadata {
                version: "1".to_string(),
                system_version: "1".to_string(),
                export_timestamp: "now".to_string(),
                exported_by: "u1".to_string(),
                tenant_id: None,
                collections: collection_meta,
                total_documents: 1,
                total_size_bytes: 2,
                checksum: "tampered".to_string(),
                compression: Compression::None,
                description: None,
            },
            collections: vec![CollectionExportData {
                collection_name: "users".to_string(),
                documents: vec![json!({})],
                indexes: vec![],
                metadata: json!({}),
            }],
        };
        assert!(matches!(
            validate_package_structure(&package),
            Err(ClusterError::ChecksumMismatch { .. })
        ));
    }
}
