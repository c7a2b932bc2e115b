//! Detached signature verification
//!
//! A signed bundle carries `signature.sig`, a minisign signature box over
//! the exact bytes of `checksums.txt`. Since every file in the archive is
//! pinned by the checksum manifest, verifying the manifest signature seals
//! the whole bundle.

use minisign::{PublicKey, PublicKeyBox, SignatureBox};
use std::io::Cursor;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Load a public key from its base64 box representation (the contents of a
/// `.pub` file).
pub fn load_public_key(content: &str) -> Result<PublicKey> {
    let pk_box = PublicKeyBox::from_string(content).map_err(|e| CoreError::SignatureInvalid {
        message: format!("failed to parse public key: {e}"),
    })?;
    pk_box
        .into_public_key()
        .map_err(|e| CoreError::SignatureInvalid {
            message: format!("failed to decode public key: {e}"),
        })
}

/// Verify the signature file over the checksum manifest bytes.
pub fn verify_checksums(
    checksums: &[u8],
    signature_path: &Path,
    public_key: &PublicKey,
) -> Result<()> {
    let sig_content = std::fs::read_to_string(signature_path)?;
    let sig_box = SignatureBox::from_string(&sig_content).map_err(|e| {
        CoreError::SignatureInvalid {
            message: format!("failed to parse {}: {e}", signature_path.display()),
        }
    })?;

    let mut cursor = Cursor::new(checksums);
    minisign::verify(public_key, &sig_box, &mut cursor, true, false, false).map_err(|e| {
        CoreError::SignatureInvalid {
            message: e.to_string(),
        }
    })
}

/// Enforce the signing policy for an extracted bundle.
///
/// - signature + key: verify
/// - signature, no key: fatal, the user must supply the key
/// - key, no signature: fatal, the bundle is unsigned
/// - neither: nothing to do
pub fn enforce_policy(root: &Path, public_key: Option<&PublicKey>) -> Result<()> {
    let signature_path = root.join(crate::bundle::SIGNATURE_FILE);
    match (signature_path.exists(), public_key) {
        (true, Some(pk)) => {
            let checksums = std::fs::read(root.join(crate::bundle::CHECKSUMS_FILE))?;
            verify_checksums(&checksums, &signature_path, pk)
        }
        (true, None) => Err(CoreError::SignatureKeyRequired),
        (false, Some(_)) => Err(CoreError::SignatureMissing),
        (false, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minisign::KeyPair;
    use tempfile::TempDir;

    fn signed_bundle(temp: &TempDir) -> PublicKey {
        let KeyPair { pk, sk } = KeyPair::generate_unencrypted_keypair().unwrap();
        let checksums = b"aa11  airlift.yaml\n";
        std::fs::write(temp.path().join("checksums.txt"), checksums).unwrap();

        let mut cursor = Cursor::new(&checksums[..]);
        let sig = minisign::sign(None, &sk, &mut cursor, None, None).unwrap();
        std::fs::write(temp.path().join("signature.sig"), sig.to_string()).unwrap();
        pk
    }

    #[test]
    fn valid_signature_passes() {
        let temp = TempDir::new().unwrap();
        let pk = signed_bundle(&temp);
        enforce_policy(temp.path(), Some(&pk)).unwrap();
    }

    #[test]
    fn tampered_checksums_fail() {
        let temp = TempDir::new().unwrap();
        let pk = signed_bundle(&temp);
        std::fs::write(temp.path().join("checksums.txt"), b"bb22  evil.yaml\n").unwrap();

        let err = enforce_policy(temp.path(), Some(&pk)).unwrap_err();
        assert!(matches!(err, CoreError::SignatureInvalid { .. }));
    }

    #[test]
    fn signed_bundle_requires_key() {
        let temp = TempDir::new().unwrap();
        signed_bundle(&temp);
        let err = enforce_policy(temp.path(), None).unwrap_err();
        assert!(matches!(err, CoreError::SignatureKeyRequired));
    }

    #[test]
    fn key_without_signature_fails() {
        let temp = TempDir::new().unwrap();
        let pk = signed_bundle(&temp);
        std::fs::remove_file(temp.path().join("signature.sig")).unwrap();
        let err = enforce_policy(temp.path(), Some(&pk)).unwrap_err();
        assert!(matches!(err, CoreError::SignatureMissing));
    }

    #[test]
    fn unsigned_without_key_is_fine() {
        let temp = TempDir::new().unwrap();
        enforce_policy(temp.path(), None).unwrap();
    }
}
