//! Keyring I/O and the vote signer.
//!
//! Only the `test` backend is supported: the feeder's secp256k1 key lives
//! as a hex file named after its address inside the keyring directory. The
//! passphrase is taken from `PRICE_FEEDER_PASS` or prompted on stdin.

use std::io::{BufRead, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, SignOnly};
use sha2::{Digest, Sha256};

use crate::chain::ChainClientError;

/// Environment variable carrying the keyring passphrase.
pub const ENV_KEYRING_PASS: &str = "PRICE_FEEDER_PASS";

const BACKEND_TEST: &str = "test";

/// Signs amino sign-docs with the feeder key.
#[derive(Clone)]
pub struct Signer {
    secp: Secp256k1<SignOnly>,
    secret: SecretKey,
    public: PublicKey,
}

impl Signer {
    pub fn from_hex(hex_key: &str) -> Result<Self, ChainClientError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| ChainClientError::Keyring(format!("key is not valid hex: {e}")))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| ChainClientError::Keyring(format!("invalid secp256k1 key: {e}")))?;
        let secp = Secp256k1::signing_only();
        let public = secret.public_key(&secp);
        Ok(Self {
            secp,
            secret,
            public,
        })
    }

    /// Sign sha256(bytes); returns (base64 signature, base64 compressed
    /// public key) as they appear in a `StdTx` signature entry.
    pub fn sign(&self, bytes: &[u8]) -> (String, String) {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        let message = Message::from_digest(digest);
        let signature = self.secp.sign_ecdsa(&message, &self.secret);
        (
            BASE64.encode(signature.serialize_compact()),
            BASE64.encode(self.public.serialize()),
        )
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

/// Load the signer for `address` from the configured keyring.
pub fn load_signer(
    backend: &str,
    dir: &str,
    address: &str,
    _passphrase: &str,
) -> Result<Signer, ChainClientError> {
    if backend != BACKEND_TEST {
        return Err(ChainClientError::Keyring(format!(
            "unsupported keyring backend {backend:?}, only \"test\" is available"
        )));
    }

    let key_path = Path::new(dir).join(format!("{address}.key"));
    let hex_key = std::fs::read_to_string(&key_path).map_err(|e| {
        ChainClientError::Keyring(format!("failed to read {}: {e}", key_path.display()))
    })?;
    Signer::from_hex(&hex_key)
}

/// The keyring passphrase, from the environment or an stdin prompt. With
/// `skip_prompt` set the environment value is used as-is, possibly empty.
pub fn keyring_password(skip_prompt: bool) -> anyhow::Result<String> {
    let pass = std::env::var(ENV_KEYRING_PASS).unwrap_or_default();
    if skip_prompt || !pass.is_empty() {
        return Ok(pass);
    }

    print!("Enter keyring passphrase: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(Signer::from_hex("not hex at all").is_err());
        assert!(Signer::from_hex("00").is_err());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = "c9ff48cb12e4446ba2df2fdfbc1a4a2bb94a255ecec9ff48cb12e4446ba2df2f";
        let signer = Signer::from_hex(key).unwrap();
        let (sig_a, pub_a) = signer.sign(b"vote payload");
        let (sig_b, pub_b) = signer.sign(b"vote payload");
        assert_eq!(sig_a, sig_b);
        assert_eq!(pub_a, pub_b);

        let (sig_c, _) = signer.sign(b"different payload");
        assert_ne!(sig_a, sig_c);
    }

    #[test]
    fn test_load_signer_rejects_other_backends() {
        let err = load_signer("os", "/tmp", "kii1feeder", "").unwrap_err();
        assert!(err.to_string().contains("unsupported keyring backend"));
    }

    #[test]
    fn test_load_signer_reads_key_file() {
        let dir = std::env::temp_dir().join("price-feeder-keyring-test");
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("kii1feeder.key");
        std::fs::write(
            &key_path,
            "c9ff48cb12e4446ba2df2fdfbc1a4a2bb94a255ecec9ff48cb12e4446ba2df2f\n",
        )
        .unwrap();

        let signer = load_signer(
            "test",
            dir.to_str().unwrap(),
            "kii1feeder",
            "",
        )
        .unwrap();
        let (signature, pub_key) = signer.sign(b"payload");
        assert!(!signature.is_empty());
        assert!(!pub_key.is_empty());

        std::fs::remove_file(key_path).ok();
    }
}
