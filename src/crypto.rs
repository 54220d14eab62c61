/*!
Crypto things: at-rest encryption of provider tokens, session
token signing, and local password hashing.
*/
use ring::aead::BoundKey;
use std::num::NonZeroU32;

const PBKDF2_ROUNDS: u32 = 100_000;

/// ring requires an implementor of `NonceSequence`,
/// which is a wrapping trait around `ring::aead::Nonce`.
/// We have to make a wrapper that can pass ownership
/// of the nonce exactly once.
struct OneNonceSequence {
    inner: Option<ring::aead::Nonce>,
}
impl OneNonceSequence {
    fn new(inner: ring::aead::Nonce) -> Self {
        Self { inner: Some(inner) }
    }
}

impl ring::aead::NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> std::result::Result<ring::aead::Nonce, ring::error::Unspecified> {
        self.inner.take().ok_or(ring::error::Unspecified)
    }
}

/// Return a `Vec` of secure random bytes of size `n`
pub fn rand_bytes(n: usize) -> crate::Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| "Error getting random bytes")?;
    Ok(buf)
}

pub fn new_nonce() -> crate::Result<Vec<u8>> {
    rand_bytes(12)
}

pub fn hmac_sign(s: &str) -> String {
    // using a 32 byte key
    let s_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &crate::CONFIG.enc_key.as_bytes());
    let tag = ring::hmac::sign(&s_key, s.as_bytes());
    hex::encode(&tag)
}

/// Return the SHA256 hash of `bytes`
pub fn hash(bytes: &[u8]) -> Vec<u8> {
    let alg = &ring::digest::SHA256;
    let digest = ring::digest::digest(alg, bytes);
    Vec::from(digest.as_ref())
}

/// An encrypted value and the nonce used to encrypt it,
/// both hex encoded for storage.
pub struct Enc {
    pub value: String,
    pub nonce: String,
}

/// Encrypt `s` with the application key, returning the hex
/// encoded ciphertext and nonce pair
pub fn encrypt(s: &str) -> crate::Result<Enc> {
    let nonce = new_nonce()?;
    let b = encrypt_bytes(s.as_bytes(), &nonce, crate::CONFIG.enc_key.as_bytes())?;
    Ok(Enc {
        value: hex::encode(&b),
        nonce: hex::encode(&nonce),
    })
}

/// Decrypt an `Enc` back into the original string
pub fn decrypt(enc: &Enc) -> crate::Result<String> {
    let nonce = hex::decode(&enc.nonce).map_err(|e| format!("nonce hex decode error {}", e))?;
    let mut value = hex::decode(&enc.value).map_err(|e| format!("value hex decode error {}", e))?;
    let bytes = decrypt_bytes(value.as_mut_slice(), &nonce, crate::CONFIG.enc_key.as_bytes())?;
    Ok(String::from_utf8(bytes.to_owned()).map_err(|e| format!("utf8 decode error {}", e))?)
}

/// Encrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are encrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn encrypt_bytes(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> crate::Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| "Encryption nonce not unique")?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass).map_err(|_| "Error building sealing key")?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| "Failed encrypting bytes")?;
    Ok(in_out)
}

/// Decrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are decrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn decrypt_bytes<'a>(bytes: &'a mut [u8], nonce: &[u8], pass: &[u8]) -> crate::Result<&'a [u8]> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| "Decryption nonce not unique")?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass).map_err(|_| "Error building opening key")?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| "Failed decrypting bytes")?;
    Ok(out_slice)
}

/// Hash a password with PBKDF2-HMAC-SHA256 and a fresh salt,
/// returning the hex encoded `(salt, hash)` pair
pub fn hash_password(password: &str) -> crate::Result<(String, String)> {
    let salt = rand_bytes(16)?;
    let rounds = NonZeroU32::new(PBKDF2_ROUNDS).expect("non-zero pbkdf2 rounds");
    let mut out = [0u8; 32];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        &salt,
        password.as_bytes(),
        &mut out,
    );
    Ok((hex::encode(&salt), hex::encode(&out)))
}

/// Verify a password against a stored hex encoded `(salt, hash)` pair
pub fn verify_password(password: &str, salt_hex: &str, hash_hex: &str) -> bool {
    let salt = match hex::decode(salt_hex) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let expected = match hex::decode(hash_hex) {
        Ok(h) => h,
        Err(_) => return false,
    };
    let rounds = NonZeroU32::new(PBKDF2_ROUNDS).expect("non-zero pbkdf2 rounds");
    ring::pbkdf2::verify(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        &salt,
        password.as_bytes(),
        &expected,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let enc = encrypt("BQDe4db...some-access-token").expect("encrypt error");
        assert_ne!(enc.value, "BQDe4db...some-access-token");
        let plain = decrypt(&enc).expect("decrypt error");
        assert_eq!(plain, "BQDe4db...some-access-token");
    }

    #[test]
    fn encrypt_uses_fresh_nonces() {
        let a = encrypt("same-value").expect("encrypt error");
        let b = encrypt("same-value").expect("encrypt error");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.value, b.value);
    }

    #[test]
    fn hmac_sign_is_deterministic() {
        assert_eq!(hmac_sign("token-a"), hmac_sign("token-a"));
        assert_ne!(hmac_sign("token-a"), hmac_sign("token-b"));
    }

    #[test]
    fn password_hash_and_verify() {
        let (salt, hash) = hash_password("hunter2hunter2").expect("hash error");
        assert!(verify_password("hunter2hunter2", &salt, &hash));
        assert!(!verify_password("hunter2hunter3", &salt, &hash));
    }

    #[test]
    fn password_verify_rejects_bad_encodings() {
        assert!(!verify_password("pw", "not-hex", "also-not-hex"));
    }
}
