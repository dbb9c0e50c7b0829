//! Encrypted part framing.
//!
//! An encrypted part is a 34-byte header followed by sealed blocks:
//!
//! ```text
//! magic[10] "TELDRIVE\0\0" | nonce[24] | seal(nonce + 0, data_0) | seal(nonce + 1, data_1) | ...
//! ```
//!
//! Each sealed block is a 16-byte Poly1305 tag followed by up to 64 KiB of
//! XSalsa20 ciphertext. The block nonce is the file nonce incremented by the
//! block index with little-endian carry. Keys come from scrypt over the
//! passphrase and the per-part salt.

use crate::{Error, Result};
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::{Tag, XSalsa20Poly1305};
use rand::RngCore;
use std::fmt;

/// Header magic.
pub const MAGIC: &[u8; 10] = b"TELDRIVE\0\0";
/// Nonce length in bytes.
pub const NONCE_LEN: usize = 24;
/// Total header length: magic plus nonce.
pub const HEADER_LEN: u64 = (MAGIC.len() + NONCE_LEN) as u64;
/// Plaintext bytes per sealed block.
pub const BLOCK_DATA_SIZE: u64 = 64 * 1024;
/// Authenticator bytes per sealed block.
pub const BLOCK_TAG_SIZE: u64 = 16;
/// Full sealed block size.
pub const BLOCK_SIZE: u64 = BLOCK_DATA_SIZE + BLOCK_TAG_SIZE;

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_MATERIAL_LEN: usize = 96;

/// Stored size of an encrypted part holding `plain` plaintext bytes.
pub fn encrypted_size(plain: u64) -> u64 {
    let blocks = plain / BLOCK_DATA_SIZE;
    let residue = plain % BLOCK_DATA_SIZE;
    let mut size = HEADER_LEN + blocks * BLOCK_SIZE;
    if residue != 0 {
        size += BLOCK_TAG_SIZE + residue;
    }
    size
}

/// Plaintext size of an encrypted part whose stored size is `stored`.
pub fn decrypted_size(stored: u64) -> Result<u64> {
    if stored < HEADER_LEN {
        return Err(Error::FileTooShort);
    }
    let body = stored - HEADER_LEN;
    let blocks = body / BLOCK_SIZE;
    let residue = body % BLOCK_SIZE;
    let mut size = blocks * BLOCK_DATA_SIZE;
    if residue != 0 {
        if residue <= BLOCK_TAG_SIZE {
            return Err(Error::BadSize(stored));
        }
        size += residue - BLOCK_TAG_SIZE;
    }
    Ok(size)
}

/// 24-byte XSalsa20 nonce.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random nonce for a new part.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Nonce advanced by `n`, with little-endian carry across all 24 bytes.
    pub fn add(&self, n: u64) -> Self {
        let mut out = self.0;
        let mut carry = n as u128;
        for byte in out.iter_mut() {
            if carry == 0 {
                break;
            }
            let sum = *byte as u128 + (carry & 0xff);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
        Self(out)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(&self.0[..8]))
    }
}

/// Parse the part header and return the file nonce.
pub fn parse_header(header: &[u8]) -> Result<Nonce> {
    if (header.len() as u64) < HEADER_LEN {
        return Err(Error::FileTooShort);
    }
    if &header[..MAGIC.len()] != MAGIC {
        return Err(Error::BadMagic);
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&header[MAGIC.len()..HEADER_LEN as usize]);
    Ok(Nonce(nonce))
}

/// Serialise a part header.
pub fn encode_header(nonce: &Nonce) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN as usize);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&nonce.0);
    out
}

/// Per-part block cipher keyed from a passphrase and salt.
#[derive(Clone)]
pub struct Cipher {
    aead: XSalsa20Poly1305,
}

impl Cipher {
    /// Derive the data key with scrypt(N=16384, r=8, p=1, 96 bytes).
    ///
    /// The first 32 bytes are the data key. The name key and tweak that
    /// follow are not used at the chunk layer.
    pub fn new(passphrase: &str, salt: &str) -> Result<Self> {
        // `len` only feeds the PHC string; the output length is the buffer's.
        let params = scrypt::Params::new(
            SCRYPT_LOG_N,
            SCRYPT_R,
            SCRYPT_P,
            scrypt::Params::RECOMMENDED_LEN,
        )
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        let mut material = [0u8; KEY_MATERIAL_LEN];
        scrypt::scrypt(
            passphrase.as_bytes(),
            salt.as_bytes(),
            &params,
            &mut material,
        )
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        Self::from_key(&material[..32])
    }

    /// Build a cipher from a raw 32-byte data key.
    pub fn from_key(key: &[u8]) -> Result<Self> {
        let aead = XSalsa20Poly1305::new_from_slice(key)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        Ok(Self { aead })
    }

    /// Seal one block: returns `tag || ciphertext`.
    pub fn seal_block(&self, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(plaintext.len() + BLOCK_TAG_SIZE as usize);
        out.extend_from_slice(&[0u8; BLOCK_TAG_SIZE as usize]);
        out.extend_from_slice(plaintext);
        let (tag_slot, body) = out.split_at_mut(BLOCK_TAG_SIZE as usize);
        // Encryption with a valid key and nonce cannot fail for in-memory buffers.
        if let Ok(tag) = self
            .aead
            .encrypt_in_place_detached(GenericArray::from_slice(nonce.as_bytes()), b"", body)
        {
            tag_slot.copy_from_slice(&tag);
        }
        out
    }

    /// Open one sealed block (`tag || ciphertext`).
    pub fn open_block(&self, nonce: &Nonce, sealed: &[u8]) -> Result<Vec<u8>> {
        if (sealed.len() as u64) <= BLOCK_TAG_SIZE {
            return Err(Error::BlockAuthentication);
        }
        let (tag, body) = sealed.split_at(BLOCK_TAG_SIZE as usize);
        let mut plain = body.to_vec();
        self.aead
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce.as_bytes()),
                b"",
                &mut plain,
                Tag::from_slice(tag),
            )
            .map_err(|_| Error::BlockAuthentication)?;
        Ok(plain)
    }

    /// Encrypt a whole part with the given file nonce.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(encrypted_size(plaintext.len() as u64) as usize);
        out.extend_from_slice(&encode_header(nonce));
        for (index, block) in plaintext.chunks(BLOCK_DATA_SIZE as usize).enumerate() {
            out.extend_from_slice(&self.seal_block(&nonce.add(index as u64), block));
        }
        out
    }

    /// Decrypt a whole stored part. Fails on the first bad block.
    pub fn decrypt(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let nonce = parse_header(stored)?;
        let plain_len = decrypted_size(stored.len() as u64)?;
        let mut out = Vec::with_capacity(plain_len as usize);
        let body = &stored[HEADER_LEN as usize..];
        for (index, sealed) in body.chunks(BLOCK_SIZE as usize).enumerate() {
            out.extend_from_slice(&self.open_block(&nonce.add(index as u64), sealed)?);
        }
        Ok(out)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(<redacted>)")
    }
}

/// Generate a random per-part salt (hex encoded, 32 chars).
pub fn random_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_formulae_roundtrip() {
        for n in [
            0u64,
            1,
            16,
            65535,
            65536,
            65537,
            131072,
            1_048_576,
            2_000_000,
            (BLOCK_DATA_SIZE * 3) + 17,
        ] {
            assert_eq!(decrypted_size(encrypted_size(n)).unwrap(), n, "n = {n}");
        }
    }

    #[test]
    fn test_encrypted_size_closed_form() {
        for n in [0u64, 1, 65536, 65537, 1_000_000] {
            let blocks = n.div_ceil(BLOCK_DATA_SIZE);
            assert_eq!(encrypted_size(n), HEADER_LEN + n + blocks * BLOCK_TAG_SIZE);
        }
    }

    #[test]
    fn test_decrypted_size_errors() {
        assert!(matches!(decrypted_size(10), Err(Error::FileTooShort)));
        assert!(matches!(
            decrypted_size(HEADER_LEN + 16),
            Err(Error::BadSize(_))
        ));
    }

    #[test]
    fn test_nonce_add_carries_little_endian() {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[0] = 0xff;
        bytes[1] = 0xff;
        let n = Nonce::from_bytes(bytes).add(1);
        assert_eq!(&n.as_bytes()[..3], &[0, 0, 1]);

        let all = Nonce::from_bytes([0xff; NONCE_LEN]).add(1);
        assert_eq!(all.as_bytes(), &[0u8; NONCE_LEN]);

        let big = Nonce::from_bytes([0u8; NONCE_LEN]).add(0x0102);
        assert_eq!(&big.as_bytes()[..2], &[0x02, 0x01]);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = Cipher::from_key(&[9u8; 32]).unwrap();
        let nonce = Nonce::random();
        let plain: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();

        let stored = cipher.encrypt(&nonce, &plain);
        assert_eq!(stored.len() as u64, encrypted_size(plain.len() as u64));
        assert_eq!(&stored[..10], MAGIC);
        assert_eq!(cipher.decrypt(&stored).unwrap(), plain);
    }

    #[test]
    fn test_header_checks() {
        assert!(matches!(parse_header(b"short"), Err(Error::FileTooShort)));
        let mut header = encode_header(&Nonce::random());
        header[0] = b'X';
        assert!(matches!(parse_header(&header), Err(Error::BadMagic)));
    }

    #[test]
    fn test_tampered_block_fails_authentication() {
        let cipher = Cipher::from_key(&[1u8; 32]).unwrap();
        let nonce = Nonce::random();
        let mut sealed = cipher.seal_block(&nonce, b"hello");
        *sealed.last_mut().unwrap() ^= 1;
        assert!(matches!(
            cipher.open_block(&nonce, &sealed),
            Err(Error::BlockAuthentication)
        ));
    }

    #[test]
    fn test_scrypt_key_is_deterministic() {
        let a = Cipher::new("p", "s").unwrap();
        let b = Cipher::new("p", "s").unwrap();
        let nonce = Nonce::from_bytes([3u8; NONCE_LEN]);
        assert_eq!(a.seal_block(&nonce, b"x"), b.seal_block(&nonce, b"x"));
    }

    #[test]
    fn test_passphrase_key_is_head_of_material() {
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32).unwrap();
        let mut material = [0u8; KEY_MATERIAL_LEN];
        scrypt::scrypt(b"pass", b"salt", &params, &mut material).unwrap();

        let derived = Cipher::new("pass", "salt").unwrap();
        let direct = Cipher::from_key(&material[..32]).unwrap();
        let other_salt = Cipher::new("pass", "pepper").unwrap();
        let nonce = Nonce::from_bytes([7u8; NONCE_LEN]);
        let sealed = derived.seal_block(&nonce, b"block");
        assert_eq!(sealed, direct.seal_block(&nonce, b"block"));
        assert_ne!(sealed, other_salt.seal_block(&nonce, b"block"));
        assert!(other_salt.open_block(&nonce, &sealed).is_err());
    }
}
