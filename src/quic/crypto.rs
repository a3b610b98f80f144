//! Packet protection keys (RFC 9001)
//!
//! [`Aead`] is the per-level sealer/opener consumed by the codec. [`RingAead`]
//! implements it with AES-128-GCM and AES header protection from `ring`.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;
use std::fmt;

use crate::quic::error::{CryptoError, Result};
use crate::quic::state::Role;

/// Initial salt for QUIC version 1
pub const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17,
    0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];

const RETRY_INTEGRITY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// Bytes of ciphertext sampled for header protection
pub const SAMPLE_LEN: usize = 16;

/// Header protection mask length
pub const MASK_LEN: usize = 5;

/// Per-level packet protection
pub trait Aead: Send + Sync + fmt::Debug {
    /// Seal an outgoing payload with the header as associated data
    fn seal(&self, packet_number: u64, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Open an incoming payload; fails on any authentication error
    fn open(&self, packet_number: u64, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Header protection mask for an outgoing packet
    fn encrypt_header_sample(&self, sample: &[u8]) -> Result<[u8; MASK_LEN]>;

    /// Header protection mask for an incoming packet
    fn decrypt_header_sample(&self, sample: &[u8]) -> Result<[u8; MASK_LEN]>;

    fn tag_len(&self) -> usize;
}

/// Raw key material for one direction of one level
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: [u8; 16],
    pub iv: [u8; 12],
    pub hp: [u8; 16],
}

impl KeyMaterial {
    /// Expand packet protection keys from a traffic secret
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let mut material = Self { key: [0; 16], iv: [0; 12], hp: [0; 16] };
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
        expand_label_into(&prk, b"quic key", &mut material.key)?;
        expand_label_into(&prk, b"quic iv", &mut material.iv)?;
        expand_label_into(&prk, b"quic hp", &mut material.hp)?;
        Ok(material)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

struct DirectionalKeys {
    key: LessSafeKey,
    iv: [u8; 12],
    hp: aead::quic::HeaderProtectionKey,
}

impl DirectionalKeys {
    fn new(material: &KeyMaterial) -> Result<Self> {
        let unbound = UnboundKey::new(&aead::AES_128_GCM, &material.key)
            .map_err(|_| CryptoError::KeyDerivation("invalid AEAD key".to_string()))?;
        let hp = aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &material.hp)
            .map_err(|_| CryptoError::KeyDerivation("invalid header protection key".to_string()))?;
        Ok(Self { key: LessSafeKey::new(unbound), iv: material.iv, hp })
    }

    fn nonce(&self, packet_number: u64) -> Nonce {
        let mut nonce = self.iv;
        for (byte, pn_byte) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
            *byte ^= pn_byte;
        }
        Nonce::assume_unique_for_key(nonce)
    }

    fn mask(&self, sample: &[u8]) -> Result<[u8; MASK_LEN]> {
        if sample.len() != SAMPLE_LEN {
            return Err(CryptoError::HeaderProtection(format!("sample of {} bytes", sample.len())).into());
        }
        self.hp
            .new_mask(sample)
            .map_err(|_| CryptoError::HeaderProtection("mask generation failed".to_string()).into())
    }
}

/// AES-128-GCM packet protection for one level, sealing with the local
/// keys and opening with the remote keys
pub struct RingAead {
    local: DirectionalKeys,
    remote: DirectionalKeys,
}

impl RingAead {
    pub fn new(local: &KeyMaterial, remote: &KeyMaterial) -> Result<Self> {
        Ok(Self {
            local: DirectionalKeys::new(local)?,
            remote: DirectionalKeys::new(remote)?,
        })
    }

    /// Build from the client and server traffic secrets of a level
    pub fn from_secrets(role: Role, client_secret: &[u8], server_secret: &[u8]) -> Result<Self> {
        let client = KeyMaterial::from_secret(client_secret)?;
        let server = KeyMaterial::from_secret(server_secret)?;
        match role {
            Role::Client => Self::new(&client, &server),
            Role::Server => Self::new(&server, &client),
        }
    }
}

impl fmt::Debug for RingAead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingAead").finish_non_exhaustive()
    }
}

impl Aead for RingAead {
    fn seal(&self, packet_number: u64, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut in_out = Vec::with_capacity(plaintext.len() + self.tag_len());
        in_out.extend_from_slice(plaintext);
        self.local
            .key
            .seal_in_place_append_tag(self.local.nonce(packet_number), Aad::from(header), &mut in_out)
            .map_err(|_| CryptoError::Encryption)?;
        Ok(in_out)
    }

    fn open(&self, packet_number: u64, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut in_out = ciphertext.to_vec();
        let plaintext_len = self
            .remote
            .key
            .open_in_place(self.remote.nonce(packet_number), Aad::from(header), &mut in_out)
            .map_err(|_| CryptoError::Decryption)?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    fn encrypt_header_sample(&self, sample: &[u8]) -> Result<[u8; MASK_LEN]> {
        self.local.mask(sample)
    }

    fn decrypt_header_sample(&self, sample: &[u8]) -> Result<[u8; MASK_LEN]> {
        self.remote.mask(sample)
    }

    fn tag_len(&self) -> usize {
        aead::AES_128_GCM.tag_len()
    }
}

struct Len(usize);

impl hkdf::KeyType for Len {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label (RFC 8446 Section 7.1) with an empty context
fn expand_label_into(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) -> Result<()> {
    let length = (out.len() as u16).to_be_bytes();
    let label_len = [(b"tls13 ".len() + label.len()) as u8];
    let info: [&[u8]; 5] = [&length, &label_len, b"tls13 ", label, &[0]];
    prk.expand(&info, Len(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| CryptoError::KeyDerivation(format!("expand {}", String::from_utf8_lossy(label))).into())
}

/// Extract with `salt` and expand two labelled 32-byte secrets, returned in
/// label order
pub fn derive_secret_pair(salt: &[u8], ikm: &[u8], first: &[u8], second: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(ikm);
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    expand_label_into(&prk, first, &mut a)?;
    expand_label_into(&prk, second, &mut b)?;
    Ok((a, b))
}

/// Client and server Initial secrets for a destination connection id
pub fn initial_secrets(dcid: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    derive_secret_pair(&INITIAL_SALT, dcid, b"client in", b"server in")
}

/// Initial level protection keyed on the client's original destination id
pub fn initial_aead(dcid: &[u8], role: Role) -> Result<RingAead> {
    let (client, server) = initial_secrets(dcid)?;
    RingAead::from_secrets(role, &client, &server)
}

fn retry_key() -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY)
        .map_err(|_| CryptoError::KeyDerivation("invalid retry key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

fn retry_pseudo_packet(original_dcid: &[u8], retry_without_tag: &[u8]) -> Vec<u8> {
    let mut pseudo = Vec::with_capacity(1 + original_dcid.len() + retry_without_tag.len());
    pseudo.push(original_dcid.len() as u8);
    pseudo.extend_from_slice(original_dcid);
    pseudo.extend_from_slice(retry_without_tag);
    pseudo
}

/// Retry integrity tag (RFC 9001 Section 5.8)
pub fn retry_integrity_tag(original_dcid: &[u8], retry_without_tag: &[u8]) -> Result<[u8; 16]> {
    let pseudo = retry_pseudo_packet(original_dcid, retry_without_tag);
    let tag = retry_key()?
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE),
            Aad::from(pseudo.as_slice()),
            &mut [0u8; 0],
        )
        .map_err(|_| CryptoError::Encryption)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(tag.as_ref());
    Ok(out)
}

/// Verify the tag at the end of a full Retry packet
pub fn verify_retry_integrity(original_dcid: &[u8], retry_packet: &[u8]) -> Result<()> {
    if retry_packet.len() < 16 {
        return Err(CryptoError::RetryIntegrity.into());
    }
    let (body, tag) = retry_packet.split_at(retry_packet.len() - 16);
    let pseudo = retry_pseudo_packet(original_dcid, body);
    let mut in_out = tag.to_vec();
    retry_key()?
        .open_in_place(
            Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE),
            Aad::from(pseudo.as_slice()),
            &mut in_out,
        )
        .map_err(|_| CryptoError::RetryIntegrity)?;
    Ok(())
}
