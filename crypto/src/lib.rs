pub mod guard;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::{random, Rng};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPublicKey};
use sha1::Sha1;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("rsa key of {0} bits is below the 1024 bit minimum")]
    KeyTooSmall(usize),
    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("Malformed message")]
    MalformedMessage,
    #[error("Invalid HMAC")]
    InvalidHmac,
}

pub type Result<T, E = CryptError> = std::result::Result<T, E>;

const SYSTEM_PUBLIC_KEY_DER_BYTES: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/system.der"));

static SYSTEM_PUBLIC_KEY: Lazy<RsaPublicKey> = Lazy::new(|| {
    RsaPublicKey::from_public_key_der(SYSTEM_PUBLIC_KEY_DER_BYTES)
        .expect("Failed to parse public key")
});

type HmacSha1 = Hmac<Sha1>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Session key for one encrypted channel, plus the material sent to the server.
///
/// `confirmation` is the HMAC-SHA1 of the wrapped blob under the first 16
/// bytes of the plain key, proving to the server that both sides hold the
/// same key without revealing it.
pub struct ChannelKey {
    pub plain: [u8; 32],
    pub encrypted: Vec<u8>,
    pub confirmation: [u8; 20],
}

/// Generate a fresh 32 byte session key wrapped for an arbitrary RSA public key.
///
/// When the channel-encrypt request carried a nonce it is appended to the key
/// before wrapping.
pub fn channel_key(public_key: &RsaPublicKey, nonce: Option<&[u8; 16]>) -> Result<ChannelKey> {
    let mut rng = rand::thread_rng();
    let plain: [u8; 32] = rng.gen();

    let encrypted = match nonce {
        Some(nonce) => {
            let mut data = [0; 48];
            data[0..32].copy_from_slice(&plain);
            data[32..48].copy_from_slice(nonce);
            public_key.encrypt(&mut rng, Oaep::new::<Sha1>(), &data)
        }
        None => public_key.encrypt(&mut rng, Oaep::new::<Sha1>(), &plain),
    }?;

    let mut mac: HmacSha1 = Mac::new_from_slice(&plain[0..16]).expect("hmac accepts any key length");
    mac.update(&encrypted);
    let confirmation: [u8; 20] = mac.finalize().into_bytes().into();

    Ok(ChannelKey {
        plain,
        encrypted,
        confirmation,
    })
}

/// Generate a session key wrapped for the steam "system" public key.
pub fn generate_session_key(nonce: Option<&[u8; 16]>) -> ChannelKey {
    channel_key(&SYSTEM_PUBLIC_KEY, nonce).expect("system key is large enough for a 48 byte wrap")
}

/// Wrap a web-api nonce for `ISteamUserAuth/AuthenticateUser` under the system key.
pub fn encrypt_with_system_key(data: &[u8]) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    Ok(SYSTEM_PUBLIC_KEY.encrypt(&mut rng, Oaep::new::<Sha1>(), data)?)
}

/// Encrypt `data` with PKCS#1 v1.5 under `key`.
///
/// Used for the password handshake; keys below 1024 bits are refused.
pub fn encrypt_with_key_pkcs1(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    let bits = key.size() * 8;
    if bits < 1024 {
        return Err(CryptError::KeyTooSmall(bits));
    }
    let mut rng = rand::thread_rng();
    Ok(key.encrypt(&mut rng, Pkcs1v15Encrypt, data)?)
}

/// Encrypt an initialization vector with AES 256 ECB.
fn encrypt_iv(iv: [u8; 16], key: &[u8; 32]) -> [u8; 16] {
    let iv_crypter = Aes256::new(GenericArray::from_slice(key));
    let mut iv_block = GenericArray::from(iv);
    iv_crypter.encrypt_block(&mut iv_block);
    iv_block.into()
}

/// Decrypt an initialization vector with AES 256 ECB.
fn decrypt_iv(iv: [u8; 16], key: &[u8; 32]) -> [u8; 16] {
    let iv_crypter = Aes256::new(GenericArray::from_slice(key));
    let mut iv_block = GenericArray::from(iv);
    iv_crypter.decrypt_block(&mut iv_block);
    iv_block.into()
}

fn encrypt_message(message: &[u8], key: &[u8; 32], plain_iv: &[u8; 16]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), plain_iv.into()).encrypt_padded_vec_mut::<Pkcs7>(message)
}

fn decrypt_message(message: &[u8], key: &[u8; 32], plain_iv: &[u8; 16]) -> Result<Vec<u8>> {
    Aes256CbcDec::new(key.into(), plain_iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(message)
        .map_err(|_| CryptError::MalformedMessage)
}

/// Encrypt `input`, prefixing the ECB-encrypted IV.
///
/// The IV doubles as an integrity check: its first 13 bytes are the HMAC-SHA1
/// of 3 random bytes followed by the plaintext, keyed with the first half of
/// the session key, and the random bytes fill the remaining 3.
pub fn symmetric_encrypt(input: BytesMut, key: &[u8; 32]) -> BytesMut {
    let hmac_random: [u8; 3] = random();

    let mut mac: HmacSha1 = Mac::new_from_slice(&key[0..16]).expect("hmac accepts any key length");
    mac.update(&hmac_random);
    mac.update(&input);
    let hmac: [u8; 20] = mac.finalize().into_bytes().into();

    let mut iv = [0; 16];
    iv[0..13].copy_from_slice(&hmac[0..13]);
    iv[13..].copy_from_slice(&hmac_random);

    let mut out = BytesMut::with_capacity(16 + input.len() + 16);
    out.extend_from_slice(&encrypt_iv(iv, key));
    out.extend_from_slice(&encrypt_message(&input, key, &iv));
    out
}

/// Decrypt the IV stored in the first 16 bytes of `input`
/// and use it to decrypt the remaining bytes.
pub fn symmetric_decrypt(mut input: BytesMut, key: &[u8; 32]) -> Result<BytesMut> {
    if input.len() < 32 {
        return Err(CryptError::MalformedMessage);
    }
    let message = input.split_off(16);
    let encrypted_iv: [u8; 16] = input.as_ref().try_into().expect("split at 16");
    let plain_iv = decrypt_iv(encrypted_iv, key);

    let message = decrypt_message(&message, key, &plain_iv)?;

    let hmac_random = &plain_iv[13..];
    let mut mac: HmacSha1 = Mac::new_from_slice(&key[0..16]).expect("hmac accepts any key length");
    mac.update(hmac_random);
    mac.update(&message);
    let hmac: [u8; 20] = mac.finalize().into_bytes().into();

    if hmac[0..13] != plain_iv[0..13] {
        return Err(CryptError::InvalidHmac);
    }

    Ok(message.as_slice().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    #[test]
    fn roundtrip_test() {
        let key = random();

        let input = BytesMut::from(&[55; 16][..]);

        let encrypted = symmetric_encrypt(input.clone(), &key);

        let decrypted = symmetric_decrypt(encrypted, &key).unwrap();

        assert_eq!(input, decrypted);
    }

    #[test]
    fn roundtrip_empty_and_odd_sizes() {
        let key = random();
        for size in [0usize, 1, 15, 16, 17, 255, 4096] {
            let input: BytesMut = std::iter::repeat(0xA5u8).take(size).collect();
            let decrypted = symmetric_decrypt(symmetric_encrypt(input.clone(), &key), &key).unwrap();
            assert_eq!(input, decrypted, "size {size}");
        }
    }

    #[test]
    fn tampered_message_fails_hmac() {
        let key = random();
        let mut encrypted = symmetric_encrypt(BytesMut::from(&b"attack at dawn"[..]), &key);
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(matches!(
            symmetric_decrypt(encrypted, &key),
            Err(CryptError::InvalidHmac | CryptError::MalformedMessage)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let key = random();
        let other: [u8; 32] = random();
        let encrypted = symmetric_encrypt(BytesMut::from(&[1u8; 32][..]), &key);
        assert!(symmetric_decrypt(encrypted, &other).is_err());
    }

    #[test]
    fn channel_key_shape() {
        let keys = generate_session_key(None);
        // 1024 bit modulus
        assert_eq!(keys.encrypted.len(), 128);
        let mut mac: HmacSha1 = Mac::new_from_slice(&keys.plain[0..16]).unwrap();
        mac.update(&keys.encrypted);
        let expected: [u8; 20] = mac.finalize().into_bytes().into();
        assert_eq!(keys.confirmation, expected);
    }

    #[test]
    fn channel_key_with_nonce_differs() {
        let nonce = [7u8; 16];
        let with = generate_session_key(Some(&nonce));
        let without = generate_session_key(None);
        assert_ne!(with.encrypted, without.encrypted);
    }

    #[test]
    fn pkcs1_rejects_small_keys() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let res = encrypt_with_key_pkcs1(&private.to_public_key(), b"hunter2");
        assert!(matches!(res, Err(CryptError::KeyTooSmall(512))));
    }

    #[test]
    fn pkcs1_roundtrip() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let wrapped = encrypt_with_key_pkcs1(&private.to_public_key(), b"hunter2").unwrap();
        let plain = private.decrypt(Pkcs1v15Encrypt, &wrapped).unwrap();
        assert_eq!(plain, b"hunter2");
    }
}
