use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha1::{Digest, Sha1};

pub const SHA1_SIZE: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// SHA-1 digest of `data`.
#[inline]
pub fn sha1_bin(data: &[u8]) -> [u8; SHA1_SIZE] {
    Sha1::digest(data).into()
}

/// HMAC-SHA1 of `data` under `key`. Keys of any length are accepted.
#[inline]
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; SHA1_SIZE] {
    let mut mac = HmacSha1::new_from_slice(key).expect("Hmac must accept any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// PBKDF2 keyed on HMAC-SHA1. The output is exactly `dklen` bytes long for
/// any requested length.
#[inline]
pub fn pbkdf2_hmac_sha1(password: &[u8], salt: &[u8], iterations: u32, dklen: usize) -> Vec<u8> {
    let mut derived = vec![0u8; dklen];
    pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut derived);
    derived
}

/// CRC-32 (IEEE) of `data`. The short-input variant used for key routing
/// produces the same value as the streaming one.
#[inline]
pub fn crc32_short(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// XOR of two equal-length byte strings.
#[inline]
pub fn xor_bytes(left: &[u8], right: &[u8]) -> Vec<u8> {
    if left.len() != right.len() {
        panic!(
            "XOR operands must have equal length, got {} and {}",
            left.len(),
            right.len()
        )
    }

    left.iter().zip(right.iter()).map(|(l, r)| l ^ r).collect()
}

/// `count` random decimal digits. Used as client nonce material.
#[inline]
pub fn random_digits(count: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
