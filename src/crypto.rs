//! Crypto
//!
//! AES-256-CBC encrypt/decrypt of upstream credential material. Keys are
//! derived per-salt with scrypt so a leaked encryption passphrase alone
//! cannot decrypt stored ciphertext without also knowing each record's salt.
//! Decrypted plaintext is cached (LRU, TTL-bounded) since the scheduler may
//! re-decrypt the same account's credential many times a second.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use lru::LruCache;
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const CACHE_CAPACITY: usize = 500;
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    plaintext: String,
    inserted_at: Instant,
}

/// Encrypt/decrypt factory bound to one salt. The same salt must be used to
/// decrypt what it encrypted.
pub struct Encryptor {
    key: [u8; 32],
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl Encryptor {
    pub fn new(passphrase: &str, salt: &str) -> Self {
        let mut key = [0u8; 32];
        let params = scrypt::Params::new(15, 8, 1, 32).expect("valid scrypt params");
        scrypt::scrypt(passphrase.as_bytes(), salt.as_bytes(), &params, &mut key)
            .expect("scrypt key derivation");
        Self {
            key,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// Encrypts `plaintext`, returning `hex(iv):hex(ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let ct = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        format!("{}:{}", hex::encode(iv), hex::encode(ct))
    }

    /// Decrypts `hex(iv):hex(ct)`. On any parse/decrypt failure, returns the
    /// input unchanged; callers treat that as legacy plaintext material
    /// that was never encrypted.
    pub fn decrypt(&self, input: &str) -> String {
        let cache_key = {
            let mut hasher = Sha256::new();
            hasher.update(input.as_bytes());
            hex::encode(hasher.finalize())
        };

        if let Some(hit) = self.cache_get(&cache_key) {
            return hit;
        }

        let plaintext = self.decrypt_uncached(input).unwrap_or_else(|| input.to_string());
        self.cache_put(cache_key, plaintext.clone());
        plaintext
    }

    fn decrypt_uncached(&self, input: &str) -> Option<String> {
        let (iv_hex, ct_hex) = input.split_once(':')?;
        let iv = hex::decode(iv_hex).ok()?;
        let ct = hex::decode(ct_hex).ok()?;
        if iv.len() != 16 {
            return None;
        }
        let iv: [u8; 16] = iv.try_into().ok()?;

        let mut buf = ct;
        let pt = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .ok()?;
        String::from_utf8(pt.to_vec()).ok()
    }

    fn cache_get(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get(key) {
            if entry.inserted_at.elapsed() < CACHE_TTL {
                return Some(entry.plaintext.clone());
            }
        }
        cache.pop(key);
        None
    }

    fn cache_put(&self, key: String, plaintext: String) {
        let mut cache = self.cache.lock().unwrap();
        cache.put(
            key,
            CacheEntry {
                plaintext,
                inserted_at: Instant::now(),
            },
        );
    }
}

/// Process-wide cache of `Encryptor` instances, one per salt. The per-salt
/// scrypt key derivation runs once per salt for the life of the process
/// rather than once per decrypt. A relay decrypts the same handful of
/// account credentials on every forwarded request.
pub struct EncryptorRegistry {
    passphrase: String,
    instances: Mutex<HashMap<String, Arc<Encryptor>>>,
}

impl EncryptorRegistry {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, salt: &str) -> Arc<Encryptor> {
        let mut instances = self.instances.lock().unwrap();
        if let Some(existing) = instances.get(salt) {
            return existing.clone();
        }
        let encryptor = Arc::new(Encryptor::new(&self.passphrase, salt));
        instances.insert(salt.to_string(), encryptor.clone());
        encryptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reuses_instance_per_salt() {
        let registry = EncryptorRegistry::new("passphrase");
        let a = registry.get_or_create("salt-1");
        let b = registry.get_or_create("salt-1");
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.get_or_create("salt-2");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn roundtrip() {
        let enc = Encryptor::new("passphrase", "salt-1");
        let ct = enc.encrypt("sk-upstream-secret");
        assert_eq!(enc.decrypt(&ct), "sk-upstream-secret");
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let enc = Encryptor::new("passphrase", "salt-1");
        assert_eq!(enc.decrypt("not-encrypted-legacy-value"), "not-encrypted-legacy-value");
    }

    #[test]
    fn cache_hits_return_same_value() {
        let enc = Encryptor::new("passphrase", "salt-2");
        let ct = enc.encrypt("cached-value");
        assert_eq!(enc.decrypt(&ct), "cached-value");
        assert_eq!(enc.decrypt(&ct), "cached-value");
    }
}
