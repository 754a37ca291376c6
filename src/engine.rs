//! Derivation of NTLM hashes, responses and session keys.
//!
//! The free functions in this module are the individual algorithms; [`CipherEngine`] ties them to
//! the inputs of one handshake and caches every derived value, so that each value (in particular
//! every randomly generated one) is computed exactly once.


use chrono::{DateTime, NaiveDate, Utc};
use cipher::{BlockEncrypt, KeyInit};
use cipher::generic_array::GenericArray;
use des::Des;
use digest::Digest;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use tracing::trace;

use crate::Credentials;
use crate::encoding::{ascii_bytes, to_uppercase_per_char, utf16_le_bytes};
use crate::error::{CipherError, CipherOperation};
use crate::md4::md4;
use crate::rc4::Rc4;


/// The plaintext encrypted with both halves of the password to obtain the LM hash.
const LM_MAGIC: [u8; 8] = *b"KGS!@#$%";

/// Signature at the start of the NTLMv2 blob (response version and highest response version,
/// followed by two reserved bytes).
const BLOB_SIGNATURE: [u8; 4] = [0x01, 0x01, 0x00, 0x00];

/// Filler for the second half of the key material of the LAN Manager session key.
const LAN_MANAGER_KEY_FILLER: u8 = 0xBD;


// primitive helpers


/// Spreads 56 bits of key material over 8 bytes and sets every byte to odd parity.
///
/// DES takes 64-bit keys of which only the upper 7 bits of each byte are used; the lowest bit is a
/// parity bit.
pub fn expand_des_key(material: &[u8; 7]) -> [u8; 8] {
    let k = material;
    let mut key = [
        k[0],
        (k[0] << 7) | (k[1] >> 1),
        (k[1] << 6) | (k[2] >> 2),
        (k[2] << 5) | (k[3] >> 3),
        (k[3] << 4) | (k[4] >> 4),
        (k[4] << 3) | (k[5] >> 5),
        (k[5] << 2) | (k[6] >> 6),
        k[6] << 1,
    ];
    for b in &mut key {
        *b = with_odd_parity(*b);
    }
    key
}

fn with_odd_parity(b: u8) -> u8 {
    let data_bits = b & 0xFE;
    if data_bits.count_ones() % 2 == 0 {
        data_bits | 0x01
    } else {
        data_bits
    }
}

/// Encrypts a single block using DES in ECB mode without padding, keyed by 7 bytes of material.
fn des_encrypt(material: &[u8], block: &[u8; 8], operation: CipherOperation) -> Result<[u8; 8], CipherError> {
    let mut key_material = [0u8; 7];
    key_material.copy_from_slice(&material[0..7]);
    let key = expand_des_key(&key_material);

    let des = Des::new_from_slice(&key)
        .map_err(|e| CipherError::new(operation, e))?;
    let mut buf = GenericArray::from(*block);
    des.encrypt_block(&mut buf);
    Ok(buf.into())
}

/// Calculates HMAC-MD5 over the concatenation of `parts`.
pub fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], CipherError> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key)
        .map_err(|e| CipherError::new(CipherOperation::HmacMd5, e))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}


// hashes


/// Derives the LM hash from a password.
///
/// The LMv1 scheme consists of the following:
///
/// ```plain
///            ┌────────────┐  ┌───────────────┐  ┌─────────────┐
/// password ──┤ convert to ├──┤ encode using  ├──┤ truncate or ├──┐
///            │ uppercase  │  │ ASCII         │  │ pad to 14 B │  │
///            └────────────┘  └───────────────┘  └─────────────┘  │
///           ┌────────────────────────────────────────────────────┘
///           │┌───────┐
///           └┤ split │           "KGS!@#$%"
///            └─┬───┬─┘               │ input
///         0..7 │   │ 7..14    key ┌──┴──┐ output
///              │   └──────────────┤ DES ├────────────┐
///              │                  └─────┘            │ 8..16
///              │                                  ┌──┴───┐
///              │                 "KGS!@#$%"       │ join ├──── hash
///              │                     │ input      └──┬───┘
///              │              key ┌──┴──┐ output     │ 0..8
///              └──────────────────┤ DES ├────────────┘
///                                 └─────┘
/// ```
pub fn lm_hash(password: &str) -> Result<[u8; 16], CipherError> {
    let mut password_bytes = ascii_bytes(&to_uppercase_per_char(password));
    password_bytes.resize(14, 0x00);

    let mut output = [0u8; 16];
    output[0..8].copy_from_slice(&des_encrypt(&password_bytes[0..7], &LM_MAGIC, CipherOperation::LmHash)?);
    output[8..16].copy_from_slice(&des_encrypt(&password_bytes[7..14], &LM_MAGIC, CipherOperation::LmHash)?);
    Ok(output)
}

/// Derives the NTLM hash from a password.
///
/// The password is encoded as UTF-16 in little-endian byte order (without the Byte Order Mark),
/// keeping its case, and hashed using MD4.
pub fn ntlm_hash(password: &str) -> [u8; 16] {
    md4(&utf16_le_bytes(password))
}

/// Derives the LMv2 hash: HMAC-MD5 keyed by the NTLM hash over uppercase username and uppercase
/// domain, both encoded as UTF-16LE.
pub fn lm_v2_hash(username: &str, domain: &str, ntlm_hash: &[u8; 16]) -> Result<[u8; 16], CipherError> {
    let user_bytes = utf16_le_bytes(&to_uppercase_per_char(username));
    let domain_bytes = utf16_le_bytes(&to_uppercase_per_char(domain));
    hmac_md5(ntlm_hash, &[&user_bytes, &domain_bytes])
}

/// Derives the NTLMv2 hash: like [`lm_v2_hash`], except that the domain keeps its case.
pub fn ntlm_v2_hash(username: &str, domain: &str, ntlm_hash: &[u8; 16]) -> Result<[u8; 16], CipherError> {
    let user_bytes = utf16_le_bytes(&to_uppercase_per_char(username));
    let domain_bytes = utf16_le_bytes(domain);
    hmac_md5(ntlm_hash, &[&user_bytes, &domain_bytes])
}


// responses


/// Calculates a v1 (LM or NTLM) response from a 16-byte hash.
///
/// The hash is padded with zeroes to 21 bytes, split into three 7-byte DES keys, and each key
/// encrypts the challenge; the three ciphertexts form the response.
pub fn v1_response(hash: &[u8; 16], challenge: &[u8; 8]) -> Result<[u8; 24], CipherError> {
    let mut key_bytes = [0u8; 21];
    key_bytes[0..16].copy_from_slice(hash);

    let mut ret = [0u8; 24];
    for (i, output) in ret.chunks_exact_mut(8).enumerate() {
        let ciphertext = des_encrypt(&key_bytes[7*i..7*i+7], challenge, CipherOperation::V1Response)?;
        output.copy_from_slice(&ciphertext);
    }
    Ok(ret)
}

/// Calculates a v2 (LMv2 or NTLMv2) response: the HMAC of challenge and client data keyed by the
/// v2 hash, followed by the client data itself.
pub fn v2_response(hash: &[u8; 16], challenge: &[u8; 8], client_data: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(hash)
        .map_err(|e| CipherError::new(CipherOperation::V2Response, e))?;
    mac.update(challenge);
    mac.update(client_data);
    let proof = mac.finalize().into_bytes();

    let mut ret = Vec::with_capacity(proof.len() + client_data.len());
    ret.extend_from_slice(&proof);
    ret.extend_from_slice(client_data);
    Ok(ret)
}

/// Assembles the NTLMv2 blob that serves as client data of the NTLMv2 response.
pub fn ntlm_v2_blob(client_challenge: &[u8; 8], target_info: &[u8], timestamp: &[u8; 8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(4 + 4 + 8 + 8 + 4 + target_info.len() + 4);
    blob.extend_from_slice(&BLOB_SIGNATURE);
    blob.extend_from_slice(&[0u8; 4]); // reserved
    blob.extend_from_slice(timestamp);
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);
    blob
}

/// Calculates the NTLM2 session response.
///
/// The first 8 bytes of MD5(server challenge ++ client challenge) replace the server challenge in
/// the v1 algorithm.
pub fn ntlm2_session_response(ntlm_hash: &[u8; 16], challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Result<[u8; 24], CipherError> {
    let mut md5 = <Md5 as Digest>::new();
    md5.update(challenge);
    md5.update(client_challenge);
    let digest = md5.finalize();

    let mut session_hash = [0u8; 8];
    session_hash.copy_from_slice(&digest[0..8]);
    v1_response(ntlm_hash, &session_hash)
}


/// Converts a point in time into an NTLM timestamp: tenths of a microsecond since 1601-01-01.
pub fn ntlm_timestamp(instant: DateTime<Utc>) -> i64 {
    let windows_epoch = NaiveDate::from_ymd_opt(1601, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let delta = instant - windows_epoch;
    delta.num_seconds() * 10_000_000 + i64::from(delta.subsec_nanos()) / 100
}


/// Derived values, each computed at most once.
#[derive(Clone, Debug, Default)]
struct DerivationCache {
    lm_hash: Option<[u8; 16]>,
    ntlm_hash: Option<[u8; 16]>,
    lm_v2_hash: Option<[u8; 16]>,
    ntlm_v2_hash: Option<[u8; 16]>,
    lm_response: Option<[u8; 24]>,
    ntlm_response: Option<[u8; 24]>,
    lm_v2_response: Option<Vec<u8>>,
    ntlm_v2_blob: Option<Vec<u8>>,
    ntlm_v2_response: Option<Vec<u8>>,
    lm2_session_response: Option<[u8; 24]>,
    ntlm2_session_response: Option<[u8; 24]>,
    lm_user_session_key: Option<[u8; 16]>,
    ntlm_user_session_key: Option<[u8; 16]>,
    ntlm_v2_user_session_key: Option<[u8; 16]>,
    ntlm2_session_user_session_key: Option<[u8; 16]>,
    lan_manager_session_key: Option<[u8; 16]>,
}


/// Calculates the cryptographic values required to answer one server challenge.
///
/// Values that are usually random (the client challenges and the secondary key) as well as the
/// timestamp may be fixed up front for reproducible results; otherwise they are drawn from the
/// supplied random number generator the first time they are needed.
pub struct CipherEngine<R: RngCore> {
    rng: R,
    current_time: i64,

    domain: String,
    username: String,
    password: String,
    challenge: [u8; 8],
    target_info: Vec<u8>,

    client_challenge: Option<[u8; 8]>,
    client_challenge2: Option<[u8; 8]>,
    secondary_key: Option<[u8; 16]>,
    timestamp: Option<[u8; 8]>,

    cache: DerivationCache,
}
impl<R: RngCore> CipherEngine<R> {
    /// Creates an engine for the given credentials and server challenge.
    ///
    /// `now` is sampled once here; every timestamp derived by this engine refers to it.
    pub fn new(rng: R, now: DateTime<Utc>, creds: &Credentials, challenge: [u8; 8], target_info: Option<&[u8]>) -> Self {
        Self {
            rng,
            current_time: ntlm_timestamp(now),
            domain: creds.domain.clone(),
            username: creds.username.clone(),
            password: creds.password.clone(),
            challenge,
            target_info: target_info.map(Vec::from).unwrap_or_default(),
            client_challenge: None,
            client_challenge2: None,
            secondary_key: None,
            timestamp: None,
            cache: DerivationCache::default(),
        }
    }

    /// Fixes the client challenge used by the LMv2 and NTLM2 session responses.
    pub fn with_client_challenge(mut self, client_challenge: [u8; 8]) -> Self {
        self.client_challenge = Some(client_challenge);
        self
    }

    /// Fixes the client challenge embedded in the NTLMv2 blob.
    pub fn with_client_challenge2(mut self, client_challenge2: [u8; 8]) -> Self {
        self.client_challenge2 = Some(client_challenge2);
        self
    }

    /// Fixes the secondary (exported) session key.
    pub fn with_secondary_key(mut self, secondary_key: [u8; 16]) -> Self {
        self.secondary_key = Some(secondary_key);
        self
    }

    /// Fixes the timestamp bytes embedded in the NTLMv2 blob.
    pub fn with_timestamp(mut self, timestamp: [u8; 8]) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    // entropy and inputs

    fn client_challenge(&mut self) -> [u8; 8] {
        if let Some(cc) = self.client_challenge {
            return cc;
        }
        let mut cc = [0u8; 8];
        self.rng.fill_bytes(&mut cc);
        trace!("generated client challenge");
        self.client_challenge = Some(cc);
        cc
    }

    fn client_challenge2(&mut self) -> [u8; 8] {
        if let Some(cc) = self.client_challenge2 {
            return cc;
        }
        let mut cc = [0u8; 8];
        self.rng.fill_bytes(&mut cc);
        trace!("generated second client challenge");
        self.client_challenge2 = Some(cc);
        cc
    }

    /// Returns the 16-byte secondary key, generating it on first use.
    ///
    /// When key exchange is negotiated, this becomes the exported session key.
    pub fn secondary_key(&mut self) -> [u8; 16] {
        if let Some(key) = self.secondary_key {
            return key;
        }
        let mut key = [0u8; 16];
        self.rng.fill_bytes(&mut key);
        trace!("generated secondary key");
        self.secondary_key = Some(key);
        key
    }

    fn timestamp(&mut self) -> [u8; 8] {
        if let Some(ts) = self.timestamp {
            return ts;
        }
        let ts = self.current_time.to_le_bytes();
        self.timestamp = Some(ts);
        ts
    }

    // hashes

    /// The LM hash of the password.
    pub fn lm_hash(&mut self) -> Result<[u8; 16], CipherError> {
        if let Some(hash) = self.cache.lm_hash {
            return Ok(hash);
        }
        let hash = lm_hash(&self.password)?;
        self.cache.lm_hash = Some(hash);
        Ok(hash)
    }

    /// The NTLM hash of the password.
    pub fn ntlm_hash(&mut self) -> [u8; 16] {
        if let Some(hash) = self.cache.ntlm_hash {
            return hash;
        }
        let hash = ntlm_hash(&self.password);
        self.cache.ntlm_hash = Some(hash);
        hash
    }

    /// The LMv2 hash of the credentials.
    pub fn lm_v2_hash(&mut self) -> Result<[u8; 16], CipherError> {
        if let Some(hash) = self.cache.lm_v2_hash {
            return Ok(hash);
        }
        let ntlm_hash = self.ntlm_hash();
        let hash = lm_v2_hash(&self.username, &self.domain, &ntlm_hash)?;
        self.cache.lm_v2_hash = Some(hash);
        Ok(hash)
    }

    /// The NTLMv2 hash of the credentials.
    pub fn ntlm_v2_hash(&mut self) -> Result<[u8; 16], CipherError> {
        if let Some(hash) = self.cache.ntlm_v2_hash {
            return Ok(hash);
        }
        let ntlm_hash = self.ntlm_hash();
        let hash = ntlm_v2_hash(&self.username, &self.domain, &ntlm_hash)?;
        self.cache.ntlm_v2_hash = Some(hash);
        Ok(hash)
    }

    // responses

    /// The LM response: the v1 algorithm applied to the LM hash.
    pub fn lm_response(&mut self) -> Result<[u8; 24], CipherError> {
        if let Some(response) = self.cache.lm_response {
            return Ok(response);
        }
        let hash = self.lm_hash()?;
        let response = v1_response(&hash, &self.challenge)?;
        self.cache.lm_response = Some(response);
        Ok(response)
    }

    /// The NTLM response: the v1 algorithm applied to the NTLM hash.
    pub fn ntlm_response(&mut self) -> Result<[u8; 24], CipherError> {
        if let Some(response) = self.cache.ntlm_response {
            return Ok(response);
        }
        let hash = self.ntlm_hash();
        let response = v1_response(&hash, &self.challenge)?;
        self.cache.ntlm_response = Some(response);
        Ok(response)
    }

    /// The LMv2 response; its client data is the client challenge.
    pub fn lm_v2_response(&mut self) -> Result<Vec<u8>, CipherError> {
        if let Some(response) = &self.cache.lm_v2_response {
            return Ok(response.clone());
        }
        let hash = self.lm_v2_hash()?;
        let client_challenge = self.client_challenge();
        let response = v2_response(&hash, &self.challenge, &client_challenge)?;
        self.cache.lm_v2_response = Some(response.clone());
        Ok(response)
    }

    /// The NTLMv2 blob containing timestamp, second client challenge and target info.
    pub fn ntlm_v2_blob(&mut self) -> Vec<u8> {
        if let Some(blob) = &self.cache.ntlm_v2_blob {
            return blob.clone();
        }
        let client_challenge2 = self.client_challenge2();
        let timestamp = self.timestamp();
        let blob = ntlm_v2_blob(&client_challenge2, &self.target_info, &timestamp);
        self.cache.ntlm_v2_blob = Some(blob.clone());
        blob
    }

    /// The NTLMv2 response; its client data is the NTLMv2 blob.
    pub fn ntlm_v2_response(&mut self) -> Result<Vec<u8>, CipherError> {
        if let Some(response) = &self.cache.ntlm_v2_response {
            return Ok(response.clone());
        }
        let hash = self.ntlm_v2_hash()?;
        let blob = self.ntlm_v2_blob();
        let response = v2_response(&hash, &self.challenge, &blob)?;
        self.cache.ntlm_v2_response = Some(response.clone());
        Ok(response)
    }

    /// The value placed into the LM response field alongside the NTLM2 session response: the
    /// client challenge padded with zeroes to 24 bytes.
    pub fn lm2_session_response(&mut self) -> [u8; 24] {
        if let Some(response) = self.cache.lm2_session_response {
            return response;
        }
        let mut response = [0u8; 24];
        response[0..8].copy_from_slice(&self.client_challenge());
        self.cache.lm2_session_response = Some(response);
        response
    }

    /// The NTLM2 session response.
    pub fn ntlm2_session_response(&mut self) -> Result<[u8; 24], CipherError> {
        if let Some(response) = self.cache.ntlm2_session_response {
            return Ok(response);
        }
        let hash = self.ntlm_hash();
        let client_challenge = self.client_challenge();
        let response = ntlm2_session_response(&hash, &self.challenge, &client_challenge)?;
        self.cache.ntlm2_session_response = Some(response);
        Ok(response)
    }

    // session keys

    /// The LM user session key: the first half of the LM hash, padded with zeroes.
    pub fn lm_user_session_key(&mut self) -> Result<[u8; 16], CipherError> {
        if let Some(key) = self.cache.lm_user_session_key {
            return Ok(key);
        }
        let mut key = [0u8; 16];
        key[0..8].copy_from_slice(&self.lm_hash()?[0..8]);
        self.cache.lm_user_session_key = Some(key);
        Ok(key)
    }

    /// The NTLM user session key: the MD4 digest of the NTLM hash.
    pub fn ntlm_user_session_key(&mut self) -> [u8; 16] {
        if let Some(key) = self.cache.ntlm_user_session_key {
            return key;
        }
        let key = md4(&self.ntlm_hash());
        self.cache.ntlm_user_session_key = Some(key);
        key
    }

    /// The NTLMv2 user session key: HMAC-MD5 of the NTLMv2 proof string, keyed by the NTLMv2 hash.
    pub fn ntlm_v2_user_session_key(&mut self) -> Result<[u8; 16], CipherError> {
        if let Some(key) = self.cache.ntlm_v2_user_session_key {
            return Ok(key);
        }
        let hash = self.ntlm_v2_hash()?;
        let response = self.ntlm_v2_response()?;
        let key = hmac_md5(&hash, &[&response[0..16]])?;
        self.cache.ntlm_v2_user_session_key = Some(key);
        Ok(key)
    }

    /// The NTLM2 session response user session key: HMAC-MD5 of the server challenge and the
    /// padded client challenge, keyed by the NTLM user session key.
    pub fn ntlm2_session_user_session_key(&mut self) -> Result<[u8; 16], CipherError> {
        if let Some(key) = self.cache.ntlm2_session_user_session_key {
            return Ok(key);
        }
        let user_session_key = self.ntlm_user_session_key();
        let nonce = self.lm2_session_response();
        let key = hmac_md5(&user_session_key, &[&self.challenge, &nonce])?;
        self.cache.ntlm2_session_user_session_key = Some(key);
        Ok(key)
    }

    /// The LAN Manager session key, used instead of the other user session keys when
    /// `NEGOTIATE_LANMAN_KEY` is negotiated.
    pub fn lan_manager_session_key(&mut self) -> Result<[u8; 16], CipherError> {
        if let Some(key) = self.cache.lan_manager_session_key {
            return Ok(key);
        }

        let mut key_bytes = [LAN_MANAGER_KEY_FILLER; 14];
        key_bytes[0..8].copy_from_slice(&self.lm_hash()?[0..8]);

        let lm_response = self.lm_response()?;
        let mut truncated_response = [0u8; 8];
        truncated_response.copy_from_slice(&lm_response[0..8]);

        let mut key = [0u8; 16];
        key[0..8].copy_from_slice(&des_encrypt(&key_bytes[0..7], &truncated_response, CipherOperation::LanManagerSessionKey)?);
        key[8..16].copy_from_slice(&des_encrypt(&key_bytes[7..14], &truncated_response, CipherOperation::LanManagerSessionKey)?);
        self.cache.lan_manager_session_key = Some(key);
        Ok(key)
    }

    /// Wraps `user_session_key` for transmission under the secondary key using RC4.
    pub fn encrypt_session_key(&mut self, user_session_key: &[u8; 16]) -> [u8; 16] {
        let secondary_key = self.secondary_key();
        let mut wrapped = *user_session_key;
        Rc4::new(&secondary_key).apply_keystream(&mut wrapped);
        wrapped
    }
}
