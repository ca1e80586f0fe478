//! WeCom message crypto.
//!
//! [`MsgCrypt`] is the contract the callback handler consumes: verify the
//! URL challenge, decrypt an inbound envelope, encrypt a reply. Every
//! operation yields either its payload or an [`ErrorCode`] carrying the
//! platform's numeric result code.
//!
//! [`WxBizMsgCrypt`] implements the platform scheme:
//! - signature: SHA-1 hex over the sorted concatenation of
//!   token, timestamp, nonce and ciphertext
//! - cipher: AES-256-CBC, key = Base64(EncodingAESKey), iv = key[..16]
//! - plaintext: 16 random bytes | u32 BE length | message | corp id,
//!   PKCS#7 padded to 32-byte blocks

use aes::Aes256;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use crate::config::CallbackCredentials;
use crate::message::{EncryptedEnvelope, InboundEnvelope};
use crate::util::time::unix_timestamp;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Padding block size used by the platform (not the AES block size).
const PAD_BLOCK_SIZE: usize = 32;

const RANDOM_PREFIX_LEN: usize = 16;

/// EncodingAESKey is 43 characters with no padding and arbitrary trailing bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Platform result codes. Success is the `Ok` side of [`CryptResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("signature validation error")]
    ValidateSignature,
    #[error("xml parse error")]
    ParseXml,
    #[error("signature computation error")]
    ComputeSignature,
    #[error("illegal aes key")]
    IllegalAesKey,
    #[error("corp id validation error")]
    ValidateCorpid,
    #[error("aes encryption error")]
    EncryptAes,
    #[error("aes decryption error")]
    DecryptAes,
    #[error("illegal buffer")]
    IllegalBuffer,
    #[error("base64 encoding error")]
    EncodeBase64,
    #[error("base64 decoding error")]
    DecodeBase64,
    #[error("reply xml generation error")]
    GenReturnXml,
    /// A code this crate does not know about.
    #[error("unknown error code {0}")]
    Other(i32),
}

impl ErrorCode {
    /// Numeric code as reported by the platform SDKs.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ValidateSignature => -40001,
            ErrorCode::ParseXml => -40002,
            ErrorCode::ComputeSignature => -40003,
            ErrorCode::IllegalAesKey => -40004,
            ErrorCode::ValidateCorpid => -40005,
            ErrorCode::EncryptAes => -40006,
            ErrorCode::DecryptAes => -40007,
            ErrorCode::IllegalBuffer => -40008,
            ErrorCode::EncodeBase64 => -40009,
            ErrorCode::DecodeBase64 => -40010,
            ErrorCode::GenReturnXml => -40011,
            ErrorCode::Other(code) => code,
        }
    }
}

pub type CryptResult<T> = Result<T, ErrorCode>;

/// Call contract of the crypto collaborator.
///
/// Implementations own their credentials and are shared across requests.
pub trait MsgCrypt: Send + Sync {
    /// Check the signature over `echostr` and return the decrypted challenge.
    fn verify_url(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        echostr: &str,
    ) -> CryptResult<String>;

    /// Extract `Encrypt` from the POST body, check its signature and decrypt it.
    fn decrypt_msg(
        &self,
        post_data: &str,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
    ) -> CryptResult<String>;

    /// Encrypt and sign a plaintext reply, returning the reply envelope XML.
    ///
    /// Uses the current time when `timestamp` is `None`.
    fn encrypt_msg(&self, reply_msg: &str, nonce: &str, timestamp: Option<&str>)
        -> CryptResult<String>;
}

/// WeCom reference crypto scheme.
#[derive(Debug, Clone)]
pub struct WxBizMsgCrypt {
    credentials: CallbackCredentials,
}

impl WxBizMsgCrypt {
    pub fn new(credentials: CallbackCredentials) -> Self {
        Self { credentials }
    }

    fn aes_key(&self) -> CryptResult<[u8; 32]> {
        let bytes = LENIENT_BASE64
            .decode(self.credentials.encoding_aes_key.trim())
            .map_err(|_| ErrorCode::IllegalAesKey)?;
        bytes.try_into().map_err(|_| ErrorCode::IllegalAesKey)
    }

    /// SHA-1 hex digest of the sorted, concatenated parts.
    pub fn signature(&self, timestamp: &str, nonce: &str, encrypted: &str) -> String {
        let mut parts = [self.credentials.token.as_str(), timestamp, nonce, encrypted];
        parts.sort_unstable();

        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn check_signature(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypted: &str,
    ) -> CryptResult<()> {
        let expected = self.signature(timestamp, nonce, encrypted);
        if constant_time_compare(&expected, msg_signature) {
            Ok(())
        } else {
            debug!(
                expected_length = expected.len(),
                actual_length = msg_signature.len(),
                "crypto_signature_mismatch"
            );
            Err(ErrorCode::ValidateSignature)
        }
    }

    /// Encrypt `plaintext` behind a random alphanumeric prefix.
    pub fn encrypt(&self, plaintext: &str) -> CryptResult<String> {
        let mut prefix = [0u8; RANDOM_PREFIX_LEN];
        for (slot, byte) in prefix
            .iter_mut()
            .zip(rand::thread_rng().sample_iter(&Alphanumeric))
        {
            *slot = byte;
        }
        self.encrypt_with_prefix(&prefix, plaintext)
    }

    fn encrypt_with_prefix(
        &self,
        prefix: &[u8; RANDOM_PREFIX_LEN],
        plaintext: &str,
    ) -> CryptResult<String> {
        let key = self.aes_key()?;
        let msg_len = u32::try_from(plaintext.len()).map_err(|_| ErrorCode::EncryptAes)?;
        let corp_id = self.credentials.corp_id.as_bytes();

        let capacity = RANDOM_PREFIX_LEN + 4 + plaintext.len() + corp_id.len() + PAD_BLOCK_SIZE;
        let mut buf = Vec::with_capacity(capacity);
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(&msg_len.to_be_bytes());
        buf.extend_from_slice(plaintext.as_bytes());
        buf.extend_from_slice(corp_id);
        pkcs7_pad(&mut buf);

        let cipher =
            Aes256CbcEnc::new_from_slices(&key, &key[..16]).map_err(|_| ErrorCode::IllegalAesKey)?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&buf);

        Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
    }

    /// Decrypt a Base64 ciphertext and check the trailing corp id.
    pub fn decrypt(&self, encrypted: &str) -> CryptResult<String> {
        let key = self.aes_key()?;

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(encrypted.trim())
            .map_err(|_| ErrorCode::DecryptAes)?;
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(ErrorCode::DecryptAes);
        }

        let cipher =
            Aes256CbcDec::new_from_slices(&key, &key[..16]).map_err(|_| ErrorCode::IllegalAesKey)?;
        let padded = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
            .map_err(|_| ErrorCode::DecryptAes)?;

        let plain = pkcs7_unpad(&padded);
        if plain.len() < RANDOM_PREFIX_LEN + 4 {
            return Err(ErrorCode::IllegalBuffer);
        }
        let content = &plain[RANDOM_PREFIX_LEN..];

        let len_bytes: [u8; 4] = content[..4].try_into().map_err(|_| ErrorCode::IllegalBuffer)?;
        let msg_len = u32::from_be_bytes(len_bytes) as usize;
        let rest = &content[4..];
        if rest.len() < msg_len {
            return Err(ErrorCode::IllegalBuffer);
        }
        let (msg, receive_id) = rest.split_at(msg_len);

        if receive_id != self.credentials.corp_id.as_bytes() {
            debug!(receive_id_length = receive_id.len(), "crypto_corp_id_mismatch");
            return Err(ErrorCode::ValidateCorpid);
        }

        String::from_utf8(msg.to_vec()).map_err(|_| ErrorCode::IllegalBuffer)
    }
}

impl MsgCrypt for WxBizMsgCrypt {
    fn verify_url(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        echostr: &str,
    ) -> CryptResult<String> {
        self.check_signature(msg_signature, timestamp, nonce, echostr)?;
        self.decrypt(echostr)
    }

    fn decrypt_msg(
        &self,
        post_data: &str,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
    ) -> CryptResult<String> {
        let envelope = InboundEnvelope::parse(post_data).map_err(|_| ErrorCode::ParseXml)?;
        self.check_signature(msg_signature, timestamp, nonce, &envelope.encrypt)?;
        self.decrypt(&envelope.encrypt)
    }

    fn encrypt_msg(
        &self,
        reply_msg: &str,
        nonce: &str,
        timestamp: Option<&str>,
    ) -> CryptResult<String> {
        let encrypt = self.encrypt(reply_msg)?;
        let timestamp = timestamp
            .map(str::to_string)
            .unwrap_or_else(|| unix_timestamp().to_string());
        let msg_signature = self.signature(&timestamp, nonce, &encrypt);

        EncryptedEnvelope {
            encrypt,
            msg_signature,
            timestamp,
            nonce: nonce.to_string(),
        }
        .to_xml()
        .map_err(|_| ErrorCode::GenReturnXml)
    }
}

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = PAD_BLOCK_SIZE - buf.len() % PAD_BLOCK_SIZE;
    buf.resize(buf.len() + pad, pad as u8);
}

/// Out-of-range pad bytes are treated as no padding, as the platform SDKs do.
fn pkcs7_unpad(buf: &[u8]) -> &[u8] {
    let pad = buf.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > PAD_BLOCK_SIZE || pad > buf.len() {
        buf
    } else {
        &buf[..buf.len() - pad]
    }
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "QDG6eK";
    const KEY: &str = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C";
    const CORP_ID: &str = "wx5823bf96d3bd56c7";

    fn crypt() -> WxBizMsgCrypt {
        WxBizMsgCrypt::new(CallbackCredentials::new(TOKEN, KEY, CORP_ID))
    }

    #[test]
    fn test_error_code_numbers() {
        assert_eq!(ErrorCode::ValidateSignature.code(), -40001);
        assert_eq!(ErrorCode::GenReturnXml.code(), -40011);
        assert_eq!(ErrorCode::DecryptAes.code(), -40007);
        assert_eq!(ErrorCode::Other(-49999).code(), -49999);
    }

    #[test]
    fn test_signature_is_order_independent_sha1() {
        let c = crypt();
        let sig = c.signature("1409659589", "263014780", "abc");
        assert_eq!(sig.len(), 40);
        assert!(sig.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));

        // Sorting makes the argument order irrelevant.
        let mut parts = [TOKEN, "1409659589", "263014780", "abc"];
        parts.sort_unstable();
        let mut hasher = Sha1::new();
        hasher.update(parts.concat().as_bytes());
        assert_eq!(sig, hex::encode(hasher.finalize()));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let c = crypt();
        let encrypted = c.encrypt("1616140317555161061").unwrap();
        assert_eq!(c.decrypt(&encrypted).unwrap(), "1616140317555161061");
    }

    #[test]
    fn test_ciphertext_is_block_aligned() {
        let c = crypt();
        let encrypted = c.encrypt_with_prefix(b"aaaaaaaaaaaaaaaa", "x").unwrap();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encrypted)
            .unwrap();
        assert_eq!(raw.len() % PAD_BLOCK_SIZE, 0);
    }

    #[test]
    fn test_decrypt_rejects_other_corp() {
        let other = WxBizMsgCrypt::new(CallbackCredentials::new(TOKEN, KEY, "wwOTHERCORP"));
        let encrypted = other.encrypt("hello").unwrap();
        assert_eq!(crypt().decrypt(&encrypted), Err(ErrorCode::ValidateCorpid));
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        assert_eq!(crypt().decrypt("!!!not base64!!!"), Err(ErrorCode::DecryptAes));
        assert_eq!(crypt().decrypt("YWJj"), Err(ErrorCode::DecryptAes));
    }

    #[test]
    fn test_illegal_aes_key() {
        let c = WxBizMsgCrypt::new(CallbackCredentials::new(TOKEN, "short", CORP_ID));
        assert_eq!(c.encrypt("hello"), Err(ErrorCode::IllegalAesKey));
        assert_eq!(c.decrypt("YWJj"), Err(ErrorCode::IllegalAesKey));
    }

    #[test]
    fn test_verify_url() {
        let c = crypt();
        let echostr = c.encrypt("echo-challenge").unwrap();
        let sig = c.signature("1409659589", "263014780", &echostr);

        assert_eq!(
            c.verify_url(&sig, "1409659589", "263014780", &echostr).unwrap(),
            "echo-challenge"
        );
        assert_eq!(
            c.verify_url(&sig, "1409659590", "263014780", &echostr),
            Err(ErrorCode::ValidateSignature)
        );
    }

    #[test]
    fn test_decrypt_msg_round_trip() {
        let c = crypt();
        let plaintext = "<xml><Content><![CDATA[hello]]></Content></xml>";
        let envelope_xml = c.encrypt_msg(plaintext, "1372623149", Some("1409659813")).unwrap();
        let envelope = EncryptedEnvelope::parse(&envelope_xml).unwrap();

        assert_eq!(envelope.timestamp, "1409659813");
        assert_eq!(envelope.nonce, "1372623149");
        assert_eq!(
            envelope.msg_signature,
            c.signature("1409659813", "1372623149", &envelope.encrypt)
        );

        let post_body = format!(
            "<xml><ToUserName><![CDATA[{}]]></ToUserName><AgentID><![CDATA[218]]></AgentID><Encrypt><![CDATA[{}]]></Encrypt></xml>",
            CORP_ID, envelope.encrypt
        );
        let decrypted = c
            .decrypt_msg(&post_body, &envelope.msg_signature, "1409659813", "1372623149")
            .unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_msg_parse_error() {
        assert_eq!(
            crypt().decrypt_msg("<xml><ToUserName>x</ToUserName></xml>", "sig", "1", "2"),
            Err(ErrorCode::ParseXml)
        );
        assert_eq!(
            crypt().decrypt_msg("not xml at all", "sig", "1", "2"),
            Err(ErrorCode::ParseXml)
        );
    }

    #[test]
    fn test_encrypt_msg_defaults_timestamp() {
        let xml = crypt().encrypt_msg("hi", "nonce", None).unwrap();
        let envelope = EncryptedEnvelope::parse(&xml).unwrap();
        let ts: u64 = envelope.timestamp.parse().unwrap();
        assert!(ts > 1_600_000_000);
    }

    #[test]
    fn test_pkcs7_unpad_out_of_range() {
        assert_eq!(pkcs7_unpad(&[1, 2, 3, 0]), &[1u8, 2, 3, 0][..]);
        assert_eq!(pkcs7_unpad(&[1, 2, 2]), &[1u8][..]);
        assert_eq!(pkcs7_unpad(&[9, 40]), &[9u8, 40][..]);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
