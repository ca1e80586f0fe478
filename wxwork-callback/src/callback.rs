//! Callback protocol handling.
//!
//! Two flows share one crypto collaborator:
//!
//! ```text
//! GET  /  → verify_url()      → decrypted echostr as text/plain
//! POST /  → handle_message()  → encrypted reply XML, or an empty 200
//! ```
//!
//! Neither flow touches HTTP types. Both return an [`Outcome`] that the web
//! layer maps to a status code.
//!
//! WeCom redelivers a POST until it gets a 200. Anything that is not an
//! authenticity or decryption failure therefore ends in an empty 200:
//! unsupported message types, unparseable plaintext and internal faults
//! (including a failed reply encryption). The GET challenge is a one-shot
//! setup call, so internal faults there surface as a server error.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::crypto::{CryptResult, ErrorCode, MsgCrypt};
use crate::message::{PlaintextMessage, ReplyMessage};
use crate::util::{unix_timestamp, url_decode};

/// Prepended to the inbound content to form the reply.
pub const REPLY_PREFIX: &str = "Received: ";

/// Result of processing one callback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// URL verification passed; carries the decrypted echo string.
    Verified(String),
    /// Message accepted. `Some` holds the encrypted reply XML, `None` means
    /// "received, no reply".
    Decrypted(Option<String>),
    /// Authenticity or decryption failure. The reason is informational only.
    Rejected(String),
    /// Unexpected failure while verifying the URL.
    InternalError(String),
}

/// Query parameters of the URL verification GET.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationRequest {
    pub msg_signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub echostr: String,
}

/// Query parameters of a message delivery POST.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRequest {
    pub msg_signature: String,
    pub timestamp: String,
    pub nonce: String,
}

/// Human-readable reason for a collaborator failure.
pub fn rejection_reason(code: ErrorCode) -> String {
    match code {
        ErrorCode::ValidateSignature => "signature validation failed".to_string(),
        ErrorCode::ComputeSignature => "signature computation error".to_string(),
        ErrorCode::DecryptAes => "decryption failed".to_string(),
        ErrorCode::IllegalAesKey => "illegal AES key".to_string(),
        ErrorCode::ValidateCorpid => "corp id validation failed".to_string(),
        ErrorCode::ParseXml => "xml parse error".to_string(),
        other => format!("verification failed, code={}", other.code()),
    }
}

/// Reply text for an inbound text message.
pub fn reply_content(content: &str) -> String {
    format!("{}{}", REPLY_PREFIX, content)
}

/// Strip surrounding whitespace and any byte-order mark from the echo string.
fn clean_echo(echo: &str) -> String {
    echo.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}')
        .to_string()
}

/// Runs both callback flows against a crypto collaborator.
#[derive(Clone)]
pub struct CallbackHandler {
    crypt: Arc<dyn MsgCrypt>,
    crypto_timeout: Duration,
}

impl CallbackHandler {
    pub fn new(crypt: Arc<dyn MsgCrypt>, crypto_timeout: Duration) -> Self {
        Self {
            crypt,
            crypto_timeout,
        }
    }

    /// URL verification: check the signature and return the decrypted echo.
    pub async fn verify_url(&self, request: VerificationRequest) -> Outcome {
        let msg_signature = url_decode(&request.msg_signature).into_owned();
        let timestamp = url_decode(&request.timestamp).into_owned();
        let nonce = url_decode(&request.nonce).into_owned();
        let echostr = url_decode(&request.echostr).into_owned();

        info!(
            timestamp = %timestamp,
            nonce = %nonce,
            echostr_length = echostr.len(),
            "callback_verify_received"
        );

        let result = self
            .call("verify_url", move |crypt| {
                crypt.verify_url(&msg_signature, &timestamp, &nonce, &echostr)
            })
            .await;

        match result {
            Err(detail) => Outcome::InternalError(format!("internal server error: {}", detail)),
            Ok(Err(code)) => {
                warn!(code = code.code(), error = %code, "callback_verify_failed");
                Outcome::Rejected(rejection_reason(code))
            }
            Ok(Ok(echo)) => {
                let echo = clean_echo(&echo);
                info!(echo_length = echo.len(), "callback_verified");
                Outcome::Verified(echo)
            }
        }
    }

    /// Message delivery: decrypt, decide on a reply, encrypt it.
    pub async fn handle_message(&self, request: MessageRequest, body: String) -> Outcome {
        let msg_signature = url_decode(&request.msg_signature).into_owned();
        let timestamp = url_decode(&request.timestamp).into_owned();
        let nonce = url_decode(&request.nonce).into_owned();

        info!(
            timestamp = %timestamp,
            nonce = %nonce,
            body_length = body.len(),
            "callback_message_received"
        );

        let decrypt_timestamp = timestamp.clone();
        let decrypt_nonce = nonce.clone();
        let result = self
            .call("decrypt_msg", move |crypt| {
                crypt.decrypt_msg(&body, &msg_signature, &decrypt_timestamp, &decrypt_nonce)
            })
            .await;

        let plaintext = match result {
            Err(detail) => {
                error!(detail = %detail, "callback_message_internal_fault");
                return Outcome::Decrypted(None);
            }
            Ok(Err(code)) => {
                warn!(code = code.code(), error = %code, "callback_message_decrypt_failed");
                return Outcome::Rejected(rejection_reason(code));
            }
            Ok(Ok(plaintext)) => plaintext,
        };

        let inbound = match PlaintextMessage::parse(&plaintext) {
            Ok(m) => m,
            Err(e) => {
                info!(reason = "unparseable", error = %e, "callback_message_ignored");
                return Outcome::Decrypted(None);
            }
        };

        if !inbound.is_text() {
            info!(
                reason = "unsupported_msg_type",
                msg_type = %inbound.msg_type,
                "callback_message_ignored"
            );
            return Outcome::Decrypted(None);
        }

        if !inbound.has_both_users() {
            info!(
                reason = "missing_user",
                has_to_user = !inbound.to_user_name.is_empty(),
                has_from_user = !inbound.from_user_name.is_empty(),
                "callback_message_ignored"
            );
            return Outcome::Decrypted(None);
        }

        let reply = ReplyMessage::text_reply(
            &inbound,
            reply_content(&inbound.content),
            unix_timestamp(),
        );

        let reply_xml = match reply.to_xml() {
            Ok(xml) => xml,
            Err(e) => {
                error!(error = %e, "callback_reply_build_failed");
                return Outcome::Decrypted(None);
            }
        };

        let result = self
            .call("encrypt_msg", move |crypt| {
                crypt.encrypt_msg(&reply_xml, &nonce, Some(&timestamp))
            })
            .await;

        match result {
            Ok(Ok(encrypted)) => {
                info!(
                    to_user = %reply.to_user_name,
                    reply_length = encrypted.len(),
                    "callback_message_replied"
                );
                Outcome::Decrypted(Some(encrypted))
            }
            Ok(Err(code)) => {
                error!(code = code.code(), error = %code, "callback_reply_encrypt_failed");
                Outcome::Decrypted(None)
            }
            Err(detail) => {
                error!(detail = %detail, "callback_reply_encrypt_failed");
                Outcome::Decrypted(None)
            }
        }
    }

    /// Run a collaborator call on the blocking pool, bounded by the crypto timeout.
    ///
    /// The outer `Err` reports a panic or timeout.
    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<CryptResult<T>, String>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MsgCrypt) -> CryptResult<T> + Send + 'static,
    {
        let crypt = Arc::clone(&self.crypt);
        let task = tokio::task::spawn_blocking(move || f(&*crypt));

        match tokio::time::timeout(self.crypto_timeout, task).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                error!(operation, error = %e, "crypto_call_failed");
                Err(format!("{} failed", operation))
            }
            Err(_) => {
                error!(
                    operation,
                    timeout_ms = self.crypto_timeout.as_millis() as u64,
                    "crypto_call_timed_out"
                );
                Err(format!("{} timed out", operation))
            }
        }
    }
}
