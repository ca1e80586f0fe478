//! WxCallback - WeCom callback endpoint.
//!
//! Handles the two requests WeCom sends to a callback URL:
//! - `GET /`: URL ownership verification (decrypt and echo `echostr`)
//! - `POST /`: encrypted message delivery, answered with an encrypted reply
//!
//! ## Architecture
//!
//! ```text
//! HTTP → web (axum) → callback::CallbackHandler → crypto::MsgCrypt
//!                              ↓
//!                   message (XML parse / build)
//! ```

pub mod callback;
pub mod config;
pub mod crypto;
pub mod message;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use callback::{CallbackHandler, MessageRequest, Outcome, VerificationRequest};
pub use config::{CallbackCredentials, Config};
pub use crypto::{CryptResult, ErrorCode, MsgCrypt, WxBizMsgCrypt};
pub use message::{EncryptedEnvelope, InboundEnvelope, PlaintextMessage, ReplyMessage};
pub use web::AppState;
