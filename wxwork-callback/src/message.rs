//! XML message types exchanged with WeCom.
//!
//! Three shapes travel over the wire:
//! - [`InboundEnvelope`]: the POST body, carrying the encrypted payload
//! - [`PlaintextMessage`]: the decrypted payload
//! - [`ReplyMessage`] / [`EncryptedEnvelope`]: the reply before and after encryption
//!
//! Every document is a flat `<xml>` root whose children hold either CDATA or
//! plain text, so parsing collects the direct children of the root into a map.

use std::collections::HashMap;

use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// Message type that qualifies for a reply.
pub const MSG_TYPE_TEXT: &str = "text";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid utf-8 in xml: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("missing root element")]
    MissingRoot,

    #[error("unterminated element")]
    Unterminated,

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

// =============================================================================
// Inbound
// =============================================================================

/// Encrypted POST body as delivered by WeCom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub to_user_name: String,
    pub agent_id: String,
    pub encrypt: String,
}

impl InboundEnvelope {
    /// Parse the envelope. Only `Encrypt` is mandatory.
    pub fn parse(xml: &str) -> Result<Self, MessageError> {
        let mut fields = parse_fields(xml)?;
        let encrypt = fields
            .remove("Encrypt")
            .filter(|v| !v.is_empty())
            .ok_or(MessageError::MissingField("Encrypt"))?;

        Ok(Self {
            to_user_name: fields.remove("ToUserName").unwrap_or_default(),
            agent_id: fields.remove("AgentID").unwrap_or_default(),
            encrypt,
        })
    }
}

/// Decrypted message. Absent fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaintextMessage {
    pub to_user_name: String,
    pub from_user_name: String,
    pub msg_type: String,
    pub content: String,
}

impl PlaintextMessage {
    pub fn parse(xml: &str) -> Result<Self, MessageError> {
        let mut fields = parse_fields(xml)?;
        let mut take = |name: &str| fields.remove(name).unwrap_or_default();

        Ok(Self {
            to_user_name: take("ToUserName"),
            from_user_name: take("FromUserName"),
            msg_type: take("MsgType"),
            content: take("Content"),
        })
    }

    pub fn is_text(&self) -> bool {
        self.msg_type == MSG_TYPE_TEXT
    }

    pub fn has_both_users(&self) -> bool {
        !self.to_user_name.is_empty() && !self.from_user_name.is_empty()
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Plaintext reply, addressed back to the sender of the inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    pub to_user_name: String,
    pub from_user_name: String,
    pub create_time: u64,
    pub msg_type: &'static str,
    pub content: String,
}

impl ReplyMessage {
    /// Build a text reply with the sender and recipient of `inbound` swapped.
    pub fn text_reply(inbound: &PlaintextMessage, content: String, create_time: u64) -> Self {
        Self {
            to_user_name: inbound.from_user_name.clone(),
            from_user_name: inbound.to_user_name.clone(),
            create_time,
            msg_type: MSG_TYPE_TEXT,
            content,
        }
    }

    pub fn to_xml(&self) -> Result<String, MessageError> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Start(BytesStart::new("xml")))?;
        write_cdata_element(&mut writer, "ToUserName", &self.to_user_name)?;
        write_cdata_element(&mut writer, "FromUserName", &self.from_user_name)?;
        write_text_element(&mut writer, "CreateTime", &self.create_time.to_string())?;
        write_cdata_element(&mut writer, "MsgType", self.msg_type)?;
        write_cdata_element(&mut writer, "Content", &self.content)?;
        writer.write_event(Event::End(BytesEnd::new("xml")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

/// Encrypted reply body returned to WeCom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub encrypt: String,
    pub msg_signature: String,
    pub timestamp: String,
    pub nonce: String,
}

impl EncryptedEnvelope {
    pub fn parse(xml: &str) -> Result<Self, MessageError> {
        let mut fields = parse_fields(xml)?;
        let mut require = |name: &'static str| {
            fields
                .remove(name)
                .filter(|v| !v.is_empty())
                .ok_or(MessageError::MissingField(name))
        };

        Ok(Self {
            encrypt: require("Encrypt")?,
            msg_signature: require("MsgSignature")?,
            timestamp: require("TimeStamp")?,
            nonce: require("Nonce")?,
        })
    }

    pub fn to_xml(&self) -> Result<String, MessageError> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Start(BytesStart::new("xml")))?;
        write_cdata_element(&mut writer, "Encrypt", &self.encrypt)?;
        write_cdata_element(&mut writer, "MsgSignature", &self.msg_signature)?;
        write_text_element(&mut writer, "TimeStamp", &self.timestamp)?;
        write_cdata_element(&mut writer, "Nonce", &self.nonce)?;
        writer.write_event(Event::End(BytesEnd::new("xml")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Collect the text of every direct child of the root element.
///
/// CDATA and escaped text are concatenated verbatim; deeper elements are
/// ignored. Whitespace between elements outside the fields is skipped.
fn parse_fields(xml: &str) -> Result<HashMap<String, String>, MessageError> {
    let mut reader = Reader::from_str(xml);

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth == 0 && saw_root {
                    return Err(MessageError::MissingRoot);
                }
                depth += 1;
                if depth == 1 {
                    saw_root = true;
                } else if depth == 2 {
                    let name = String::from_utf8(e.name().as_ref().to_vec())?;
                    fields.entry(name.clone()).or_default();
                    current = Some(name);
                }
            }
            Event::Empty(e) => {
                if depth == 0 {
                    // `<xml/>` is a root without children
                    saw_root = true;
                } else if depth == 1 {
                    let name = String::from_utf8(e.name().as_ref().to_vec())?;
                    fields.entry(name).or_default();
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    current = None;
                }
                depth = depth.checked_sub(1).ok_or(MessageError::MissingRoot)?;
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                if depth == 2 {
                    if let Some(value) = current.as_ref().and_then(|n| fields.get_mut(n)) {
                        value.push_str(&text);
                    }
                } else if depth == 0 && !text.trim().is_empty() {
                    return Err(MessageError::MissingRoot);
                }
            }
            Event::CData(c) => {
                if depth == 2 {
                    let text = String::from_utf8(c.into_inner().into_owned())?;
                    if let Some(value) = current.as_ref().and_then(|n| fields.get_mut(n)) {
                        value.push_str(&text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(MessageError::MissingRoot);
    }
    if depth != 0 {
        return Err(MessageError::Unterminated);
    }

    Ok(fields)
}

fn write_cdata_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    value: &str,
) -> Result<(), MessageError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::CData(BytesCData::new(split_cdata_terminators(value))))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    value: &str,
) -> Result<(), MessageError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// A literal `]]>` would close the section early, so split it across two sections.
fn split_cdata_terminators(value: &str) -> String {
    value.replace("]]>", "]]]]><![CDATA[>")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT_MESSAGE: &str = "<xml><ToUserName><![CDATA[WWA]]></ToUserName>\
        <FromUserName><![CDATA[u001]]></FromUserName>\
        <CreateTime>1348831860</CreateTime>\
        <MsgType><![CDATA[text]]></MsgType>\
        <Content><![CDATA[hello]]></Content>\
        <MsgId>1234567890123456</MsgId>\
        <AgentID>1</AgentID></xml>";

    #[test]
    fn test_parse_text_message() {
        let msg = PlaintextMessage::parse(TEXT_MESSAGE).unwrap();

        assert_eq!(msg.to_user_name, "WWA");
        assert_eq!(msg.from_user_name, "u001");
        assert_eq!(msg.msg_type, "text");
        assert_eq!(msg.content, "hello");
        assert!(msg.is_text());
        assert!(msg.has_both_users());
    }

    #[test]
    fn test_parse_missing_fields_are_empty() {
        let msg = PlaintextMessage::parse(
            "<xml><MsgType><![CDATA[event]]></MsgType><Event>subscribe</Event></xml>",
        )
        .unwrap();

        assert_eq!(msg.msg_type, "event");
        assert!(msg.to_user_name.is_empty());
        assert!(msg.content.is_empty());
        assert!(!msg.has_both_users());
    }

    #[test]
    fn test_parse_plain_text_and_entities() {
        let msg = PlaintextMessage::parse(
            "<xml>\n  <ToUserName>corp</ToUserName>\n  <Content>a &amp; b</Content>\n</xml>",
        )
        .unwrap();

        assert_eq!(msg.to_user_name, "corp");
        assert_eq!(msg.content, "a & b");
    }

    #[test]
    fn test_parse_keeps_field_whitespace() {
        let msg = PlaintextMessage::parse(
            "<?xml version=\"1.0\"?>\n<xml>\n  <ToUserName> WWA </ToUserName>\n  \
             <FromUserName>u001</FromUserName>\n  <Content>  hi there  </Content>\n</xml>\n",
        )
        .unwrap();

        assert_eq!(msg.to_user_name, " WWA ");
        assert_eq!(msg.from_user_name, "u001");
        assert_eq!(msg.content, "  hi there  ");
    }

    #[test]
    fn test_parse_rejects_non_xml() {
        assert!(PlaintextMessage::parse("definitely not xml").is_err());
        assert!(PlaintextMessage::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_document() {
        let err = PlaintextMessage::parse("<xml><ToUserName><![CDATA[WWA]]></ToUserName>");
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_rejects_mismatched_tags() {
        assert!(PlaintextMessage::parse("<xml><ToUserName>a</FromUserName></xml>").is_err());
    }

    #[test]
    fn test_inbound_envelope() {
        let env = InboundEnvelope::parse(
            "<xml><ToUserName><![CDATA[wx5823bf96d3bd56c7]]></ToUserName>\
             <AgentID><![CDATA[218]]></AgentID>\
             <Encrypt><![CDATA[RypEvHKD8QQKFhvQ6QleEB4J58tiPdvo+rtK1I9qca6aM/wvqnLSV5zEPeusUiX5L5X/0lWfrf0QADHHhGd3QczcdCUpj911L3vg3W/sYYvuJTs3TUUkSUXxaccAS0qhxchrRYt66wiSpGLYL42aM6A8dTT+6k4aSknmPj48kzJs8qLjvd4Xgpue06DOdnLxAUHzM6+kDZ+HMZfJYuR+LtwGc2hgf5gsijff0ekUNXZiqATP7PF5mZxZ3Izoun1s4zG4LUMnvw2r+KqCKIw+3IQH03v+BCA9nMELNqbSf6tiWSrXJB3LAVGUcallcrw8V2t9EL4EhzJWrQUax5wLVMNS0+rUPA3k22Ncx4XXZS9o0MBH27Bo6BpNelZpS+/uh9KsNlY6bHCmJU9p8g7m3fVKn28H3KDYA5Pl/T8Z1ptDAVe0lXdQ2YoyyH2uyPIGHBZZIs2pDBS8R07+qN+E7Q==]]></Encrypt>\
             </xml>",
        )
        .unwrap();

        assert_eq!(env.to_user_name, "wx5823bf96d3bd56c7");
        assert_eq!(env.agent_id, "218");
        assert!(env.encrypt.starts_with("RypEvHKD8QQK"));
    }

    #[test]
    fn test_inbound_envelope_requires_encrypt() {
        let err = InboundEnvelope::parse("<xml><ToUserName>a</ToUserName></xml>").unwrap_err();
        assert!(matches!(err, MessageError::MissingField("Encrypt")));
    }

    #[test]
    fn test_reply_swaps_users() {
        let inbound = PlaintextMessage::parse(TEXT_MESSAGE).unwrap();
        let reply = ReplyMessage::text_reply(&inbound, "Received: hello".to_string(), 1700000000);

        assert_eq!(reply.to_user_name, "u001");
        assert_eq!(reply.from_user_name, "WWA");
        assert_eq!(reply.msg_type, "text");
    }

    #[test]
    fn test_reply_xml_shape() {
        let inbound = PlaintextMessage::parse(TEXT_MESSAGE).unwrap();
        let reply = ReplyMessage::text_reply(&inbound, "Received: hello".to_string(), 1700000000);

        assert_eq!(
            reply.to_xml().unwrap(),
            "<xml><ToUserName><![CDATA[u001]]></ToUserName>\
             <FromUserName><![CDATA[WWA]]></FromUserName>\
             <CreateTime>1700000000</CreateTime>\
             <MsgType><![CDATA[text]]></MsgType>\
             <Content><![CDATA[Received: hello]]></Content></xml>"
        );
    }

    #[test]
    fn test_reply_content_with_cdata_terminator_survives() {
        let inbound = PlaintextMessage::parse(TEXT_MESSAGE).unwrap();
        let tricky = "a ]]> b <c> & d".to_string();
        let reply = ReplyMessage::text_reply(&inbound, tricky.clone(), 1);

        let parsed = PlaintextMessage::parse(&reply.to_xml().unwrap()).unwrap();
        assert_eq!(parsed.content, tricky);
        assert_eq!(parsed.to_user_name, "u001");
    }

    #[test]
    fn test_encrypted_envelope_xml() {
        let env = EncryptedEnvelope {
            encrypt: "abc+/=".to_string(),
            msg_signature: "deadbeef".to_string(),
            timestamp: "1409659813".to_string(),
            nonce: "1372623149".to_string(),
        };
        let xml = env.to_xml().unwrap();

        assert_eq!(
            xml,
            "<xml><Encrypt><![CDATA[abc+/=]]></Encrypt>\
             <MsgSignature><![CDATA[deadbeef]]></MsgSignature>\
             <TimeStamp>1409659813</TimeStamp>\
             <Nonce><![CDATA[1372623149]]></Nonce></xml>"
        );
        assert_eq!(EncryptedEnvelope::parse(&xml).unwrap(), env);
    }
}
