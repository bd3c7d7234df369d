// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

// Canonical binary TLV codec.
//
// All parsing is safe: malformed input returns Err, never panics.
//
// Envelope layout:
//   [0]      version (u8)
//   [1]      kind (u8)
//   [2..18]  message_id (16 bytes)
//   [18..34] trace_id (16 bytes)
//   [34..]   fields: tag (u8) | len (u32 LE) | value
//
// Field tags are scoped to the kind. Tags the decoder does not recognize
// are preserved as `Envelope::extensions` and re-emitted on encode.

use std::fmt;

use uuid::Uuid;

use crate::envelope::{
    CommandRequest, CommandResponse, CommandStatus, Envelope, Event, HandshakeRequest,
    HandshakeResponse, HandshakeStatus, Payload, UnknownField, WireError, WIRE_VERSION,
};

/// Fixed header size before the TLV section.
pub const HEADER_SIZE: usize = 34;

// Payload kind bytes.
pub const KIND_HANDSHAKE_REQUEST: u8 = 0x01;
pub const KIND_HANDSHAKE_RESPONSE: u8 = 0x02;
pub const KIND_HEARTBEAT: u8 = 0x03;
pub const KIND_COMMAND_REQUEST: u8 = 0x04;
pub const KIND_COMMAND_RESPONSE: u8 = 0x05;
pub const KIND_EVENT: u8 = 0x06;
pub const KIND_ERROR: u8 = 0x07;

// HandshakeRequest field tags.
const TAG_HS_BOT_ID: u8 = 0x01;
const TAG_HS_INSTANCE_ID: u8 = 0x02;
const TAG_HS_AUTH_TOKEN: u8 = 0x03;
const TAG_HS_CAPABILITY: u8 = 0x04;
const TAG_HS_MAX_VERSION: u8 = 0x05;

// HandshakeResponse field tags.
const TAG_HR_STATUS: u8 = 0x01;
const TAG_HR_HEARTBEAT_SECS: u8 = 0x02;
const TAG_HR_ISSUED_KEY: u8 = 0x03;
const TAG_HR_ERROR_MESSAGE: u8 = 0x04;
const TAG_HR_WIRE_VERSION: u8 = 0x05;

// CommandRequest field tags.
const TAG_CQ_COMMAND_ID: u8 = 0x01;
const TAG_CQ_COMMAND_NAME: u8 = 0x02;
const TAG_CQ_ARGUMENTS: u8 = 0x03;
const TAG_CQ_DEADLINE_MS: u8 = 0x04;

// CommandResponse field tags.
const TAG_CR_COMMAND_ID: u8 = 0x01;
const TAG_CR_STATUS: u8 = 0x02;
const TAG_CR_RESULT: u8 = 0x03;
const TAG_CR_ERROR_MESSAGE: u8 = 0x04;

// Event field tags.
const TAG_EV_NAME: u8 = 0x01;
const TAG_EV_PAYLOAD: u8 = 0x02;

// Error field tags.
const TAG_ER_CODE: u8 = 0x01;
const TAG_ER_MESSAGE: u8 = 0x02;

/// Decode failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes for the header or a declared field length.
    Truncated,
    /// A field was present but structurally invalid, or a required field
    /// was missing. Carries the field name for diagnostics.
    MalformedField(&'static str),
    /// Unknown payload kind byte.
    UnknownVariant(u8),
    /// Frame version exceeds [`WIRE_VERSION`].
    UnsupportedVersion(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame"),
            Self::MalformedField(name) => write!(f, "malformed field: {}", name),
            Self::UnknownVariant(kind) => write!(f, "unknown payload kind: 0x{:02x}", kind),
            Self::UnsupportedVersion(v) => write!(f, "unsupported wire version: {}", v),
        }
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode an envelope. Total for any structurally valid envelope.
pub fn encode(env: &Envelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + 64);
    buf.push(WIRE_VERSION);
    buf.push(kind_byte(&env.payload));
    buf.extend_from_slice(env.message_id.as_bytes());
    buf.extend_from_slice(env.trace_id.as_bytes());

    match &env.payload {
        Payload::HandshakeRequest(p) => {
            put_str(&mut buf, TAG_HS_BOT_ID, &p.bot_id);
            put_str(&mut buf, TAG_HS_INSTANCE_ID, &p.instance_id);
            put_str(&mut buf, TAG_HS_AUTH_TOKEN, &p.auth_token);
            for cap in &p.capabilities {
                put_str(&mut buf, TAG_HS_CAPABILITY, cap);
            }
            put_u8(&mut buf, TAG_HS_MAX_VERSION, p.max_wire_version);
        }
        Payload::HandshakeResponse(p) => {
            put_u8(&mut buf, TAG_HR_STATUS, p.status.as_u8());
            put_u32(&mut buf, TAG_HR_HEARTBEAT_SECS, p.heartbeat_interval_secs);
            if let Some(key) = &p.issued_api_key {
                put_str(&mut buf, TAG_HR_ISSUED_KEY, key);
            }
            if let Some(msg) = &p.error_message {
                put_str(&mut buf, TAG_HR_ERROR_MESSAGE, msg);
            }
            put_u8(&mut buf, TAG_HR_WIRE_VERSION, p.wire_version);
        }
        Payload::Heartbeat => {}
        Payload::CommandRequest(p) => {
            put_bytes(&mut buf, TAG_CQ_COMMAND_ID, p.command_id.as_bytes());
            put_str(&mut buf, TAG_CQ_COMMAND_NAME, &p.command_name);
            put_bytes(&mut buf, TAG_CQ_ARGUMENTS, &p.arguments);
            put_u32(&mut buf, TAG_CQ_DEADLINE_MS, p.deadline_ms);
        }
        Payload::CommandResponse(p) => {
            put_bytes(&mut buf, TAG_CR_COMMAND_ID, p.command_id.as_bytes());
            put_u8(&mut buf, TAG_CR_STATUS, p.status.as_u8());
            put_bytes(&mut buf, TAG_CR_RESULT, &p.result);
            if let Some(msg) = &p.error_message {
                put_str(&mut buf, TAG_CR_ERROR_MESSAGE, msg);
            }
        }
        Payload::Event(p) => {
            put_str(&mut buf, TAG_EV_NAME, &p.name);
            put_bytes(&mut buf, TAG_EV_PAYLOAD, &p.payload);
        }
        Payload::Error(p) => {
            put_u16(&mut buf, TAG_ER_CODE, p.code);
            put_str(&mut buf, TAG_ER_MESSAGE, &p.message);
        }
    }

    for ext in &env.extensions {
        put_bytes(&mut buf, ext.tag, &ext.data);
    }

    buf
}

fn kind_byte(payload: &Payload) -> u8 {
    match payload {
        Payload::HandshakeRequest(_) => KIND_HANDSHAKE_REQUEST,
        Payload::HandshakeResponse(_) => KIND_HANDSHAKE_RESPONSE,
        Payload::Heartbeat => KIND_HEARTBEAT,
        Payload::CommandRequest(_) => KIND_COMMAND_REQUEST,
        Payload::CommandResponse(_) => KIND_COMMAND_RESPONSE,
        Payload::Event(_) => KIND_EVENT,
        Payload::Error(_) => KIND_ERROR,
    }
}

fn put_bytes(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

fn put_str(buf: &mut Vec<u8>, tag: u8, value: &str) {
    put_bytes(buf, tag, value.as_bytes());
}

fn put_u8(buf: &mut Vec<u8>, tag: u8, value: u8) {
    put_bytes(buf, tag, &[value]);
}

fn put_u16(buf: &mut Vec<u8>, tag: u8, value: u16) {
    put_bytes(buf, tag, &value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, tag: u8, value: u32) {
    put_bytes(buf, tag, &value.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one envelope from a full frame body.
pub fn decode(buf: &[u8]) -> Result<Envelope, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated);
    }
    let version = buf[0];
    if version > WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let kind = buf[1];
    let message_id = read_uuid(&buf[2..18]);
    let trace_id = read_uuid(&buf[18..34]);

    let mut fields = FieldReader::new(&buf[HEADER_SIZE..]);
    let mut extensions = Vec::new();

    let payload = match kind {
        KIND_HANDSHAKE_REQUEST => decode_handshake_request(&mut fields, &mut extensions)?,
        KIND_HANDSHAKE_RESPONSE => decode_handshake_response(&mut fields, &mut extensions)?,
        KIND_HEARTBEAT => {
            drain_unknown(&mut fields, &mut extensions)?;
            Payload::Heartbeat
        }
        KIND_COMMAND_REQUEST => decode_command_request(&mut fields, &mut extensions)?,
        KIND_COMMAND_RESPONSE => decode_command_response(&mut fields, &mut extensions)?,
        KIND_EVENT => decode_event(&mut fields, &mut extensions)?,
        KIND_ERROR => decode_error(&mut fields, &mut extensions)?,
        other => return Err(DecodeError::UnknownVariant(other)),
    };

    Ok(Envelope {
        message_id,
        trace_id,
        payload,
        extensions,
    })
}

fn read_uuid(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Uuid::from_bytes(raw)
}

/// Iterates TLV fields over the remainder of a frame.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn next(&mut self) -> Result<Option<(u8, &'a [u8])>, DecodeError> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        if self.pos + 5 > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let tag = self.buf[self.pos];
        let len = u32::from_le_bytes([
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
            self.buf[self.pos + 4],
        ]) as usize;
        let start = self.pos + 5;
        let end = start.checked_add(len).ok_or(DecodeError::Truncated)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        self.pos = end;
        Ok(Some((tag, &self.buf[start..end])))
    }
}

fn drain_unknown(
    fields: &mut FieldReader<'_>,
    extensions: &mut Vec<UnknownField>,
) -> Result<(), DecodeError> {
    while let Some((tag, value)) = fields.next()? {
        extensions.push(UnknownField {
            tag,
            data: value.to_vec(),
        });
    }
    Ok(())
}

fn as_str(value: &[u8], name: &'static str) -> Result<String, DecodeError> {
    std::str::from_utf8(value)
        .map(|s| s.to_string())
        .map_err(|_| DecodeError::MalformedField(name))
}

fn as_u8(value: &[u8], name: &'static str) -> Result<u8, DecodeError> {
    if value.len() != 1 {
        return Err(DecodeError::MalformedField(name));
    }
    Ok(value[0])
}

fn as_u16(value: &[u8], name: &'static str) -> Result<u16, DecodeError> {
    if value.len() != 2 {
        return Err(DecodeError::MalformedField(name));
    }
    Ok(u16::from_le_bytes([value[0], value[1]]))
}

fn as_u32(value: &[u8], name: &'static str) -> Result<u32, DecodeError> {
    if value.len() != 4 {
        return Err(DecodeError::MalformedField(name));
    }
    Ok(u32::from_le_bytes([value[0], value[1], value[2], value[3]]))
}

fn as_uuid(value: &[u8], name: &'static str) -> Result<Uuid, DecodeError> {
    if value.len() != 16 {
        return Err(DecodeError::MalformedField(name));
    }
    Ok(read_uuid(value))
}

fn decode_handshake_request(
    fields: &mut FieldReader<'_>,
    extensions: &mut Vec<UnknownField>,
) -> Result<Payload, DecodeError> {
    let mut bot_id = None;
    let mut instance_id = None;
    let mut auth_token = None;
    let mut capabilities = Vec::new();
    let mut max_wire_version = WIRE_VERSION;

    while let Some((tag, value)) = fields.next()? {
        match tag {
            TAG_HS_BOT_ID => bot_id = Some(as_str(value, "bot_id")?),
            TAG_HS_INSTANCE_ID => instance_id = Some(as_str(value, "instance_id")?),
            TAG_HS_AUTH_TOKEN => auth_token = Some(as_str(value, "auth_token")?),
            TAG_HS_CAPABILITY => capabilities.push(as_str(value, "capability")?),
            TAG_HS_MAX_VERSION => max_wire_version = as_u8(value, "max_wire_version")?,
            other => extensions.push(UnknownField {
                tag: other,
                data: value.to_vec(),
            }),
        }
    }

    Ok(Payload::HandshakeRequest(HandshakeRequest {
        bot_id: bot_id.ok_or(DecodeError::MalformedField("bot_id"))?,
        instance_id: instance_id.ok_or(DecodeError::MalformedField("instance_id"))?,
        auth_token: auth_token.ok_or(DecodeError::MalformedField("auth_token"))?,
        capabilities,
        max_wire_version,
    }))
}

fn decode_handshake_response(
    fields: &mut FieldReader<'_>,
    extensions: &mut Vec<UnknownField>,
) -> Result<Payload, DecodeError> {
    let mut status = None;
    let mut heartbeat_interval_secs = None;
    let mut issued_api_key = None;
    let mut error_message = None;
    let mut wire_version = WIRE_VERSION;

    while let Some((tag, value)) = fields.next()? {
        match tag {
            TAG_HR_STATUS => {
                let raw = as_u8(value, "status")?;
                status = Some(
                    HandshakeStatus::from_u8(raw).ok_or(DecodeError::MalformedField("status"))?,
                );
            }
            TAG_HR_HEARTBEAT_SECS => {
                heartbeat_interval_secs = Some(as_u32(value, "heartbeat_interval_secs")?)
            }
            TAG_HR_ISSUED_KEY => issued_api_key = Some(as_str(value, "issued_api_key")?),
            TAG_HR_ERROR_MESSAGE => error_message = Some(as_str(value, "error_message")?),
            TAG_HR_WIRE_VERSION => wire_version = as_u8(value, "wire_version")?,
            other => extensions.push(UnknownField {
                tag: other,
                data: value.to_vec(),
            }),
        }
    }

    Ok(Payload::HandshakeResponse(HandshakeResponse {
        status: status.ok_or(DecodeError::MalformedField("status"))?,
        heartbeat_interval_secs: heartbeat_interval_secs
            .ok_or(DecodeError::MalformedField("heartbeat_interval_secs"))?,
        issued_api_key,
        error_message,
        wire_version,
    }))
}

fn decode_command_request(
    fields: &mut FieldReader<'_>,
    extensions: &mut Vec<UnknownField>,
) -> Result<Payload, DecodeError> {
    let mut command_id = None;
    let mut command_name = None;
    let mut arguments = Vec::new();
    let mut deadline_ms = None;

    while let Some((tag, value)) = fields.next()? {
        match tag {
            TAG_CQ_COMMAND_ID => command_id = Some(as_uuid(value, "command_id")?),
            TAG_CQ_COMMAND_NAME => command_name = Some(as_str(value, "command_name")?),
            TAG_CQ_ARGUMENTS => arguments = value.to_vec(),
            TAG_CQ_DEADLINE_MS => deadline_ms = Some(as_u32(value, "deadline_ms")?),
            other => extensions.push(UnknownField {
                tag: other,
                data: value.to_vec(),
            }),
        }
    }

    Ok(Payload::CommandRequest(CommandRequest {
        command_id: command_id.ok_or(DecodeError::MalformedField("command_id"))?,
        command_name: command_name.ok_or(DecodeError::MalformedField("command_name"))?,
        arguments,
        deadline_ms: deadline_ms.ok_or(DecodeError::MalformedField("deadline_ms"))?,
    }))
}

fn decode_command_response(
    fields: &mut FieldReader<'_>,
    extensions: &mut Vec<UnknownField>,
) -> Result<Payload, DecodeError> {
    let mut command_id = None;
    let mut status = None;
    let mut result = Vec::new();
    let mut error_message = None;

    while let Some((tag, value)) = fields.next()? {
        match tag {
            TAG_CR_COMMAND_ID => command_id = Some(as_uuid(value, "command_id")?),
            TAG_CR_STATUS => {
                let raw = as_u8(value, "status")?;
                status =
                    Some(CommandStatus::from_u8(raw).ok_or(DecodeError::MalformedField("status"))?);
            }
            TAG_CR_RESULT => result = value.to_vec(),
            TAG_CR_ERROR_MESSAGE => error_message = Some(as_str(value, "error_message")?),
            other => extensions.push(UnknownField {
                tag: other,
                data: value.to_vec(),
            }),
        }
    }

    Ok(Payload::CommandResponse(CommandResponse {
        command_id: command_id.ok_or(DecodeError::MalformedField("command_id"))?,
        status: status.ok_or(DecodeError::MalformedField("status"))?,
        result,
        error_message,
    }))
}

fn decode_event(
    fields: &mut FieldReader<'_>,
    extensions: &mut Vec<UnknownField>,
) -> Result<Payload, DecodeError> {
    let mut name = None;
    let mut payload = Vec::new();

    while let Some((tag, value)) = fields.next()? {
        match tag {
            TAG_EV_NAME => name = Some(as_str(value, "name")?),
            TAG_EV_PAYLOAD => payload = value.to_vec(),
            other => extensions.push(UnknownField {
                tag: other,
                data: value.to_vec(),
            }),
        }
    }

    Ok(Payload::Event(Event {
        name: name.ok_or(DecodeError::MalformedField("name"))?,
        payload,
    }))
}

fn decode_error(
    fields: &mut FieldReader<'_>,
    extensions: &mut Vec<UnknownField>,
) -> Result<Payload, DecodeError> {
    let mut code = None;
    let mut message = None;

    while let Some((tag, value)) = fields.next()? {
        match tag {
            TAG_ER_CODE => code = Some(as_u16(value, "code")?),
            TAG_ER_MESSAGE => message = Some(as_str(value, "message")?),
            other => extensions.push(UnknownField {
                tag: other,
                data: value.to_vec(),
            }),
        }
    }

    Ok(Payload::Error(WireError {
        code: code.ok_or(DecodeError::MalformedField("code"))?,
        message: message.ok_or(DecodeError::MalformedField("message"))?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::new(Payload::HandshakeRequest(HandshakeRequest {
                bot_id: "bot-1".into(),
                instance_id: "inst-1".into(),
                auth_token: "deadbeef".into(),
                capabilities: vec!["message.send".into(), "task.execute".into()],
                max_wire_version: WIRE_VERSION,
            })),
            Envelope::new(Payload::HandshakeResponse(HandshakeResponse {
                status: HandshakeStatus::Success,
                heartbeat_interval_secs: 30,
                issued_api_key: Some("cafebabe".into()),
                error_message: None,
                wire_version: WIRE_VERSION,
            })),
            Envelope::new(Payload::HandshakeResponse(HandshakeResponse {
                status: HandshakeStatus::AuthFailed,
                heartbeat_interval_secs: 0,
                issued_api_key: None,
                error_message: Some("invalid authentication token".into()),
                wire_version: WIRE_VERSION,
            })),
            Envelope::new(Payload::Heartbeat),
            Envelope::new(Payload::CommandRequest(CommandRequest {
                command_id: Uuid::new_v4(),
                command_name: "t.exec".into(),
                arguments: br#"{"x":1}"#.to_vec(),
                deadline_ms: 30_000,
            })),
            Envelope::new(Payload::CommandResponse(CommandResponse {
                command_id: Uuid::new_v4(),
                status: CommandStatus::Success,
                result: br#"{"y":2}"#.to_vec(),
                error_message: None,
            })),
            Envelope::new(Payload::CommandResponse(CommandResponse {
                command_id: Uuid::new_v4(),
                status: CommandStatus::ExecutionError,
                result: vec![],
                error_message: Some("tool crashed".into()),
            })),
            Envelope::new(Payload::Event(Event {
                name: "adapter.ready".into(),
                payload: vec![0xAA, 0xBB],
            })),
            Envelope::new(Payload::Error(WireError {
                code: crate::envelope::ERR_BAD_HANDSHAKE,
                message: "first frame must be a handshake".into(),
            })),
        ]
    }

    #[test]
    fn test_roundtrip_all_variants() {
        for original in sample_envelopes() {
            let bytes = encode(&original);
            let parsed = decode(&bytes).unwrap();
            assert_eq!(parsed, original);
        }
    }

    #[test]
    fn test_decode_truncated_header() {
        assert_eq!(decode(&[]), Err(DecodeError::Truncated));
        assert_eq!(decode(&[WIRE_VERSION, KIND_HEARTBEAT]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_truncated_field() {
        let env = Envelope::new(Payload::Event(Event {
            name: "e".into(),
            payload: vec![1, 2, 3],
        }));
        let bytes = encode(&env);
        // Chop off the tail of the last field.
        assert_eq!(decode(&bytes[..bytes.len() - 1]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut bytes = encode(&Envelope::new(Payload::Heartbeat));
        bytes[1] = 0x7F;
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownVariant(0x7F)));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut bytes = encode(&Envelope::new(Payload::Heartbeat));
        bytes[0] = WIRE_VERSION + 1;
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::UnsupportedVersion(WIRE_VERSION + 1))
        );
    }

    #[test]
    fn test_decode_missing_required_field() {
        // An Error payload with only a code and no message.
        let env = Envelope::new(Payload::Error(WireError {
            code: 1,
            message: "x".into(),
        }));
        let mut bytes = Vec::new();
        bytes.push(WIRE_VERSION);
        bytes.push(KIND_ERROR);
        bytes.extend_from_slice(env.message_id.as_bytes());
        bytes.extend_from_slice(env.trace_id.as_bytes());
        put_u16(&mut bytes, TAG_ER_CODE, 1);
        assert_eq!(decode(&bytes), Err(DecodeError::MalformedField("message")));
    }

    #[test]
    fn test_malformed_fixed_width_field() {
        let env = Envelope::new(Payload::Error(WireError {
            code: 7,
            message: "m".into(),
        }));
        let mut bytes = Vec::new();
        bytes.push(WIRE_VERSION);
        bytes.push(KIND_ERROR);
        bytes.extend_from_slice(env.message_id.as_bytes());
        bytes.extend_from_slice(env.trace_id.as_bytes());
        // code declared as 3 bytes instead of 2
        put_bytes(&mut bytes, TAG_ER_CODE, &[1, 2, 3]);
        put_str(&mut bytes, TAG_ER_MESSAGE, "m");
        assert_eq!(decode(&bytes), Err(DecodeError::MalformedField("code")));
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let mut env = Envelope::new(Payload::Event(Event {
            name: "e".into(),
            payload: vec![9],
        }));
        env.extensions.push(UnknownField {
            tag: 0x7E,
            data: vec![1, 2, 3, 4],
        });
        let bytes = encode(&env);
        let parsed = decode(&bytes).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(parsed.extensions.len(), 1);
        assert_eq!(parsed.extensions[0].tag, 0x7E);
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let env = Envelope::new(Payload::Event(Event {
            name: "e".into(),
            payload: vec![],
        }));
        let mut bytes = Vec::new();
        bytes.push(WIRE_VERSION);
        bytes.push(KIND_EVENT);
        bytes.extend_from_slice(env.message_id.as_bytes());
        bytes.extend_from_slice(env.trace_id.as_bytes());
        put_bytes(&mut bytes, TAG_EV_NAME, &[0xFF, 0xFE]);
        assert_eq!(decode(&bytes), Err(DecodeError::MalformedField("name")));
    }

    #[test]
    fn test_older_version_still_decodes() {
        // Version byte below the maximum must be accepted.
        let bytes = encode(&Envelope::new(Payload::Heartbeat));
        assert!(decode(&bytes).is_ok());
    }
}
