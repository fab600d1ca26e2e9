//! Wire frame codec.
//!
//! A frame is `<mtype:1><flag?:1><reqId:ASCII digits>[':' <payload>]` with
//! `mtype` one of `C`/`S`/`R` and at most one flag out of `!` (error
//! payload), `+` (more frames follow) and `#` (abort). Payloads are JSON
//! text; both peers use this one serialization.

use serde_json::Value;

use crate::error::{Error, Result};

/// Message kind: request-expecting-response, fire-and-forget, or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Call,
    Signal,
    Resp,
}

impl MsgType {
    fn tag(self) -> char {
        match self {
            MsgType::Call => 'C',
            MsgType::Signal => 'S',
            MsgType::Resp => 'R',
        }
    }
}

/// A decoded wire message. At most one of `data` and `error` is meaningful;
/// an error terminates any streaming sequence on its request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub mtype: MsgType,
    pub req_id: u64,
    pub more: bool,
    pub abort: bool,
    pub data: Option<Value>,
    pub error: Option<Value>,
}

impl Message {
    pub fn value_frame(mtype: MsgType, req_id: u64, data: Option<Value>, more: bool) -> Self {
        Message {
            mtype,
            req_id,
            more,
            abort: false,
            data,
            error: None,
        }
    }

    /// One frame of a streaming tail.
    pub fn chunk(mtype: MsgType, req_id: u64, data: Value) -> Self {
        Message::value_frame(mtype, req_id, Some(data), true)
    }

    /// Terminator of a streaming tail.
    pub fn end(mtype: MsgType, req_id: u64) -> Self {
        Message::value_frame(mtype, req_id, None, false)
    }

    pub fn error(mtype: MsgType, req_id: u64, payload: Value) -> Self {
        Message {
            mtype,
            req_id,
            more: false,
            abort: false,
            data: None,
            error: Some(payload),
        }
    }

    pub fn abort(mtype: MsgType, req_id: u64) -> Self {
        Message {
            mtype,
            req_id,
            more: false,
            abort: true,
            data: None,
            error: None,
        }
    }
}

/// Encodes a message into its wire form.
pub fn encode(msg: &Message) -> Result<String> {
    if msg.req_id == 0 {
        return Err(Error::protocol("request id must be positive"));
    }

    let (flag, payload) = if let Some(error) = &msg.error {
        (Some('!'), Some(error))
    } else if msg.abort {
        (Some('#'), msg.data.as_ref())
    } else if msg.more {
        (Some('+'), msg.data.as_ref())
    } else {
        (None, msg.data.as_ref())
    };

    let mut out = String::new();
    out.push(msg.mtype.tag());
    if let Some(flag) = flag {
        out.push(flag);
    }
    out.push_str(&msg.req_id.to_string());
    if let Some(payload) = payload {
        out.push(':');
        out.push_str(&serde_json::to_string(payload)?);
    }

    Ok(out)
}

/// Decodes a wire frame. Unknown tags, double flags, non-positive request
/// ids and malformed payloads are decode errors.
pub fn decode(frame: &str) -> Result<Message> {
    let mut rest = frame;

    let mtype = match rest.as_bytes().first() {
        Some(b'C') => MsgType::Call,
        Some(b'S') => MsgType::Signal,
        Some(b'R') => MsgType::Resp,
        Some(other) => {
            return Err(Error::protocol(format!(
                "unknown message tag {:?}",
                char::from(*other)
            )));
        }
        None => return Err(Error::protocol("empty frame")),
    };
    rest = &rest[1..];

    let flag = match rest.as_bytes().first() {
        Some(flag @ (b'!' | b'+' | b'#')) => {
            rest = &rest[1..];
            Some(*flag)
        }
        _ => None,
    };

    let digits_len = rest
        .as_bytes()
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits_len == 0 {
        return Err(Error::protocol(format!("missing request id in {frame:?}")));
    }
    let req_id: u64 = rest[..digits_len]
        .parse()
        .map_err(|_| Error::protocol(format!("request id out of range in {frame:?}")))?;
    if req_id == 0 {
        return Err(Error::protocol("request id must be positive"));
    }
    rest = &rest[digits_len..];

    let payload = match rest.as_bytes().first() {
        Some(b':') => Some(serde_json::from_str::<Value>(&rest[1..])?),
        Some(other) => {
            return Err(Error::protocol(format!(
                "unexpected byte {:?} after request id",
                char::from(*other)
            )));
        }
        None => None,
    };

    let mut msg = Message {
        mtype,
        req_id,
        more: false,
        abort: false,
        data: None,
        error: None,
    };
    match flag {
        Some(b'!') => msg.error = Some(payload.unwrap_or(Value::Null)),
        Some(b'+') => {
            msg.more = true;
            msg.data = payload;
        }
        Some(b'#') => {
            msg.abort = true;
            msg.data = payload;
        }
        _ => msg.data = payload,
    }

    Ok(msg)
}
