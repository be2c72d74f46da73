//! Message codec — one line of UTF-8 text per message envelope.
//!
//! Wire format: a single JSON object terminated by `\n`. Exactly one
//! top-level key selects the kind, probed in fixed priority order:
//!
//! ```text
//! {"command": "<name>", "data": <any>}       // data omitted if absent
//! {"notification": "<name>", "data": <any>}  // data omitted if absent
//! {"return": <any-or-null>}                  // payload always present
//! {"error": <any-or-null>}                   // payload always present
//! ```
//!
//! For commands and notifications the `data` key is omitted entirely when
//! there is no payload — it is never emitted as `null`. For `return` and
//! `error` the payload is always present, `null` standing in for "none".

use serde_json::{Map, Value};

use crate::error::DecodeError;

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A request expecting exactly one `Return` or `Error` reply.
    Command {
        name: String,
        data: Option<Value>,
    },
    /// A one-way message with no reply.
    Notification {
        name: String,
        data: Option<Value>,
    },
    /// The successful reply to a command. `Value::Null` when the command
    /// produced no payload.
    Return(Value),
    /// The failure reply to a command. Carries business-level error
    /// information, not a connection fault.
    Error(Value),
}

/// Serialize an envelope to a single `\n`-terminated line.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let mut object = Map::new();
    match envelope {
        Envelope::Command { name, data } => {
            object.insert("command".to_string(), Value::String(name.clone()));
            if let Some(data) = data {
                object.insert("data".to_string(), data.clone());
            }
        }
        Envelope::Notification { name, data } => {
            object.insert("notification".to_string(), Value::String(name.clone()));
            if let Some(data) = data {
                object.insert("data".to_string(), data.clone());
            }
        }
        Envelope::Return(value) => {
            object.insert("return".to_string(), value.clone());
        }
        Envelope::Error(value) => {
            object.insert("error".to_string(), value.clone());
        }
    }

    let mut line = serde_json::to_string(&Value::Object(object))?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into an envelope.
///
/// The line terminator is tolerated. Classification probes the `command`,
/// `notification`, `return`, `error` keys in that order; the first match
/// wins. An absent `data` key decodes to `None`, a present `null` to
/// `Some(Value::Null)`, so re-encoding preserves the distinction.
pub fn decode(line: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(line.trim_end_matches(['\r', '\n']))?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let data = object.remove("data");

    if let Some(name) = object.remove("command") {
        let Value::String(name) = name else {
            return Err(DecodeError::NameNotString { key: "command" });
        };
        return Ok(Envelope::Command { name, data });
    }

    if let Some(name) = object.remove("notification") {
        let Value::String(name) = name else {
            return Err(DecodeError::NameNotString { key: "notification" });
        };
        return Ok(Envelope::Notification { name, data });
    }

    if let Some(value) = object.remove("return") {
        return Ok(Envelope::Return(value));
    }

    if let Some(value) = object.remove("error") {
        return Ok(Envelope::Error(value));
    }

    Err(DecodeError::UnrecognizedShape)
}
