use std::fmt;
use std::str::FromStr;

/// Identifies the instance and event a chat button should raise.
///
/// Encoded as `instance|event`. `%` and `|` inside either part are escaped
/// as `%25` and `%7C`, so the encoded form always splits on `|` into exactly
/// two parts and decoding restores the originals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackToken {
    pub instance_id: String,
    pub event_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackTokenError {
    #[error("callback token must have exactly two '|'-separated parts, found {0}")]
    WrongPartCount(usize),
    #[error("callback token has an empty {0}")]
    EmptyPart(&'static str),
    #[error("invalid escape sequence in callback token: {0}")]
    BadEscape(String),
}

impl CallbackToken {
    pub fn new(instance_id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            event_name: event_name.into(),
        }
    }
}

fn escape(part: &str) -> String {
    part.replace('%', "%25").replace('|', "%7C")
}

fn unescape(part: &str) -> Result<String, CallbackTokenError> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let seq = rest.get(pos..pos + 3).unwrap_or(&rest[pos..]);
        match seq {
            "%25" => out.push('%'),
            "%7C" | "%7c" => out.push('|'),
            other => return Err(CallbackTokenError::BadEscape(other.to_string())),
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", escape(&self.instance_id), escape(&self.event_name))
    }
}

impl FromStr for CallbackToken {
    type Err = CallbackTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        let [instance, event] = parts.as_slice() else {
            return Err(CallbackTokenError::WrongPartCount(parts.len()));
        };
        let instance_id = unescape(instance)?;
        let event_name = unescape(event)?;
        if instance_id.is_empty() {
            return Err(CallbackTokenError::EmptyPart("instance id"));
        }
        if event_name.is_empty() {
            return Err(CallbackTokenError::EmptyPart("event name"));
        }
        Ok(Self {
            instance_id,
            event_name,
        })
    }
}
