use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// One observed HTTP exchange, as written by the capture side.
///
/// The serialized shape is one JSON object per line with `request` and `response` keys. Body
/// content travels base64-encoded and is decoded to raw bytes here. Any other flow state the
/// capture engine emits next to these keys is ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub request: FlowRequest,
    pub response: FlowResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_content")]
    pub content: Vec<u8>,
    pub timestamp_start: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    pub status_code: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_content")]
    pub content: Vec<u8>,
}

#[derive(Debug)]
pub enum DecodeError {
    Utf8(std::str::Utf8Error),
    Json(serde_json::Error),
}

impl DecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Utf8(_) => "invalid_utf8",
            Self::Json(_) => "invalid_json",
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utf8(_) => write!(f, "capture line is not valid UTF-8"),
            Self::Json(_) => write!(f, "capture line is not a valid flow object"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Utf8(source) => Some(source),
            Self::Json(source) => Some(source),
        }
    }
}

impl FlowRecord {
    /// Serializes the record as a single capture line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decodes one raw capture line. Trailing whitespace (including the newline) is ignored.
pub fn decode_line(line: &[u8]) -> Result<FlowRecord, DecodeError> {
    let text = std::str::from_utf8(line.trim_ascii_end()).map_err(DecodeError::Utf8)?;
    serde_json::from_str(text).map_err(DecodeError::Json)
}

/// Renders header pairs as `name: value` lines, each terminated by `\n`.
pub fn header_block(headers: &[(String, String)]) -> String {
    let mut block = String::new();
    for (name, value) in headers {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push('\n');
    }
    block
}

mod base64_content {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let Some(encoded) = Option::<String>::deserialize(deserializer)? else {
            return Ok(Vec::new());
        };
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| D::Error::custom(format!("invalid base64 content: {err}")))
    }
}
