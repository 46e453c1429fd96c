//! Wire framing and payload codecs.
//!
//! The public endpoint speaks minimal HTTP/1.1: a request line, headers,
//! and a Content-Length body. The body codec is selected per request:
//! `Content-Type` picks the request codec, `Accept` the response codec,
//! between binary (bincode) and text (JSON) representations of the typed
//! request structures.

use crate::api::request::{Request, Response};
use crate::core::error::{Error, Result};
use bytes::BytesMut;

/// Content type of the binary codec.
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Content type of the text codec.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// URL prefix of the KV endpoint; the method name follows.
pub const KV_ENDPOINT_PREFIX: &str = "/kv/db/";

/// Payload codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCodec {
    Binary,
    Json,
}

impl PayloadCodec {
    /// Pick a codec from a content-type header value.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let value = value.split(';').next().unwrap_or("").trim();
        match value {
            CONTENT_TYPE_BINARY => Some(Self::Binary),
            CONTENT_TYPE_JSON => Some(Self::Json),
            _ => None,
        }
    }

    /// The content-type header value for this codec.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Binary => CONTENT_TYPE_BINARY,
            Self::Json => CONTENT_TYPE_JSON,
        }
    }

    /// Decode a typed request.
    pub fn decode_request(self, body: &[u8]) -> Result<Request> {
        match self {
            Self::Binary => bincode::deserialize(body)
                .map_err(|e| Error::internal(format!("malformed binary request: {}", e))),
            Self::Json => serde_json::from_slice(body)
                .map_err(|e| Error::internal(format!("malformed json request: {}", e))),
        }
    }

    /// Encode a typed request.
    pub fn encode_request(self, request: &Request) -> Result<Vec<u8>> {
        match self {
            Self::Binary => bincode::serialize(request)
                .map_err(|e| Error::internal(format!("encode request: {}", e))),
            Self::Json => serde_json::to_vec(request)
                .map_err(|e| Error::internal(format!("encode request: {}", e))),
        }
    }

    /// Decode a typed response.
    pub fn decode_response(self, body: &[u8]) -> Result<Response> {
        match self {
            Self::Binary => bincode::deserialize(body)
                .map_err(|e| Error::internal(format!("malformed binary response: {}", e))),
            Self::Json => serde_json::from_slice(body)
                .map_err(|e| Error::internal(format!("malformed json response: {}", e))),
        }
    }

    /// Encode a typed response.
    pub fn encode_response(self, response: &Response) -> Result<Vec<u8>> {
        match self {
            Self::Binary => bincode::serialize(response)
                .map_err(|e| Error::internal(format!("encode response: {}", e))),
            Self::Json => serde_json::to_vec(response)
                .map_err(|e| Error::internal(format!("encode response: {}", e))),
        }
    }
}

/// A parsed HTTP request head plus body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First header value with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of a frame decode attempt.
#[derive(Debug)]
pub enum DecodeResult {
    /// A complete request; the consumed bytes were drained.
    Complete(HttpRequest),
    /// More data is needed.
    Incomplete,
    /// The stream is unparseable and must be closed.
    Invalid(String),
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Attempt to decode one HTTP request from the buffer, draining the
/// consumed bytes on success.
pub fn decode_http_request(buffer: &mut BytesMut) -> DecodeResult {
    let Some(head_end) = find_head_end(buffer) else {
        // Cap unterminated heads so a garbage stream cannot grow the
        // buffer without bound.
        if buffer.len() > 64 * 1024 {
            return DecodeResult::Invalid("request head too large".to_string());
        }
        return DecodeResult::Incomplete;
    };

    let head = match std::str::from_utf8(&buffer[..head_end]) {
        Ok(head) => head,
        Err(_) => return DecodeResult::Invalid("request head is not utf-8".to_string()),
    };
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return DecodeResult::Invalid(format!("malformed request line {request_line:?}"));
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return DecodeResult::Invalid(format!("malformed header line {line:?}"));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    if buffer.len() < head_end + content_length {
        return DecodeResult::Incomplete;
    }

    let method = method.to_string();
    let path = path.to_string();
    let _ = buffer.split_to(head_end);
    let body = buffer.split_to(content_length).to_vec();
    DecodeResult::Complete(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Encode an HTTP response frame.
pub fn encode_http_response(status: u16, content_type: &str, body: &[u8]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Encode an HTTP request frame.
pub fn encode_http_request(
    path: &str,
    content_type: &str,
    accept: &str,
    user: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut out = format!(
        "POST {} HTTP/1.1\r\nContent-Type: {}\r\nAccept: {}\r\nX-Meridian-User: {}\r\nContent-Length: {}\r\n\r\n",
        path,
        content_type,
        accept,
        user,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Parse one HTTP response from a buffer. Returns the status, content
/// type, and body once complete.
pub fn decode_http_response(buffer: &mut BytesMut) -> Option<(u16, String, Vec<u8>)> {
    let head_end = find_head_end(buffer)?;
    let head = std::str::from_utf8(&buffer[..head_end]).ok()?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;

    let mut content_type = String::new();
    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-type") {
                content_type = value.trim().to_string();
            } else if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if buffer.len() < head_end + content_length {
        return None;
    }
    let _ = buffer.split_to(head_end);
    let body = buffer.split_to(content_length).to_vec();
    Some((status, content_type, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::request::{GetRequest, RequestHeader};

    #[test]
    fn codec_selection() {
        assert_eq!(
            PayloadCodec::from_content_type("application/json; charset=utf-8"),
            Some(PayloadCodec::Json)
        );
        assert_eq!(
            PayloadCodec::from_content_type(CONTENT_TYPE_BINARY),
            Some(PayloadCodec::Binary)
        );
        assert_eq!(PayloadCodec::from_content_type("text/html"), None);
    }

    #[test]
    fn request_round_trips_in_both_codecs() {
        let request = Request::Get(GetRequest {
            header: RequestHeader::point(b"key".to_vec()),
        });
        for codec in [PayloadCodec::Binary, PayloadCodec::Json] {
            let encoded = codec.encode_request(&request).unwrap();
            let decoded = codec.decode_request(&encoded).unwrap();
            assert_eq!(decoded.header().key, b"key".to_vec());
        }
    }

    #[test]
    fn http_request_frame_round_trip() {
        let frame = encode_http_request("/kv/db/Get", CONTENT_TYPE_JSON, CONTENT_TYPE_JSON, "root", b"{}");
        let mut buffer = BytesMut::from(&frame[..]);
        match decode_http_request(&mut buffer) {
            DecodeResult::Complete(req) => {
                assert_eq!(req.method, "POST");
                assert_eq!(req.path, "/kv/db/Get");
                assert_eq!(req.header("content-type"), Some(CONTENT_TYPE_JSON));
                assert_eq!(req.header("x-meridian-user"), Some("root"));
                assert_eq!(req.body, b"{}");
            }
            other => panic!("expected complete frame, got {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let frame = encode_http_request("/kv/db/Get", CONTENT_TYPE_JSON, CONTENT_TYPE_JSON, "root", b"{\"k\":1}");
        let mut buffer = BytesMut::from(&frame[..frame.len() - 3]);
        assert!(matches!(
            decode_http_request(&mut buffer),
            DecodeResult::Incomplete
        ));
    }

    #[test]
    fn http_response_frame_round_trip() {
        let frame = encode_http_response(200, CONTENT_TYPE_JSON, b"body");
        let mut buffer = BytesMut::from(&frame[..]);
        let (status, content_type, body) = decode_http_response(&mut buffer).unwrap();
        assert_eq!(status, 200);
        assert_eq!(content_type, CONTENT_TYPE_JSON);
        assert_eq!(body, b"body");
    }
}
