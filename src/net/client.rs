//! Thin HTTP client for the KV endpoint.
//!
//! Used by the CLI. One request per call over a fresh connection; the
//! endpoint is cheap to reach and the CLI is not throughput-sensitive.

use crate::api::request::{Request, Response};
use crate::core::error::{Error, Result};
use crate::net::codec::{
    decode_http_response, encode_http_request, PayloadCodec, KV_ENDPOINT_PREFIX,
};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Client for the public KV endpoint.
#[derive(Debug, Clone)]
pub struct HttpKvClient {
    addr: String,
    user: String,
    codec: PayloadCodec,
}

impl HttpKvClient {
    pub fn new(addr: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user: user.into(),
            codec: PayloadCodec::Binary,
        }
    }

    /// Use the text codec instead of the binary one.
    pub fn with_json(mut self) -> Self {
        self.codec = PayloadCodec::Json;
        self
    }

    /// Submit one typed request and await its typed response.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let method = request.method();
        let body = self.codec.encode_request(&request)?;
        let frame = encode_http_request(
            &format!("{}{}", KV_ENDPOINT_PREFIX, method.as_str()),
            self.codec.content_type(),
            self.codec.content_type(),
            &self.user,
            &body,
        );

        let mut socket = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::internal(format!("connect {}: {}", self.addr, e)))?;
        socket
            .write_all(&frame)
            .await
            .map_err(|e| Error::internal(format!("write: {}", e)))?;

        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            if let Some((status, content_type, body)) = decode_http_response(&mut buffer) {
                if status != 200 {
                    return Err(Error::internal(format!(
                        "endpoint returned {}: {}",
                        status,
                        String::from_utf8_lossy(&body)
                    )));
                }
                let codec = PayloadCodec::from_content_type(&content_type).unwrap_or(self.codec);
                let response = codec.decode_response(&body)?;
                // Typed errors ride inside the response structure.
                if let Some(err) = &response.header().error {
                    return Err(err.clone());
                }
                return Ok(response);
            }
            let read = socket
                .read_buf(&mut buffer)
                .await
                .map_err(|e| Error::internal(format!("read: {}", e)))?;
            if read == 0 {
                return Err(Error::internal("connection closed mid-response"));
            }
        }
    }
}
