//! The public KV wire endpoint.
//!
//! Serves `/kv/db/<MethodName>`: the body is the marshalled request
//! structure, `Content-Type` selects the request codec, `Accept` the
//! response codec. Unauthorized requests get 401, unknown methods 404,
//! malformed bodies 400, server faults 500; datastore errors travel in
//! the response structure itself. Internal clients bypass this endpoint
//! and talk to the distributed sender directly.

use crate::api::request::{Method, Request};
use crate::core::runtime::Stopper;
use crate::dist::KvSender;
use crate::net::codec::{
    decode_http_request, encode_http_response, DecodeResult, HttpRequest, PayloadCodec,
    KV_ENDPOINT_PREFIX,
};
use crate::net::security::{self, SecurityConfig};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// The KV endpoint server.
pub struct Server {
    sender: Arc<dyn KvSender>,
    security: SecurityConfig,
    stopper: Arc<Stopper>,
}

impl Server {
    pub fn new(sender: Arc<dyn KvSender>, security: SecurityConfig, stopper: Arc<Stopper>) -> Arc<Self> {
        Arc::new(Self {
            sender,
            security,
            stopper,
        })
    }

    /// Bind `addr` and serve until shutdown. Returns the bound address
    /// (useful when binding port 0 in tests).
    pub async fn serve(self: &Arc<Self>, addr: &str) -> anyhow::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let acceptor = if self.security.insecure {
            None
        } else {
            Some(self.security.tls_acceptor()?)
        };
        info!(addr = %local_addr, insecure = self.security.insecure, "kv endpoint listening");

        let server = Arc::clone(self);
        let mut shutdown = self.stopper.shutdown_signal();
        self.stopper.spawn("kv-listener", async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, peer)) => {
                                debug!(peer = %peer, "accepted connection");
                                let server = Arc::clone(&server);
                                let acceptor: Option<TlsAcceptor> = acceptor.clone();
                                tokio::spawn(async move {
                                    let result = match acceptor {
                                        Some(acceptor) => match acceptor.accept(socket).await {
                                            Ok(tls) => server.serve_connection(tls).await,
                                            Err(e) => Err(e.into()),
                                        },
                                        None => server.serve_connection(socket).await,
                                    };
                                    if let Err(e) = result {
                                        debug!(peer = %peer, error = %e, "connection closed");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });
        Ok(local_addr)
    }

    async fn serve_connection<S>(self: &Arc<Self>, mut socket: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            match decode_http_request(&mut buffer) {
                DecodeResult::Complete(request) => {
                    let response = self.dispatch(request).await;
                    socket.write_all(&response).await?;
                }
                DecodeResult::Incomplete => {
                    let read = socket.read_buf(&mut buffer).await?;
                    if read == 0 {
                        return Ok(());
                    }
                }
                DecodeResult::Invalid(reason) => {
                    let response = encode_http_response(400, "text/plain", reason.as_bytes());
                    socket.write_all(&response).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, http: HttpRequest) -> Vec<u8> {
        // Method resolution: the URL path names the operation.
        let Some(method_name) = http.path.strip_prefix(KV_ENDPOINT_PREFIX) else {
            return encode_http_response(404, "text/plain", b"unknown endpoint");
        };
        let Some(method) = Method::from_str(method_name) else {
            return encode_http_response(404, "text/plain", b"unknown method");
        };

        let request_codec = match http
            .header("content-type")
            .and_then(PayloadCodec::from_content_type)
        {
            Some(codec) => codec,
            None => return encode_http_response(400, "text/plain", b"unsupported content type"),
        };
        let response_codec = http
            .header("accept")
            .and_then(PayloadCodec::from_content_type)
            .unwrap_or(request_codec);

        let mut request = match request_codec.decode_request(&http.body) {
            Ok(request) => request,
            Err(e) => {
                return encode_http_response(400, "text/plain", e.to_string().as_bytes());
            }
        };
        if request.method() != method {
            return encode_http_response(400, "text/plain", b"body does not match method");
        }
        if let Err(reason) = verify_public(&request) {
            return encode_http_response(400, "text/plain", reason.as_bytes());
        }

        // Authentication: certificate common name in secure mode, the
        // declared user in insecure mode.
        let declared = http.header("x-meridian-user").unwrap_or("");
        let peer_cn = http.header("x-meridian-peer-cn");
        let Some(user) = security::authenticate(&self.security, peer_cn, declared) else {
            return encode_http_response(401, "text/plain", b"unauthorized");
        };
        request.header_mut().user = user;

        let response = match self.sender.send(request).await {
            Ok(response) => response,
            // Typed errors ride inside the response structure.
            Err(e) => crate::api::request::Response::from_error(method, e),
        };
        match response_codec.encode_response(&response) {
            Ok(body) => encode_http_response(200, response_codec.content_type(), &body),
            Err(e) => encode_http_response(500, "text/plain", e.to_string().as_bytes()),
        }
    }
}

/// Reject requests that are not part of the public API, including inside
/// batches.
fn verify_public(request: &Request) -> Result<(), String> {
    if !request.method().is_public() {
        return Err(format!("{} is not a public method", request.method()));
    }
    if let Request::Batch(batch) = request {
        for sub in &batch.requests {
            if !sub.method().is_public() {
                return Err(format!(
                    "batch contains non-public request {}",
                    sub.method()
                ));
            }
            if matches!(sub, Request::Batch(_)) {
                return Err("batch may not nest batches".to_string());
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("insecure", &self.security.insecure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::request::{BatchRequest, GetRequest, InternalGcRequest, RequestHeader};
    use crate::core::clock::Timestamp;

    #[test]
    fn public_verification() {
        let get = Request::Get(GetRequest {
            header: RequestHeader::point(b"k".to_vec()),
        });
        assert!(verify_public(&get).is_ok());

        let internal = Request::InternalGc(InternalGcRequest {
            header: RequestHeader::point(b"k".to_vec()),
            gc_threshold: Timestamp::zero(),
        });
        assert!(verify_public(&internal).is_err());

        let smuggled = Request::Batch(BatchRequest {
            header: RequestHeader::default(),
            requests: vec![internal],
        });
        assert!(verify_public(&smuggled).is_err());
    }

    #[tokio::test]
    async fn unknown_method_is_404() {
        struct NoopSender;
        impl KvSender for NoopSender {
            fn send(&self, _request: Request) -> crate::dist::SendFuture<'_> {
                Box::pin(async { Err(crate::core::error::Error::NodeUnavailable) })
            }
        }
        let server = Server::new(
            Arc::new(NoopSender),
            SecurityConfig::insecure(),
            Stopper::new(),
        );
        let response = server
            .dispatch(HttpRequest {
                method: "POST".to_string(),
                path: "/kv/db/Bogus".to_string(),
                headers: vec![],
                body: vec![],
            })
            .await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 404"));
    }
}
