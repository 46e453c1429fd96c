//! Wire endpoint: framing, codecs, authentication, error statuses.

mod common;

use common::TestCluster;
use meridian::api::data::Value;
use meridian::api::request::{
    GetRequest, InternalGcRequest, PutRequest, Request, RequestHeader, Response,
};
use meridian::core::clock::Timestamp;
use meridian::net::client::HttpKvClient;
use meridian::net::codec::{encode_http_request, CONTENT_TYPE_JSON};
use meridian::net::security::SecurityConfig;
use meridian::net::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn serve(cluster: &TestCluster) -> std::net::SocketAddr {
    let server = Server::new(
        cluster.db(),
        SecurityConfig::insecure(),
        cluster.stopper.clone(),
    );
    server.serve("127.0.0.1:0").await.expect("bind")
}

#[tokio::test]
async fn binary_and_json_clients_round_trip() {
    let cluster = TestCluster::new(1).await;
    let addr = serve(&cluster).await;

    let binary = HttpKvClient::new(addr.to_string(), "root");
    let json = HttpKvClient::new(addr.to_string(), "root").with_json();

    binary
        .send(Request::Put(PutRequest {
            header: RequestHeader::point(b"wire-key".to_vec()),
            value: Value::from_bytes(b"wire-value".to_vec()),
        }))
        .await
        .unwrap();

    // The JSON client reads back what the binary client wrote.
    let response = json
        .send(Request::Get(GetRequest {
            header: RequestHeader::point(b"wire-key".to_vec()),
        }))
        .await
        .unwrap();
    match response {
        Response::Get(resp) => {
            assert_eq!(resp.value.unwrap().bytes, Some(b"wire-value".to_vec()));
        }
        other => panic!("unexpected response {:?}", other.method()),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn typed_errors_travel_in_the_response() {
    let cluster = TestCluster::new(1).await;
    let addr = serve(&cluster).await;
    let client = HttpKvClient::new(addr.to_string(), "root");

    client
        .send(Request::Put(PutRequest {
            header: RequestHeader::point(b"k".to_vec()),
            value: Value::from_bytes(b"v".to_vec()),
        }))
        .await
        .unwrap();

    // A failed condition comes back as the typed error, not a transport
    // failure.
    let err = client
        .send(Request::ConditionalPut(
            meridian::api::request::ConditionalPutRequest {
                header: RequestHeader::point(b"k".to_vec()),
                value: Value::from_bytes(b"v2".to_vec()),
                expected: None,
            },
        ))
        .await
        .unwrap_err();
    assert!(
        matches!(err, meridian::core::error::Error::ConditionFailed { .. }),
        "got {err:?}"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn internal_methods_are_rejected_at_the_wire() {
    let cluster = TestCluster::new(1).await;
    let addr = serve(&cluster).await;
    let client = HttpKvClient::new(addr.to_string(), "root");

    let err = client
        .send(Request::InternalGc(InternalGcRequest {
            header: RequestHeader::point(b"k".to_vec()),
            gc_threshold: Timestamp::zero(),
        }))
        .await
        .unwrap_err();
    // The endpoint answers 404 for methods outside the public surface.
    assert!(err.to_string().contains("404"), "got {err}");

    cluster.shutdown().await;
}

#[tokio::test]
async fn malformed_bodies_get_400() {
    let cluster = TestCluster::new(1).await;
    let addr = serve(&cluster).await;

    let frame = encode_http_request(
        "/kv/db/Get",
        CONTENT_TYPE_JSON,
        CONTENT_TYPE_JSON,
        "root",
        b"this is not json",
    );
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(&frame).await.unwrap();
    let mut buffer = bytes::BytesMut::with_capacity(1024);
    let status = loop {
        if let Some((status, _, _)) = meridian::net::codec::decode_http_response(&mut buffer) {
            break status;
        }
        let read = socket.read_buf(&mut buffer).await.unwrap();
        assert!(read > 0, "connection closed before a response arrived");
    };
    assert_eq!(status, 400);

    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_clients_share_one_endpoint() {
    let cluster = TestCluster::new(1).await;
    let addr = serve(&cluster).await;

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let client = HttpKvClient::new(addr.to_string(), "root");
        handles.push(tokio::spawn(async move {
            client
                .send(Request::Put(PutRequest {
                    header: RequestHeader::point(vec![b'c', i]),
                    value: Value::from_bytes(vec![i]),
                }))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for i in 0..8u8 {
        assert_eq!(cluster.get(&[b'c', i]).await.unwrap(), Some(vec![i]));
    }

    cluster.shutdown().await;
}
