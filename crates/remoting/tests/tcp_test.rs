//! Calls over real TCP sessions against an in-test server.

mod common;

use common::init_tracing;
use futures::{SinkExt, StreamExt};
use proven_remoting::transport::tcp::frame_codec;
use proven_remoting::{Bytes, CborCodec, Client, Codec, Error, PoolStats, Request, Response, Url};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// Serve every accepted connection, answering two-way requests with `answer`.
async fn serve(answer: fn(&Request) -> Option<Response>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, frame_codec());
                while let Some(Ok(frame)) = framed.next().await {
                    let Ok(request) = CborCodec.decode_request(&frame) else {
                        break;
                    };
                    if !request.two_way {
                        continue;
                    }
                    if let Some(response) = answer(&request) {
                        let reply = CborCodec.encode_response(&response).unwrap();
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn client_for(addr: &str) -> Client {
    init_tracing();
    let client = Client::builder().build();
    client
        .connect(&Url::parse(&format!("dubbo://{addr}")).unwrap())
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let addr = serve(|request| Some(Response::echo(request))).await;
    let client = client_for(&addr).await;

    let response = client
        .request(Request::two_way("over tcp"), Duration::from_secs(5), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.payload, Bytes::from_static(b"over tcp"));

    let none = client
        .request(Request::one_way("fire"), Duration::from_secs(5), None)
        .await
        .unwrap();
    assert!(none.is_none());

    let pool = client.pool().unwrap();
    assert_eq!(pool.stats(&addr), PoolStats { live: 1, idle: 1 });

    client.close().await;
    assert!(pool.is_closed());
}

#[tokio::test]
async fn test_tcp_concurrent_calls_multiplex() {
    let addr = serve(|request| Some(Response::echo(request))).await;
    let client = std::sync::Arc::new(client_for(&addr).await);

    let calls: Vec<_> = (0..32)
        .map(|i| {
            let client = std::sync::Arc::clone(&client);
            tokio::spawn(async move {
                let payload = Bytes::from(format!("n{i}"));
                let response = client
                    .request(Request::two_way(payload.clone()), Duration::from_secs(5), None)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(response.payload, payload);
            })
        })
        .collect();

    for call in calls {
        call.await.unwrap();
    }
    assert!(client.pending_responses().is_empty());
}

#[tokio::test]
async fn test_tcp_read_timeout() {
    let addr = serve(|_| None).await;
    let client = client_for(&addr).await;

    let err = client
        .request(Request::two_way("ignored"), Duration::from_millis(200), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ReadTimeout(_)));
    assert_eq!(client.pool().unwrap().stats(&addr).live, 1);
}

#[tokio::test]
async fn test_tcp_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = client_for(&addr).await;
    let err = client
        .request(Request::two_way("nobody home"), Duration::from_secs(1), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Connect { .. }));
    assert_eq!(client.pool().unwrap().stats(&addr), PoolStats::default());
}
