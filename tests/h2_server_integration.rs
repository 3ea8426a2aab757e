//! Server transport integration tests
//!
//! A hand-driven peer speaks raw frames to a `ServerTransport` over an
//! in-memory duplex pipe, so every frame the server writes can be checked.

mod helpers;

use bytes::Bytes;
use h2rpc::http::h2::frames::*;
use h2rpc::http::h2::message::Message;
use h2rpc::http::h2::*;
use h2rpc::http::{Metadata, Status, StatusCode};
use helpers::{setup_tracing, RawPeer};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn request_metadata(path: &str) -> Metadata {
    let mut md = Metadata::new();
    md.insert(":method", "POST");
    md.insert(":scheme", "http");
    md.insert(":path", path.to_string());
    md.insert(":authority", "localhost");
    md.insert("content-type", "application/grpc");
    md
}

fn start(builder: ServerTransportBuilder) -> (ServerTransport, RawPeer) {
    setup_tracing();
    let (server_io, peer_io) = tokio::io::duplex(1 << 20);
    let server = builder.build(server_io).unwrap();
    (server, RawPeer::new(peer_io))
}

async fn expect_event(call: &mut CallHandle) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(5), call.next_event())
        .await
        .expect("timed out waiting for a call event")
        .expect("call already finished")
}

#[tokio::test]
async fn test_settings_exchange() {
    let (_server, mut peer) = start(ServerTransportBuilder::new().max_concurrent_streams(7));
    peer.send_raw(CONNECTION_PREFACE).await;
    peer.send(Frame::Settings(SettingsFrame::new(vec![(0x4, 1 << 20)]))).await;

    let frame = peer.recv_until(|f| matches!(f, Frame::Settings(s) if !s.ack)).await;
    let Frame::Settings(settings) = frame else { unreachable!() };
    assert!(settings.params.contains(&(0x3, 7)));
    assert!(settings.params.contains(&(0x2, 0)));

    // Our SETTINGS gets acknowledged
    peer.recv_until(|f| matches!(f, Frame::Settings(s) if s.ack)).await;
}

#[tokio::test]
async fn test_unary_call() {
    let (mut server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;

    let headers = peer.headers(1, &request_metadata("/echo.Echo/Say"), false);
    peer.send(headers).await;
    let body = Message::new(Bytes::from_static(b"hello")).encode().unwrap();
    peer.send(Frame::Data(DataFrame::new(1, body, true))).await;

    let mut call = server.accept().await.unwrap();
    assert_eq!(call.stream_id(), 1);
    match expect_event(&mut call).await {
        StreamEvent::InitialMetadata(md) => assert_eq!(md.get_str(":path"), Some("/echo.Echo/Say")),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        expect_event(&mut call).await,
        StreamEvent::Message(Message::new(Bytes::from_static(b"hello")))
    );
    assert_eq!(expect_event(&mut call).await, StreamEvent::HalfClosed);

    let mut response = Metadata::new();
    response.insert(":status", "200");
    call.enqueue_initial_metadata(response).unwrap();
    call.enqueue_message(Message::new(Bytes::from_static(b"world")))
        .await
        .unwrap();
    call.send_status(&Status::ok(), Metadata::new()).unwrap();

    let Frame::Headers(initial) = peer.recv_until(|f| matches!(f, Frame::Headers(_))).await else {
        unreachable!()
    };
    assert!(!initial.end_stream);
    assert_eq!(peer.decode(&initial).get_str(":status"), Some("200"));

    let Frame::Data(data) = peer.recv_until(|f| matches!(f, Frame::Data(_))).await else {
        unreachable!()
    };
    assert_eq!(data.data, Message::new(Bytes::from_static(b"world")).encode().unwrap());

    let Frame::Headers(trailers) = peer.recv_until(|f| matches!(f, Frame::Headers(_))).await else {
        unreachable!()
    };
    assert!(trailers.end_stream);
    assert_eq!(peer.decode(&trailers).get_str("grpc-status"), Some("0"));

    assert_eq!(expect_event(&mut call).await, StreamEvent::Closed(Status::ok()));
    assert!(call.next_event().await.is_none());
}

#[tokio::test]
async fn test_response_before_half_close_resets_with_no_error() {
    let (mut server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;
    let headers = peer.headers(1, &request_metadata("/svc/Stream"), false);
    peer.send(headers).await;

    let call = server.accept().await.unwrap();
    call.send_status(&Status::new(StatusCode::NotFound, "nope"), Metadata::new())
        .unwrap();

    let Frame::Headers(trailers) = peer.recv_until(|f| matches!(f, Frame::Headers(_))).await else {
        unreachable!()
    };
    assert!(trailers.end_stream);
    assert_eq!(peer.decode(&trailers).get_str("grpc-status"), Some("5"));

    let Frame::RstStream(rst) = peer.recv_until(|f| matches!(f, Frame::RstStream(_))).await else {
        unreachable!()
    };
    assert_eq!(rst.stream_id, 1);
    assert_eq!(rst.error_code, ErrorCode::NoError);
}

#[tokio::test]
async fn test_refuses_streams_over_limit() {
    let (mut server, mut peer) = start(ServerTransportBuilder::new().max_concurrent_streams(1));
    peer.client_handshake().await;

    let first = peer.headers(1, &request_metadata("/a/A"), false);
    peer.send(first).await;
    let second = peer.headers(3, &request_metadata("/a/B"), false);
    peer.send(second).await;

    let Frame::RstStream(rst) = peer.recv_until(|f| matches!(f, Frame::RstStream(_))).await else {
        unreachable!()
    };
    assert_eq!(rst.stream_id, 3);
    assert_eq!(rst.error_code, ErrorCode::RefusedStream);

    let call = server.accept().await.unwrap();
    assert_eq!(call.stream_id(), 1);
    assert_eq!(server.active_streams(), 1);
}

#[tokio::test]
async fn test_even_stream_id_is_connection_error() {
    let (server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;
    let headers = peer.headers(2, &request_metadata("/a/A"), true);
    peer.send(headers).await;

    let Frame::Goaway(goaway) = peer.recv_until(|f| matches!(f, Frame::Goaway(_))).await else {
        unreachable!()
    };
    assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
    server.closed().await;
    assert_eq!(server.close_status().unwrap().code(), StatusCode::Unavailable);
}

#[tokio::test]
async fn test_data_on_idle_stream_is_connection_error() {
    let (server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;
    peer.send(Frame::Data(DataFrame::new(5, Bytes::from_static(b"x"), false)))
        .await;

    let Frame::Goaway(goaway) = peer.recv_until(|f| matches!(f, Frame::Goaway(_))).await else {
        unreachable!()
    };
    assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
    server.closed().await;
}

#[tokio::test]
async fn test_ping_is_acknowledged() {
    let (_server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;
    peer.send(Frame::Ping(PingFrame::with_opaque(42, false))).await;

    let Frame::Ping(ack) = peer.recv_until(|f| matches!(f, Frame::Ping(_))).await else {
        unreachable!()
    };
    assert!(ack.ack);
    assert_eq!(ack.opaque(), 42);
}

#[tokio::test]
async fn test_ping_abuse_sends_enhance_your_calm() {
    let (server, mut peer) = start(
        ServerTransportBuilder::new().ping_abuse(Duration::from_secs(300), 1),
    );
    peer.client_handshake().await;
    for opaque in 0..3 {
        peer.send(Frame::Ping(PingFrame::with_opaque(opaque, false))).await;
    }

    let Frame::Goaway(goaway) = peer.recv_until(|f| matches!(f, Frame::Goaway(_))).await else {
        unreachable!()
    };
    assert_eq!(goaway.error_code, ErrorCode::EnhanceYourCalm);
    assert_eq!(goaway.debug_data, Bytes::from_static(b"too_many_pings"));
    server.closed().await;
}

#[tokio::test]
async fn test_header_block_over_soft_limit_is_cancelled() {
    let (mut server, mut peer) = start(ServerTransportBuilder::new().max_header_list_size(128, 4096));
    peer.client_handshake().await;

    let mut large = request_metadata("/a/A");
    large.insert("x-padding", "p".repeat(512));
    let headers = peer.headers(1, &large, false);
    peer.send(headers).await;

    let Frame::RstStream(rst) = peer.recv_until(|f| matches!(f, Frame::RstStream(_))).await else {
        unreachable!()
    };
    assert_eq!(rst.stream_id, 1);
    assert_eq!(rst.error_code, ErrorCode::Cancel);

    // The decoder stayed in step, so the next stream decodes fine
    let headers = peer.headers(3, &request_metadata("/a/B"), true);
    peer.send(headers).await;
    let mut call = server.accept().await.unwrap();
    assert_eq!(call.stream_id(), 3);
    match expect_event(&mut call).await {
        StreamEvent::InitialMetadata(md) => assert_eq!(md.get_str(":path"), Some("/a/B")),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_header_block_over_hard_limit_is_enhance_your_calm() {
    let (_server, mut peer) = start(ServerTransportBuilder::new().max_header_list_size(128, 256));
    peer.client_handshake().await;

    let mut large = request_metadata("/a/A");
    large.insert("x-padding", "p".repeat(300));
    let headers = peer.headers(1, &large, false);
    peer.send(headers).await;

    let Frame::RstStream(rst) = peer.recv_until(|f| matches!(f, Frame::RstStream(_))).await else {
        unreachable!()
    };
    assert_eq!(rst.error_code, ErrorCode::EnhanceYourCalm);
}

#[tokio::test]
async fn test_continuation_flood_is_connection_error() {
    let (server, mut peer) = start(ServerTransportBuilder::new().max_header_list_size(128, 256));
    peer.client_handshake().await;

    let first = HeadersFrame::new(1, Bytes::from(vec![0u8; 64]), false, false);
    assert!(peer.try_send(Frame::Headers(first)).await);
    let chunk = Bytes::from(vec![0u8; 1024]);
    for _ in 0..64 {
        let frame = Frame::Continuation(ContinuationFrame::new(1, chunk.clone(), false));
        if !peer.try_send(frame).await {
            break;
        }
    }

    let Frame::Goaway(goaway) = peer.recv_until(|f| matches!(f, Frame::Goaway(_))).await else {
        unreachable!()
    };
    assert_eq!(goaway.error_code, ErrorCode::EnhanceYourCalm);
    server.closed().await;
    assert!(server.is_closed());
}

#[tokio::test]
async fn test_frame_interleaved_with_header_sequence_is_connection_error() {
    let (server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;

    let open = HeadersFrame::new(1, Bytes::from_static(&[0x83]), false, false);
    peer.send(Frame::Headers(open)).await;
    peer.send(Frame::Data(DataFrame::new(3, Bytes::from_static(b"x"), false)))
        .await;

    let Frame::Goaway(goaway) = peer.recv_until(|f| matches!(f, Frame::Goaway(_))).await else {
        unreachable!()
    };
    assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
    server.closed().await;
}

#[tokio::test]
async fn test_peer_reset_cancels_call() {
    let (mut server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;
    let headers = peer.headers(1, &request_metadata("/a/A"), false);
    peer.send(headers).await;

    let mut call = server.accept().await.unwrap();
    assert!(matches!(expect_event(&mut call).await, StreamEvent::InitialMetadata(_)));

    peer.send(Frame::RstStream(RstStreamFrame::new(1, ErrorCode::Cancel)))
        .await;
    match expect_event(&mut call).await {
        StreamEvent::Closed(status) => assert_eq!(status.code(), StatusCode::Cancelled),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test]
async fn test_graceful_goaway_waits_for_ping() {
    let (server, mut peer) = start(ServerTransportBuilder::new());
    peer.client_handshake().await;
    let headers = peer.headers(1, &request_metadata("/a/A"), true);
    peer.send(headers).await;

    let peer_side = async {
        let Frame::Goaway(first) = peer.recv_until(|f| matches!(f, Frame::Goaway(_))).await else {
            unreachable!()
        };
        assert_eq!(first.last_stream_id, MAX_STREAM_ID);
        assert_eq!(first.error_code, ErrorCode::NoError);

        let Frame::Ping(ping) = peer.recv_until(|f| matches!(f, Frame::Ping(p) if !p.ack)).await else {
            unreachable!()
        };
        peer.send(Frame::Ping(PingFrame::with_opaque(ping.opaque(), true)))
            .await;

        let Frame::Goaway(last) = peer.recv_until(|f| matches!(f, Frame::Goaway(_))).await else {
            unreachable!()
        };
        assert_eq!(last.last_stream_id, 1);
        peer
    };
    let (_, mut peer) = tokio::join!(
        server.request_goaway(ErrorCode::NoError, Bytes::new(), false),
        peer_side
    );

    // Streams after the final GOAWAY are ignored
    let headers = peer.headers(3, &request_metadata("/a/B"), true);
    peer.send(headers).await;
    assert_eq!(server.active_streams(), 1);
}

#[tokio::test]
async fn test_security_frame_delivered_when_advertised() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let (_server, mut peer) = start(
        ServerTransportBuilder::new()
            .allow_security_frame(true)
            .security_frame_handler(move |payload| {
                let _ = tx.send(payload);
            }),
    );
    peer.client_handshake().await;
    peer.send(Frame::Security(SecurityFrame::new(Bytes::from_static(b"alts"))))
        .await;
    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, Bytes::from_static(b"alts"));
}

#[tokio::test]
async fn test_bad_preface_gets_goaway() {
    let (server, mut peer) = start(ServerTransportBuilder::new());
    peer.send_raw(b"PRI * HTTP/1.1\r\n\r\nSM\r\n\r\n").await;
    let frames = peer.drain().await;
    assert!(frames.iter().any(
        |f| matches!(f, Frame::Goaway(g) if g.error_code == ErrorCode::ProtocolError)
    ));
    assert!(server.is_closed());
}
