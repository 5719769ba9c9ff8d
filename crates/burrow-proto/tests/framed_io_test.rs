//! Frame codec behaviour over a real byte stream

use burrow_proto::{Frame, FrameCodec, FrameError, FrameType};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, FramedWrite};

#[tokio::test]
async fn test_frames_survive_a_byte_stream() {
    let (client, server) = tokio::io::duplex(64);

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(client, FrameCodec::new());
        sink.send(Frame::open(1, 22)).await.unwrap();
        sink.send(Frame::data(1, Bytes::from(vec![7u8; 10_000])))
            .await
            .unwrap();
        sink.send(Frame::close(1)).await.unwrap();
    });

    let mut frames = FramedRead::new(server, FrameCodec::new());

    let open = frames.next().await.unwrap().unwrap();
    assert_eq!(open.port(), Some(22));

    let data = frames.next().await.unwrap().unwrap();
    assert_eq!(data.frame_type, FrameType::Data);
    assert_eq!(data.payload.len(), 10_000);

    let close = frames.next().await.unwrap().unwrap();
    assert_eq!(close.frame_type, FrameType::Close);
    assert!(close.payload.is_empty());

    writer.await.unwrap();

    // Writer dropped at a frame boundary: clean end of stream
    assert!(frames.next().await.is_none());
}

#[tokio::test]
async fn test_truncated_payload_is_an_error() {
    let (mut client, server) = tokio::io::duplex(64);

    let encoded = Frame::data(5, Bytes::from_static(b"0123456789"))
        .encode()
        .unwrap();
    // Full header, half the payload, then the peer goes away
    client.write_all(&encoded[..Frame::HEADER_SIZE + 5]).await.unwrap();
    drop(client);

    let mut frames = FramedRead::new(server, FrameCodec::new());
    match frames.next().await {
        Some(Err(FrameError::Io(_))) => {}
        other => panic!("expected I/O error for truncated frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_truncated_header_is_an_error() {
    let (mut client, server) = tokio::io::duplex(64);

    client.write_all(&[b'D', 0, 0]).await.unwrap();
    drop(client);

    let mut frames = FramedRead::new(server, FrameCodec::new());
    assert!(matches!(frames.next().await, Some(Err(FrameError::Io(_)))));
}
