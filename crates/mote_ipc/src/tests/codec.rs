use serde_json::json;

use crate::{
    codec::{encode_frame, read_frame, FrameReader, MAX_FRAME_BYTES},
    IpcError, IpcMessage, MessageKind, Role,
};

fn sample_message() -> IpcMessage {
    IpcMessage::to(MessageKind::ShowNotification, Role::Main, Role::Tray)
        .with_payload(&json!({"title": "t", "body": "b"}))
        .expect("payload")
}

#[test]
fn encode_decode_round_trip() {
    let message = sample_message();
    let frame = encode_frame(&message).expect("encode");

    let mut reader = FrameReader::new();
    reader.push(&frame);
    let decoded = reader
        .next_message()
        .expect("decode")
        .expect("complete frame");
    assert_eq!(decoded, message);
    assert_eq!(reader.pending_bytes(), 0);
}

#[tokio::test]
async fn read_frame_round_trip() {
    let message = sample_message();
    let frame = encode_frame(&message).expect("encode");

    let (mut tx, mut rx) = tokio::io::duplex(frame.len());
    tokio::io::AsyncWriteExt::write_all(&mut tx, &frame)
        .await
        .expect("write");
    let decoded = read_frame(&mut rx).await.expect("read frame");
    assert_eq!(decoded, message);
}

#[test]
fn every_split_of_a_frame_yields_one_message() {
    let message = sample_message();
    let frame = encode_frame(&message).expect("encode");

    for split_at in 1..frame.len() {
        let mut reader = FrameReader::new();
        reader.push(&frame[..split_at]);
        assert!(
            reader.next_message().expect("first half").is_none(),
            "split at {split_at} should need more data"
        );
        reader.push(&frame[split_at..]);
        let decoded = reader
            .next_message()
            .expect("second half")
            .expect("complete frame");
        assert_eq!(decoded, message);
        assert!(reader.next_message().expect("drained").is_none());
    }
}

#[test]
fn oversize_payload_fails_to_encode() {
    let message = IpcMessage::new(MessageKind::StatusUpdate, Role::Main)
        .with_payload(&json!({"blob": "x".repeat(MAX_FRAME_BYTES)}))
        .expect("payload");
    match encode_frame(&message) {
        Err(IpcError::FrameTooLarge { len, max }) => {
            assert!(len > max);
            assert_eq!(max, MAX_FRAME_BYTES);
        }
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
}

#[test]
fn oversize_declared_length_is_fatal() {
    let mut reader = FrameReader::new();
    reader.push(&((MAX_FRAME_BYTES as u32 + 1).to_be_bytes()));
    assert!(matches!(
        reader.next_message(),
        Err(IpcError::FrameTooLarge { .. })
    ));
}

#[test]
fn empty_body_frame_is_a_parse_error() {
    let mut reader = FrameReader::new();
    reader.push(&0u32.to_be_bytes());
    assert!(matches!(
        reader.next_message(),
        Err(IpcError::Deserialize(_))
    ));
}

#[test]
fn open_brace_frame_is_a_different_parse_error() {
    let mut empty = FrameReader::new();
    empty.push(&0u32.to_be_bytes());
    let empty_error = match empty.next_message() {
        Err(IpcError::Deserialize(error)) => error.to_string(),
        other => panic!("expected parse error, got {other:?}"),
    };

    let mut brace = FrameReader::new();
    brace.push(&1u32.to_be_bytes());
    brace.push(b"{");
    let brace_error = match brace.next_message() {
        Err(IpcError::Deserialize(error)) => error.to_string(),
        other => panic!("expected parse error, got {other:?}"),
    };

    assert_ne!(empty_error, brace_error);
}

#[test]
fn short_prefix_needs_more_data() {
    let mut reader = FrameReader::new();
    reader.push(&[0, 0]);
    assert!(reader.next_message().expect("short prefix").is_none());
    assert_eq!(reader.pending_bytes(), 2);
}

#[test]
fn two_frames_in_one_feed_decode_in_order() {
    let first = sample_message();
    let second = IpcMessage::new(MessageKind::Ping, Role::Main);

    let mut combined = encode_frame(&first).expect("encode first");
    combined.extend(encode_frame(&second).expect("encode second"));

    let mut reader = FrameReader::new();
    reader.push(&combined);
    assert_eq!(reader.next_message().expect("first").expect("frame"), first);
    assert_eq!(
        reader.next_message().expect("second").expect("frame"),
        second
    );
    assert!(reader.next_message().expect("drained").is_none());
}
