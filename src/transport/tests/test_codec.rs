use crate::transport::stream::{SipCodec, SipFrame};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

const REGISTER: &str = "REGISTER sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKnashds7\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@example.com>;tag=88sja8x\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: 987asjd97y7atg\r\n\
CSeq: 1 REGISTER\r\n\
Content-Length: 5\r\n\r\nhello";

#[test]
fn test_decode_keepalive() {
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::from(&b"\r\n\r\n\r\n"[..]);

    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(SipFrame::KeepaliveRequest)
    ));
    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(SipFrame::KeepaliveResponse)
    ));
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_decode_split_message() {
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::new();

    // headers alone are not enough, the body is still outstanding
    let (head, tail) = REGISTER.split_at(REGISTER.len() - 3);
    buf.extend_from_slice(head.as_bytes());
    assert!(codec.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(tail.as_bytes());
    match codec.decode(&mut buf).unwrap() {
        Some(SipFrame::Message(msg)) => {
            assert_eq!(msg.body(), b"hello");
        }
        other => panic!("expected message, got {:?}", other),
    }
    assert!(buf.is_empty());
}

#[test]
fn test_decode_back_to_back_messages() {
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(REGISTER.as_bytes());
    buf.extend_from_slice(REGISTER.as_bytes());

    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(SipFrame::Message(_))
    ));
    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(SipFrame::Message(_))
    ));
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_decode_compact_content_length() {
    let compact = REGISTER.replace("Content-Length: 5", "l: 5");
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::from(compact.as_bytes());
    match codec.decode(&mut buf).unwrap() {
        Some(SipFrame::Message(msg)) => assert_eq!(msg.body(), b"hello"),
        other => panic!("expected message, got {:?}", other),
    }
}

#[test]
fn test_decode_rejects_bad_content_length() {
    let bad = REGISTER.replace("Content-Length: 5", "Content-Length: abc");
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::from(bad.as_bytes());
    assert!(codec.decode(&mut buf).is_err());
}
