use crate::transport::{udp::UdpConnection, SipConnection, TransportEvent};
use rsip::prelude::UntypedHeader;
use rsip::SipMessage;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;

const REGISTER: &str = "REGISTER sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKnashds7\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@example.com>;tag=88sja8x\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: 987asjd97y7atg\r\n\
CSeq: 1 REGISTER\r\n\
Content-Length: 0\r\n\r\n";

#[test]
fn test_build_via_received() {
    let mut via =
        rsip::headers::Via::new("SIP/2.0/UDP 192.168.1.1:5060;branch=z9hG4bKtest");
    SipConnection::build_via_received(&mut via, "127.0.0.1:12345".parse().unwrap()).unwrap();
    let text = via.to_string();
    assert!(text.contains("received=127.0.0.1"), "{}", text);
    assert!(text.contains("rport=12345"), "{}", text);
}

#[test]
fn test_build_via_received_noop_when_matching() {
    let mut via =
        rsip::headers::Via::new("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKtest");
    SipConnection::build_via_received(&mut via, "127.0.0.1:5060".parse().unwrap()).unwrap();
    let text = via.to_string();
    assert!(!text.contains("received="), "{}", text);
}

#[test]
fn test_parse_target_from_via() {
    let via = rsip::headers::Via::new(
        "SIP/2.0/UDP 192.168.1.1:5060;branch=z9hG4bKtest;received=10.0.0.1;rport=9999",
    );
    let target = SipConnection::parse_target_from_via(&via).unwrap();
    assert_eq!(target.host.to_string(), "10.0.0.1");
    assert_eq!(target.port.map(|p| *p.value()), Some(9999));
}

#[tokio::test]
async fn test_udp_send_recv() {
    let a = UdpConnection::create_connection("127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();
    let b = UdpConnection::create_connection("127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();

    let (tx, mut rx) = unbounded_channel();
    let receiver = b.clone();
    tokio::spawn(async move {
        receiver.serve_loop(tx).await.ok();
    });

    let msg = SipMessage::try_from(REGISTER).unwrap();
    a.send(msg, Some(b.get_addr())).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");
    match event {
        TransportEvent::Incoming(msg, _, source) => {
            let req = match msg {
                SipMessage::Request(req) => req,
                _ => panic!("expected request"),
            };
            assert_eq!(req.method, rsip::Method::Register);
            // source port is ephemeral so the Via must be corrected
            assert!(req.to_string().contains("rport="));
            assert_eq!(source.r#type, Some(rsip::transport::Transport::Udp));
        }
        _ => panic!("expected incoming event"),
    }
}
