use super::{create_test_endpoint, fast_timers, next_state};
use crate::{
    dialog::{Dialog, DialogLayer, DialogLayerOption, DialogState, TerminatedReason, TimeoutReason},
    transaction::endpoint::Endpoint,
};
use rsip::{headers::*, Header, SipMessage, StatusCode};
use std::time::Duration;
use tokio::{net::UdpSocket, sync::mpsc::unbounded_channel, time::timeout};

fn raw_invite(branch: &str, local: std::net::SocketAddr, target: &crate::transport::SipAddr) -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Invite,
        uri: target.into(),
        headers: vec![
            Via::new(format!("SIP/2.0/UDP {};branch={}", local, branch)).into(),
            CSeq::new("1 INVITE").into(),
            From::new("Alice <sip:alice@example.com>;tag=uac-tag").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new(format!("{}@example.com", branch)).into(),
            Contact::new(format!("<sip:{}>", local)).into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

async fn recv_response(socket: &UdpSocket, status_code: StatusCode) -> rsip::Response {
    let mut buf = [0u8; 65535];
    loop {
        let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("recv failed");
        if let Ok(SipMessage::Response(resp)) = SipMessage::try_from(&buf[..n]) {
            if resp.status_code == status_code {
                return resp;
            }
        }
    }
}

async fn recv_request(
    socket: &UdpSocket,
    method: rsip::Method,
) -> (rsip::Request, std::net::SocketAddr) {
    let mut buf = [0u8; 65535];
    loop {
        let (n, source) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("recv failed");
        if let Ok(SipMessage::Request(req)) = SipMessage::try_from(&buf[..n]) {
            if req.method == method {
                return (req, source);
            }
        }
    }
}

/// UAS that answers every INVITE with a 2xx, optionally after a 180.
fn spawn_uas(
    server: &Endpoint,
    layer: &DialogLayer,
    state_tx: crate::dialog::DialogStateSender,
    answer: bool,
) {
    let mut incoming = server.incoming_transactions();
    tokio::spawn(server.inner.clone().process());
    {
        let layer = layer.clone();
        tokio::spawn(async move { layer.serve().await });
    }
    let layer = layer.clone();
    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            if tx.original.method != rsip::Method::Invite {
                if let Some(dialog) = layer.match_dialog(&tx.original) {
                    tokio::spawn(async move {
                        dialog.handle_request(&mut tx).await.ok();
                    });
                }
                continue;
            }
            let dialog = layer
                .get_or_create_server_invite(&tx, state_tx.clone(), None)
                .expect("server dialog");
            tokio::spawn(async move {
                dialog.ringing(&mut tx).await.expect("180 failed");
                if answer {
                    dialog.accept(&mut tx, vec![], None).await.expect("200 failed");
                }
                dialog.handle(&mut tx).await.ok();
            });
        }
    });
}

/// Missing ACK with linked-agent recovery: the layer synthesizes a BYE
/// and terminates the dialog with an `AckNotReceived` notification.
#[tokio::test]
async fn test_ack_wait_linked_agent_auto_bye() -> crate::Result<()> {
    let server = create_test_endpoint(fast_timers()).await?;
    let server_addr = server.get_addrs().await[0].clone();
    let layer = DialogLayer::with_option(
        server.inner.clone(),
        DialogLayerOption {
            ack_wait: Duration::from_millis(100),
            linked_agent: true,
            ..Default::default()
        },
    );
    let (state_tx, mut states) = unbounded_channel();
    spawn_uas(&server, &layer, state_tx, true);

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let local = peer.local_addr()?;
    let invite = raw_invite("z9hG4bKlinked1", local, &server_addr);
    peer.send_to(invite.to_string().as_bytes(), server_addr.get_socketaddr()?)
        .await?;
    recv_response(&peer, StatusCode::OK).await;

    assert!(matches!(next_state(&mut states).await, DialogState::Calling(_)));
    assert!(matches!(next_state(&mut states).await, DialogState::Early(_, _)));
    assert!(matches!(
        next_state(&mut states).await,
        DialogState::WaitAck(_, _)
    ));
    match next_state(&mut states).await {
        DialogState::Timeout(_, reason) => assert_eq!(reason, TimeoutReason::AckNotReceived),
        state => panic!("expected timeout notification, got {}", state),
    }
    match next_state(&mut states).await {
        DialogState::Terminated(_, reason) => assert_eq!(
            reason,
            TerminatedReason::Timeout(TimeoutReason::AckNotReceived)
        ),
        state => panic!("expected termination, got {}", state),
    }

    // the recovery BYE goes out toward the peer's contact
    let (bye, source) = recv_request(&peer, rsip::Method::Bye).await;
    let mut headers = bye.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
        )
    });
    let ok = rsip::Response {
        status_code: StatusCode::OK,
        version: rsip::Version::V2,
        headers,
        body: vec![],
    };
    peer.send_to(ok.to_string().as_bytes(), source).await?;
    Ok(())
}

/// Same expiry without linked-agent mode: notification only, no BYE, the
/// dialog keeps waiting.
#[tokio::test]
async fn test_ack_wait_notification_only() -> crate::Result<()> {
    let server = create_test_endpoint(fast_timers()).await?;
    let server_addr = server.get_addrs().await[0].clone();
    let layer = DialogLayer::with_option(
        server.inner.clone(),
        DialogLayerOption {
            ack_wait: Duration::from_millis(100),
            linked_agent: false,
            ..Default::default()
        },
    );
    let (state_tx, mut states) = unbounded_channel();
    spawn_uas(&server, &layer, state_tx, true);

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let local = peer.local_addr()?;
    let invite = raw_invite("z9hG4bKlinked2", local, &server_addr);
    peer.send_to(invite.to_string().as_bytes(), server_addr.get_socketaddr()?)
        .await?;
    recv_response(&peer, StatusCode::OK).await;

    assert!(matches!(next_state(&mut states).await, DialogState::Calling(_)));
    assert!(matches!(next_state(&mut states).await, DialogState::Early(_, _)));
    assert!(matches!(
        next_state(&mut states).await,
        DialogState::WaitAck(_, _)
    ));
    let id = match next_state(&mut states).await {
        DialogState::Timeout(id, reason) => {
            assert_eq!(reason, TimeoutReason::AckNotReceived);
            id
        }
        state => panic!("expected timeout notification, got {}", state),
    };

    // no BYE and no termination follow
    let mut buf = [0u8; 65535];
    assert!(timeout(Duration::from_millis(300), peer.recv_from(&mut buf))
        .await
        .is_err());
    assert!(states.try_recv().is_err());
    match layer.get_dialog(&id) {
        Some(Dialog::ServerInvite(dialog)) => assert!(dialog.inner.waiting_ack()),
        _ => panic!("dialog missing"),
    }
    Ok(())
}

/// A dialog stuck in the early state raises `EarlyStateTimeout`.
#[tokio::test]
async fn test_early_state_timeout() -> crate::Result<()> {
    let server = create_test_endpoint(fast_timers()).await?;
    let server_addr = server.get_addrs().await[0].clone();
    let layer = DialogLayer::with_option(
        server.inner.clone(),
        DialogLayerOption {
            early_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    );
    let (state_tx, mut states) = unbounded_channel();
    spawn_uas(&server, &layer, state_tx, false);

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let local = peer.local_addr()?;
    let invite = raw_invite("z9hG4bKearly1", local, &server_addr);
    peer.send_to(invite.to_string().as_bytes(), server_addr.get_socketaddr()?)
        .await?;
    recv_response(&peer, StatusCode::Ringing).await;

    assert!(matches!(next_state(&mut states).await, DialogState::Calling(_)));
    assert!(matches!(next_state(&mut states).await, DialogState::Early(_, _)));
    match next_state(&mut states).await {
        DialogState::Timeout(id, reason) => {
            assert_eq!(reason, TimeoutReason::EarlyStateTimeout);
            let dialog = layer.get_dialog(&id).expect("dialog missing");
            assert!(dialog.inner().is_early());
        }
        state => panic!("expected timeout notification, got {}", state),
    }
    Ok(())
}
