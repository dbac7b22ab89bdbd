use super::{create_test_endpoint, fast_timers, make_invite, next_state};
use crate::{
    dialog::{DialogId, DialogLayer, DialogState, TerminatedReason},
    transport::SipAddr,
};
use rsip::prelude::UntypedHeader;
use rsip::{Header, SipMessage, StatusCode};
use std::time::Duration;
use tokio::{net::UdpSocket, sync::mpsc::unbounded_channel, time::timeout};

fn response_for(
    req: &rsip::Request,
    status_code: StatusCode,
    tag: Option<&str>,
    contact: Option<std::net::SocketAddr>,
) -> rsip::Response {
    let mut headers: Vec<Header> = Vec::new();
    for header in req.headers.iter() {
        match header {
            Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::CSeq(_) => {
                headers.push(header.clone())
            }
            Header::To(to) => match tag {
                Some(tag) => headers.push(
                    rsip::headers::To::new(format!("{};tag={}", to.value(), tag)).into(),
                ),
                None => headers.push(header.clone()),
            },
            _ => {}
        }
    }
    if let Some(addr) = contact {
        headers.push(rsip::headers::Contact::new(format!("<sip:{}>", addr)).into());
    }
    rsip::Response {
        status_code,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

/// Read datagrams until one parses as a request of `method`, skipping
/// retransmissions of anything else.
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

/// Two provisional responses with distinct remote tags yield two dialogs;
/// the one that gets the 2xx confirms and terminates independently while
/// the other stays early.
#[tokio::test]
async fn test_forked_invite_creates_one_dialog_per_tag() -> crate::Result<()> {
    let client = create_test_endpoint(fast_timers()).await?;
    let layer = DialogLayer::new(client.inner.clone());
    tokio::spawn(client.inner.clone().process());
    {
        let layer = layer.clone();
        tokio::spawn(async move { layer.serve().await });
    }

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?;
    let target: SipAddr = {
        let mut addr: SipAddr = peer_addr.into();
        addr.r#type = Some(rsip::transport::Transport::Udp);
        addr
    };

    let (state_tx, mut states) = unbounded_channel();
    let invite = make_invite(&client, &target).await?;
    let (dialog, mut tx) = layer.create_client_invite(invite, state_tx, None)?;
    tx.destination = Some(target);
    tx.send().await?;
    let driver = {
        let dialog = dialog.clone();
        tokio::spawn(async move { dialog.process(&mut tx).await })
    };
    assert!(matches!(next_state(&mut states).await, DialogState::Calling(_)));

    let (invite_req, source) = recv_request(&peer, rsip::Method::Invite).await;
    for tag in ["fork-a", "fork-b"] {
        let ringing = response_for(&invite_req, StatusCode::Ringing, Some(tag), None);
        peer.send_to(ringing.to_string().as_bytes(), source).await?;
    }

    match next_state(&mut states).await {
        DialogState::Early(id, _) => assert_eq!(id.remote_tag, "fork-a"),
        state => panic!("expected early dialog, got {}", state),
    }
    match next_state(&mut states).await {
        DialogState::Early(id, _) => assert_eq!(id.remote_tag, "fork-b"),
        state => panic!("expected forked early dialog, got {}", state),
    }
    assert_eq!(layer.len(), 2);

    let id = dialog.id();
    let forked = layer
        .get_dialog(&DialogId {
            call_id: id.call_id.clone(),
            local_tag: id.local_tag.clone(),
            remote_tag: "fork-b".to_string(),
        })
        .expect("forked dialog not in table");
    assert_eq!(forked.inner().fork_of.as_ref(), Some(&id));

    // the duplicate 2xx is absorbed, one leg confirms
    let ok = response_for(&invite_req, StatusCode::OK, Some("fork-a"), Some(peer_addr));
    peer.send_to(ok.to_string().as_bytes(), source).await?;
    peer.send_to(ok.to_string().as_bytes(), source).await?;
    match next_state(&mut states).await {
        DialogState::Confirmed(id, _) => assert_eq!(id.remote_tag, "fork-a"),
        state => panic!("expected confirmed dialog, got {}", state),
    }
    driver.await.unwrap()?;
    recv_request(&peer, rsip::Method::Ack).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(states.try_recv().is_err(), "exactly one confirmation");

    // the confirmed leg terminates on its own, the fork stays early
    let bye_task = {
        let dialog = dialog.clone();
        tokio::spawn(async move { dialog.bye().await })
    };
    let (bye, bye_source) = recv_request(&peer, rsip::Method::Bye).await;
    let ok = response_for(&bye, StatusCode::OK, None, None);
    peer.send_to(ok.to_string().as_bytes(), bye_source).await?;
    bye_task.await.unwrap()?;

    match next_state(&mut states).await {
        DialogState::Terminated(id, reason) => {
            assert_eq!(id.remote_tag, "fork-a");
            assert_eq!(reason, TerminatedReason::UacBye);
        }
        state => panic!("expected termination, got {}", state),
    }
    assert!(forked.inner().is_early());
    Ok(())
}

/// A 2xx carrying a To-tag never seen before is a fork, not a
/// retransmission: it gets its own dialog, confirmation and ACK even
/// after another leg has already confirmed.
#[tokio::test]
async fn test_second_2xx_with_new_tag_forks() -> crate::Result<()> {
    let client = create_test_endpoint(fast_timers()).await?;
    let layer = DialogLayer::new(client.inner.clone());
    tokio::spawn(client.inner.clone().process());
    {
        let layer = layer.clone();
        tokio::spawn(async move { layer.serve().await });
    }

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?;
    let target: SipAddr = {
        let mut addr: SipAddr = peer_addr.into();
        addr.r#type = Some(rsip::transport::Transport::Udp);
        addr
    };

    let (state_tx, mut states) = unbounded_channel();
    let invite = make_invite(&client, &target).await?;
    let (dialog, mut tx) = layer.create_client_invite(invite, state_tx, None)?;
    tx.destination = Some(target);
    tx.send().await?;
    {
        let dialog = dialog.clone();
        tokio::spawn(async move { dialog.process(&mut tx).await });
    }
    assert!(matches!(next_state(&mut states).await, DialogState::Calling(_)));

    let (invite_req, source) = recv_request(&peer, rsip::Method::Invite).await;
    let ok = response_for(&invite_req, StatusCode::OK, Some("fork-a"), Some(peer_addr));
    peer.send_to(ok.to_string().as_bytes(), source).await?;
    match next_state(&mut states).await {
        DialogState::Confirmed(id, _) => assert_eq!(id.remote_tag, "fork-a"),
        state => panic!("expected confirmed dialog, got {}", state),
    }
    recv_request(&peer, rsip::Method::Ack).await;

    // the second remote tag must yield a second, separately confirmed dialog
    let ok = response_for(&invite_req, StatusCode::OK, Some("fork-b"), Some(peer_addr));
    peer.send_to(ok.to_string().as_bytes(), source).await?;
    match next_state(&mut states).await {
        DialogState::Confirmed(id, _) => assert_eq!(id.remote_tag, "fork-b"),
        state => panic!("expected forked confirmation, got {}", state),
    }
    assert_eq!(layer.len(), 2);

    let id = dialog.id();
    let forked = layer
        .get_dialog(&DialogId {
            call_id: id.call_id.clone(),
            local_tag: id.local_tag.clone(),
            remote_tag: "fork-b".to_string(),
        })
        .expect("forked dialog not in table");
    assert_eq!(forked.inner().fork_of.as_ref(), Some(&id));
    assert!(forked.inner().is_confirmed());
    recv_request(&peer, rsip::Method::Ack).await;
    Ok(())
}
