use super::{
    create_test_endpoint, create_test_endpoint_with_option, fast_timers, make_test_invite,
};
use crate::{
    transaction::{make_tag, TransactionState},
    transport::SipAddr,
};
use rsip::{Header, SipMessage, StatusCode};
use std::time::Duration;
use tokio::{net::UdpSocket, time::timeout};

async fn recv_parsed(socket: &UdpSocket) -> (SipMessage, std::net::SocketAddr) {
    let mut buf = [0u8; 65535];
    let (n, addr) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv failed");
    let msg = SipMessage::try_from(&buf[..n]).expect("unparsable message");
    (msg, addr)
}

fn make_final_response(req: &rsip::Request, status_code: StatusCode) -> rsip::Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
        )
    });
    rsip::Response {
        status_code,
        version: rsip::Version::V2,
        headers,
        body: vec![],
    }
}

#[tokio::test]
async fn test_client_invite_accepted() -> crate::Result<()> {
    let client = create_test_endpoint_with_option(Some("127.0.0.1:0"), fast_timers()).await?;
    let server = create_test_endpoint(Some("127.0.0.1:0")).await?;
    let server_addr = server.get_addrs().await.first().cloned().unwrap();

    let mut incoming = server.incoming_transactions();
    tokio::spawn(server.inner.clone().process());
    tokio::spawn(client.inner.clone().process());

    let invite = make_test_invite(&client, &server_addr).await?;
    let mut tx = client.client_transaction(invite)?;
    tx.destination = Some(server_addr.clone());
    tx.send().await?;

    let server_task = tokio::spawn(async move {
        let mut stx = incoming.recv().await.expect("no incoming transaction");
        stx.reply(StatusCode::Ringing).await.expect("180 failed");
        stx.reply(StatusCode::OK).await.expect("200 failed");
        stx
    });

    let msg = timeout(Duration::from_secs(2), tx.receive())
        .await
        .expect("timed out")
        .expect("expected provisional response");
    match msg {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::Ringing),
        _ => panic!("expected response"),
    }
    assert_eq!(tx.state, TransactionState::Proceeding);

    let msg = timeout(Duration::from_secs(2), tx.receive())
        .await
        .expect("timed out")
        .expect("expected final response");
    match msg {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::OK),
        _ => panic!("expected response"),
    }
    // the ACK is the dialog layer's job; the transaction lingers in
    // Accepted so retransmitted and forked 2xx responses still surface,
    // then terminates on its own once the linger expires
    assert_eq!(tx.state, TransactionState::Accepted);
    let next = timeout(Duration::from_secs(2), tx.receive())
        .await
        .expect("accepted transaction never terminated");
    assert!(next.is_none());
    assert_eq!(tx.state, TransactionState::Terminated);

    server_task.await.unwrap();
    Ok(())
}

#[tokio::test]
async fn test_client_noninvite_completed() -> crate::Result<()> {
    let client = create_test_endpoint(Some("127.0.0.1:0")).await?;
    let server = create_test_endpoint(Some("127.0.0.1:0")).await?;
    let server_addr = server.get_addrs().await.first().cloned().unwrap();

    let mut incoming = server.incoming_transactions();
    tokio::spawn(server.inner.clone().process());
    tokio::spawn(client.inner.clone().process());

    let via = client.inner.get_via(None, None).await?;
    let from = rsip::typed::From {
        display_name: None,
        uri: rsip::Uri::try_from("sip:alice@example.com")?,
        params: vec![rsip::Param::Tag(make_tag())],
    };
    let to = rsip::typed::To {
        display_name: None,
        uri: (&server_addr).into(),
        params: vec![],
    };
    let register = client.inner.make_request(
        rsip::Method::Register,
        (&server_addr).into(),
        via,
        from,
        to,
        1,
    );

    let mut tx = client.client_transaction(register)?;
    tx.destination = Some(server_addr.clone());
    tx.send().await?;

    tokio::spawn(async move {
        let mut stx = incoming.recv().await.expect("no incoming transaction");
        stx.reply(StatusCode::OK).await.expect("200 failed");
        stx
    });

    let msg = timeout(Duration::from_secs(2), tx.receive())
        .await
        .expect("timed out")
        .expect("expected final response");
    match msg {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::OK),
        _ => panic!("expected response"),
    }
    assert_eq!(tx.state, TransactionState::Completed);
    Ok(())
}

/// No response at all: the transaction reports exactly one timeout, as a
/// locally generated 408.
#[tokio::test]
async fn test_client_invite_timeout() -> crate::Result<()> {
    let client = create_test_endpoint_with_option(Some("127.0.0.1:0"), fast_timers()).await?;
    tokio::spawn(client.inner.clone().process());

    // a socket that never answers
    let sink = UdpSocket::bind("127.0.0.1:0").await?;
    let target: SipAddr = {
        let mut addr: SipAddr = sink.local_addr()?.into();
        addr.r#type = Some(rsip::transport::Transport::Udp);
        addr
    };

    let invite = make_test_invite(&client, &target).await?;
    let mut tx = client.client_transaction(invite)?;
    tx.destination = Some(target);
    tx.send().await?;

    let surfaced = tokio::spawn(async move {
        let mut surfaced = Vec::new();
        while let Some(msg) = tx.receive().await {
            surfaced.push(msg);
        }
        surfaced
    });
    let surfaced = timeout(Duration::from_secs(5), surfaced)
        .await
        .expect("transaction never timed out")
        .unwrap();

    assert_eq!(surfaced.len(), 1, "exactly one timeout report");
    match &surfaced[0] {
        SipMessage::Response(resp) => {
            assert_eq!(resp.status_code, StatusCode::RequestTimeout)
        }
        _ => panic!("expected 408 response"),
    }
    Ok(())
}

/// Retransmission over unreliable transport, and the idempotent non-2xx
/// completion: however many duplicate finals arrive, the ACK is built once.
#[tokio::test]
async fn test_client_invite_retransmit_and_single_ack() -> crate::Result<()> {
    let client = create_test_endpoint_with_option(Some("127.0.0.1:0"), fast_timers()).await?;
    tokio::spawn(client.inner.clone().process());

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let target: SipAddr = {
        let mut addr: SipAddr = peer.local_addr()?.into();
        addr.r#type = Some(rsip::transport::Transport::Udp);
        addr
    };

    let invite = make_test_invite(&client, &target).await?;
    let mut tx = client.client_transaction(invite)?;
    tx.destination = Some(target);
    tx.send().await?;

    let surfaced = tokio::spawn(async move {
        let mut surfaced = Vec::new();
        while let Some(msg) = tx.receive().await {
            surfaced.push(msg);
        }
        surfaced
    });

    let (first, source) = recv_parsed(&peer).await;
    let original = match first {
        SipMessage::Request(req) => {
            assert_eq!(req.method, rsip::Method::Invite);
            req
        }
        _ => panic!("expected INVITE"),
    };
    // Timer A fires while we stay silent
    let (retransmit, _) = recv_parsed(&peer).await;
    assert!(matches!(retransmit, SipMessage::Request(_)));

    let busy = make_final_response(&original, StatusCode::BusyHere);
    peer.send_to(busy.to_string().as_bytes(), source).await?;
    let (ack1, _) = recv_parsed(&peer).await;
    let ack1 = match ack1 {
        SipMessage::Request(req) => {
            assert_eq!(req.method, rsip::Method::Ack);
            req
        }
        _ => panic!("expected ACK"),
    };

    // a duplicate final is answered with the cached ACK, not a new one
    peer.send_to(busy.to_string().as_bytes(), source).await?;
    let (ack2, _) = recv_parsed(&peer).await;
    let ack2 = match ack2 {
        SipMessage::Request(req) => req,
        _ => panic!("expected ACK"),
    };
    assert_eq!(ack1.to_string(), ack2.to_string());

    let surfaced = timeout(Duration::from_secs(5), surfaced)
        .await
        .expect("transaction never terminated")
        .unwrap();
    // the duplicate 486 was absorbed inside the transaction
    assert_eq!(surfaced.len(), 1);
    match &surfaced[0] {
        SipMessage::Response(resp) => assert_eq!(resp.status_code, StatusCode::BusyHere),
        _ => panic!("expected 486"),
    }
    Ok(())
}
