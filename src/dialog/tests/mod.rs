use super::{DialogState, DialogStateReceiver};
use crate::{
    transaction::{endpoint::Endpoint, make_tag, EndpointBuilder, EndpointOption},
    transport::{udp::UdpConnection, SipAddr, TransportLayer},
    Result,
};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

mod test_fork;
mod test_timeout;

pub(super) async fn create_test_endpoint(option: EndpointOption) -> Result<Endpoint> {
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());
    let socket = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    tl.add_transport(socket.into()).await;
    Ok(EndpointBuilder::new()
        .with_user_agent("sipflow-test")
        .with_cancel_token(token)
        .with_transport_layer(tl)
        .with_option(option)
        .build())
}

pub(super) fn fast_timers() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(160),
        t4: Duration::from_millis(40),
        t1x64: Duration::from_millis(400),
        timer_interval: Duration::from_millis(5),
        stray_message_hook: None,
    }
}

/// An INVITE suitable for `create_client_invite`: tagged From, Contact on
/// the endpoint's own listen address.
pub(super) async fn make_invite(endpoint: &Endpoint, target: &SipAddr) -> Result<rsip::Request> {
    let via = endpoint.inner.get_via(None, None).await?;
    let from = rsip::typed::From {
        display_name: None,
        uri: rsip::Uri::try_from("sip:alice@example.com")?,
        params: vec![rsip::Param::Tag(make_tag())],
    };
    let to = rsip::typed::To {
        display_name: None,
        uri: target.into(),
        params: vec![],
    };
    let mut req = endpoint
        .inner
        .make_request(rsip::Method::Invite, target.into(), via, from, to, 1);
    let contact: rsip::Uri = (&endpoint.get_addrs().await[0]).into();
    req.headers.push(rsip::Header::Contact(
        rsip::typed::Contact {
            display_name: None,
            uri: contact,
            params: vec![],
        }
        .into(),
    ));
    Ok(req)
}

pub(super) async fn next_state(receiver: &mut DialogStateReceiver) -> DialogState {
    timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for dialog state")
        .expect("state channel closed")
}
