use super::{endpoint::Endpoint, make_tag, EndpointBuilder, EndpointOption};
use crate::{
    transport::{udp::UdpConnection, SipAddr, TransportLayer},
    Result,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod test_client;

pub(super) async fn create_test_endpoint(addr: Option<&str>) -> Result<Endpoint> {
    create_test_endpoint_with_option(addr, EndpointOption::default()).await
}

pub(super) async fn create_test_endpoint_with_option(
    addr: Option<&str>,
    option: EndpointOption,
) -> Result<Endpoint> {
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());

    if let Some(addr) = addr {
        let socket = UdpConnection::create_connection(addr.parse()?, None).await?;
        tl.add_transport(socket.into()).await;
    }

    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipflow-test")
        .with_cancel_token(token)
        .with_transport_layer(tl)
        .with_option(option)
        .build();
    Ok(endpoint)
}

/// Timer settings shrunk to milliseconds so timeout paths run in test time.
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

/// An INVITE addressed at `target`, with the Via taken from the endpoint's
/// own listen socket so responses find their way back.
pub(super) async fn make_test_invite(
    endpoint: &Endpoint,
    target: &SipAddr,
) -> Result<rsip::Request> {
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
    Ok(endpoint
        .inner
        .make_request(rsip::Method::Invite, target.into(), via, from, to, 1))
}

#[cfg(test)]
mod helper_tests {
    use crate::transaction::{make_via_branch, random_text};

    #[test]
    fn test_random_text() {
        let text = random_text(10);
        assert_eq!(text.len(), 10);
        assert_ne!(random_text(10), random_text(10));

        let branch = make_via_branch().to_string();
        assert!(branch.contains("z9hG4bK"));
    }
}
