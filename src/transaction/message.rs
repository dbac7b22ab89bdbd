use super::{endpoint::EndpointInner, make_call_id, make_via_branch};
use crate::{Error, Result};
use rsip::{headers::ContentLength, prelude::HeadersExt, Header, Request, Response, StatusCode};

impl EndpointInner {
    /// Build an out-of-dialog request with the mandatory header set.
    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> rsip::Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(None)),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        rsip::Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    /// Build a response to `req`: Via chain, Call-ID, From, To and CSeq are
    /// copied verbatim, everything else is dropped. To-tag and Contact are
    /// the caller's business.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::RecordRoute(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
            )
        });
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Response {
            status_code,
            version: req.version.clone(),
            headers,
            body: body.unwrap_or_default(),
        }
    }

    /// ACK for a non-2xx final response, built inside the INVITE
    /// transaction per RFC 3261 17.1.1.3: same Request-URI and top Via
    /// (same branch) as the original, To taken from the response so the
    /// peer's tag is acknowledged.
    pub fn make_ack(&self, original: &Request, resp: &Response) -> Result<Request> {
        let via = original.via_header()?.clone();
        let to = resp.to_header()?.clone();
        let cseq = rsip::typed::CSeq {
            seq: original.cseq_header()?.seq()?,
            method: rsip::Method::Ack,
        };
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(original.call_id_header()?.clone().into()),
            Header::From(original.from_header()?.clone().into()),
            Header::To(to.into()),
            Header::CSeq(cseq.into()),
            Header::MaxForwards(70.into()),
            Header::ContentLength(ContentLength::default()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        Ok(Request {
            method: rsip::Method::Ack,
            uri: original.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        })
    }

    /// Via for outbound requests, built from a listen address of the
    /// transport layer with a fresh branch.
    pub async fn get_via(
        &self,
        transport: Option<rsip::transport::Transport>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = self
            .transport_layer
            .get_addr(transport)
            .await
            .ok_or_else(|| Error::Error("no transport available for Via".to_string()))?;
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr.clone(),
                ..Default::default()
            },
            params: vec![branch.unwrap_or_else(make_via_branch)],
        })
    }

    /// CANCEL for a pending INVITE: same top Via (same branch), same CSeq
    /// number with the method swapped.
    pub fn make_cancel(&self, original: &Request) -> Result<Request> {
        let via = original.via_header()?.clone();
        let cseq = rsip::typed::CSeq {
            seq: original.cseq_header()?.seq()?,
            method: rsip::Method::Cancel,
        };
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(original.call_id_header()?.clone().into()),
            Header::From(original.from_header()?.clone().into()),
            Header::To(original.to_header()?.clone().into()),
            Header::CSeq(cseq.into()),
            Header::MaxForwards(70.into()),
            Header::ContentLength(ContentLength::default()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        Ok(Request {
            method: rsip::Method::Cancel,
            uri: original.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        })
    }
}
