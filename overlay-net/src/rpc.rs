//! Request/response correlation.
//!
//! A call sends a REQUEST upstream and then reads the downstream-request
//! port until a RESPONSE with the same topic turns up.  Anything else read
//! in the meantime belongs to some other waiter: it is held in a side
//! buffer and handed back to the port, in arrival order, once the call is
//! done.  There is no timeout; a call waits until it is answered or the
//! port fails.
//!
//! Three flavours differ only in how they treat the response payload:
//!
//! | Call | Absent payload | Present payload |
//! |------|----------------|-----------------|
//! | [`Handle::call`]        | `Ok(None)`   | `Ok(Some(p))` |
//! | [`Handle::call_expect`] | `Protocol`   | `Ok(p)`       |
//! | [`Handle::call_void`]   | `Ok(())`     | `Protocol`    |
//!
//! `call_expect` is the older typed entry point and keeps its stricter
//! check for compatibility.

use {
    crate::{
        error::{OverlayError, Result},
        handle::Handle,
        message::{Envelope, MessageType},
        payload::Payload,
        port::{PortKind, RecvMode, Transport},
    },
    log::{debug, warn},
    std::collections::VecDeque,
};

impl<T: Transport> Handle<T> {
    /// Send a REQUEST without waiting for an answer.
    ///
    /// The route stack is started with this handle's identity so that a
    /// response can find its way back.
    pub fn request(&mut self, nodeid: u32, topic: &str, payload: Option<Payload>) -> Result<()> {
        if topic.is_empty() {
            let err = OverlayError::InvalidArgument("request topic is empty".into());
            self.record_error(&err);
            return Err(err);
        }
        let mut envelope = Envelope::request(topic, payload).with_nodeid(nodeid);
        envelope.push_route(self.identity().to_string());
        let result = self.transport.send(PortKind::UpstreamRequest, &envelope);
        self.track(result)
    }

    /// Receive the RESPONSE for `topic`, setting aside everything else.
    ///
    /// Set-aside envelopes are requeued on the downstream-request port
    /// before returning, whether or not a match was found.
    pub fn recv_matched(&mut self, topic: &str, mode: RecvMode) -> Result<Envelope> {
        let mut nomatch = VecDeque::new();
        let result = loop {
            match self.transport.recv(PortKind::DownstreamRequest, mode) {
                Ok(envelope)
                    if envelope.msg_type == MessageType::Response && envelope.matches(topic) =>
                {
                    break Ok(envelope)
                }
                Ok(envelope) => {
                    debug!("setting aside {} while waiting for {}", envelope, topic);
                    nomatch.push_back(envelope);
                }
                Err(e) => break Err(e),
            }
        };
        while let Some(envelope) = nomatch.pop_back() {
            if let Err(e) = self.transport.requeue(PortKind::DownstreamRequest, envelope) {
                warn!("failed to requeue set-aside envelope: {}", e);
            }
        }
        self.track(result)
    }

    /// Send a request and wait for its response envelope, turning a
    /// nonzero error number into [`OverlayError::Remote`].
    fn rpc(&mut self, nodeid: u32, topic: &str, payload: Option<Payload>) -> Result<Envelope> {
        self.request(nodeid, topic, payload)?;
        let response = self.recv_matched(topic, RecvMode::Blocking)?;
        match response.errnum.unwrap_or(0) {
            0 => Ok(response),
            errnum => {
                let err = OverlayError::Remote { errnum };
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Call `topic` on `nodeid` and return the response payload, if any.
    ///
    /// An empty response is a success.
    pub fn call(
        &mut self,
        nodeid: u32,
        topic: &str,
        payload: Option<Payload>,
    ) -> Result<Option<Payload>> {
        Ok(self.rpc(nodeid, topic, payload)?.payload)
    }

    /// Call `topic` on `nodeid`, requiring a response payload.
    #[deprecated(note = "use `call` and handle an absent payload")]
    pub fn call_expect(
        &mut self,
        nodeid: u32,
        topic: &str,
        payload: Option<Payload>,
    ) -> Result<Payload> {
        match self.rpc(nodeid, topic, payload)?.payload {
            Some(payload) => Ok(payload),
            None => {
                let err = OverlayError::Protocol(format!("{topic}: response has no payload"));
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Call `topic` on `nodeid` where no response payload is expected.
    pub fn call_void(&mut self, nodeid: u32, topic: &str, payload: Option<Payload>) -> Result<()> {
        match self.rpc(nodeid, topic, payload)?.payload {
            None => Ok(()),
            Some(_) => {
                let err = OverlayError::Protocol(format!("{topic}: unexpected response payload"));
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Answer `request` on the downstream-request port.
    ///
    /// Topic, route and destination are copied from the request.  Any
    /// payload is dropped when `errnum` is nonzero.
    pub fn respond(
        &mut self,
        request: &Envelope,
        errnum: i32,
        payload: Option<Payload>,
    ) -> Result<()> {
        if request.msg_type != MessageType::Request {
            return Err(OverlayError::InvalidArgument(format!(
                "cannot respond to {request}"
            )));
        }
        let response = Envelope::response_to(request, errnum, payload);
        let result = self.transport.send(PortKind::DownstreamRequest, &response);
        self.track(result)
    }
}
