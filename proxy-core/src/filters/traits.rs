//! Component D: the two filter capabilities, `HeaderFilter` and
//! `BodyFilter`, plus the read-only message view passed to both.
//!
//! `MessageHead` deliberately carries no body: a `HeaderFilter` must not be
//! able to observe body bytes, and giving it only a head view enforces that
//! at the type level instead of by convention.

use bytes::BytesMut;
use http::{Method, StatusCode, Uri};

use crate::context::ProxyContext;
use crate::headers::Headers;
use crate::message::HttpVersion;

/// The request-line or status-line facts a filter may need, without giving
/// it access to the body.
#[derive(Debug, Clone, Copy)]
pub enum MessageHead<'a> {
    Request { method: &'a Method, uri: &'a Uri, version: HttpVersion },
    Response { status: StatusCode, version: HttpVersion },
}

impl<'a> MessageHead<'a> {
    pub fn version(&self) -> HttpVersion {
        match self {
            MessageHead::Request { version, .. } => *version,
            MessageHead::Response { version, .. } => *version,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, MessageHead::Request { .. })
    }
}

/// Mutates a header bag (request headers at the `ReqHdr` stage, response
/// headers at `RespHdr`). May short-circuit by setting `ctx.response`; only
/// meaningful at the `ReqHdr` stage, since by `RespHdr` a response already
/// exists.
pub trait HeaderFilter: Send + Sync {
    /// Called once, the first time this filter is selected for a message.
    fn begin(&self, _head: &MessageHead, _ctx: &mut ProxyContext) {}

    fn filter(&self, headers: &mut Headers, head: &MessageHead, ctx: &mut ProxyContext);

    /// Called once after the last header filter invocation for a message.
    fn end(&self, _head: &MessageHead, _ctx: &mut ProxyContext) {}
}

/// Transforms streamed body chunks. `data_inout` holds bytes available to
/// consume this call; anything the filter isn't ready to emit yet goes into
/// `carry_out`, which `FilterStack` prepends to this filter's next call.
/// `is_last` marks the final chunk of the message, at which point a
/// well-behaved filter drains its own carry.
pub trait BodyFilter: Send + Sync {
    fn begin(&self, _head: &MessageHead, _ctx: &mut ProxyContext) {}

    fn filter(
        &self,
        data_inout: &mut BytesMut,
        carry_out: &mut BytesMut,
        head: &MessageHead,
        headers: &Headers,
        is_last: bool,
        ctx: &mut ProxyContext,
    );

    /// Whether this filter ever changes body length/content. `FilterStack`
    /// uses this to decide whether `Content-Length` survives the stack:
    /// stripped when any selected body filter reports `true` and the
    /// message is not already chunked.
    fn will_modify(&self) -> bool {
        true
    }

    fn end(&self, _head: &MessageHead, _ctx: &mut ProxyContext) {}
}
