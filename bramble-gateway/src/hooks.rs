//! The interception hook surface.
//!
//! Hooks run once per downstream call and may contribute outbound headers
//! derived from the inbound request. This is deliberately the whole surface;
//! anything resembling a plugin pipeline stays out of the gateway.

use http::header::HeaderName;
use http::HeaderMap;

pub trait OutboundHook: Send + Sync {
    /// Adds headers to a downstream request. `inbound` carries the client's
    /// request headers.
    fn outbound_headers(&self, inbound: &HeaderMap, outbound: &mut HeaderMap);
}

/// Forwards a configured set of inbound headers verbatim.
pub struct ForwardHeaders {
    names: Vec<HeaderName>,
}

impl ForwardHeaders {
    pub fn new(names: &[String]) -> Self {
        ForwardHeaders {
            names: names
                .iter()
                .filter_map(|name| name.parse::<HeaderName>().ok())
                .collect(),
        }
    }
}

impl OutboundHook for ForwardHeaders {
    fn outbound_headers(&self, inbound: &HeaderMap, outbound: &mut HeaderMap) {
        for name in &self.names {
            for value in inbound.get_all(name) {
                outbound.append(name.clone(), value.clone());
            }
        }
    }
}
