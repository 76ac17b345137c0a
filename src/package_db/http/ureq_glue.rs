use crate::prelude::*;

use std::io::Read;
use std::time::Duration;
use ureq::{Agent, AgentBuilder, OrAnyStatus};

use super::user_agent::user_agent;
use crate::error::ResolveError;
use crate::net::call_with_retry;

pub fn new_ureq_agent() -> Agent {
    AgentBuilder::new()
        .user_agent(&user_agent())
        // we handle redirects in the caching layer
        .redirects(0)
        .timeout(Duration::from_secs(30))
        .build()
}

pub fn do_request_ureq(
    agent: &Agent,
    req: &http::Request<()>,
) -> Result<http::Response<impl Read>> {
    let mut ureq_req =
        agent.request_url(req.method().as_str(), &Url::parse(&req.uri().to_string())?);
    for (name, value) in req.headers().into_iter() {
        ureq_req = ureq_req.set(name.as_str(), std::str::from_utf8(value.as_bytes())?);
    }
    // `or_any_status` turns an HTTP error status into an `Ok` response, so
    // only a genuine transport failure -- surviving the bounded retry
    // schedule in `net::retry` -- reaches this `map_err`.
    let ureq_response = call_with_retry(ureq_req)
        .or_any_status()
        .map_err(|err| ResolveError::SourceUnreachable {
            url: req.uri().to_string(),
            reason: err.to_string(),
        })?;
    let mut response = http::Response::builder().status(ureq_response.status());
    for name in ureq_response.headers_names() {
        for value in ureq_response.all(&name) {
            response = response.header(&name, value);
        }
    }
    Ok(response.body(ureq_response.into_reader())?)
}
