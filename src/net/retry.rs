use std::time::Duration;
use ureq::Error::*;

// Bounded exponential backoff with jitter, 3 tries total by default.
//
// - retry on 500, 503, 520, 527 (same list pip uses in
//   pip/_internal/network/session.py)
// - retry on connect-related transport errors
// - base sleep doubles each attempt, plus up to 50% jitter, so two concurrent
//   callers hitting the same flaky host don't retry in lockstep
const MAX_TRIES: u32 = 3;
const BASE_SLEEP_MS: u64 = 250;

const RETRY_STATUS: &[u16] = &[500, 503, 520, 527];
use ureq::ErrorKind::*;
const RETRY_ERRORKIND: &[ureq::ErrorKind] =
    &[Dns, ConnectionFailed, TooManyRedirects, Io, ProxyConnect];

fn backoff(attempt: u32) -> Duration {
    let base = BASE_SLEEP_MS * 2u64.saturating_pow(attempt);
    let jitter = fastrand::u64(0..=base / 2);
    Duration::from_millis(base + jitter)
}

pub fn call_with_retry(
    req: ureq::Request,
) -> std::result::Result<ureq::Response, ureq::Error> {
    // We preserve ureq's native Result/Error types, so callers can customize how they
    // handle 4xx responses themselves.
    let mut attempt = 0;
    loop {
        let this_req = req.clone();
        let result = this_req.call();
        match &result {
            Ok(_) => return result,
            Err(Status(status, _)) => {
                if !RETRY_STATUS.contains(status) {
                    return result;
                }
            }
            Err(err @ Transport(_)) => {
                if !RETRY_ERRORKIND.contains(&err.kind()) {
                    return result;
                }
            }
        }
        attempt += 1;
        if attempt >= MAX_TRIES {
            return result;
        }
        std::thread::sleep(backoff(attempt));
    }
}
