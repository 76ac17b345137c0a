#[path = "http.rs"]
mod transport;
pub mod ureq_glue;
pub mod user_agent;

pub use self::transport::{CacheMode, Http, HttpInner, NotCached};
