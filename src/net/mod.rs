mod retry;

pub use retry::call_with_retry;
