pub mod hmac;
pub mod nonce;

pub use self::hmac::{ApiCredentials, HmacAuth};
pub use self::nonce::MonotonicMillis;
