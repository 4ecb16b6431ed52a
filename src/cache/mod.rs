pub mod keys;
pub mod payment;

pub use keys::CacheKey;
pub use payment::PaymentCache;
