//! Data models shared across the stores and the services.

pub mod biometric;
pub mod otp;
pub mod rate_limit;
pub mod session;
pub mod signing_key;
pub mod two_factor;
pub mod user;
