pub mod auth;
pub mod biometric;
pub mod cleanup;
pub mod key_manager;
pub mod notification;
pub mod rate_limiter;
pub mod session;
pub mod two_factor;

pub use auth::AuthService;
pub use biometric::BiometricService;
pub use cleanup::{CleanupReport, CleanupService};
pub use key_manager::KeyManager;
pub use notification::{NotificationDispatcher, SmtpDispatcher};
pub use rate_limiter::RateLimiter;
pub use session::SessionManager;
pub use two_factor::TwoFactorService;
