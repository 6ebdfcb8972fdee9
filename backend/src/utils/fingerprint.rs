use crate::models::session::DeviceInfo;
use crate::utils::security::sha256_hex;

/// Stable device identifier: `sha256(userAgent:ip:deviceType:os:browser)`.
///
/// A fingerprint supplied by the client takes precedence.
pub fn device_fingerprint(device: &DeviceInfo) -> String {
    if let Some(fingerprint) = device.fingerprint.as_deref().filter(|f| !f.trim().is_empty()) {
        return fingerprint.to_string();
    }
    let material = format!(
        "{}:{}:{}:{}:{}",
        device.user_agent,
        device.ip,
        device.device_type.as_deref().unwrap_or_default(),
        device.os.as_deref().unwrap_or_default(),
        device.browser.as_deref().unwrap_or_default(),
    );
    sha256_hex(&material)
}
