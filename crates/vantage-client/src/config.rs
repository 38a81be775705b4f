//! Client configuration knobs.
//!
//! The signaling URI can be overridden per device without a rebuild: an
//! environment variable first (convenient on dev machines), then an Android
//! system property read with a bounded wait, then the localhost default.

use std::time::Duration;

use tracing::{debug, warn};

pub const WEBSOCKET_URI_ENV: &str = "VANTAGE_WEBSOCKET_URI";
pub const WEBSOCKET_URI_PROPERTY: &str = "debug.vantage.websocket_uri";
pub const BLACK_THRESHOLD_PROPERTY: &str = "debug.vantage.black_threshold";
pub const DEFAULT_WEBSOCKET_URI: &str = "ws://127.0.0.1:8080";

/// Resolve the signaling URI, waiting at most `timeout` for the property
/// store to answer. Absent or late values fall back to localhost.
pub fn websocket_uri(timeout: Duration) -> String {
    if let Ok(uri) = std::env::var(WEBSOCKET_URI_ENV) {
        if !uri.is_empty() {
            debug!("websocket uri from {WEBSOCKET_URI_ENV}: {uri}");
            return uri;
        }
    }
    match read_system_property(WEBSOCKET_URI_PROPERTY, timeout) {
        Some(uri) if !uri.is_empty() => {
            debug!("websocket uri from {WEBSOCKET_URI_PROPERTY}: {uri}");
            uri
        }
        _ => DEFAULT_WEBSOCKET_URI.to_string(),
    }
}

/// Optional override for the additive-to-alpha default threshold.
pub fn black_threshold_override(timeout: Duration) -> Option<f32> {
    let value = read_system_property(BLACK_THRESHOLD_PROPERTY, timeout)?;
    parse_threshold(&value)
}

fn parse_threshold(value: &str) -> Option<f32> {
    match value.trim().parse::<f32>() {
        Ok(v) if (0.0..=1.0).contains(&v) => Some(v),
        Ok(v) => {
            warn!("{BLACK_THRESHOLD_PROPERTY}={v} outside [0,1], ignored");
            None
        }
        Err(_) => {
            warn!("{BLACK_THRESHOLD_PROPERTY}={value:?} is not a float, ignored");
            None
        }
    }
}

/// Single-call property read: the platform lookup runs on a worker thread and
/// the caller waits at most `timeout` for its answer.
#[cfg(target_os = "android")]
fn read_system_property(name: &str, timeout: Duration) -> Option<String> {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    let property = name.to_string();
    let spawned = std::thread::Builder::new()
        .name("property-read".to_string())
        .spawn(move || {
            let _ = tx.send(read_property_blocking(&property));
        });
    if spawned.is_err() {
        return None;
    }
    match rx.recv_timeout(timeout) {
        Ok(value) => value,
        Err(_) => {
            warn!("timed out after {timeout:?} reading {name}");
            None
        }
    }
}

#[cfg(target_os = "android")]
fn read_property_blocking(name: &str) -> Option<String> {
    use std::ffi::{CStr, CString};

    // PROP_VALUE_MAX from <sys/system_properties.h>.
    const PROP_VALUE_MAX: usize = 92;

    let c_name = CString::new(name).ok()?;
    let mut value = [0i8; PROP_VALUE_MAX];
    let len = unsafe { libc::__system_property_get(c_name.as_ptr(), value.as_mut_ptr()) };
    if len <= 0 {
        return None;
    }
    let text = unsafe { CStr::from_ptr(value.as_ptr()) };
    Some(text.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "android"))]
fn read_system_property(_name: &str, _timeout: Duration) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_parsing_accepts_unit_range() {
        assert_eq!(parse_threshold("0.25"), Some(0.25));
        assert_eq!(parse_threshold(" 0 "), Some(0.0));
        assert_eq!(parse_threshold("1.0"), Some(1.0));
    }

    #[test]
    fn threshold_parsing_rejects_garbage() {
        assert_eq!(parse_threshold("1.5"), None);
        assert_eq!(parse_threshold("-0.1"), None);
        assert_eq!(parse_threshold("dark"), None);
    }

    #[test]
    fn missing_property_falls_back_to_localhost() {
        std::env::remove_var(WEBSOCKET_URI_ENV);
        assert_eq!(
            websocket_uri(Duration::from_millis(10)),
            DEFAULT_WEBSOCKET_URI
        );
    }
}
