//! Configuration lookups for the AV stack.
//!
//! Properties live in a JSON config file. Parsing is split into pure
//! `_internal` helpers so the policy can be unit tested without touching
//! the filesystem.

use serde_json::Value;

// File to store the config for the AV stack
const BT_AV_CONF: &str = "/var/lib/bluetooth/bt_av.json";

const OFFLOAD_SUPPORTED_KEY: &str = "a2dp_offload.supported";
const OFFLOAD_DISABLED_KEY: &str = "a2dp_offload.disabled";
const DELAY_REPORTING_KEY: &str = "a2dp.delay_reporting";
const ABSOLUTE_VOLUME_KEY: &str = "avrcp.absolute_volume";

pub fn read_config() -> std::io::Result<String> {
    std::fs::read_to_string(BT_AV_CONF)
}

/// Whether the platform supports the hardware offload path. Read-only.
pub fn is_offload_supported() -> bool {
    read_config().ok().and_then(is_offload_supported_internal).unwrap_or(false)
}

fn is_offload_supported_internal(config: String) -> Option<bool> {
    serde_json::from_str::<Value>(config.as_str()).ok()?.get(OFFLOAD_SUPPORTED_KEY)?.as_bool()
}

/// Whether offload has been persistently disabled.
pub fn is_offload_disabled() -> bool {
    read_config().ok().and_then(is_offload_disabled_internal).unwrap_or(false)
}

fn is_offload_disabled_internal(config: String) -> Option<bool> {
    serde_json::from_str::<Value>(config.as_str()).ok()?.get(OFFLOAD_DISABLED_KEY)?.as_bool()
}

/// Offload is enabled iff supported and not disabled.
pub fn offload_enabled() -> bool {
    is_offload_supported() && !is_offload_disabled()
}

/// Whether AVDTP delay reporting is enabled; defaults to true.
pub fn delay_reporting_enabled() -> bool {
    read_config().ok().and_then(delay_reporting_enabled_internal).unwrap_or(true)
}

fn delay_reporting_enabled_internal(config: String) -> Option<bool> {
    serde_json::from_str::<Value>(config.as_str()).ok()?.get(DELAY_REPORTING_KEY)?.as_bool()
}

/// Whether AVRCP absolute volume is enabled; defaults to true.
pub fn absolute_volume_enabled() -> bool {
    read_config().ok().and_then(absolute_volume_enabled_internal).unwrap_or(true)
}

fn absolute_volume_enabled_internal(config: String) -> Option<bool> {
    serde_json::from_str::<Value>(config.as_str()).ok()?.get(ABSOLUTE_VOLUME_KEY)?.as_bool()
}
