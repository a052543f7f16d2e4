use serde::{Deserialize, Serialize};

/// Final, merged runtime settings.
///
/// Merge order: CLI > ENV (`ROTOR_*`) > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Directory holding one JSON document per credential.
    pub credentials_dir: String,
    /// Calls served by the active credential before the pool rotates.
    pub calls_per_rotation: u32,
    pub retry_429_max_retries: u32,
    pub retry_429_interval_ms: u64,
    pub auto_ban: bool,
    /// HTTP statuses that count toward the ban threshold.
    pub auto_ban_error_codes: Vec<u16>,
    pub auto_ban_threshold: u32,
    pub connect_timeout_secs: u64,
    /// Total budget for a non-streaming upstream call.
    pub request_timeout_secs: u64,
    /// Total budget for a streaming call, measured from first byte.
    pub streaming_timeout_secs: u64,
    /// A stream producing no bytes for this long is treated as stalled.
    pub stream_inactivity_timeout_secs: u64,
    pub anti_truncation_max_attempts: u32,
    /// When the client cannot render thinking blocks, convert them to
    /// delimited text instead of dropping them.
    pub thinking_to_text_fallback: bool,
    /// Fold system turns into the first user turn instead of sending a
    /// separate system instruction.
    pub compatibility_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7861,
            credentials_dir: "creds".to_string(),
            calls_per_rotation: 100,
            retry_429_max_retries: 3,
            retry_429_interval_ms: 1000,
            auto_ban: true,
            auto_ban_error_codes: vec![400, 403],
            auto_ban_threshold: 3,
            connect_timeout_secs: 30,
            request_timeout_secs: 600,
            streaming_timeout_secs: 1200,
            stream_inactivity_timeout_secs: 120,
            anti_truncation_max_attempts: 3,
            thinking_to_text_fallback: true,
            compatibility_mode: false,
        }
    }
}

/// Optional layer used while merging settings sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credentials_dir: Option<String>,
    pub calls_per_rotation: Option<u32>,
    pub retry_429_max_retries: Option<u32>,
    pub retry_429_interval_ms: Option<u64>,
    pub auto_ban: Option<bool>,
    pub auto_ban_error_codes: Option<Vec<u16>>,
    pub auto_ban_threshold: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub streaming_timeout_secs: Option<u64>,
    pub stream_inactivity_timeout_secs: Option<u64>,
    pub anti_truncation_max_attempts: Option<u32>,
    pub thinking_to_text_fallback: Option<bool>,
    pub compatibility_mode: Option<bool>,
}

impl SettingsPatch {
    /// Read the `ROTOR_*` environment, ignoring unparseable values.
    pub fn from_env() -> Self {
        fn get<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok()?.trim().parse().ok()
        }
        fn get_bool(key: &str) -> Option<bool> {
            let raw = std::env::var(key).ok()?;
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        }
        fn get_codes(key: &str) -> Option<Vec<u16>> {
            let raw = std::env::var(key).ok()?;
            let codes: Vec<u16> = raw
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect();
            if codes.is_empty() { None } else { Some(codes) }
        }

        Self {
            host: std::env::var("ROTOR_HOST").ok(),
            port: get("ROTOR_PORT"),
            credentials_dir: std::env::var("ROTOR_CREDENTIALS_DIR").ok(),
            calls_per_rotation: get("ROTOR_CALLS_PER_ROTATION"),
            retry_429_max_retries: get("ROTOR_RETRY_429_MAX_RETRIES"),
            retry_429_interval_ms: get("ROTOR_RETRY_429_INTERVAL_MS"),
            auto_ban: get_bool("ROTOR_AUTO_BAN"),
            auto_ban_error_codes: get_codes("ROTOR_AUTO_BAN_ERROR_CODES"),
            auto_ban_threshold: get("ROTOR_AUTO_BAN_THRESHOLD"),
            connect_timeout_secs: get("ROTOR_CONNECT_TIMEOUT_SECS"),
            request_timeout_secs: get("ROTOR_REQUEST_TIMEOUT_SECS"),
            streaming_timeout_secs: get("ROTOR_STREAMING_TIMEOUT_SECS"),
            stream_inactivity_timeout_secs: get("ROTOR_STREAM_INACTIVITY_TIMEOUT_SECS"),
            anti_truncation_max_attempts: get("ROTOR_ANTI_TRUNCATION_MAX_ATTEMPTS"),
            thinking_to_text_fallback: get_bool("ROTOR_THINKING_TO_TEXT_FALLBACK"),
            compatibility_mode: get_bool("ROTOR_COMPATIBILITY_MODE"),
        }
    }

    pub fn overlay(&mut self, other: SettingsPatch) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            host,
            port,
            credentials_dir,
            calls_per_rotation,
            retry_429_max_retries,
            retry_429_interval_ms,
            auto_ban,
            auto_ban_error_codes,
            auto_ban_threshold,
            connect_timeout_secs,
            request_timeout_secs,
            streaming_timeout_secs,
            stream_inactivity_timeout_secs,
            anti_truncation_max_attempts,
            thinking_to_text_fallback,
            compatibility_mode,
        );
    }

    pub fn into_settings(self) -> Settings {
        let defaults = Settings::default();
        Settings {
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            credentials_dir: self.credentials_dir.unwrap_or(defaults.credentials_dir),
            calls_per_rotation: self.calls_per_rotation.unwrap_or(defaults.calls_per_rotation),
            retry_429_max_retries: self
                .retry_429_max_retries
                .unwrap_or(defaults.retry_429_max_retries),
            retry_429_interval_ms: self
                .retry_429_interval_ms
                .unwrap_or(defaults.retry_429_interval_ms),
            auto_ban: self.auto_ban.unwrap_or(defaults.auto_ban),
            auto_ban_error_codes: self
                .auto_ban_error_codes
                .unwrap_or(defaults.auto_ban_error_codes),
            auto_ban_threshold: self.auto_ban_threshold.unwrap_or(defaults.auto_ban_threshold),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or(defaults.connect_timeout_secs),
            request_timeout_secs: self
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            streaming_timeout_secs: self
                .streaming_timeout_secs
                .unwrap_or(defaults.streaming_timeout_secs),
            stream_inactivity_timeout_secs: self
                .stream_inactivity_timeout_secs
                .unwrap_or(defaults.stream_inactivity_timeout_secs),
            anti_truncation_max_attempts: self
                .anti_truncation_max_attempts
                .unwrap_or(defaults.anti_truncation_max_attempts),
            thinking_to_text_fallback: self
                .thinking_to_text_fallback
                .unwrap_or(defaults.thinking_to_text_fallback),
            compatibility_mode: self.compatibility_mode.unwrap_or(defaults.compatibility_mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.calls_per_rotation, 100);
        assert_eq!(settings.anti_truncation_max_attempts, 3);
        assert!(settings.auto_ban_error_codes.contains(&403));
    }

    #[test]
    fn overlay_prefers_newer_layer() {
        let mut base = SettingsPatch {
            port: Some(7861),
            calls_per_rotation: Some(50),
            ..Default::default()
        };
        base.overlay(SettingsPatch {
            port: Some(9000),
            ..Default::default()
        });
        let settings = base.into_settings();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.calls_per_rotation, 50);
    }
}
