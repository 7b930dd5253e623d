use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub scheduling: SchedulingSettings,
    pub server_port: u16,
}

/// Scheduling knobs read from the environment. Kept as plain strings/values
/// here so the config crate stays free of domain types.
#[derive(Debug, Clone)]
pub struct SchedulingSettings {
    /// `unchecked` or `conflict_checked`
    pub creation_policy: String,
    pub strict_transitions: bool,
    pub default_slot_minutes: i64,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            creation_policy: "conflict_checked".to_string(),
            strict_transitions: false,
            default_slot_minutes: 30,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = SchedulingSettings::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            scheduling: SchedulingSettings {
                creation_policy: env::var("SCHEDULING_CREATION_POLICY")
                    .unwrap_or_else(|_| defaults.creation_policy.clone()),
                strict_transitions: parse_flag("SCHEDULING_STRICT_TRANSITIONS", defaults.strict_transitions),
                default_slot_minutes: parse_number(
                    "SCHEDULING_DEFAULT_SLOT_MINUTES",
                    defaults.default_slot_minutes,
                ),
            },
            server_port: parse_number("SERVER_PORT", 3000),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }
}

fn parse_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!("{} has unrecognised value '{}', using default {}", key, other, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_number<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid number ('{}'), using default {}", key, value, default);
            default
        }),
        Err(_) => default,
    }
}
