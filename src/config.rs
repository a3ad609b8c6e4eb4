//! Engine configuration

use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default number of bars kept resident per symbol.
pub const DEFAULT_WINDOW_SIZE: usize = 10_000;

/// Replay engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Directory holding one `<SYMBOL>.db` file per symbol (default: "data")
    pub data_dir: PathBuf,
    /// Bar resolution the engine replays (default: "1m")
    pub timeframe: String,
    /// Maximum number of bars kept in memory per symbol (default: 10 000)
    pub window_size: usize,
    /// Interval between scheduled ticks in milliseconds (default: 1000)
    pub default_speed_ms: u64,
    /// Time of day "jump to next day" lands on (default: 09:30)
    pub fast_forward_time: NaiveTime,
    /// UTC offset of the data's civil calendar in minutes (default: 0).
    /// A fixed offset ignores daylight saving; use `data_timezone` for
    /// exchange data that follows DST.
    pub data_utc_offset_minutes: i32,
    /// IANA zone of the data's civil calendar, e.g. "America/New_York".
    /// Overrides `data_utc_offset_minutes` when set (default: unset)
    pub data_timezone: Option<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            data_dir: PathBuf::from("data"),
            timeframe: "1m".to_string(),
            window_size: DEFAULT_WINDOW_SIZE,
            default_speed_ms: 1000,
            fast_forward_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            data_utc_offset_minutes: 0,
            data_timezone: None,
        }
    }
}

impl ReplayConfig {
    /// Builds a configuration from `REPLAY_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparseable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        let mut config = ReplayConfig::default();

        if let Ok(dir) = std::env::var("REPLAY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(timeframe) = std::env::var("REPLAY_TIMEFRAME") {
            config.timeframe = timeframe;
        }
        if let Some(size) = parse_env("REPLAY_WINDOW_SIZE") {
            config.window_size = size;
        }
        if let Some(speed) = parse_env("REPLAY_SPEED_MS") {
            config.default_speed_ms = speed;
        }
        if let Ok(raw) = std::env::var("REPLAY_FAST_FORWARD_TIME") {
            match NaiveTime::parse_from_str(&raw, "%H:%M") {
                Ok(time) => config.fast_forward_time = time,
                Err(e) => log::warn!("Ignoring REPLAY_FAST_FORWARD_TIME={:?}: {}", raw, e),
            }
        }
        if let Some(offset) = parse_env("REPLAY_UTC_OFFSET_MINUTES") {
            config.data_utc_offset_minutes = offset;
        }
        if let Ok(zone) = std::env::var("REPLAY_TIMEZONE") {
            config.data_timezone = Some(zone);
        }

        config
    }

    /// Loads a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config: ReplayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can drive an engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::Invalid(
                "window_size must be greater than zero".to_string(),
            ));
        }
        if self.timeframe.is_empty() {
            return Err(ConfigError::Invalid("timeframe cannot be empty".to_string()));
        }
        self.data_calendar()?;
        Ok(())
    }

    /// The data's civil calendar: the named zone if set, else the fixed offset.
    pub fn data_calendar(&self) -> Result<DataCalendar, ConfigError> {
        match &self.data_timezone {
            Some(name) => name
                .parse::<Tz>()
                .map(DataCalendar::Zone)
                .map_err(|e| ConfigError::Invalid(format!("data_timezone {:?}: {}", name, e))),
            None => self.data_offset().map(DataCalendar::Fixed),
        }
    }

    /// The data's civil calendar as a fixed UTC offset.
    pub fn data_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.data_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "data_utc_offset_minutes out of range: {}",
                    self.data_utc_offset_minutes
                ))
            })
    }
}

/// Calendar that decides where one trading day ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataCalendar {
    Fixed(FixedOffset),
    Zone(Tz),
}

impl DataCalendar {
    /// The instant `time_of_day` on the calendar day after `timestamp`.
    pub fn next_day_at(
        &self,
        timestamp: DateTime<Utc>,
        time_of_day: NaiveTime,
    ) -> Option<DateTime<Utc>> {
        match self {
            DataCalendar::Fixed(offset) => next_day_at(timestamp, time_of_day, offset),
            DataCalendar::Zone(zone) => next_day_at(timestamp, time_of_day, zone),
        }
    }
}

/// The instant `time_of_day` on the calendar day after `timestamp`, in `zone`.
///
/// An ambiguous local time (DST fall-back) resolves to the earlier instant; a
/// skipped one (spring-forward gap) yields `None`.
pub fn next_day_at<Z: TimeZone>(
    timestamp: DateTime<Utc>,
    time_of_day: NaiveTime,
    zone: &Z,
) -> Option<DateTime<Utc>> {
    let date = timestamp.with_timezone(zone).date_naive().succ_opt()?;
    zone.from_local_datetime(&date.and_time(time_of_day))
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T>
where
    T::Err: fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

/// Errors that can occur while loading configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Config file could not be read
    Io(String),
    /// Config file is not valid JSON for this schema
    Parse(String),
    /// Values are out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "Cannot read config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Cannot parse config: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplayConfig::default();
        assert_eq!(config.window_size, 10_000);
        assert_eq!(config.default_speed_ms, 1000);
        assert_eq!(config.timeframe, "1m");
        assert_eq!(
            config.fast_forward_time,
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: ReplayConfig =
            serde_json::from_str(r#"{"window_size": 500, "fast_forward_time": "08:00:00"}"#)
                .unwrap();
        assert_eq!(config.window_size, 500);
        assert_eq!(
            config.fast_forward_time,
            NaiveTime::from_hms_opt(8, 0, 0).unwrap()
        );
        assert_eq!(config.timeframe, "1m");
    }

    #[test]
    fn test_zero_window_is_invalid() {
        let config = ReplayConfig {
            window_size: 0,
            ..ReplayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_data_offset() {
        let config = ReplayConfig {
            data_utc_offset_minutes: -300,
            ..ReplayConfig::default()
        };
        assert_eq!(config.data_offset().unwrap().local_minus_utc(), -300 * 60);

        let broken = ReplayConfig {
            data_utc_offset_minutes: 100_000,
            ..ReplayConfig::default()
        };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_named_zone_overrides_offset() {
        let config = ReplayConfig {
            data_utc_offset_minutes: 120,
            data_timezone: Some("America/New_York".to_string()),
            ..ReplayConfig::default()
        };
        assert_eq!(
            config.data_calendar().unwrap(),
            DataCalendar::Zone(chrono_tz::America::New_York)
        );

        let unknown = ReplayConfig {
            data_timezone: Some("Mars/Olympus_Mons".to_string()),
            ..ReplayConfig::default()
        };
        assert!(matches!(unknown.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zone_calendar_follows_dst() {
        let calendar = DataCalendar::Zone(chrono_tz::America::New_York);
        let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();

        // EST in January: 09:30 local is 14:30 UTC
        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap();
        assert_eq!(
            calendar.next_day_at(winter, open),
            Some(Utc.with_ymd_and_hms(2024, 1, 16, 14, 30, 0).unwrap())
        );

        // EDT in July: 09:30 local is 13:30 UTC
        let summer = Utc.with_ymd_and_hms(2024, 7, 15, 15, 0, 0).unwrap();
        assert_eq!(
            calendar.next_day_at(summer, open),
            Some(Utc.with_ymd_and_hms(2024, 7, 16, 13, 30, 0).unwrap())
        );

        // Same instant under a fixed UTC-5 is an hour late in summer
        let fixed = DataCalendar::Fixed(FixedOffset::west_opt(5 * 3600).unwrap());
        assert_eq!(
            fixed.next_day_at(summer, open),
            Some(Utc.with_ymd_and_hms(2024, 7, 16, 14, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_from_json_file_missing_is_io_error() {
        let result = ReplayConfig::from_json_file("/no/such/replay.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
