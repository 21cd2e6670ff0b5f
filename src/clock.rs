//! Clock module
//!
//! Settable system time and timezone with manual/auto update policies.
//! Auto time updates run the SNTP client against the configured time
//! servers; manual mode accepts absolute Time writes. Exposed on the bus
//! as the clock object on the manager path.

use crate::error::{ConnError, ConnResult};
use crate::ntp::{self, NtpClient};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUpdates {
    Unknown,
    Manual,
    #[default]
    Auto,
}

impl TimeUpdates {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUpdates::Unknown => "unknown",
            TimeUpdates::Manual => "manual",
            TimeUpdates::Auto => "auto",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "manual" => TimeUpdates::Manual,
            "auto" => TimeUpdates::Auto,
            _ => TimeUpdates::Unknown,
        }
    }
}

/// Bus-visible clock state.
#[derive(Debug, Clone)]
pub struct ClockProperties {
    pub time: u64,
    pub time_updates: TimeUpdates,
    pub timezone: String,
    pub timezone_updates: TimeUpdates,
    pub timeservers: Vec<String>,
}

struct ClockState {
    time_updates: TimeUpdates,
    timezone_updates: TimeUpdates,
    timezone: String,
    timeservers: Vec<String>,
}

pub struct Clock {
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new(timeservers: Vec<String>) -> Self {
        Self {
            state: Mutex::new(ClockState {
                time_updates: TimeUpdates::Auto,
                timezone_updates: TimeUpdates::Auto,
                timezone: String::new(),
                timeservers,
            }),
        }
    }

    pub async fn properties(&self) -> ClockProperties {
        let state = self.state.lock().await;
        ClockProperties {
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            time_updates: state.time_updates,
            timezone: state.timezone.clone(),
            timezone_updates: state.timezone_updates,
            timeservers: state.timeservers.clone(),
        }
    }

    /// Absolute time writes are only honored in manual mode.
    pub async fn set_time(&self, seconds: u64) -> ConnResult<()> {
        let state = self.state.lock().await;
        if state.time_updates != TimeUpdates::Manual {
            return Err(ConnError::PermissionDenied(
                "time updates are automatic".into(),
            ));
        }
        ntp::set_time(seconds)?;
        info!("system time set to {}", seconds);
        Ok(())
    }

    pub async fn set_time_updates(&self, updates: TimeUpdates) -> ConnResult<()> {
        if updates == TimeUpdates::Unknown {
            return Err(ConnError::InvalidArgument("time updates value".into()));
        }
        self.state.lock().await.time_updates = updates;
        Ok(())
    }

    pub async fn set_timezone(&self, timezone: &str) -> ConnResult<()> {
        {
            let state = self.state.lock().await;
            if state.timezone_updates != TimeUpdates::Manual {
                return Err(ConnError::PermissionDenied(
                    "timezone updates are automatic".into(),
                ));
            }
        }

        self.state.lock().await.timezone = timezone.to_string();
        info!("timezone set to {}", timezone);
        Ok(())
    }

    pub async fn set_timezone_updates(&self, updates: TimeUpdates) -> ConnResult<()> {
        if updates == TimeUpdates::Unknown {
            return Err(ConnError::InvalidArgument("timezone updates value".into()));
        }
        self.state.lock().await.timezone_updates = updates;
        Ok(())
    }

    pub async fn set_timeservers(&self, timeservers: Vec<String>) -> ConnResult<()> {
        self.state.lock().await.timeservers = timeservers;
        self.sync().await;
        Ok(())
    }

    /// Run an SNTP pass when automatic updates are on; called when a
    /// service reaches online and on timeserver edits.
    pub async fn sync(&self) {
        let (auto, servers) = {
            let state = self.state.lock().await;
            (
                state.time_updates == TimeUpdates::Auto,
                state.timeservers.clone(),
            )
        };

        if !auto || servers.is_empty() {
            return;
        }

        if let Err(e) = NtpClient::sync(&servers).await {
            warn!("time synchronization failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_time_guard() {
        let clock = Clock::new(Vec::new());
        // Auto by default: manual writes are refused.
        let err = clock.set_time(1_700_000_000).await.unwrap_err();
        assert!(matches!(err, ConnError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_update_mode_strings() {
        assert_eq!(TimeUpdates::from_str("manual"), TimeUpdates::Manual);
        assert_eq!(TimeUpdates::from_str("auto"), TimeUpdates::Auto);
        assert_eq!(TimeUpdates::from_str("bogus"), TimeUpdates::Unknown);

        let clock = Clock::new(Vec::new());
        assert!(clock.set_time_updates(TimeUpdates::Unknown).await.is_err());
        clock.set_time_updates(TimeUpdates::Manual).await.unwrap();
        assert_eq!(clock.properties().await.time_updates, TimeUpdates::Manual);
    }

    #[tokio::test]
    async fn test_timezone_guard() {
        let clock = Clock::new(Vec::new());
        assert!(clock.set_timezone("Europe/Helsinki").await.is_err());

        clock
            .set_timezone_updates(TimeUpdates::Manual)
            .await
            .unwrap();
        clock.set_timezone("Europe/Helsinki").await.unwrap();
        assert_eq!(clock.properties().await.timezone, "Europe/Helsinki");
    }

    #[tokio::test]
    async fn test_properties_carry_timeservers() {
        let clock = Clock::new(vec!["pool.ntp.org".to_string()]);
        let properties = clock.properties().await;
        assert_eq!(properties.timeservers, vec!["pool.ntp.org".to_string()]);
        assert!(properties.time > 0);
    }
}
