//! Daily rotation of the service account's display name.

use crate::engine::SyncEngine;
use crate::error::SyncError;
use chrono::{DateTime, Days, FixedOffset, Offset, TimeZone, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const NAME_LENGTH: usize = 6;
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub fn random_display_name() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_LENGTH)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Time left until the next midnight in `offset`'s local time.
pub fn until_next_midnight(now: DateTime<Utc>, offset: FixedOffset) -> Duration {
    let next = now
        .with_timezone(&offset)
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single());

    match next {
        Some(next) => (next.with_timezone(&Utc) - now).to_std().unwrap_or(ONE_DAY),
        None => ONE_DAY,
    }
}

impl SyncEngine {
    /// Renames the service account every day at local midnight until
    /// `shutdown` fires. A failed rotation waits for the next day.
    pub async fn run_name_rotation(&self, utc_offset_hours: i32, shutdown: CancellationToken) {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or_else(|| {
            warn!("Invalid UTC offset {}h, rotating at UTC midnight", utc_offset_hours);
            Utc.fix()
        });

        loop {
            let wait = until_next_midnight(Utc::now(), offset);
            info!("Next display name rotation in {:?}", wait);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.rotate_name().await {
                error!("Display name rotation failed: {}", e);
            }
        }
    }

    pub async fn rotate_name(&self) -> Result<String, SyncError> {
        let name = random_display_name();
        self.api.rotate_display_name(&name).await?;
        info!("Rotated display name to {}", name);
        Ok(name)
    }
}
