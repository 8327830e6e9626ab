//! Weekly nudge for users who stopped showing up.
//!
//! The scan picks non-admin users inactive for two weeks who have not been
//! notified in the last week, sends notices in small concurrent batches with a
//! pause in between, and records who was notified.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use futures_util::future::join_all;
use log::{error, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::directory::{Directory, DirectoryError, InactiveUser};

pub const INACTIVITY_THRESHOLD_DAYS: i64 = 14;
pub const MIN_DAYS_BETWEEN_NOTIFICATIONS: i64 = 7;
pub const BATCH_SIZE: usize = 50;
pub const BATCH_PAUSE: std::time::Duration = std::time::Duration::from_secs(5);

/// Sunday, 02:00 UTC.
const RUN_HOUR_UTC: i64 = 2;

#[derive(Debug, Clone)]
pub struct InactivityPolicy {
    pub inactive_after: Duration,
    pub notify_every: Duration,
    pub batch_size: usize,
    pub batch_pause: std::time::Duration,
}

impl Default for InactivityPolicy {
    fn default() -> Self {
        Self {
            inactive_after: Duration::days(INACTIVITY_THRESHOLD_DAYS),
            notify_every: Duration::days(MIN_DAYS_BETWEEN_NOTIFICATIONS),
            batch_size: BATCH_SIZE,
            batch_pause: BATCH_PAUSE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactivityNotice {
    pub subject: String,
    pub days_inactive: i64,
}

impl InactivityNotice {
    pub fn for_user(user: &InactiveUser, now: DateTime<Utc>) -> Self {
        Self {
            subject: format!("{}, we miss you!", user.first_name),
            days_inactive: (now - user.last_active).num_days(),
        }
    }
}

#[derive(Debug, Error)]
#[error("delivery to {recipient} failed: {reason}")]
pub struct MailError {
    pub recipient: String,
    pub reason: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_notice(&self, user: &InactiveUser, notice: &InactivityNotice) -> Result<(), MailError>;
}

/// Writes notices to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_notice(&self, user: &InactiveUser, notice: &InactivityNotice) -> Result<(), MailError> {
        info!(
            "Inactivity notice to {} <{}>: \"{}\" ({} days inactive)",
            user.id, user.email, notice.subject, notice.days_inactive
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub found: usize,
    pub notified: usize,
    pub failed: usize,
}

pub struct InactivityJob {
    directory: Arc<dyn Directory>,
    mailer: Arc<dyn Mailer>,
    policy: InactivityPolicy,
}

impl InactivityJob {
    pub fn new(directory: Arc<dyn Directory>, mailer: Arc<dyn Mailer>, policy: InactivityPolicy) -> Self {
        Self {
            directory,
            mailer,
            policy,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport, DirectoryError> {
        let users = self
            .directory
            .find_inactive(now - self.policy.inactive_after, now - self.policy.notify_every)
            .await?;
        info!("Found {} inactive users to notify", users.len());

        let mut report = RunReport {
            found: users.len(),
            ..RunReport::default()
        };

        let batch_size = self.policy.batch_size.max(1);
        let batches: Vec<&[InactiveUser]> = users.chunks(batch_size).collect();
        for (i, batch) in batches.iter().enumerate() {
            let sent = self.send_batch(batch, now).await;
            report.failed += batch.len() - sent.len();

            if !sent.is_empty() {
                self.directory.mark_notified(&sent, now).await?;
                report.notified += sent.len();
            }

            if i + 1 < batches.len() && !self.policy.batch_pause.is_zero() {
                tokio::time::sleep(self.policy.batch_pause).await;
            }
        }
        Ok(report)
    }

    /// Sends one batch concurrently and returns the ids that were delivered.
    async fn send_batch(&self, batch: &[InactiveUser], now: DateTime<Utc>) -> Vec<String> {
        let sends = batch.iter().map(|user| async move {
            let notice = InactivityNotice::for_user(user, now);
            (user, self.mailer.send_notice(user, &notice).await)
        });

        join_all(sends)
            .await
            .into_iter()
            .filter_map(|(user, res)| match res {
                Ok(()) => Some(user.id.clone()),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            })
            .collect()
    }
}

/// Next Sunday 02:00 UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_to_sunday = (7 - now.weekday().num_days_from_sunday() as i64) % 7;
    let day = now.date_naive() + Duration::days(days_to_sunday);
    let at = day.and_time(NaiveTime::MIN + Duration::hours(RUN_HOUR_UTC));
    let candidate = Utc.from_utc_datetime(&at);
    if candidate <= now {
        candidate + Duration::days(7)
    } else {
        candidate
    }
}

/// Runs the job every Sunday at 02:00 UTC. A failed run is logged and the schedule continues.
pub fn spawn_weekly(job: Arc<InactivityJob>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = next_run_after(now);
            info!("Next inactivity run at {}", next);
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            match job.run_once(Utc::now()).await {
                Ok(report) => info!("Inactive user notifications completed: {:?}", report),
                Err(e) => error!("Error running inactive user notifications job: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryUser, MemoryDirectory, UserProfile};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<String>>,
        reject: Option<String>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send_notice(&self, user: &InactiveUser, _notice: &InactivityNotice) -> Result<(), MailError> {
            if self.reject.as_deref() == Some(user.id.as_str()) {
                return Err(MailError {
                    recipient: user.email.clone(),
                    reason: "mailbox full".into(),
                });
            }
            self.sent.lock().await.push(user.id.clone());
            Ok(())
        }
    }

    async fn directory_with(ids: &[&str], now: DateTime<Utc>) -> Arc<MemoryDirectory> {
        let dir = MemoryDirectory::new();
        for id in ids {
            dir.insert_user(DirectoryUser {
                profile: UserProfile {
                    id: id.to_string(),
                    first_name: id.to_string(),
                    last_name: "Test".into(),
                    avatar: None,
                },
                email: format!("{id}@example.com"),
                is_admin: false,
                last_active: now - Duration::days(20),
                last_notification_sent: None,
            })
            .await;
        }
        Arc::new(dir)
    }

    fn policy(batch_size: usize) -> InactivityPolicy {
        InactivityPolicy {
            batch_size,
            batch_pause: std::time::Duration::ZERO,
            ..InactivityPolicy::default()
        }
    }

    #[tokio::test]
    async fn notifies_in_batches_and_marks_delivered_users() {
        let now = Utc::now();
        let dir = directory_with(&["u1", "u2", "u3"], now).await;
        let mailer = Arc::new(RecordingMailer {
            reject: Some("u2".into()),
            ..RecordingMailer::default()
        });
        let job = InactivityJob::new(dir.clone(), mailer.clone(), policy(2));

        let report = job.run_once(now).await.unwrap();
        assert_eq!(
            report,
            RunReport {
                found: 3,
                notified: 2,
                failed: 1
            }
        );
        assert_eq!(mailer.sent.lock().await.len(), 2);
        assert_eq!(dir.user("u1").await.unwrap().last_notification_sent, Some(now));
        assert_eq!(dir.user("u2").await.unwrap().last_notification_sent, None);

        // Delivered users are not picked again within the week; the failed one is retried.
        let again = job.run_once(now + Duration::days(1)).await.unwrap();
        assert_eq!(again.found, 1);
        assert_eq!(again.failed, 1);
    }

    #[test]
    fn notice_counts_whole_days() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let user = InactiveUser {
            id: "u1".into(),
            email: "u1@example.com".into(),
            first_name: "Ann".into(),
            last_name: "Lee".into(),
            last_active: now - Duration::hours(15 * 24 + 5),
        };
        let notice = InactivityNotice::for_user(&user, now);
        assert_eq!(notice.subject, "Ann, we miss you!");
        assert_eq!(notice.days_inactive, 15);
    }

    #[test]
    fn next_run_is_the_coming_sunday_at_two() {
        // 2024-03-20 is a Wednesday.
        let wed = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        assert_eq!(next_run_after(wed), Utc.with_ymd_and_hms(2024, 3, 24, 2, 0, 0).unwrap());

        let sunday_early = Utc.with_ymd_and_hms(2024, 3, 24, 1, 0, 0).unwrap();
        assert_eq!(next_run_after(sunday_early), Utc.with_ymd_and_hms(2024, 3, 24, 2, 0, 0).unwrap());

        let sunday_on_time = Utc.with_ymd_and_hms(2024, 3, 24, 2, 0, 0).unwrap();
        assert_eq!(next_run_after(sunday_on_time), Utc.with_ymd_and_hms(2024, 3, 31, 2, 0, 0).unwrap());
    }
}
