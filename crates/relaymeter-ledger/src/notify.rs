//! Low-balance reminders
//!
//! A reminder is raised when a reservation moves a user balance below the
//! configured threshold or down to zero. Delivery runs on the background
//! task pool and never affects the reservation.

use async_trait::async_trait;
use relaymeter_core::{Quota, UserId};

use crate::error::NotifyError;

/// Why a reminder was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReminder {
    /// Balance crossed the reminder threshold
    Low,
    /// Balance reached zero
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaNotice {
    pub user_id: UserId,
    pub balance_before: Quota,
    pub balance_after: Quota,
    pub reminder: QuotaReminder,
}

impl QuotaNotice {
    /// Reminder for a reservation of `amount` against `balance_before`, if any
    pub fn check(user_id: UserId, balance_before: Quota, amount: Quota, threshold: Quota) -> Option<Self> {
        let balance_after = balance_before - amount;
        let reminder = if balance_after <= 0 {
            QuotaReminder::Exhausted
        } else if balance_before >= threshold && balance_after < threshold {
            QuotaReminder::Low
        } else {
            return None;
        };

        Some(Self {
            user_id,
            balance_before,
            balance_after,
            reminder,
        })
    }
}

/// Delivery channel for low-balance reminders
#[async_trait]
pub trait QuotaNotifier: Send + Sync {
    async fn notify(&self, notice: QuotaNotice) -> Result<(), NotifyError>;
}

/// Notifier that only writes a structured warning
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl QuotaNotifier for LogNotifier {
    async fn notify(&self, notice: QuotaNotice) -> Result<(), NotifyError> {
        match notice.reminder {
            QuotaReminder::Exhausted => tracing::warn!(
                user_id = %notice.user_id,
                balance = notice.balance_after,
                "user quota has been exhausted"
            ),
            QuotaReminder::Low => tracing::warn!(
                user_id = %notice.user_id,
                balance = notice.balance_after,
                "user quota is about to be exhausted"
            ),
        }
        Ok(())
    }
}
