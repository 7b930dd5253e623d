use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use appointment_cell::models::{Appointment, AppointmentWithDetails, QueueSort};

use crate::error::QueueError;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReschedulingQueueQuery {
    pub clinic_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    /// Case-insensitive match on patient name, phone or email.
    pub search: Option<String>,
    pub sort: Option<QueueSort>,
    /// 1-based.
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl ReschedulingQueueQuery {
    pub fn page(&self) -> Result<i64, QueueError> {
        match self.page {
            None => Ok(1),
            Some(page) if page >= 1 => Ok(page),
            Some(page) => Err(QueueError::InvalidPagination(format!("page must be at least 1, got {}", page))),
        }
    }

    /// Requested page size, capped at `MAX_PAGE_SIZE`.
    pub fn limit(&self) -> Result<i64, QueueError> {
        match self.limit {
            None => Ok(DEFAULT_PAGE_SIZE),
            Some(limit) if limit >= 1 => Ok(limit.min(MAX_PAGE_SIZE)),
            Some(limit) => Err(QueueError::InvalidPagination(format!("limit must be at least 1, got {}", limit))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub details: AppointmentWithDetails,
    pub days_in_queue: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReschedulingQueuePage {
    pub items: Vec<QueueEntry>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelFromQueueRequest {
    pub reason_code: String,
    pub notes: Option<String>,
}

impl CancelFromQueueRequest {
    /// `"{code}: {notes}"`, or the bare code when there are no notes.
    pub fn stored_reason(&self) -> String {
        let code = self.reason_code.trim();
        match self.notes.as_deref().map(str::trim).filter(|notes| !notes.is_empty()) {
            Some(notes) => format!("{}: {}", code, notes),
            None => code.to_string(),
        }
    }
}

/// Naive times are wall-clock values in the new unit's clinic timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleFromQueueRequest {
    pub new_doctor_id: Option<Uuid>,
    pub new_unit_id: Uuid,
    pub new_service_code: Option<String>,
    pub new_start_time: NaiveDateTime,
    pub new_end_time: NaiveDateTime,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleFromQueueResponse {
    pub original: Appointment,
    pub replacement: Appointment,
}

/// `until` is a wall-clock value in the appointment's clinic timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoozeRequest {
    pub until: NaiveDateTime,
}

/// Whole days spent in the queue, never negative.
pub fn days_in_queue(moved_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    moved_at.map_or(0, |moved_at| (now - moved_at).num_days().max(0))
}
