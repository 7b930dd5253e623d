// libs/appointment-cell/src/models.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc, NaiveDate, NaiveDateTime};
use std::fmt;
use std::str::FromStr;

use shared_models::error::AppError;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

/// A booking of a patient with a doctor in a treatment unit.
///
/// Every association is optional: multi-step creation flows persist an
/// appointment before all parties are known, and `None` is the explicit
/// "unassigned" state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub service_code: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub moved_to_needs_rescheduling_at: Option<DateTime<Utc>>,
    pub rescheduled_to_appointment_id: Option<Uuid>,
    pub cancellation_reason: Option<String>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Set once the slot passed the conflict detector. The database only
    /// enforces non-overlap between rows carrying this flag.
    #[serde(default)]
    pub conflict_checked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field values for a brand-new appointment.
#[derive(Debug, Clone, Default)]
pub struct NewAppointment {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub service_code: Option<String>,
    pub notes: Option<String>,
}

impl Appointment {
    /// Build a `scheduled` appointment with a fresh identifier.
    pub fn new(
        fields: NewAppointment,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self, AppointmentError> {
        let appointment = Self {
            id: Uuid::new_v4(),
            patient_id: fields.patient_id,
            doctor_id: fields.doctor_id,
            unit_id: fields.unit_id,
            service_code: fields.service_code,
            start_time,
            end_time,
            status: AppointmentStatus::Scheduled,
            moved_to_needs_rescheduling_at: None,
            rescheduled_to_appointment_id: None,
            cancellation_reason: None,
            snoozed_until: None,
            notes: fields.notes,
            conflict_checked: false,
            created_at: now,
            updated_at: now,
        };

        appointment.validate()?;
        Ok(appointment)
    }

    pub fn validate(&self) -> Result<(), AppointmentError> {
        validate_time_order(self.start_time, self.end_time)
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes()
    }

    /// Only `scheduled` appointments hold their slot.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Queue membership at `now`: waiting for a new slot and not snoozed.
    pub fn is_visible_in_queue(&self, now: DateTime<Utc>) -> bool {
        self.status == AppointmentStatus::NeedsRescheduling
            && self.snoozed_until.map_or(true, |until| until < now)
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

pub fn validate_time_order(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), AppointmentError> {
    if end <= start {
        return Err(AppointmentError::InvalidTimeOrder);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    Rescheduled,
    #[serde(alias = "needs-rescheduling")]
    NeedsRescheduling,
    #[serde(alias = "no-show")]
    NoShow,
    #[serde(alias = "with-error")]
    WithError,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 8] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Confirmed,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Rescheduled,
        AppointmentStatus::NeedsRescheduling,
        AppointmentStatus::NoShow,
        AppointmentStatus::WithError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Rescheduled => "rescheduled",
            AppointmentStatus::NeedsRescheduling => "needs_rescheduling",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::WithError => "with_error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Scheduled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = AppointmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        AppointmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| AppointmentError::InvalidStatus(s.to_string()))
    }
}

/// Which creation flow a caller is running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreationPolicy {
    /// Organization-scoped intake: persist without looking for overlaps.
    /// The row is stored with `conflict_checked = false`, outside the
    /// database overlap constraint, so double bookings are surfaced later
    /// through the rescheduling queue.
    Unchecked,
    /// Scheduling flow: run the conflict detector under the booking gate.
    ConflictChecked,
}

impl FromStr for CreationPolicy {
    type Err = AppointmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unchecked" => Ok(CreationPolicy::Unchecked),
            "conflict_checked" | "checked" => Ok(CreationPolicy::ConflictChecked),
            other => Err(AppointmentError::ValidationError(format!(
                "Unknown creation policy: {}",
                other
            ))),
        }
    }
}

// ==============================================================================
// REFERENCE DATA (read-only to the scheduling core)
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Clinic {
    pub id: Uuid,
    pub name: String,
    pub organization_id: String,
    pub timezone: Option<String>,
}

impl Clinic {
    /// IANA zone for wall-clock conversion, `None` when times are already UTC.
    pub fn zone(&self) -> Option<&str> {
        self.timezone.as_deref().map(str::trim).filter(|tz| !tz.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreatmentUnit {
    pub id: Uuid,
    pub name: String,
    pub clinic_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoctorAvailability {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Stored verbatim, never expanded here.
    pub recurrence_rule: Option<String>,
    pub is_available: bool,
}

impl DoctorAvailability {
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.is_available && self.start_time <= start && self.end_time >= end
    }
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

/// Times are naive wall-clock values in the unit's clinic timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub service_code: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub notes: Option<String>,
    pub creation_policy: Option<CreationPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAppointmentRequest {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub service_code: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    /// Raw tag so unknown values surface as `InvalidStatus`.
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleAppointmentRequest {
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentSearchQuery {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSlotsQuery {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub slot_duration_minutes: Option<i64>,
    /// Zone whose calendar day `date` refers to; UTC when absent.
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSlotsResponse {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub slot_duration_minutes: i64,
    pub slots: Vec<DateTime<Utc>>,
    pub local_slots: Vec<NaiveDateTime>,
}

// ==============================================================================
// CONFLICT DETECTION MODELS
// ==============================================================================

/// A proposed (doctor, unit, time-range) booking.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCandidate {
    pub doctor_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// The appointment being moved, which never conflicts with itself.
    pub exclude_appointment_id: Option<Uuid>,
}

impl ConflictCandidate {
    pub fn for_appointment(appointment: &Appointment) -> Self {
        Self {
            doctor_id: appointment.doctor_id,
            unit_id: appointment.unit_id,
            start_time: appointment.start_time,
            end_time: appointment.end_time,
            exclude_appointment_id: Some(appointment.id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictCheckQuery {
    pub doctor_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub exclude_appointment_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictCheckResponse {
    pub has_conflict: bool,
    pub doctor_available: bool,
    pub conflicting_appointments: Vec<Appointment>,
}

// ==============================================================================
// RESCHEDULING QUEUE VIEW
// ==============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueSort {
    #[default]
    Oldest,
    Newest,
}

/// Persistence-level filter for the needs-rescheduling view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReschedulingQueueFilter {
    pub organization_id: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub search: Option<String>,
    pub sort: QueueSort,
    pub limit: i64,
    pub offset: i64,
}

/// Queue row with party names resolved for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppointmentWithDetails {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub patient_name: Option<String>,
    pub patient_phone: Option<String>,
    pub patient_email: Option<String>,
    pub doctor_name: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub clinic_name: Option<String>,
    pub unit_name: Option<String>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
pub enum AppointmentError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Appointment end time must be after its start time")]
    InvalidTimeOrder,

    #[error("Unrecognized appointment status: {0}")]
    InvalidStatus(String),

    #[error("Appointment conflicts with an existing booking")]
    ConflictDetected,

    #[error("Doctor not available at requested time")]
    DoctorNotAvailable,

    #[error("Appointment is not in the rescheduling queue")]
    NotInQueue,

    #[error("Appointment belongs to another organization")]
    OwnershipMismatch,

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Transition {event} is not allowed from status {from}")]
    InvalidStatusTransition { from: AppointmentStatus, event: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl AppointmentError {
    pub fn appointment_not_found() -> Self {
        AppointmentError::NotFound("Appointment".to_string())
    }
}

impl From<AppointmentError> for AppError {
    fn from(err: AppointmentError) -> Self {
        let message = err.to_string();
        match err {
            AppointmentError::NotFound(_) => AppError::NotFound(message),
            AppointmentError::ConflictDetected | AppointmentError::NotInQueue => AppError::Conflict(message),
            AppointmentError::DoctorNotAvailable => AppError::Unprocessable(message),
            AppointmentError::OwnershipMismatch => AppError::Forbidden(message),
            AppointmentError::InvalidTimeOrder
            | AppointmentError::InvalidStatus(_)
            | AppointmentError::InvalidTimezone(_)
            | AppointmentError::InvalidStatusTransition { .. } => AppError::BadRequest(message),
            AppointmentError::ValidationError(_) => AppError::ValidationError(message),
            AppointmentError::DatabaseError(_) => AppError::Database(message),
        }
    }
}
