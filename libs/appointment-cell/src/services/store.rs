// libs/appointment-cell/src/services/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentError, AppointmentSearchQuery, AppointmentWithDetails, Clinic,
    DoctorAvailability, ReschedulingQueueFilter, TreatmentUnit,
};

/// Persistence seam for the scheduling core.
///
/// Implementations report missing rows as `Ok(None)` / `Ok(false)` and
/// reserve `Err` for storage failures. An exclusion-constraint rejection on
/// `create`/`update` is reported as `ConflictDetected`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn exists_patient(&self, patient_id: Uuid) -> Result<bool, AppointmentError>;
    async fn exists_doctor(&self, doctor_id: Uuid) -> Result<bool, AppointmentError>;
    async fn exists_unit(&self, unit_id: Uuid) -> Result<bool, AppointmentError>;

    /// The unit together with its parent clinic.
    async fn get_unit_with_clinic(&self, unit_id: Uuid) -> Result<Option<(TreatmentUnit, Clinic)>, AppointmentError>;

    /// Whether an active appointment for the doctor or the unit overlaps `[start, end)`.
    async fn check_conflict(
        &self,
        doctor_id: Option<Uuid>,
        unit_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<Uuid>,
    ) -> Result<bool, AppointmentError>;

    async fn get_conflicting_appointments(
        &self,
        doctor_id: Option<Uuid>,
        unit_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<Uuid>,
    ) -> Result<Vec<Appointment>, AppointmentError>;

    /// Whether an available window of the doctor fully covers `[start, end)`.
    async fn is_available(&self, doctor_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool, AppointmentError>;

    /// Available windows of the doctor intersecting `[from, to)`.
    async fn list_availability(
        &self,
        doctor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DoctorAvailability>, AppointmentError>;

    async fn create(&self, appointment: &Appointment) -> Result<Appointment, AppointmentError>;
    async fn update(&self, appointment: &Appointment) -> Result<Appointment, AppointmentError>;
    async fn delete(&self, appointment_id: Uuid) -> Result<(), AppointmentError>;
    async fn get_by_id(&self, appointment_id: Uuid) -> Result<Option<Appointment>, AppointmentError>;
    async fn list(&self, query: &AppointmentSearchQuery) -> Result<Vec<Appointment>, AppointmentError>;

    async fn cancel_with_reason(
        &self,
        appointment_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError>;

    async fn snooze_appointment(
        &self,
        appointment_id: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError>;

    /// Page of the needs-rescheduling view plus the total match count.
    async fn get_rescheduling_queue(
        &self,
        filter: &ReschedulingQueueFilter,
        now: DateTime<Utc>,
    ) -> Result<(Vec<AppointmentWithDetails>, i64), AppointmentError>;

    async fn link_patient_to_organization(&self, patient_id: Uuid, organization_id: &str) -> Result<(), AppointmentError>;

    /// Record `appointment_id` as the patient's first appointment unless one is set.
    async fn mark_first_appointment(
        &self,
        patient_id: Uuid,
        appointment_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppointmentError>;
}
