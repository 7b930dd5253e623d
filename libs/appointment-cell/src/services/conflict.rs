// libs/appointment-cell/src/services/conflict.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{
    validate_time_order, Appointment, AppointmentError, ConflictCandidate, ConflictCheckResponse,
};
use crate::services::store::AppointmentStore;

/// Half-open overlap: `[a_start, a_end)` and `[b_start, b_end)` share an instant.
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

/// Read-only checks of a proposed booking against stored appointments and
/// the doctor's availability calendar.
pub struct ConflictDetectionService {
    store: Arc<dyn AppointmentStore>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    /// Fail with `ConflictDetected` or `DoctorNotAvailable` when the candidate
    /// cannot be booked.
    ///
    /// The overlap query only runs when both a doctor and a unit are set.
    /// The availability check runs whenever a doctor is set.
    pub async fn check_for_conflicts(&self, candidate: &ConflictCandidate) -> Result<(), AppointmentError> {
        debug!("Checking conflicts for doctor {:?} unit {:?} from {} to {}",
               candidate.doctor_id, candidate.unit_id, candidate.start_time, candidate.end_time);

        validate_time_order(candidate.start_time, candidate.end_time)?;

        if candidate.doctor_id.is_some() && candidate.unit_id.is_some() {
            let overlaps = self.store.check_conflict(
                candidate.doctor_id,
                candidate.unit_id,
                candidate.start_time,
                candidate.end_time,
                candidate.exclude_appointment_id,
            ).await?;

            if overlaps {
                warn!("Conflict detected for doctor {:?} unit {:?} at {}",
                      candidate.doctor_id, candidate.unit_id, candidate.start_time);
                return Err(AppointmentError::ConflictDetected);
            }
        }

        if let Some(doctor_id) = candidate.doctor_id {
            let available = self.store.is_available(doctor_id, candidate.start_time, candidate.end_time).await?;
            if !available {
                warn!("Doctor {} has no availability covering {} - {}",
                      doctor_id, candidate.start_time, candidate.end_time);
                return Err(AppointmentError::DoctorNotAvailable);
            }
        }

        Ok(())
    }

    /// Advisory overlap check, availability not considered.
    pub async fn has_conflict(&self, candidate: &ConflictCandidate) -> Result<bool, AppointmentError> {
        validate_time_order(candidate.start_time, candidate.end_time)?;

        if candidate.doctor_id.is_none() && candidate.unit_id.is_none() {
            return Ok(false);
        }

        self.store.check_conflict(
            candidate.doctor_id,
            candidate.unit_id,
            candidate.start_time,
            candidate.end_time,
            candidate.exclude_appointment_id,
        ).await
    }

    /// Active appointments overlapping the candidate for its doctor or unit.
    pub async fn find_conflicts(&self, candidate: &ConflictCandidate) -> Result<Vec<Appointment>, AppointmentError> {
        validate_time_order(candidate.start_time, candidate.end_time)?;

        if candidate.doctor_id.is_none() && candidate.unit_id.is_none() {
            return Ok(vec![]);
        }

        let appointments = self.store.get_conflicting_appointments(
            candidate.doctor_id,
            candidate.unit_id,
            candidate.start_time,
            candidate.end_time,
            candidate.exclude_appointment_id,
        ).await?;

        Ok(appointments
            .into_iter()
            .filter(|existing| {
                existing.is_active()
                    && intervals_overlap(existing.start_time, existing.end_time, candidate.start_time, candidate.end_time)
            })
            .collect())
    }

    pub async fn check_report(&self, candidate: &ConflictCandidate) -> Result<ConflictCheckResponse, AppointmentError> {
        let conflicting_appointments = self.find_conflicts(candidate).await?;

        let doctor_available = match candidate.doctor_id {
            Some(doctor_id) => self.store.is_available(doctor_id, candidate.start_time, candidate.end_time).await?,
            None => true,
        };

        Ok(ConflictCheckResponse {
            has_conflict: !conflicting_appointments.is_empty(),
            doctor_available,
            conflicting_appointments,
        })
    }
}
