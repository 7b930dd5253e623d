use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use appointment_cell::models::{
    Appointment, AppointmentError, AppointmentStatus, Clinic, NewAppointment, ReschedulingQueueFilter,
};
use appointment_cell::services::timezone;
use appointment_cell::SchedulingService;

use crate::error::QueueError;
use crate::models::{
    days_in_queue, CancelFromQueueRequest, QueueEntry, RescheduleFromQueueRequest,
    RescheduleFromQueueResponse, ReschedulingQueuePage, ReschedulingQueueQuery, SnoozeRequest,
};

/// Workflow over appointments whose slot was invalidated.
///
/// Every operation is scoped to the caller's organization, resolved through
/// the appointment's unit and clinic.
pub struct ReschedulingQueueService {
    scheduling: Arc<SchedulingService>,
}

impl ReschedulingQueueService {
    pub fn new(scheduling: Arc<SchedulingService>) -> Self {
        Self { scheduling }
    }

    pub async fn list_queue(
        &self,
        organization_id: &str,
        query: ReschedulingQueueQuery,
    ) -> Result<ReschedulingQueuePage, QueueError> {
        let page = query.page()?;
        let limit = query.limit()?;
        let offset = (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| QueueError::InvalidPagination(format!("page {} is out of range", page)))?;
        debug!("Listing rescheduling queue for organization {} (page {}, limit {})", organization_id, page, limit);

        let filter = ReschedulingQueueFilter {
            organization_id: Some(organization_id.to_string()),
            clinic_id: query.clinic_id,
            doctor_id: query.doctor_id,
            search: query.search,
            sort: query.sort.unwrap_or_default(),
            limit,
            offset,
        };

        let now = self.scheduling.clock().now();
        let (rows, total) = self.scheduling.store().get_rescheduling_queue(&filter, now).await?;

        let items = rows
            .into_iter()
            .map(|details| QueueEntry {
                days_in_queue: days_in_queue(details.appointment.moved_to_needs_rescheduling_at, now),
                details,
            })
            .collect();

        Ok(ReschedulingQueuePage {
            items,
            total,
            page,
            limit,
            total_pages: (total + limit - 1) / limit,
        })
    }

    pub async fn cancel_from_queue(
        &self,
        appointment_id: Uuid,
        organization_id: &str,
        request: CancelFromQueueRequest,
    ) -> Result<Appointment, QueueError> {
        if request.reason_code.trim().is_empty() {
            return Err(AppointmentError::ValidationError("reason_code is required".to_string()).into());
        }

        self.queued_appointment(appointment_id, organization_id).await?;

        let reason = request.stored_reason();
        let now = self.scheduling.clock().now();
        let cancelled = self.scheduling.store().cancel_with_reason(appointment_id, &reason, now).await?;

        info!("Appointment {} cancelled from the rescheduling queue ({})", appointment_id, reason);
        Ok(cancelled)
    }

    /// Book a replacement slot and link the original forward to it.
    ///
    /// The insert and the link are separate writes. When the link fails the
    /// replacement stays booked and the original stays queued.
    pub async fn reschedule_from_queue(
        &self,
        appointment_id: Uuid,
        organization_id: &str,
        request: RescheduleFromQueueRequest,
    ) -> Result<RescheduleFromQueueResponse, QueueError> {
        let (mut original, _) = self.queued_appointment(appointment_id, organization_id).await?;

        let (new_unit, new_clinic) = self.scheduling.resolve_unit(request.new_unit_id).await?;
        if new_clinic.organization_id != organization_id {
            warn!("Unit {} does not belong to organization {}", new_unit.id, organization_id);
            return Err(AppointmentError::OwnershipMismatch.into());
        }

        if let Some(doctor_id) = request.new_doctor_id {
            if !self.scheduling.store().exists_doctor(doctor_id).await? {
                return Err(AppointmentError::NotFound("Doctor".to_string()).into());
            }
        }

        let (start_time, end_time) = self.scheduling.normalize_window(
            request.new_start_time,
            request.new_end_time,
            new_clinic.zone(),
        )?;

        let now = self.scheduling.clock().now();
        let replacement = Appointment::new(
            NewAppointment {
                patient_id: original.patient_id,
                doctor_id: request.new_doctor_id.or(original.doctor_id),
                unit_id: Some(new_unit.id),
                service_code: request.new_service_code.or_else(|| original.service_code.clone()),
                notes: request.notes.or_else(|| original.notes.clone()),
            },
            start_time,
            end_time,
            now,
        )?;

        let replacement = self.scheduling.persist_checked(&replacement).await?;

        original.link_to_rescheduled_appointment(replacement.id, self.scheduling.rules().transition_policy, now)?;
        let original = match self.scheduling.store().update(&original).await {
            Ok(linked) => linked,
            Err(e) => {
                error!("Replacement appointment {} was booked but original {} could not be linked: {}",
                       replacement.id, original.id, e);
                return Err(e.into());
            }
        };

        info!("Appointment {} rescheduled from the queue to {}", original.id, replacement.id);
        Ok(RescheduleFromQueueResponse { original, replacement })
    }

    pub async fn snooze(
        &self,
        appointment_id: Uuid,
        organization_id: &str,
        request: SnoozeRequest,
    ) -> Result<Appointment, QueueError> {
        let (_, clinic) = self.queued_appointment(appointment_id, organization_id).await?;

        let until = timezone::to_absolute(request.until, clinic.zone())?;
        let now = self.scheduling.clock().now();
        if until <= now {
            return Err(AppointmentError::ValidationError("Snooze time must be in the future".to_string()).into());
        }

        let snoozed = self.scheduling.store().snooze_appointment(appointment_id, until, now).await?;
        info!("Appointment {} snoozed until {}", appointment_id, until);
        Ok(snoozed)
    }

    /// Load a queued appointment owned by `organization_id`, with its clinic.
    async fn queued_appointment(
        &self,
        appointment_id: Uuid,
        organization_id: &str,
    ) -> Result<(Appointment, Clinic), QueueError> {
        let appointment = self.scheduling.get_appointment(appointment_id).await?;

        let clinic = match appointment.unit_id {
            Some(unit_id) => self.scheduling.store().get_unit_with_clinic(unit_id).await?.map(|(_, clinic)| clinic),
            None => None,
        };
        let clinic = match clinic {
            Some(clinic) if clinic.organization_id == organization_id => clinic,
            _ => {
                warn!("Appointment {} is not owned by organization {}", appointment_id, organization_id);
                return Err(AppointmentError::OwnershipMismatch.into());
            }
        };

        if appointment.status != AppointmentStatus::NeedsRescheduling {
            warn!("Appointment {} is {} and not in the rescheduling queue", appointment_id, appointment.status);
            return Err(AppointmentError::NotInQueue.into());
        }

        Ok((appointment, clinic))
    }
}
