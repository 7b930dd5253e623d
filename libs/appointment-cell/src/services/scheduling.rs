// libs/appointment-cell/src/services/scheduling.rs
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::{AppConfig, SchedulingSettings};
use shared_database::supabase::SupabaseClient;

use crate::models::{
    validate_time_order, Appointment, AppointmentError, AppointmentSearchQuery, AvailableSlotsQuery,
    AvailableSlotsResponse, Clinic, ConflictCandidate, ConflictCheckQuery, ConflictCheckResponse,
    CreateAppointmentRequest, CreationPolicy, NewAppointment, RescheduleAppointmentRequest,
    TreatmentUnit, UpdateAppointmentRequest,
};
use crate::services::clock::{Clock, SystemClock};
use crate::services::conflict::{intervals_overlap, ConflictDetectionService};
use crate::services::lifecycle::{AppointmentEvent, TransitionPolicy};
use crate::services::store::AppointmentStore;
use crate::services::supabase_store::SupabaseAppointmentStore;
use crate::services::timezone;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;
const MAX_SLOT_MINUTES: i64 = 24 * 60;

/// Serializes conflict-checked check+write sequences within the process.
#[derive(Debug, Default)]
pub struct BookingGate(Mutex<()>);

impl BookingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingRules {
    pub default_creation_policy: CreationPolicy,
    pub transition_policy: TransitionPolicy,
    pub default_slot_minutes: i64,
}

impl Default for SchedulingRules {
    fn default() -> Self {
        Self {
            default_creation_policy: CreationPolicy::ConflictChecked,
            transition_policy: TransitionPolicy::Permissive,
            default_slot_minutes: 30,
        }
    }
}

impl SchedulingRules {
    pub fn from_settings(settings: &SchedulingSettings) -> Self {
        let defaults = Self::default();

        let default_creation_policy = settings.creation_policy.parse().unwrap_or_else(|_| {
            warn!("Unknown creation policy '{}', using {:?}", settings.creation_policy, defaults.default_creation_policy);
            defaults.default_creation_policy
        });

        let default_slot_minutes = if settings.default_slot_minutes > 0 {
            settings.default_slot_minutes
        } else {
            warn!("Default slot length must be positive, using {}", defaults.default_slot_minutes);
            defaults.default_slot_minutes
        };

        Self {
            default_creation_policy,
            transition_policy: TransitionPolicy::from_strict_flag(settings.strict_transitions),
            default_slot_minutes,
        }
    }
}

/// Application state shared by the scheduling routers.
pub struct SchedulingState {
    pub config: Arc<AppConfig>,
    pub supabase: Arc<SupabaseClient>,
    pub gate: Arc<BookingGate>,
    pub clock: Arc<dyn Clock>,
    pub rules: SchedulingRules,
}

impl SchedulingState {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(&config)),
            gate: Arc::new(BookingGate::new()),
            clock: Arc::new(SystemClock),
            rules: SchedulingRules::from_settings(&config.scheduling),
            config,
        }
    }

    /// Service acting on behalf of the bearer of `auth_token`.
    pub fn service_for(&self, auth_token: &str) -> SchedulingService {
        let store = Arc::new(SupabaseAppointmentStore::new(Arc::clone(&self.supabase), auth_token));
        SchedulingService::new(store, Arc::clone(&self.clock), Arc::clone(&self.gate), self.rules)
    }
}

/// Appointment use cases: reference checks, timezone normalization,
/// conflict detection and persistence.
pub struct SchedulingService {
    store: Arc<dyn AppointmentStore>,
    conflicts: ConflictDetectionService,
    clock: Arc<dyn Clock>,
    gate: Arc<BookingGate>,
    rules: SchedulingRules,
}

impl SchedulingService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        clock: Arc<dyn Clock>,
        gate: Arc<BookingGate>,
        rules: SchedulingRules,
    ) -> Self {
        Self {
            conflicts: ConflictDetectionService::new(Arc::clone(&store)),
            store,
            clock,
            gate,
            rules,
        }
    }

    pub fn store(&self) -> &Arc<dyn AppointmentStore> {
        &self.store
    }

    pub fn conflicts(&self) -> &ConflictDetectionService {
        &self.conflicts
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn rules(&self) -> &SchedulingRules {
        &self.rules
    }

    // ==========================================================================
    // CREATE / UPDATE / RESCHEDULE
    // ==========================================================================

    pub async fn create_appointment(
        &self,
        request: CreateAppointmentRequest,
        policy: CreationPolicy,
    ) -> Result<Appointment, AppointmentError> {
        debug!("Creating appointment for patient {:?} with doctor {:?} in unit {:?} ({:?})",
               request.patient_id, request.doctor_id, request.unit_id, policy);

        if let Some(patient_id) = request.patient_id {
            self.ensure_patient(patient_id).await?;
        }
        if let Some(doctor_id) = request.doctor_id {
            self.ensure_doctor(doctor_id).await?;
        }

        let clinic = match request.unit_id {
            Some(unit_id) => Some(self.resolve_unit(unit_id).await?.1),
            None => None,
        };

        let (start_time, end_time) = self.normalize_window(
            request.start_time,
            request.end_time,
            clinic.as_ref().and_then(Clinic::zone),
        )?;

        let appointment = Appointment::new(
            NewAppointment {
                patient_id: request.patient_id,
                doctor_id: request.doctor_id,
                unit_id: request.unit_id,
                service_code: request.service_code,
                notes: request.notes,
            },
            start_time,
            end_time,
            self.clock.now(),
        )?;

        let created = match policy {
            CreationPolicy::Unchecked => self.store.create(&appointment).await?,
            CreationPolicy::ConflictChecked => self.persist_checked(&appointment).await?,
        };

        if let Some(patient_id) = created.patient_id {
            self.run_patient_side_steps(patient_id, &created, clinic.as_ref()).await;
        }

        info!("Appointment {} created for {} - {}", created.id, created.start_time, created.end_time);
        Ok(created)
    }

    /// Insert `appointment` after a conflict check, both under the booking gate.
    pub async fn persist_checked(&self, appointment: &Appointment) -> Result<Appointment, AppointmentError> {
        let _guard = self.gate.lock().await;

        self.conflicts
            .check_for_conflicts(&ConflictCandidate::for_appointment(appointment))
            .await?;

        let mut checked = appointment.clone();
        checked.conflict_checked = true;
        self.store.create(&checked).await
    }

    pub async fn update_appointment(
        &self,
        appointment_id: Uuid,
        request: UpdateAppointmentRequest,
    ) -> Result<Appointment, AppointmentError> {
        debug!("Updating appointment {}", appointment_id);

        let mut appointment = self.get_appointment(appointment_id).await?;
        let now = self.clock.now();

        if let Some(patient_id) = request.patient_id.filter(|id| Some(*id) != appointment.patient_id) {
            self.ensure_patient(patient_id).await?;
            appointment.patient_id = Some(patient_id);
        }
        if let Some(doctor_id) = request.doctor_id.filter(|id| Some(*id) != appointment.doctor_id) {
            self.ensure_doctor(doctor_id).await?;
            appointment.doctor_id = Some(doctor_id);
        }
        if let Some(unit_id) = request.unit_id.filter(|id| Some(*id) != appointment.unit_id) {
            if !self.store.exists_unit(unit_id).await? {
                return Err(AppointmentError::NotFound("Treatment unit".to_string()));
            }
            appointment.unit_id = Some(unit_id);
        }

        let mut time_changed = false;
        if request.start_time.is_some() || request.end_time.is_some() {
            let zone = self.zone_for_unit(appointment.unit_id).await?;
            let zone = zone.as_deref();

            let local_start = match request.start_time {
                Some(start) => start,
                None => timezone::to_display(appointment.start_time, zone)?,
            };
            let local_end = match request.end_time {
                Some(end) => end,
                None => timezone::to_display(appointment.end_time, zone)?,
            };

            let (start_time, end_time) = self.normalize_window(local_start, local_end, zone)?;
            time_changed = start_time != appointment.start_time || end_time != appointment.end_time;
            appointment.start_time = start_time;
            appointment.end_time = end_time;
        }

        if let Some(service_code) = request.service_code {
            appointment.service_code = Some(service_code);
        }
        if let Some(notes) = request.notes {
            appointment.notes = Some(notes);
        }

        match request.status.as_deref() {
            Some(tag) => {
                let status = tag.parse()?;
                appointment.apply(AppointmentEvent::toward(status), self.rules.transition_policy, now)?;
            }
            None if time_changed => {
                appointment.reschedule(self.rules.transition_policy, now)?;
            }
            None => {}
        }

        appointment.validate()?;
        appointment.touch(now);

        let updated = self.store.update(&appointment).await?;
        info!("Appointment {} updated (status {})", updated.id, updated.status);
        Ok(updated)
    }

    /// Move an appointment in time, keeping its status.
    pub async fn reschedule_appointment(
        &self,
        appointment_id: Uuid,
        request: RescheduleAppointmentRequest,
    ) -> Result<Appointment, AppointmentError> {
        debug!("Rescheduling appointment {} to {} - {}", appointment_id, request.start_time, request.end_time);

        let mut appointment = self.get_appointment(appointment_id).await?;
        let zone = self.zone_for_unit(appointment.unit_id).await?;
        let (start_time, end_time) = self.normalize_window(request.start_time, request.end_time, zone.as_deref())?;

        appointment.start_time = start_time;
        appointment.end_time = end_time;

        let _guard = self.gate.lock().await;
        self.conflicts
            .check_for_conflicts(&ConflictCandidate::for_appointment(&appointment))
            .await?;

        appointment.conflict_checked = true;
        appointment.touch(self.clock.now());
        let updated = self.store.update(&appointment).await?;

        info!("Appointment {} rescheduled to {} - {}", updated.id, updated.start_time, updated.end_time);
        Ok(updated)
    }

    // ==========================================================================
    // LIFECYCLE SHORTCUTS
    // ==========================================================================

    pub async fn cancel_appointment(
        &self,
        appointment_id: Uuid,
        reason: Option<String>,
    ) -> Result<Appointment, AppointmentError> {
        let mut appointment = self.get_appointment(appointment_id).await?;
        let now = self.clock.now();

        match reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => appointment.cancel_with_reason(reason, self.rules.transition_policy, now)?,
            None => appointment.cancel(self.rules.transition_policy, now)?,
        }

        let cancelled = self.store.update(&appointment).await?;
        info!("Appointment {} cancelled", cancelled.id);
        Ok(cancelled)
    }

    pub async fn complete_appointment(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        let mut appointment = self.get_appointment(appointment_id).await?;
        appointment.complete(self.rules.transition_policy, self.clock.now())?;

        let completed = self.store.update(&appointment).await?;
        info!("Appointment {} completed", completed.id);
        Ok(completed)
    }

    pub async fn mark_needs_rescheduling(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        let mut appointment = self.get_appointment(appointment_id).await?;
        appointment.move_to_needs_rescheduling(self.rules.transition_policy, self.clock.now())?;

        let queued = self.store.update(&appointment).await?;
        info!("Appointment {} moved to the rescheduling queue", queued.id);
        Ok(queued)
    }

    pub async fn delete_appointment(&self, appointment_id: Uuid) -> Result<(), AppointmentError> {
        self.store.delete(appointment_id).await?;
        info!("Appointment {} deleted", appointment_id);
        Ok(())
    }

    // ==========================================================================
    // QUERIES
    // ==========================================================================

    pub async fn get_appointment(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store
            .get_by_id(appointment_id)
            .await?
            .ok_or_else(AppointmentError::appointment_not_found)
    }

    pub async fn list_appointments(&self, mut query: AppointmentSearchQuery) -> Result<Vec<Appointment>, AppointmentError> {
        query.limit = Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT));
        query.offset = Some(query.offset.unwrap_or(0).max(0));
        self.store.list(&query).await
    }

    /// Free slots of `slot_duration_minutes` for the doctor on a local calendar day.
    pub async fn get_available_slots(&self, query: AvailableSlotsQuery) -> Result<AvailableSlotsResponse, AppointmentError> {
        let slot_minutes = query.slot_duration_minutes.unwrap_or(self.rules.default_slot_minutes);
        let step = Some(slot_minutes)
            .filter(|minutes| (1..=MAX_SLOT_MINUTES).contains(minutes))
            .and_then(Duration::try_minutes)
            .ok_or_else(|| AppointmentError::ValidationError(format!(
                "Slot duration must be between 1 and {} minutes",
                MAX_SLOT_MINUTES
            )))?;

        self.ensure_doctor(query.doctor_id).await?;

        let zone = query.timezone.as_deref();
        let (day_start, day_end) = timezone::local_day_bounds(query.date, zone)?;

        let windows = self.store.list_availability(query.doctor_id, day_start, day_end).await?;
        let booked: Vec<Appointment> = self.store
            .get_conflicting_appointments(Some(query.doctor_id), None, day_start, day_end, None)
            .await?
            .into_iter()
            .filter(Appointment::is_active)
            .collect();

        let mut slots = BTreeSet::new();

        for window in windows.iter().filter(|w| w.is_available) {
            let window_end = window.end_time.min(day_end);
            let mut slot_start = window.start_time.max(day_start);

            while let Some(slot_end) = slot_start
                .checked_add_signed(step)
                .filter(|end| *end <= window_end)
            {
                let taken = booked
                    .iter()
                    .any(|a| intervals_overlap(a.start_time, a.end_time, slot_start, slot_end));
                if !taken {
                    slots.insert(slot_start);
                }
                slot_start = slot_end;
            }
        }

        let slots: Vec<DateTime<Utc>> = slots.into_iter().collect();
        let local_slots = slots
            .iter()
            .map(|slot| timezone::to_display(*slot, zone))
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Doctor {} has {} free slots on {}", query.doctor_id, slots.len(), query.date);

        Ok(AvailableSlotsResponse {
            doctor_id: query.doctor_id,
            date: query.date,
            slot_duration_minutes: slot_minutes,
            slots,
            local_slots,
        })
    }

    pub async fn check_conflicts(&self, query: ConflictCheckQuery) -> Result<ConflictCheckResponse, AppointmentError> {
        let zone = self.zone_for_unit(query.unit_id).await?;
        let (start_time, end_time) = self.normalize_window(query.start_time, query.end_time, zone.as_deref())?;

        self.conflicts
            .check_report(&ConflictCandidate {
                doctor_id: query.doctor_id,
                unit_id: query.unit_id,
                start_time,
                end_time,
                exclude_appointment_id: query.exclude_appointment_id,
            })
            .await
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    pub async fn resolve_unit(&self, unit_id: Uuid) -> Result<(TreatmentUnit, Clinic), AppointmentError> {
        self.store
            .get_unit_with_clinic(unit_id)
            .await?
            .ok_or_else(|| AppointmentError::NotFound("Treatment unit".to_string()))
    }

    /// Convert a naive wall-clock window to absolute instants and check its order.
    pub fn normalize_window(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        zone: Option<&str>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), AppointmentError> {
        let start_time = timezone::to_absolute(start, zone)?;
        let end_time = timezone::to_absolute(end, zone)?;
        validate_time_order(start_time, end_time)?;
        Ok((start_time, end_time))
    }

    async fn zone_for_unit(&self, unit_id: Option<Uuid>) -> Result<Option<String>, AppointmentError> {
        match unit_id {
            Some(unit_id) => {
                let (_, clinic) = self.resolve_unit(unit_id).await?;
                Ok(clinic.zone().map(str::to_string))
            }
            None => Ok(None),
        }
    }

    async fn ensure_patient(&self, patient_id: Uuid) -> Result<(), AppointmentError> {
        if !self.store.exists_patient(patient_id).await? {
            return Err(AppointmentError::NotFound("Patient".to_string()));
        }
        Ok(())
    }

    async fn ensure_doctor(&self, doctor_id: Uuid) -> Result<(), AppointmentError> {
        if !self.store.exists_doctor(doctor_id).await? {
            return Err(AppointmentError::NotFound("Doctor".to_string()));
        }
        Ok(())
    }

    /// Organization link and first-appointment marker. Failures never fail the booking.
    async fn run_patient_side_steps(&self, patient_id: Uuid, appointment: &Appointment, clinic: Option<&Clinic>) {
        if let Some(clinic) = clinic {
            if let Err(e) = self.store.link_patient_to_organization(patient_id, &clinic.organization_id).await {
                warn!("Failed to link patient {} to organization {}: {}", patient_id, clinic.organization_id, e);
            }
        }

        if let Err(e) = self.store.mark_first_appointment(patient_id, appointment.id, appointment.start_time).await {
            warn!("Failed to mark first appointment for patient {}: {}", patient_id, e);
        }
    }
}
