// libs/appointment-cell/src/testing.rs
//! In-memory store and clock for driving the services in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentError, AppointmentSearchQuery, AppointmentStatus, AppointmentWithDetails,
    Clinic, DoctorAvailability, QueueSort, ReschedulingQueueFilter, TreatmentUnit,
};
use crate::services::clock::Clock;
use crate::services::conflict::intervals_overlap;
use crate::services::scheduling::{BookingGate, SchedulingRules, SchedulingService};
use crate::services::store::AppointmentStore;

#[derive(Debug, Clone)]
struct PatientRecord {
    name: String,
    phone: Option<String>,
    email: Option<String>,
}

#[derive(Default)]
struct StoreData {
    patients: HashMap<Uuid, PatientRecord>,
    doctors: HashMap<Uuid, String>,
    clinics: HashMap<Uuid, Clinic>,
    units: HashMap<Uuid, TreatmentUnit>,
    availability: Vec<DoctorAvailability>,
    appointments: HashMap<Uuid, Appointment>,
    organization_links: HashSet<(Uuid, String)>,
    first_appointments: HashMap<Uuid, Uuid>,
}

/// `AppointmentStore` held in process memory.
///
/// Overlap reads and inserts yield to the runtime so concurrent tasks
/// interleave between the check and the write.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    data: Mutex<StoreData>,
    fail_updates: AtomicBool,
    fail_side_steps: AtomicBool,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_patient(&self, name: &str, phone: Option<&str>, email: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        self.data().patients.insert(id, PatientRecord {
            name: name.to_string(),
            phone: phone.map(str::to_string),
            email: email.map(str::to_string),
        });
        id
    }

    pub fn add_doctor(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.data().doctors.insert(id, name.to_string());
        id
    }

    pub fn add_clinic(&self, organization_id: &str, timezone: Option<&str>) -> Clinic {
        let clinic = Clinic {
            id: Uuid::new_v4(),
            name: format!("Clinic {}", organization_id),
            organization_id: organization_id.to_string(),
            timezone: timezone.map(str::to_string),
        };
        self.data().clinics.insert(clinic.id, clinic.clone());
        clinic
    }

    pub fn add_unit(&self, clinic: &Clinic) -> Uuid {
        let unit = TreatmentUnit {
            id: Uuid::new_v4(),
            name: "Room".to_string(),
            clinic_id: clinic.id,
        };
        let id = unit.id;
        self.data().units.insert(id, unit);
        id
    }

    pub fn add_availability(&self, doctor_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.data().availability.push(DoctorAvailability {
            id: Uuid::new_v4(),
            doctor_id,
            start_time: start,
            end_time: end,
            recurrence_rule: None,
            is_available: true,
        });
    }

    pub fn insert_appointment(&self, appointment: Appointment) {
        self.data().appointments.insert(appointment.id, appointment);
    }

    pub fn appointment(&self, appointment_id: Uuid) -> Option<Appointment> {
        self.data().appointments.get(&appointment_id).cloned()
    }

    pub fn appointments(&self) -> Vec<Appointment> {
        self.data().appointments.values().cloned().collect()
    }

    pub fn is_linked(&self, patient_id: Uuid, organization_id: &str) -> bool {
        self.data().organization_links.contains(&(patient_id, organization_id.to_string()))
    }

    pub fn first_appointment(&self, patient_id: Uuid) -> Option<Uuid> {
        self.data().first_appointments.get(&patient_id).copied()
    }

    /// Make every `update` fail with a database error.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Make the organization link and first-appointment marker fail.
    pub fn set_fail_side_steps(&self, fail: bool) {
        self.fail_side_steps.store(fail, Ordering::SeqCst);
    }

    fn overlapping(
        &self,
        doctor_id: Option<Uuid>,
        unit_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<Uuid>,
    ) -> Vec<Appointment> {
        if doctor_id.is_none() && unit_id.is_none() {
            return vec![];
        }

        let mut rows: Vec<Appointment> = self.data()
            .appointments
            .values()
            .filter(|a| a.is_active())
            .filter(|a| Some(a.id) != exclude_id)
            .filter(|a| {
                (doctor_id.is_some() && a.doctor_id == doctor_id) || (unit_id.is_some() && a.unit_id == unit_id)
            })
            .filter(|a| intervals_overlap(a.start_time, a.end_time, start, end))
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.start_time);
        rows
    }

    fn side_step_guard(&self) -> Result<(), AppointmentError> {
        if self.fail_side_steps.load(Ordering::SeqCst) {
            return Err(AppointmentError::DatabaseError("side step unavailable".to_string()));
        }
        Ok(())
    }

    fn details(&self, appointment: &Appointment) -> AppointmentWithDetails {
        let data = self.data();
        let patient = appointment.patient_id.and_then(|id| data.patients.get(&id));
        let unit = appointment.unit_id.and_then(|id| data.units.get(&id));
        let clinic = unit.and_then(|u| data.clinics.get(&u.clinic_id));

        AppointmentWithDetails {
            appointment: appointment.clone(),
            patient_name: patient.map(|p| p.name.clone()),
            patient_phone: patient.and_then(|p| p.phone.clone()),
            patient_email: patient.and_then(|p| p.email.clone()),
            doctor_name: appointment.doctor_id.and_then(|id| data.doctors.get(&id).cloned()),
            clinic_id: clinic.map(|c| c.id),
            clinic_name: clinic.map(|c| c.name.clone()),
            unit_name: unit.map(|u| u.name.clone()),
        }
    }
}

fn matches_search(details: &AppointmentWithDetails, term: &str) -> bool {
    let term = term.to_lowercase();
    [&details.patient_name, &details.patient_phone, &details.patient_email]
        .into_iter()
        .flatten()
        .any(|value| value.to_lowercase().contains(&term))
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn exists_patient(&self, patient_id: Uuid) -> Result<bool, AppointmentError> {
        Ok(self.data().patients.contains_key(&patient_id))
    }

    async fn exists_doctor(&self, doctor_id: Uuid) -> Result<bool, AppointmentError> {
        Ok(self.data().doctors.contains_key(&doctor_id))
    }

    async fn exists_unit(&self, unit_id: Uuid) -> Result<bool, AppointmentError> {
        Ok(self.data().units.contains_key(&unit_id))
    }

    async fn get_unit_with_clinic(&self, unit_id: Uuid) -> Result<Option<(TreatmentUnit, Clinic)>, AppointmentError> {
        let data = self.data();
        Ok(data.units.get(&unit_id).and_then(|unit| {
            data.clinics.get(&unit.clinic_id).map(|clinic| (unit.clone(), clinic.clone()))
        }))
    }

    async fn check_conflict(
        &self,
        doctor_id: Option<Uuid>,
        unit_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<Uuid>,
    ) -> Result<bool, AppointmentError> {
        let found = !self.overlapping(doctor_id, unit_id, start, end, exclude_id).is_empty();
        tokio::task::yield_now().await;
        Ok(found)
    }

    async fn get_conflicting_appointments(
        &self,
        doctor_id: Option<Uuid>,
        unit_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<Uuid>,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        Ok(self.overlapping(doctor_id, unit_id, start, end, exclude_id))
    }

    async fn is_available(&self, doctor_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool, AppointmentError> {
        Ok(self.data()
            .availability
            .iter()
            .any(|w| w.doctor_id == doctor_id && w.covers(start, end)))
    }

    async fn list_availability(
        &self,
        doctor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DoctorAvailability>, AppointmentError> {
        let mut windows: Vec<DoctorAvailability> = self.data()
            .availability
            .iter()
            .filter(|w| w.doctor_id == doctor_id && w.is_available)
            .filter(|w| intervals_overlap(w.start_time, w.end_time, from, to))
            .cloned()
            .collect();
        windows.sort_by_key(|w| w.start_time);
        Ok(windows)
    }

    async fn create(&self, appointment: &Appointment) -> Result<Appointment, AppointmentError> {
        tokio::task::yield_now().await;
        self.data().appointments.insert(appointment.id, appointment.clone());
        Ok(appointment.clone())
    }

    async fn update(&self, appointment: &Appointment) -> Result<Appointment, AppointmentError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(AppointmentError::DatabaseError("update rejected".to_string()));
        }

        let mut data = self.data();
        match data.appointments.get_mut(&appointment.id) {
            Some(stored) => {
                *stored = appointment.clone();
                Ok(appointment.clone())
            }
            None => Err(AppointmentError::appointment_not_found()),
        }
    }

    async fn delete(&self, appointment_id: Uuid) -> Result<(), AppointmentError> {
        self.data()
            .appointments
            .remove(&appointment_id)
            .map(|_| ())
            .ok_or_else(AppointmentError::appointment_not_found)
    }

    async fn get_by_id(&self, appointment_id: Uuid) -> Result<Option<Appointment>, AppointmentError> {
        Ok(self.appointment(appointment_id))
    }

    async fn list(&self, query: &AppointmentSearchQuery) -> Result<Vec<Appointment>, AppointmentError> {
        let mut rows: Vec<Appointment> = self.data()
            .appointments
            .values()
            .filter(|a| query.patient_id.map_or(true, |id| a.patient_id == Some(id)))
            .filter(|a| query.doctor_id.map_or(true, |id| a.doctor_id == Some(id)))
            .filter(|a| query.unit_id.map_or(true, |id| a.unit_id == Some(id)))
            .filter(|a| query.status.map_or(true, |status| a.status == status))
            .filter(|a| query.from_date.map_or(true, |from| a.start_time >= from))
            .filter(|a| query.to_date.map_or(true, |to| a.start_time <= to))
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.start_time);

        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.unwrap_or(i64::MAX).max(0) as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn cancel_with_reason(
        &self,
        appointment_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        let mut data = self.data();
        let appointment = data
            .appointments
            .get_mut(&appointment_id)
            .ok_or_else(AppointmentError::appointment_not_found)?;

        appointment.status = AppointmentStatus::Cancelled;
        appointment.cancellation_reason = Some(reason.to_string());
        appointment.touch(now);
        Ok(appointment.clone())
    }

    async fn snooze_appointment(
        &self,
        appointment_id: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        let mut data = self.data();
        let appointment = data
            .appointments
            .get_mut(&appointment_id)
            .ok_or_else(AppointmentError::appointment_not_found)?;

        appointment.snooze(until, now);
        Ok(appointment.clone())
    }

    async fn get_rescheduling_queue(
        &self,
        filter: &ReschedulingQueueFilter,
        now: DateTime<Utc>,
    ) -> Result<(Vec<AppointmentWithDetails>, i64), AppointmentError> {
        let queued: Vec<Appointment> = self.data()
            .appointments
            .values()
            .filter(|a| a.is_visible_in_queue(now))
            .filter(|a| filter.doctor_id.map_or(true, |id| a.doctor_id == Some(id)))
            .cloned()
            .collect();

        let organizations: HashMap<Uuid, String> = self.data()
            .clinics
            .values()
            .map(|c| (c.id, c.organization_id.clone()))
            .collect();

        let mut rows: Vec<AppointmentWithDetails> = queued
            .iter()
            .map(|a| self.details(a))
            .filter(|d| filter.clinic_id.map_or(true, |id| d.clinic_id == Some(id)))
            .filter(|d| match &filter.organization_id {
                Some(org) => d.clinic_id.and_then(|id| organizations.get(&id)) == Some(org),
                None => true,
            })
            .filter(|d| match filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                Some(term) => matches_search(d, term),
                None => true,
            })
            .collect();

        rows.sort_by_key(|d| d.appointment.moved_to_needs_rescheduling_at);
        if filter.sort == QueueSort::Newest {
            rows.reverse();
        }

        let total = rows.len() as i64;
        let page = rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect();

        Ok((page, total))
    }

    async fn link_patient_to_organization(&self, patient_id: Uuid, organization_id: &str) -> Result<(), AppointmentError> {
        self.side_step_guard()?;
        self.data().organization_links.insert((patient_id, organization_id.to_string()));
        Ok(())
    }

    async fn mark_first_appointment(
        &self,
        patient_id: Uuid,
        appointment_id: Uuid,
        _at: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        self.side_step_guard()?;
        self.data().first_appointments.entry(patient_id).or_insert(appointment_id);
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// 2024-03-01 08:00 UTC.
    pub fn fixed() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).single().unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A service over an in-memory store with a manual clock.
pub struct TestScheduling {
    pub store: Arc<InMemoryAppointmentStore>,
    pub clock: Arc<ManualClock>,
    pub service: Arc<SchedulingService>,
}

impl TestScheduling {
    pub fn new() -> Self {
        Self::with_rules(SchedulingRules::default())
    }

    pub fn with_rules(rules: SchedulingRules) -> Self {
        let store = Arc::new(InMemoryAppointmentStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let service = Arc::new(SchedulingService::new(
            store.clone(),
            clock.clone(),
            Arc::new(BookingGate::new()),
            rules,
        ));

        Self { store, clock, service }
    }
}

impl Default for TestScheduling {
    fn default() -> Self {
        Self::new()
    }
}
