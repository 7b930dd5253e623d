// libs/appointment-cell/src/services/supabase_store.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use shared_database::supabase::{SupabaseClient, SupabaseError};

use crate::models::{
    Appointment, AppointmentError, AppointmentSearchQuery, AppointmentStatus, AppointmentWithDetails,
    Clinic, DoctorAvailability, QueueSort, ReschedulingQueueFilter, TreatmentUnit,
};
use crate::services::store::AppointmentStore;

/// `AppointmentStore` over Supabase PostgREST, acting with the caller's token.
pub struct SupabaseAppointmentStore {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseAppointmentStore {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: impl Into<String>) -> Self {
        Self {
            supabase,
            auth_token: auth_token.into(),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, AppointmentError> {
        self.supabase
            .request(Method::GET, path, Some(&self.auth_token), None)
            .await
            .map_err(db_error)
    }

    async fn write<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> Result<Vec<T>, AppointmentError> {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        self.supabase
            .request_with_headers(method, path, Some(&self.auth_token), body, Some(headers))
            .await
            .map_err(db_error)
    }

    async fn exists(&self, table: &str, id: Uuid) -> Result<bool, AppointmentError> {
        let path = format!("/rest/v1/{}?id=eq.{}&select=id&limit=1", table, id);
        let rows: Vec<Value> = self.fetch(&path).await?;
        Ok(!rows.is_empty())
    }

    async fn patch_appointment(&self, appointment_id: Uuid, body: Value) -> Result<Appointment, AppointmentError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let mut rows: Vec<Appointment> = self.write(Method::PATCH, &path, Some(body)).await?;
        rows.pop().ok_or_else(AppointmentError::appointment_not_found)
    }
}

/// Overlap filter for active appointments of the doctor or the unit.
fn overlap_path(
    select: &str,
    doctor_id: Option<Uuid>,
    unit_id: Option<Uuid>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_id: Option<Uuid>,
) -> Option<String> {
    let parties: Vec<String> = doctor_id
        .map(|id| format!("doctor_id.eq.{}", id))
        .into_iter()
        .chain(unit_id.map(|id| format!("unit_id.eq.{}", id)))
        .collect();

    if parties.is_empty() {
        return None;
    }

    let mut path = format!(
        "/rest/v1/appointments?select={}&status=eq.{}&start_time=lt.{}&end_time=gt.{}&or=({})",
        select,
        AppointmentStatus::Scheduled,
        encode_time(end),
        encode_time(start),
        parties.join(",")
    );

    if let Some(exclude_id) = exclude_id {
        path.push_str(&format!("&id=neq.{}", exclude_id));
    }

    Some(path)
}

fn encode_time(instant: DateTime<Utc>) -> String {
    urlencoding::encode(&instant.to_rfc3339_opts(SecondsFormat::Secs, true)).into_owned()
}

/// Exclusion-constraint rejections become conflicts, everything else a database error.
fn db_error(err: anyhow::Error) -> AppointmentError {
    match err.downcast_ref::<SupabaseError>() {
        Some(supabase_err) if supabase_err.is_exclusion_violation() => AppointmentError::ConflictDetected,
        _ => AppointmentError::DatabaseError(err.to_string()),
    }
}

#[derive(Deserialize)]
struct UnitWithClinicRow {
    id: Uuid,
    name: String,
    clinic_id: Uuid,
    clinic: Option<Clinic>,
}

#[derive(Deserialize)]
struct QueueRow {
    #[serde(flatten)]
    appointment: Appointment,
    patient: Option<PatientEmbed>,
    doctor: Option<DoctorEmbed>,
    unit: Option<UnitEmbed>,
}

#[derive(Deserialize)]
struct PatientEmbed {
    full_name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize)]
struct DoctorEmbed {
    full_name: Option<String>,
}

#[derive(Deserialize)]
struct UnitEmbed {
    name: Option<String>,
    clinic: Option<ClinicEmbed>,
}

#[derive(Deserialize)]
struct ClinicEmbed {
    id: Uuid,
    name: Option<String>,
}

impl From<QueueRow> for AppointmentWithDetails {
    fn from(row: QueueRow) -> Self {
        let (patient_name, patient_phone, patient_email) = match row.patient {
            Some(p) => (p.full_name, p.phone, p.email),
            None => (None, None, None),
        };
        let (unit_name, clinic) = match row.unit {
            Some(u) => (u.name, u.clinic),
            None => (None, None),
        };

        AppointmentWithDetails {
            appointment: row.appointment,
            patient_name,
            patient_phone,
            patient_email,
            doctor_name: row.doctor.and_then(|d| d.full_name),
            clinic_id: clinic.as_ref().map(|c| c.id),
            clinic_name: clinic.and_then(|c| c.name),
            unit_name,
        }
    }
}

/// `*term*` as a double-quoted PostgREST value, so reserved characters
/// inside `or=(...)` groups stay literal.
fn quote_search_pattern(term: &str) -> String {
    let escaped = term.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"*{}*\"", escaped)
}

fn queue_path(filter: &ReschedulingQueueFilter, now: DateTime<Utc>) -> String {
    let search = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|term| !term.is_empty());
    let scoped = filter.organization_id.is_some() || filter.clinic_id.is_some();

    let patient_embed = if search.is_some() { "patient:patients!inner" } else { "patient:patients" };
    let unit_embed = if scoped { "unit:treatment_units!inner" } else { "unit:treatment_units" };
    let clinic_embed = if scoped { "clinic:clinics!inner" } else { "clinic:clinics" };

    let mut parts = vec![
        format!(
            "select=*,{}(full_name,phone,email),doctor:doctors(full_name),{}(name,clinic_id,{}(id,name,organization_id))",
            patient_embed, unit_embed, clinic_embed
        ),
        format!("status=eq.{}", AppointmentStatus::NeedsRescheduling),
        format!("or=(snoozed_until.is.null,snoozed_until.lt.{})", encode_time(now)),
    ];

    if let Some(organization_id) = &filter.organization_id {
        parts.push(format!("unit.clinic.organization_id=eq.{}", urlencoding::encode(organization_id)));
    }
    if let Some(clinic_id) = filter.clinic_id {
        parts.push(format!("unit.clinic_id=eq.{}", clinic_id));
    }
    if let Some(doctor_id) = filter.doctor_id {
        parts.push(format!("doctor_id=eq.{}", doctor_id));
    }
    if let Some(term) = search {
        let pattern = urlencoding::encode(&quote_search_pattern(term)).into_owned();
        parts.push(format!(
            "patient.or=(full_name.ilike.{p},phone.ilike.{p},email.ilike.{p})",
            p = pattern
        ));
    }

    let direction = match filter.sort {
        QueueSort::Oldest => "asc",
        QueueSort::Newest => "desc",
    };
    parts.push(format!("order=moved_to_needs_rescheduling_at.{}", direction));
    parts.push(format!("limit={}", filter.limit));
    parts.push(format!("offset={}", filter.offset));

    format!("/rest/v1/appointments?{}", parts.join("&"))
}

#[async_trait]
impl AppointmentStore for SupabaseAppointmentStore {
    async fn exists_patient(&self, patient_id: Uuid) -> Result<bool, AppointmentError> {
        self.exists("patients", patient_id).await
    }

    async fn exists_doctor(&self, doctor_id: Uuid) -> Result<bool, AppointmentError> {
        self.exists("doctors", doctor_id).await
    }

    async fn exists_unit(&self, unit_id: Uuid) -> Result<bool, AppointmentError> {
        self.exists("treatment_units", unit_id).await
    }

    async fn get_unit_with_clinic(&self, unit_id: Uuid) -> Result<Option<(TreatmentUnit, Clinic)>, AppointmentError> {
        let path = format!("/rest/v1/treatment_units?id=eq.{}&select=*,clinic:clinics(*)", unit_id);
        let mut rows: Vec<UnitWithClinicRow> = self.fetch(&path).await?;

        Ok(rows.pop().and_then(|row| {
            let clinic = row.clinic?;
            Some((
                TreatmentUnit { id: row.id, name: row.name, clinic_id: row.clinic_id },
                clinic,
            ))
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
        let Some(mut path) = overlap_path("id", doctor_id, unit_id, start, end, exclude_id) else {
            return Ok(false);
        };
        path.push_str("&limit=1");

        let rows: Vec<Value> = self.fetch(&path).await?;
        Ok(!rows.is_empty())
    }

    async fn get_conflicting_appointments(
        &self,
        doctor_id: Option<Uuid>,
        unit_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<Uuid>,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        match overlap_path("*", doctor_id, unit_id, start, end, exclude_id) {
            Some(path) => self.fetch(&format!("{}&order=start_time.asc", path)).await,
            None => Ok(vec![]),
        }
    }

    async fn is_available(&self, doctor_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool, AppointmentError> {
        let path = format!(
            "/rest/v1/doctor_availabilities?select=id&doctor_id=eq.{}&is_available=eq.true&start_time=lte.{}&end_time=gte.{}&limit=1",
            doctor_id,
            encode_time(start),
            encode_time(end)
        );
        let rows: Vec<Value> = self.fetch(&path).await?;
        Ok(!rows.is_empty())
    }

    async fn list_availability(
        &self,
        doctor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DoctorAvailability>, AppointmentError> {
        let path = format!(
            "/rest/v1/doctor_availabilities?doctor_id=eq.{}&is_available=eq.true&start_time=lt.{}&end_time=gt.{}&order=start_time.asc",
            doctor_id,
            encode_time(to),
            encode_time(from)
        );
        self.fetch(&path).await
    }

    async fn create(&self, appointment: &Appointment) -> Result<Appointment, AppointmentError> {
        debug!("Inserting appointment {}", appointment.id);

        let body = serde_json::to_value(appointment)
            .map_err(|e| AppointmentError::DatabaseError(format!("Failed to encode appointment: {}", e)))?;
        let mut rows: Vec<Appointment> = self.write(Method::POST, "/rest/v1/appointments", Some(body)).await?;

        rows.pop()
            .ok_or_else(|| AppointmentError::DatabaseError("Failed to create appointment".to_string()))
    }

    async fn update(&self, appointment: &Appointment) -> Result<Appointment, AppointmentError> {
        debug!("Updating appointment {}", appointment.id);

        let body = serde_json::to_value(appointment)
            .map_err(|e| AppointmentError::DatabaseError(format!("Failed to encode appointment: {}", e)))?;
        self.patch_appointment(appointment.id, body).await
    }

    async fn delete(&self, appointment_id: Uuid) -> Result<(), AppointmentError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let rows: Vec<Value> = self.write(Method::DELETE, &path, None).await?;

        if rows.is_empty() {
            return Err(AppointmentError::appointment_not_found());
        }
        Ok(())
    }

    async fn get_by_id(&self, appointment_id: Uuid) -> Result<Option<Appointment>, AppointmentError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let mut rows: Vec<Appointment> = self.fetch(&path).await?;
        Ok(rows.pop())
    }

    async fn list(&self, query: &AppointmentSearchQuery) -> Result<Vec<Appointment>, AppointmentError> {
        let mut parts = Vec::new();

        if let Some(patient_id) = query.patient_id {
            parts.push(format!("patient_id=eq.{}", patient_id));
        }
        if let Some(doctor_id) = query.doctor_id {
            parts.push(format!("doctor_id=eq.{}", doctor_id));
        }
        if let Some(unit_id) = query.unit_id {
            parts.push(format!("unit_id=eq.{}", unit_id));
        }
        if let Some(status) = query.status {
            parts.push(format!("status=eq.{}", status));
        }
        if let Some(from_date) = query.from_date {
            parts.push(format!("start_time=gte.{}", encode_time(from_date)));
        }
        if let Some(to_date) = query.to_date {
            parts.push(format!("start_time=lte.{}", encode_time(to_date)));
        }
        parts.push("order=start_time.asc".to_string());
        if let Some(limit) = query.limit {
            parts.push(format!("limit={}", limit));
        }
        if let Some(offset) = query.offset {
            parts.push(format!("offset={}", offset));
        }

        self.fetch(&format!("/rest/v1/appointments?{}", parts.join("&"))).await
    }

    async fn cancel_with_reason(
        &self,
        appointment_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.patch_appointment(appointment_id, json!({
            "status": AppointmentStatus::Cancelled,
            "cancellation_reason": reason,
            "updated_at": now,
        })).await?;

        info!("Appointment {} cancelled: {}", appointment_id, reason);
        Ok(appointment)
    }

    async fn snooze_appointment(
        &self,
        appointment_id: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        self.patch_appointment(appointment_id, json!({
            "snoozed_until": until,
            "updated_at": now,
        })).await
    }

    async fn get_rescheduling_queue(
        &self,
        filter: &ReschedulingQueueFilter,
        now: DateTime<Utc>,
    ) -> Result<(Vec<AppointmentWithDetails>, i64), AppointmentError> {
        let path = queue_path(filter, now);
        debug!("Fetching rescheduling queue: {}", path);

        let (rows, total): (Vec<QueueRow>, Option<i64>) = self.supabase
            .request_with_count(Method::GET, &path, Some(&self.auth_token))
            .await
            .map_err(db_error)?;

        let total = total.unwrap_or(rows.len() as i64);
        Ok((rows.into_iter().map(AppointmentWithDetails::from).collect(), total))
    }

    async fn link_patient_to_organization(&self, patient_id: Uuid, organization_id: &str) -> Result<(), AppointmentError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Prefer",
            HeaderValue::from_static("resolution=ignore-duplicates,return=representation"),
        );

        let _: Vec<Value> = self.supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/organization_patients?on_conflict=organization_id,patient_id",
                Some(&self.auth_token),
                Some(json!({ "organization_id": organization_id, "patient_id": patient_id })),
                Some(headers),
            )
            .await
            .map_err(db_error)?;

        Ok(())
    }

    async fn mark_first_appointment(
        &self,
        patient_id: Uuid,
        appointment_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        // The `is.null` filter makes this a no-op once the marker is set.
        let path = format!("/rest/v1/patients?id=eq.{}&first_appointment_id=is.null", patient_id);
        let _: Vec<Value> = self.write(Method::PATCH, &path, Some(json!({
            "first_appointment_id": appointment_id,
            "first_appointment_at": at,
        }))).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_overlap_path_uses_half_open_bounds() {
        let doctor = Uuid::new_v4();
        let unit = Uuid::new_v4();
        let path = overlap_path("id", Some(doctor), Some(unit), at(9), at(10), None).unwrap();

        assert!(path.contains("status=eq.scheduled"));
        assert!(path.contains("start_time=lt.2024-03-01T10%3A00%3A00Z"));
        assert!(path.contains("end_time=gt.2024-03-01T09%3A00%3A00Z"));
        assert!(path.contains(&format!("or=(doctor_id.eq.{},unit_id.eq.{})", doctor, unit)));
        assert!(!path.contains("id=neq."));
    }

    #[test]
    fn test_overlap_path_requires_a_party() {
        assert!(overlap_path("id", None, None, at(9), at(10), None).is_none());
    }

    #[test]
    fn test_queue_path_scopes_by_organization() {
        let filter = ReschedulingQueueFilter {
            organization_id: Some("org-1".to_string()),
            search: Some("ana (lopez)".to_string()),
            sort: QueueSort::Newest,
            limit: 20,
            offset: 40,
            ..Default::default()
        };
        let path = queue_path(&filter, at(12));

        assert!(path.contains("unit:treatment_units!inner"));
        assert!(path.contains("patient:patients!inner"));
        assert!(path.contains("unit.clinic.organization_id=eq.org-1"));
        assert!(path.contains("full_name.ilike.%22%2Aana%20%28lopez%29%2A%22"));
        assert!(path.contains("order=moved_to_needs_rescheduling_at.desc"));
        assert!(path.ends_with("limit=20&offset=40"));
    }

    #[test]
    fn test_queue_search_keeps_email_intact() {
        let filter = ReschedulingQueueFilter {
            search: Some(" maria@example.com ".to_string()),
            limit: 20,
            ..Default::default()
        };
        let path = queue_path(&filter, at(12));

        let pattern = urlencoding::encode("\"*maria@example.com*\"").into_owned();
        assert!(path.contains(&format!("email.ilike.{}", pattern)));
        assert!(path.contains("example.com"));
    }

    #[test]
    fn test_search_pattern_escapes_quotes_and_backslashes() {
        assert_eq!(quote_search_pattern("a,b.c"), "\"*a,b.c*\"");
        assert_eq!(quote_search_pattern(r#"say "hi""#), r#""*say \"hi\"*""#);
        assert_eq!(quote_search_pattern(r"C:\tmp"), r#""*C:\\tmp*""#);
    }

    #[test]
    fn test_exclusion_violation_maps_to_conflict() {
        let err = anyhow::Error::new(SupabaseError::Constraint {
            code: "23P01".to_string(),
            message: "conflicting key value violates exclusion constraint".to_string(),
        });
        assert_eq!(db_error(err), AppointmentError::ConflictDetected);

        let other = anyhow::anyhow!("connection reset");
        assert!(matches!(db_error(other), AppointmentError::DatabaseError(_)));
    }
}
