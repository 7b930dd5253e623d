use assert_matches::assert_matches;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use uuid::Uuid;

use appointment_cell::models::*;
use appointment_cell::testing::TestScheduling;
use rescheduling_queue_cell::models::*;
use rescheduling_queue_cell::{QueueError, ReschedulingQueueService};

const ORG: &str = "org-1";

struct Fixture {
    t: TestScheduling,
    queue: ReschedulingQueueService,
    patient: Uuid,
    doctor: Uuid,
    unit: Uuid,
}

fn fixture() -> Fixture {
    let t = TestScheduling::new();
    let patient = t.store.add_patient("Ana Lopez", Some("+52 55 1234 5678"), Some("ana@example.com"));
    let doctor = t.store.add_doctor("Dr. Ruiz");
    let clinic = t.store.add_clinic(ORG, Some("America/Mexico_City"));
    let unit = t.store.add_unit(&clinic);
    t.store.add_availability(doctor, utc(1, 14, 0), utc(1, 23, 0));
    t.store.add_availability(doctor, utc(2, 14, 0), utc(2, 23, 0));

    let queue = ReschedulingQueueService::new(t.service.clone());
    Fixture { t, queue, patient, doctor, unit }
}

fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
}

fn local(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap().and_hms_opt(hour, minute, 0).unwrap()
}

async fn book(f: &Fixture, patient: Uuid, start: NaiveDateTime, end: NaiveDateTime) -> Appointment {
    f.t.service
        .create_appointment(
            CreateAppointmentRequest {
                patient_id: Some(patient),
                doctor_id: Some(f.doctor),
                unit_id: Some(f.unit),
                service_code: Some("PHYSIO-30".to_string()),
                start_time: start,
                end_time: end,
                notes: Some("left knee".to_string()),
                creation_policy: None,
            },
            CreationPolicy::ConflictChecked,
        )
        .await
        .unwrap()
}

async fn queued(f: &Fixture) -> Appointment {
    queued_at(f, local(1, 9, 0)).await
}

async fn queued_at(f: &Fixture, start: NaiveDateTime) -> Appointment {
    let booked = book(f, f.patient, start, start + Duration::minutes(30)).await;
    f.t.service.mark_needs_rescheduling(booked.id).await.unwrap()
}

fn reschedule_request(f: &Fixture, start: NaiveDateTime, end: NaiveDateTime) -> RescheduleFromQueueRequest {
    RescheduleFromQueueRequest {
        new_doctor_id: None,
        new_unit_id: f.unit,
        new_service_code: None,
        new_start_time: start,
        new_end_time: end,
        notes: None,
    }
}

#[tokio::test]
async fn test_reschedule_from_queue_books_and_links() {
    let f = fixture();
    let original = queued(&f).await;

    let result = f.queue
        .reschedule_from_queue(original.id, ORG, reschedule_request(&f, local(2, 10, 0), local(2, 10, 30)))
        .await
        .unwrap();

    assert_eq!(result.replacement.status, AppointmentStatus::Scheduled);
    assert_eq!(result.replacement.start_time, utc(2, 16, 0));
    assert_eq!(result.replacement.patient_id, Some(f.patient));
    assert_eq!(result.replacement.doctor_id, Some(f.doctor));
    assert_eq!(result.replacement.service_code.as_deref(), Some("PHYSIO-30"));
    assert_eq!(result.replacement.notes.as_deref(), Some("left knee"));

    let stored = f.t.store.appointment(original.id).unwrap();
    assert_eq!(stored.status, AppointmentStatus::Rescheduled);
    assert_eq!(stored.rescheduled_to_appointment_id, Some(result.replacement.id));
    assert_eq!(result.original, stored);
}

#[tokio::test]
async fn test_reschedule_from_queue_into_taken_slot_leaves_original_queued() {
    let f = fixture();
    let original = queued(&f).await;
    let other_patient = f.t.store.add_patient("Luis Perez", None, None);
    book(&f, other_patient, local(2, 10, 0), local(2, 11, 0)).await;

    let result = f.queue
        .reschedule_from_queue(original.id, ORG, reschedule_request(&f, local(2, 10, 30), local(2, 11, 0)))
        .await;

    assert_matches!(result, Err(QueueError::Appointment(AppointmentError::ConflictDetected)));
    let stored = f.t.store.appointment(original.id).unwrap();
    assert_eq!(stored.status, AppointmentStatus::NeedsRescheduling);
    assert_eq!(stored.rescheduled_to_appointment_id, None);
    assert_eq!(f.t.store.appointments().len(), 2);
}

#[tokio::test]
async fn test_reschedule_link_failure_keeps_replacement_booked() {
    let f = fixture();
    let original = queued(&f).await;
    f.t.store.set_fail_updates(true);

    let result = f.queue
        .reschedule_from_queue(original.id, ORG, reschedule_request(&f, local(2, 10, 0), local(2, 10, 30)))
        .await;

    assert_matches!(result, Err(QueueError::Appointment(AppointmentError::DatabaseError(_))));
    let appointments = f.t.store.appointments();
    assert_eq!(appointments.len(), 2);
    assert!(appointments
        .iter()
        .any(|a| a.id != original.id && a.status == AppointmentStatus::Scheduled));
    assert_eq!(f.t.store.appointment(original.id).unwrap().status, AppointmentStatus::NeedsRescheduling);
}

#[tokio::test]
async fn test_scheduled_appointment_is_not_in_queue() {
    let f = fixture();
    let booked = book(&f, f.patient, local(1, 9, 0), local(1, 9, 30)).await;

    let result = f.queue
        .cancel_from_queue(
            booked.id,
            ORG,
            CancelFromQueueRequest { reason_code: "PATIENT_REQUEST".to_string(), notes: None },
        )
        .await;

    assert_matches!(result, Err(QueueError::Appointment(AppointmentError::NotInQueue)));
    assert_eq!(f.t.store.appointment(booked.id).unwrap().status, AppointmentStatus::Scheduled);
}

#[tokio::test]
async fn test_other_organization_cannot_touch_queue_entry() {
    let f = fixture();
    let original = queued(&f).await;

    let cancel = f.queue
        .cancel_from_queue(
            original.id,
            "org-2",
            CancelFromQueueRequest { reason_code: "PATIENT_REQUEST".to_string(), notes: None },
        )
        .await;
    let snooze = f.queue
        .snooze(original.id, "org-2", SnoozeRequest { until: local(3, 9, 0) })
        .await;

    assert_matches!(cancel, Err(QueueError::Appointment(AppointmentError::OwnershipMismatch)));
    assert_matches!(snooze, Err(QueueError::Appointment(AppointmentError::OwnershipMismatch)));
    assert_eq!(f.t.store.appointment(original.id).unwrap().status, AppointmentStatus::NeedsRescheduling);
}

#[tokio::test]
async fn test_other_organization_cannot_learn_appointment_status() {
    let f = fixture();
    let booked = book(&f, f.patient, local(1, 9, 0), local(1, 9, 30)).await;
    let queued = queued_at(&f, local(1, 11, 0)).await;

    for appointment_id in [booked.id, queued.id] {
        let result = f.queue
            .snooze(appointment_id, "org-2", SnoozeRequest { until: local(3, 9, 0) })
            .await;

        assert_matches!(result, Err(QueueError::Appointment(AppointmentError::OwnershipMismatch)));
    }
}

#[tokio::test]
async fn test_reschedule_into_foreign_unit_is_rejected() {
    let f = fixture();
    let original = queued(&f).await;
    let foreign_clinic = f.t.store.add_clinic("org-2", Some("America/Mexico_City"));
    let foreign_unit = f.t.store.add_unit(&foreign_clinic);

    let mut request = reschedule_request(&f, local(2, 10, 0), local(2, 10, 30));
    request.new_unit_id = foreign_unit;
    let result = f.queue.reschedule_from_queue(original.id, ORG, request).await;

    assert_matches!(result, Err(QueueError::Appointment(AppointmentError::OwnershipMismatch)));
    assert_eq!(f.t.store.appointments().len(), 1);
}

#[tokio::test]
async fn test_cancel_from_queue_stores_reason_code_and_notes() {
    let f = fixture();
    let original = queued(&f).await;

    let cancelled = f.queue
        .cancel_from_queue(
            original.id,
            ORG,
            CancelFromQueueRequest {
                reason_code: "PATIENT_REQUEST".to_string(),
                notes: Some("moving abroad".to_string()),
            },
        )
        .await
        .unwrap();

    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("PATIENT_REQUEST: moving abroad"));
}

#[tokio::test]
async fn test_cancel_from_queue_requires_reason_code() {
    let f = fixture();
    let original = queued(&f).await;

    let result = f.queue
        .cancel_from_queue(original.id, ORG, CancelFromQueueRequest { reason_code: "  ".to_string(), notes: None })
        .await;

    assert_matches!(result, Err(QueueError::Appointment(AppointmentError::ValidationError(_))));
}

#[tokio::test]
async fn test_snoozed_entry_hidden_until_snooze_expires() {
    let f = fixture();
    let original = queued(&f).await;

    // 2024-03-02 09:00 Mexico City is 15:00 UTC.
    let snoozed = f.queue
        .snooze(original.id, ORG, SnoozeRequest { until: local(2, 9, 0) })
        .await
        .unwrap();
    assert_eq!(snoozed.snoozed_until, Some(utc(2, 15, 0)));
    assert_eq!(snoozed.status, AppointmentStatus::NeedsRescheduling);

    let page = f.queue.list_queue(ORG, ReschedulingQueueQuery::default()).await.unwrap();
    assert_eq!(page.total, 0);

    f.t.clock.set(utc(2, 15, 1));
    let page = f.queue.list_queue(ORG, ReschedulingQueueQuery::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].details.appointment.id, original.id);
    assert_eq!(page.items[0].days_in_queue, 1);
}

#[tokio::test]
async fn test_snooze_in_the_past_is_rejected() {
    let f = fixture();
    let original = queued(&f).await;

    let result = f.queue
        .snooze(original.id, ORG, SnoozeRequest { until: local(1, 1, 0) })
        .await;

    assert_matches!(result, Err(QueueError::Appointment(AppointmentError::ValidationError(_))));
    assert_eq!(f.t.store.appointment(original.id).unwrap().snoozed_until, None);
}

#[tokio::test]
async fn test_list_queue_pages_and_searches() {
    let f = fixture();
    let patients = [
        f.patient,
        f.t.store.add_patient("Luis Perez", Some("+52 55 0000 0001"), None),
        f.t.store.add_patient("Maria Gomez", None, Some("maria@example.com")),
    ];

    let mut ids = Vec::new();
    for (hour, patient) in (9..).zip(patients) {
        let booked = book(&f, patient, local(1, hour, 0), local(1, hour, 30)).await;
        f.t.service.mark_needs_rescheduling(booked.id).await.unwrap();
        ids.push(booked.id);
        f.t.clock.advance(Duration::hours(1));
    }

    let first = f.queue
        .list_queue(ORG, ReschedulingQueueQuery { limit: Some(2), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(first.total, 3);
    assert_eq!(first.total_pages, 2);
    assert_eq!(
        first.items.iter().map(|e| e.details.appointment.id).collect::<Vec<_>>(),
        ids[..2].to_vec()
    );

    let newest = f.queue
        .list_queue(ORG, ReschedulingQueueQuery { sort: Some(QueueSort::Newest), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(newest.items[0].details.appointment.id, ids[2]);

    let search = f.queue
        .list_queue(ORG, ReschedulingQueueQuery { search: Some("MARIA@".to_string()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(search.total, 1);
    assert_eq!(search.items[0].details.patient_name.as_deref(), Some("Maria Gomez"));

    let foreign = f.queue.list_queue("org-2", ReschedulingQueueQuery::default()).await.unwrap();
    assert_eq!(foreign.total, 0);
}

#[tokio::test]
async fn test_list_queue_rejects_zero_limit() {
    let f = fixture();

    let result = f.queue
        .list_queue(ORG, ReschedulingQueueQuery { limit: Some(0), ..Default::default() })
        .await;

    assert_matches!(result, Err(QueueError::InvalidPagination(_)));
}

#[tokio::test]
async fn test_list_queue_rejects_page_past_addressable_range() {
    let f = fixture();

    let result = f.queue
        .list_queue(ORG, ReschedulingQueueQuery { page: Some(i64::MAX), ..Default::default() })
        .await;

    assert_matches!(result, Err(QueueError::InvalidPagination(_)));
}
