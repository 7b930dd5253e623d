// libs/appointment-cell/src/services/lifecycle.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Appointment, AppointmentError, AppointmentStatus};

/// Something that moves an appointment to another status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentEvent {
    Confirm,
    Complete,
    Cancel,
    Reschedule,
    MoveToNeedsRescheduling,
    LinkToRescheduled(Uuid),
    MarkNoShow,
    MarkError,
    Restore,
}

impl AppointmentEvent {
    /// Event that lands on `status`, used for explicit status updates.
    pub fn toward(status: AppointmentStatus) -> Self {
        match status {
            AppointmentStatus::Scheduled => AppointmentEvent::Restore,
            AppointmentStatus::Confirmed => AppointmentEvent::Confirm,
            AppointmentStatus::Completed => AppointmentEvent::Complete,
            AppointmentStatus::Cancelled => AppointmentEvent::Cancel,
            AppointmentStatus::Rescheduled => AppointmentEvent::Reschedule,
            AppointmentStatus::NeedsRescheduling => AppointmentEvent::MoveToNeedsRescheduling,
            AppointmentStatus::NoShow => AppointmentEvent::MarkNoShow,
            AppointmentStatus::WithError => AppointmentEvent::MarkError,
        }
    }

    pub fn target(&self) -> AppointmentStatus {
        match self {
            AppointmentEvent::Restore => AppointmentStatus::Scheduled,
            AppointmentEvent::Confirm => AppointmentStatus::Confirmed,
            AppointmentEvent::Complete => AppointmentStatus::Completed,
            AppointmentEvent::Cancel => AppointmentStatus::Cancelled,
            AppointmentEvent::Reschedule | AppointmentEvent::LinkToRescheduled(_) => AppointmentStatus::Rescheduled,
            AppointmentEvent::MoveToNeedsRescheduling => AppointmentStatus::NeedsRescheduling,
            AppointmentEvent::MarkNoShow => AppointmentStatus::NoShow,
            AppointmentEvent::MarkError => AppointmentStatus::WithError,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AppointmentEvent::Confirm => "confirm",
            AppointmentEvent::Complete => "complete",
            AppointmentEvent::Cancel => "cancel",
            AppointmentEvent::Reschedule => "reschedule",
            AppointmentEvent::MoveToNeedsRescheduling => "move_to_needs_rescheduling",
            AppointmentEvent::LinkToRescheduled(_) => "link_to_rescheduled",
            AppointmentEvent::MarkNoShow => "mark_no_show",
            AppointmentEvent::MarkError => "mark_error",
            AppointmentEvent::Restore => "restore",
        }
    }
}

impl fmt::Display for AppointmentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How `next_status` is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Apply every event; pairs outside the table are only logged.
    #[default]
    Permissive,
    /// Reject pairs outside the table with `InvalidStatusTransition`.
    Strict,
}

impl TransitionPolicy {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            TransitionPolicy::Strict
        } else {
            TransitionPolicy::Permissive
        }
    }
}

/// The allowed transition table. `None` means the pair is not allowed.
pub fn next_status(from: AppointmentStatus, event: &AppointmentEvent) -> Option<AppointmentStatus> {
    use AppointmentStatus::*;

    let allowed = match event {
        AppointmentEvent::Confirm => matches!(from, Scheduled | Confirmed),
        AppointmentEvent::Complete => matches!(from, Scheduled | Confirmed | Completed),
        // Cancelling twice is a no-op, not an error.
        AppointmentEvent::Cancel => matches!(from, Scheduled | Confirmed | NeedsRescheduling | NoShow | WithError | Cancelled),
        AppointmentEvent::Reschedule => matches!(from, Scheduled | Confirmed | NeedsRescheduling | Rescheduled),
        AppointmentEvent::MoveToNeedsRescheduling => matches!(from, Scheduled | Confirmed | WithError | NeedsRescheduling),
        AppointmentEvent::LinkToRescheduled(_) => matches!(from, NeedsRescheduling | Scheduled | Confirmed),
        AppointmentEvent::MarkNoShow => matches!(from, Scheduled | Confirmed),
        AppointmentEvent::MarkError => matches!(from, Scheduled | Confirmed | NeedsRescheduling),
        AppointmentEvent::Restore => matches!(from, Scheduled | Confirmed | NeedsRescheduling | WithError | NoShow),
    };

    allowed.then(|| event.target())
}

impl Appointment {
    /// Apply `event` under `policy`, stamping `updated_at` from `now`.
    pub fn apply(
        &mut self,
        event: AppointmentEvent,
        policy: TransitionPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        if next_status(self.status, &event).is_none() {
            match policy {
                TransitionPolicy::Strict => {
                    warn!("Rejected transition {} from {} for appointment {}", event, self.status, self.id);
                    return Err(AppointmentError::InvalidStatusTransition {
                        from: self.status,
                        event: event.name().to_string(),
                    });
                }
                TransitionPolicy::Permissive => {
                    warn!("Applying out-of-table transition {} from {} for appointment {}", event, self.status, self.id);
                }
            }
        }

        debug!("Appointment {} transition {} -> {}", self.id, self.status, event.target());
        self.status = event.target();

        match event {
            AppointmentEvent::MoveToNeedsRescheduling => {
                self.moved_to_needs_rescheduling_at = Some(now);
                self.snoozed_until = None;
            }
            AppointmentEvent::LinkToRescheduled(new_id) => {
                self.rescheduled_to_appointment_id = Some(new_id);
            }
            _ => {}
        }

        self.touch(now);
        Ok(())
    }

    pub fn cancel(&mut self, policy: TransitionPolicy, now: DateTime<Utc>) -> Result<(), AppointmentError> {
        self.apply(AppointmentEvent::Cancel, policy, now)
    }

    pub fn cancel_with_reason(
        &mut self,
        reason: &str,
        policy: TransitionPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        self.apply(AppointmentEvent::Cancel, policy, now)?;
        self.cancellation_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn complete(&mut self, policy: TransitionPolicy, now: DateTime<Utc>) -> Result<(), AppointmentError> {
        self.apply(AppointmentEvent::Complete, policy, now)
    }

    pub fn reschedule(&mut self, policy: TransitionPolicy, now: DateTime<Utc>) -> Result<(), AppointmentError> {
        self.apply(AppointmentEvent::Reschedule, policy, now)
    }

    pub fn move_to_needs_rescheduling(
        &mut self,
        policy: TransitionPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        self.apply(AppointmentEvent::MoveToNeedsRescheduling, policy, now)
    }

    pub fn link_to_rescheduled_appointment(
        &mut self,
        new_appointment_id: Uuid,
        policy: TransitionPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        self.apply(AppointmentEvent::LinkToRescheduled(new_appointment_id), policy, now)
    }

    /// Hide the appointment from the queue until `until` has passed.
    pub fn snooze(&mut self, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.snoozed_until = Some(until);
        self.touch(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};

    use crate::models::NewAppointment;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn scheduled() -> Appointment {
        let start = base_time() + Duration::hours(1);
        Appointment::new(NewAppointment::default(), start, start + Duration::minutes(30), base_time()).unwrap()
    }

    #[test]
    fn test_cancel_is_idempotent_and_advances_updated_at() {
        let mut appointment = scheduled();
        let first = base_time() + Duration::minutes(5);
        let second = base_time() + Duration::minutes(10);

        appointment.cancel(TransitionPolicy::Strict, first).unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Cancelled);
        assert_eq!(appointment.updated_at, first);

        appointment.cancel(TransitionPolicy::Strict, second).unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Cancelled);
        assert_eq!(appointment.updated_at, second);
    }

    #[test]
    fn test_updated_at_never_moves_backwards() {
        let mut appointment = scheduled();
        let later = base_time() + Duration::hours(2);
        appointment.complete(TransitionPolicy::Permissive, later).unwrap();

        appointment.complete(TransitionPolicy::Permissive, base_time()).unwrap();
        assert_eq!(appointment.updated_at, later);
    }

    #[test]
    fn test_move_to_queue_stamps_time_and_clears_snooze() {
        let mut appointment = scheduled();
        appointment.snooze(base_time() + Duration::days(3), base_time());

        let now = base_time() + Duration::minutes(1);
        appointment.move_to_needs_rescheduling(TransitionPolicy::Strict, now).unwrap();

        assert_eq!(appointment.status, AppointmentStatus::NeedsRescheduling);
        assert_eq!(appointment.moved_to_needs_rescheduling_at, Some(now));
        assert_eq!(appointment.snoozed_until, None);
    }

    #[test]
    fn test_link_sets_forward_pointer() {
        let mut appointment = scheduled();
        appointment.move_to_needs_rescheduling(TransitionPolicy::Strict, base_time()).unwrap();

        let replacement = Uuid::new_v4();
        appointment
            .link_to_rescheduled_appointment(replacement, TransitionPolicy::Strict, base_time())
            .unwrap();

        assert_eq!(appointment.status, AppointmentStatus::Rescheduled);
        assert_eq!(appointment.rescheduled_to_appointment_id, Some(replacement));
    }

    #[test]
    fn test_strict_policy_rejects_out_of_table_pairs() {
        let mut appointment = scheduled();
        appointment.complete(TransitionPolicy::Strict, base_time()).unwrap();

        let result = appointment.move_to_needs_rescheduling(TransitionPolicy::Strict, base_time());
        assert_matches!(
            result,
            Err(AppointmentError::InvalidStatusTransition { from: AppointmentStatus::Completed, .. })
        );
        assert_eq!(appointment.status, AppointmentStatus::Completed);
    }

    #[test]
    fn test_permissive_policy_applies_anything() {
        let mut appointment = scheduled();
        appointment.complete(TransitionPolicy::Permissive, base_time()).unwrap();

        appointment.cancel(TransitionPolicy::Permissive, base_time()).unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Cancelled);
    }

    #[test]
    fn test_toward_round_trips_every_status() {
        for status in AppointmentStatus::ALL {
            assert_eq!(AppointmentEvent::toward(status).target(), status);
        }
    }

    #[test]
    fn test_table_allows_cancel_twice() {
        assert_eq!(
            next_status(AppointmentStatus::Cancelled, &AppointmentEvent::Cancel),
            Some(AppointmentStatus::Cancelled)
        );
        assert_eq!(next_status(AppointmentStatus::Rescheduled, &AppointmentEvent::Confirm), None);
    }
}
