// libs/appointment-cell/src/services/timezone.rs
//! Conversion between clinic wall-clock times and absolute UTC instants.
//!
//! A missing or blank zone means the wall-clock value already is UTC.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::models::AppointmentError;

/// Parse an IANA zone name, `None` for blank input.
pub fn parse_zone(zone: Option<&str>) -> Result<Option<Tz>, AppointmentError> {
    match zone.map(str::trim).filter(|name| !name.is_empty()) {
        None => Ok(None),
        Some(name) => name
            .parse::<Tz>()
            .map(Some)
            .map_err(|_| AppointmentError::InvalidTimezone(name.to_string())),
    }
}

/// Interpret `local` as a wall-clock reading in `zone`.
///
/// Ambiguous readings (clocks falling back) resolve to the earlier instant.
/// Readings inside a spring-forward gap are shifted forward by an hour.
pub fn to_absolute(local: NaiveDateTime, zone: Option<&str>) -> Result<DateTime<Utc>, AppointmentError> {
    let Some(tz) = parse_zone(zone)? else {
        return Ok(local.and_utc());
    };

    let resolved = match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => {
            debug!("Ambiguous local time {} in {}, using earliest", local, tz);
            earliest
        }
        LocalResult::None => {
            debug!("Local time {} does not exist in {}, shifting past the gap", local, tz);
            tz.from_local_datetime(&(local + Duration::hours(1)))
                .earliest()
                .ok_or_else(|| AppointmentError::ValidationError(format!(
                    "Local time {} cannot be represented in {}",
                    local, tz
                )))?
        }
    };

    Ok(resolved.with_timezone(&Utc))
}

/// Wall-clock reading of `instant` in `zone`.
pub fn to_display(instant: DateTime<Utc>, zone: Option<&str>) -> Result<NaiveDateTime, AppointmentError> {
    Ok(match parse_zone(zone)? {
        Some(tz) => instant.with_timezone(&tz).naive_local(),
        None => instant.naive_utc(),
    })
}

/// Absolute `[start, end)` bounds of the calendar day `date` in `zone`.
pub fn local_day_bounds(
    date: NaiveDate,
    zone: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), AppointmentError> {
    let next = date
        .succ_opt()
        .ok_or_else(|| AppointmentError::ValidationError(format!("Date {} is out of range", date)))?;

    let start = to_absolute(date.and_time(NaiveTime::MIN), zone)?;
    let end = to_absolute(next.and_time(NaiveTime::MIN), zone)?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn test_mexico_city_morning_is_afternoon_utc() {
        let utc = to_absolute(naive("2024-03-01 09:00"), Some("America/Mexico_City")).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-03-01T15:00:00+00:00");
    }

    #[test]
    fn test_round_trip_through_zone() {
        let zone = Some("Europe/Madrid");
        let local = naive("2024-07-15 18:30");
        let utc = to_absolute(local, zone).unwrap();
        assert_eq!(to_display(utc, zone).unwrap(), local);
    }

    #[test]
    fn test_missing_zone_passes_through() {
        let local = naive("2024-03-01 09:00");
        assert_eq!(to_absolute(local, None).unwrap(), local.and_utc());
        assert_eq!(to_absolute(local, Some("")).unwrap(), local.and_utc());
    }

    #[test]
    fn test_unknown_zone_is_rejected() {
        let err = to_absolute(naive("2024-03-01 09:00"), Some("Mars/Olympus_Mons")).unwrap_err();
        assert_eq!(err, AppointmentError::InvalidTimezone("Mars/Olympus_Mons".to_string()));
    }

    #[test]
    fn test_ambiguous_time_resolves_to_earliest() {
        // 2024-11-03 01:30 happens twice in New York; the first is EDT (UTC-4).
        let utc = to_absolute(naive("2024-11-03 01:30"), Some("America/New_York")).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-11-03T05:30:00+00:00");
    }

    #[test]
    fn test_gap_time_shifts_forward() {
        // 02:30 does not exist on 2024-03-10 in New York; 03:30 EDT is 07:30Z.
        let utc = to_absolute(naive("2024-03-10 02:30"), Some("America/New_York")).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-03-10T07:30:00+00:00");
    }

    #[test]
    fn test_local_day_bounds() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let (start, end) = local_day_bounds(date, Some("America/Mexico_City")).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-03-01T06:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-03-02T06:00:00+00:00");
    }
}
