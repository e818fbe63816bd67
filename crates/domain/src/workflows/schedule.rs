//! Future dose generation from a schedule descriptor.

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::errors::Result;
use crate::medications::{Frequency, MedicationCommand};

/// Dose instants strictly after `from`, over `horizon_days` local days,
/// capped at `cap`. PRN and inactive medications yield nothing.
pub fn upcoming_doses(
    command: &MedicationCommand,
    from: DateTime<Utc>,
    horizon_days: i64,
    cap: usize,
) -> Result<Vec<DateTime<Utc>>> {
    if command.status.is_prn || !command.status.is_active || cap == 0 {
        return Ok(vec![]);
    }

    let schedule = &command.schedule;
    let tz = schedule.tz()?;
    let times = schedule.parsed_times()?;
    let first_day = schedule.start_date.max(from.with_timezone(&tz).date_naive());

    let mut doses = Vec::new();
    for offset in 0..horizon_days.max(0) as u64 {
        let Some(day) = first_day.checked_add_days(Days::new(offset)) else {
            break;
        };
        if schedule.end_date.is_some_and(|end| day > end) {
            break;
        }
        if !falls_on(schedule.frequency, schedule.start_date, day) {
            continue;
        }
        for time in &times {
            let Some(at) = resolve_local(&tz, day.and_time(*time)) else {
                continue;
            };
            if at <= from {
                continue;
            }
            doses.push(at);
            if doses.len() == cap {
                return Ok(doses);
            }
        }
    }
    Ok(doses)
}

/// Whether `slot` is one of the instants the command's current schedule
/// produces, ignoring status and the generation horizon.
pub fn is_scheduled_slot(command: &MedicationCommand, slot: DateTime<Utc>) -> Result<bool> {
    if command.status.is_prn {
        return Ok(false);
    }
    let schedule = &command.schedule;
    let tz = schedule.tz()?;
    let day = slot.with_timezone(&tz).date_naive();
    if day < schedule.start_date
        || schedule.end_date.is_some_and(|end| day > end)
        || !falls_on(schedule.frequency, schedule.start_date, day)
    {
        return Ok(false);
    }
    Ok(schedule
        .parsed_times()?
        .iter()
        .any(|time| resolve_local(&tz, day.and_time(*time)) == Some(slot)))
}

fn falls_on(frequency: Frequency, start: NaiveDate, day: NaiveDate) -> bool {
    let since_start = (day - start).num_days();
    match frequency {
        Frequency::EveryOtherDay => since_start % 2 == 0,
        Frequency::Weekly => since_start % 7 == 0,
        Frequency::OnceDaily
        | Frequency::TwiceDaily
        | Frequency::ThreeTimesDaily
        | Frequency::FourTimesDaily => true,
        Frequency::AsNeeded => false,
    }
}

/// Ambiguous local times take the earlier instant; times inside a DST gap
/// move forward by an hour.
fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|at| at.with_timezone(&Utc))
}
