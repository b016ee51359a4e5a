//! Anchored monthly usage cycles
//!
//! Usage windows are anchored on the day the tenant was created and
//! projected forward by whole months, independent of any billing-period
//! dates the payment provider reports. A tenant created on Jan 15 cycles
//! on the 15th of every month; a tenant created on Jan 31 cycles on the
//! last valid day of shorter months (Feb 28/29, Apr 30, ...). Boundaries
//! are at UTC midnight of the anchor day.

use time::{Date, Month, OffsetDateTime};

/// `anchor` shifted forward by `months` whole months, day-of-month clamped
/// to the target month's length. Always computed from the anchor date, so
/// clamping in a short month never loses the original anchor day.
fn shift_months(anchor: Date, months: u32) -> Date {
    let total = anchor.year() * 12 + (anchor.month() as i32 - 1) + months as i32;
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12) as u8 + 1;
    let month = match Month::try_from(month_index) {
        Ok(m) => m,
        // month_index is always 1..=12
        Err(_) => Month::January,
    };
    let day = anchor.day().min(month.length(year));
    Date::from_calendar_date(year, month, day).unwrap_or(anchor)
}

fn at_utc_midnight(date: Date) -> OffsetDateTime {
    date.midnight().assume_utc()
}

/// Start of the cycle containing `now`: the largest `anchor + k months`
/// (k >= 0) that is <= `now`.
pub fn cycle_start(anchor: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
    let anchor_date = anchor.date();
    let mut k: u32 = 0;
    while at_utc_midnight(shift_months(anchor_date, k + 1)) <= now {
        k += 1;
    }
    at_utc_midnight(shift_months(anchor_date, k))
}

/// (cycle_start, cycle_end) for the cycle containing `now`. The end is one
/// anchor month after the start and doubles as the reset date.
pub fn cycle_bounds(anchor: OffsetDateTime, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let anchor_date = anchor.date();
    let mut k: u32 = 0;
    while at_utc_midnight(shift_months(anchor_date, k + 1)) <= now {
        k += 1;
    }
    (
        at_utc_midnight(shift_months(anchor_date, k)),
        at_utc_midnight(shift_months(anchor_date, k + 1)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn mid_month_anchor_projects_to_current_month() {
        // Tenant created 2024-01-15, asked on 2024-03-20
        let (start, end) = cycle_bounds(
            datetime!(2024-01-15 09:30 UTC),
            datetime!(2024-03-20 12:00 UTC),
        );
        assert_eq!(start, datetime!(2024-03-15 00:00 UTC));
        assert_eq!(end, datetime!(2024-04-15 00:00 UTC));
    }

    #[test]
    fn now_on_the_anchor_day_starts_a_new_cycle() {
        let (start, end) = cycle_bounds(
            datetime!(2024-01-15 00:00 UTC),
            datetime!(2024-02-15 00:00 UTC),
        );
        assert_eq!(start, datetime!(2024-02-15 00:00 UTC));
        assert_eq!(end, datetime!(2024-03-15 00:00 UTC));
    }

    #[test]
    fn first_cycle_before_one_month_elapses() {
        let (start, end) = cycle_bounds(
            datetime!(2024-01-15 10:00 UTC),
            datetime!(2024-01-20 12:00 UTC),
        );
        assert_eq!(start, datetime!(2024-01-15 00:00 UTC));
        assert_eq!(end, datetime!(2024-02-15 00:00 UTC));
    }

    #[test]
    fn end_of_month_anchor_clamps_in_short_months() {
        // Created Jan 31; February cycle starts on the 29th (2024 is a leap year)
        let start = cycle_start(
            datetime!(2024-01-31 08:00 UTC),
            datetime!(2024-03-05 00:00 UTC),
        );
        assert_eq!(start, datetime!(2024-02-29 00:00 UTC));

        // ...and the clamp does not stick: March resumes on the 31st
        let start = cycle_start(
            datetime!(2024-01-31 08:00 UTC),
            datetime!(2024-04-10 00:00 UTC),
        );
        assert_eq!(start, datetime!(2024-03-31 00:00 UTC));
    }

    #[test]
    fn crosses_year_boundaries() {
        let (start, end) = cycle_bounds(
            datetime!(2023-11-05 00:00 UTC),
            datetime!(2024-01-20 00:00 UTC),
        );
        assert_eq!(start, datetime!(2024-01-05 00:00 UTC));
        assert_eq!(end, datetime!(2024-02-05 00:00 UTC));
    }

    #[test]
    fn stable_within_the_same_day() {
        let anchor = datetime!(2024-01-15 09:30 UTC);
        let a = cycle_start(anchor, datetime!(2024-03-20 00:10 UTC));
        let b = cycle_start(anchor, datetime!(2024-03-20 23:50 UTC));
        assert_eq!(a, b);
    }
}
