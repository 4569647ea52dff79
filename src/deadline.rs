use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

pub const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Accepts full English month names or 3-letter abbreviations, case-insensitive.
/// Returns a 1-based month index.
pub fn month_index(name: &str) -> Option<u32> {
    let t = name.trim();
    if t.len() < 3 {
        return None;
    }
    let lower = t.to_ascii_lowercase();
    for (i, full) in MONTH_NAMES.iter().enumerate() {
        let full_lower = full.to_ascii_lowercase();
        if lower == full_lower || lower == full_lower[..3] {
            return Some(i as u32 + 1);
        }
    }
    None
}

pub fn month_name(index: u32) -> Option<&'static str> {
    if (1..=12).contains(&index) {
        Some(MONTH_NAMES[index as usize - 1])
    } else {
        None
    }
}

/// The period immediately after (month_index, year), rolling December into
/// January of the next year.
pub fn next_period(month_index: u32, year: i32) -> (u32, i32) {
    if month_index == 12 {
        (1, year + 1)
    } else {
        (month_index + 1, year)
    }
}

#[derive(Debug, Clone)]
pub struct MonthlyOverride {
    pub month_index: u32,
    pub year: i32,
    pub lock_date: Option<DateTime<Utc>>,
    pub is_force_open: bool,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub is_lock_enabled: bool,
    pub lock_cutoff_day: u32,
    pub revision_grace_days: i64,
    pub unlock_grant_days: i64,
    pub overrides: Vec<MonthlyOverride>,
}

impl LockSettings {
    pub fn find_override(&self, month_index: u32, year: i32) -> Option<&MonthlyOverride> {
        self.overrides
            .iter()
            .find(|o| o.month_index == month_index && o.year == year)
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            is_lock_enabled: true,
            lock_cutoff_day: 6,
            revision_grace_days: 3,
            unlock_grant_days: 7,
            overrides: Vec::new(),
        }
    }
}

/// Reporting deadline for a (month, year) period.
///
/// An override for the period wins verbatim: admins may set any literal date,
/// including one outside the following month. Without an override the period
/// locks at the end of day `clamp(cutoff_day, 1, 28)` of the *following*
/// month (December rolls into January of the next year).
///
/// Returns `None` when the month is unparseable or the year is missing; the
/// caller must treat that as "not locked" (fail open, never closed).
pub fn resolve_deadline(
    month: &str,
    year: Option<i32>,
    cutoff_day: u32,
    overrides: &[MonthlyOverride],
) -> Option<DateTime<Utc>> {
    let mi = month_index(month)?;
    let year = year?;

    if let Some(ov) = overrides
        .iter()
        .find(|o| o.month_index == mi && o.year == year)
    {
        if let Some(d) = ov.lock_date {
            return Some(d);
        }
    }

    let (nm, ny) = next_period(mi, year);
    let day = cutoff_day.clamp(1, 28);
    let date = NaiveDate::from_ymd_opt(ny, nm, day)?;
    let dt = date.and_hms_milli_opt(23, 59, 59, 999)?;
    Some(Utc.from_utc_datetime(&dt))
}

/// The lock-relevant slice of a plan row.
#[derive(Debug, Clone, Default)]
pub struct PlanLockInput<'a> {
    pub month: &'a str,
    pub year: Option<i32>,
    pub unlock_status: Option<&'a str>,
    pub approved_until: Option<DateTime<Utc>>,
    pub temporary_unlock_expiry: Option<DateTime<Utc>>,
}

/// Whether a plan's period is closed to edits at `now`.
///
/// Decision order: lock disabled; approved unlock grant (absent expiry means
/// an indefinite grant, an expired grant falls through to the deadline
/// check); live temporary unlock from a revision verdict; force-open
/// override; deadline comparison.
pub fn is_locked(plan: &PlanLockInput, settings: &LockSettings, now: DateTime<Utc>) -> bool {
    if !settings.is_lock_enabled {
        return false;
    }

    if plan.unlock_status == Some("approved") {
        match plan.approved_until {
            None => return false,
            Some(until) if now < until => return false,
            Some(_) => {}
        }
    }

    if let Some(expiry) = plan.temporary_unlock_expiry {
        if now < expiry {
            return false;
        }
    }

    if let (Some(mi), Some(year)) = (month_index(plan.month), plan.year) {
        if let Some(ov) = settings.find_override(mi, year) {
            if ov.is_force_open {
                return false;
            }
        }
    }

    match resolve_deadline(
        plan.month,
        plan.year,
        settings.lock_cutoff_day,
        &settings.overrides,
    ) {
        None => false,
        Some(deadline) => now > deadline,
    }
}

/// Grace window granted by a revision verdict.
pub fn revision_unlock_expiry(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now + Duration::days(days)
}
