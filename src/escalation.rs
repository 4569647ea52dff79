use chrono::{DateTime, Utc};

pub const LEVEL_STANDARD: &str = "Standard";
pub const LEVEL_LEADER: &str = "Leader";
pub const LEVEL_MANAGEMENT_BOD: &str = "Management_BOD";

pub const ATTENTION_LEVELS: [&str; 3] = [LEVEL_STANDARD, LEVEL_LEADER, LEVEL_MANAGEMENT_BOD];

pub fn is_valid_level(level: &str) -> bool {
    ATTENTION_LEVELS.contains(&level)
}

/// Minimum trimmed explanation length to report or resolve a blocker at a
/// given attention level. Board-level escalations need a fuller writeup.
pub fn min_reason_len(attention_level: &str) -> usize {
    if attention_level == LEVEL_MANAGEMENT_BOD {
        20
    } else {
        10
    }
}

pub fn validate_reason(attention_level: &str, reason: &str) -> Result<(), String> {
    let needed = min_reason_len(attention_level);
    let got = reason.trim().chars().count();
    if got < needed {
        return Err(format!(
            "blocker explanation too short for {}: {} chars (need >= {})",
            attention_level, got, needed
        ));
    }
    Ok(())
}

/// A plan is escalated only while Blocked and raised above Standard.
pub fn is_escalated(status: &str, attention_level: Option<&str>) -> bool {
    status == "Blocked"
        && matches!(attention_level, Some(l) if !l.is_empty() && l != LEVEL_STANDARD)
}

/// Whole days spent in Blocked, 0 for any other status.
pub fn blocked_days(status: &str, updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    if status != "Blocked" {
        return 0;
    }
    let Some(since) = updated_at else {
        return 0;
    };
    let secs = (now - since).num_seconds();
    if secs <= 0 {
        0
    } else {
        secs / 86_400
    }
}

pub fn severity(days: i64) -> &'static str {
    if days > 7 {
        "critical"
    } else if days >= 4 {
        "warning"
    } else {
        "normal"
    }
}
