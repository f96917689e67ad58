//! 5-field cron evaluation at minute resolution.
//!
//! Fields: minute, hour, day-of-month, month, day-of-week (0 = Sunday).
//! Supported syntax per field: `*`, `*/n`, `n`, `n,m,...`, `n-m`.
//! Ranges wrap: an hour field of `22-5` matches hours >= 22 or < 6.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Check one field against a value. Ranges with `start > end` wrap
/// around the field's domain.
fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
        return false;
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                let hit = if start <= end {
                    value >= start && value <= end
                } else {
                    // Overnight-style wrap: 22-5 == >=22 or <=5.
                    value >= start || value <= end
                };
                if hit {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Whether a UTC instant matches a 5-field cron expression.
/// Malformed expressions never match.
pub fn cron_matches(cron: &str, at: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], at.minute())
        && field_matches(fields[1], at.hour())
        && field_matches(fields[2], at.day())
        && field_matches(fields[3], at.month())
        && field_matches(fields[4], at.weekday().num_days_from_sunday())
}

/// Validate a cron expression shape without evaluating it.
pub fn validate_cron(cron: &str) -> Result<(), String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "expected 5 cron fields, got {} in '{cron}'",
            fields.len()
        ));
    }
    for field in fields {
        let ok = field == "*"
            || field
                .strip_prefix("*/")
                .map(|n| n.parse::<u32>().map(|n| n > 0).unwrap_or(false))
                .unwrap_or_else(|| {
                    field.split(',').all(|part| match part.split_once('-') {
                        Some((a, b)) => a.parse::<u32>().is_ok() && b.parse::<u32>().is_ok(),
                        None => part.parse::<u32>().is_ok(),
                    })
                });
        if !ok {
            return Err(format!("malformed cron field '{field}' in '{cron}'"));
        }
    }
    Ok(())
}
