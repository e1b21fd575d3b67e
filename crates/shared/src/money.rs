//! Money parsing and formatting
//!
//! All amounts are carried internally as integer cents. Gateway wire formats
//! differ: Stripe already reports cents, PayPal NVP reports decimal-dollar
//! strings ("25.00"), so the decimal parser here avoids float round-trips.

/// Parse a decimal amount string ("25.00", "9", "0.5") into cents.
/// Returns None for negative, malformed, or more-than-two-decimal inputs.
pub fn cents_from_decimal(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
        return None;
    }

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if frac.len() > 2 || (whole.is_empty() && frac.is_empty()) {
        return None;
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().ok()?
    };

    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };

    whole.checked_mul(100)?.checked_add(frac_cents)
}

/// Format cents as a decimal-dollar string for gateway wire formats ("2500" -> "25.00").
pub fn decimal_from_cents(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

/// Format cents for human-facing output ("$25.00").
pub fn format_cents(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_from_decimal() {
        assert_eq!(cents_from_decimal("25.00"), Some(2500));
        assert_eq!(cents_from_decimal("25"), Some(2500));
        assert_eq!(cents_from_decimal("0.5"), Some(50));
        assert_eq!(cents_from_decimal("0.05"), Some(5));
        assert_eq!(cents_from_decimal(" 19.99 "), Some(1999));
    }

    #[test]
    fn test_cents_from_decimal_rejects_garbage() {
        assert_eq!(cents_from_decimal(""), None);
        assert_eq!(cents_from_decimal("-5.00"), None);
        assert_eq!(cents_from_decimal("1.234"), None);
        assert_eq!(cents_from_decimal("abc"), None);
        assert_eq!(cents_from_decimal("."), None);
    }

    #[test]
    fn test_decimal_from_cents_round_trip() {
        assert_eq!(decimal_from_cents(2500), "25.00");
        assert_eq!(decimal_from_cents(5), "0.05");
        assert_eq!(cents_from_decimal(&decimal_from_cents(1999)), Some(1999));
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(2500), "$25.00");
        assert_eq!(format_cents(9), "$0.09");
    }
}
