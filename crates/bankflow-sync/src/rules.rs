//! Field cleaning and derivation rules applied by the normalizer.
//!
//! Every rule is total: malformed input falls back to a default or `None`, never an error.

use bankflow_core::{is_null_like, is_truthy, NA};
use chrono::{Datelike, NaiveDate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCase {
    Keep,
    Title,
    Upper,
    Lower,
}

/// Casing applied to a text column.
pub fn text_case(column: &str) -> TextCase {
    match column {
        "branch_name" | "city" | "manager_name" | "first_name" | "last_name" | "address"
        | "loan_type" | "loan_status" => TextCase::Title,
        "state" | "transaction_type" => TextCase::Upper,
        "email" => TextCase::Lower,
        _ => TextCase::Keep,
    }
}

/// Null-like input becomes `NA`; anything else is trimmed and re-cased.
pub fn clean_text(raw: Option<&str>, case: TextCase) -> String {
    let Some(raw) = raw.filter(|r| !is_null_like(r)) else {
        return NA.to_string();
    };
    let trimmed = raw.trim();
    match case {
        TextCase::Keep => trimmed.to_string(),
        TextCase::Upper => trimmed.to_uppercase(),
        TextCase::Lower => trimmed.to_lowercase(),
        TextCase::Title => title_case(trimmed),
    }
}

/// Upper-cases the first letter of every alphabetic run and lower-cases the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_alpha = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

/// Parses a number after removing currency symbols, thousands separators and whitespace.
pub fn parse_number(raw: Option<&str>) -> Option<f64> {
    let raw = raw.filter(|r| !is_null_like(r))?;
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '₹' | '$' | '€' | '£' | ',') && !c.is_whitespace())
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn clean_number(raw: Option<&str>, default: f64) -> f64 {
    parse_number(raw).unwrap_or(default)
}

/// Maps a two-digit year onto a century relative to `today`: years up to the current
/// two-digit year land in the 2000s, later ones in the 1900s.
pub fn expand_two_digit_year(yy: u32, today: NaiveDate) -> i32 {
    let current_yy = today.year().rem_euclid(100) as u32;
    if yy <= current_yy {
        2000 + yy as i32
    } else {
        1900 + yy as i32
    }
}

/// Accepts `YYYY-MM-DD`, `DD-MM-YYYY`, `MM-DD-YYYY`, `DD-MM-YY`, `MM-DD-YY` and `YY-MM-DD`
/// with `-`, `/` or `.` separators, tried in that order. A time part after `T` or a space is
/// ignored. Results outside `[today.year - 120, today.year + 50]` are rejected.
pub fn parse_date(raw: Option<&str>, today: NaiveDate) -> Option<NaiveDate> {
    let raw = raw.filter(|r| !is_null_like(r))?.trim();
    if raw.eq_ignore_ascii_case(NA) {
        return None;
    }
    let date_part = raw.split(['T', ' ']).next()?;
    let sep = date_part.chars().find(|c| matches!(c, '-' | '/' | '.'))?;
    let parts: Vec<&str> = date_part.split(sep).collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || p.len() > 4 || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    let nums: Vec<u32> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    let lens: Vec<usize> = parts.iter().map(|p| p.len()).collect();
    let short = |idx: usize| lens[idx] <= 2;

    // (year, month, day) candidates in priority order
    let mut candidates: Vec<(i32, u32, u32)> = Vec::new();
    if lens[0] == 4 && short(1) && short(2) {
        candidates.push((nums[0] as i32, nums[1], nums[2]));
    }
    if lens[2] == 4 && short(0) && short(1) {
        candidates.push((nums[2] as i32, nums[1], nums[0]));
        candidates.push((nums[2] as i32, nums[0], nums[1]));
    }
    if lens[2] == 2 && short(0) && short(1) {
        let year = expand_two_digit_year(nums[2], today);
        candidates.push((year, nums[1], nums[0]));
        candidates.push((year, nums[0], nums[1]));
    }
    if lens[0] == 2 && short(1) && short(2) {
        candidates.push((expand_two_digit_year(nums[0], today), nums[1], nums[2]));
    }

    let date = candidates
        .into_iter()
        .find_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))?;
    let year = date.year();
    if year < today.year() - 120 || year > today.year() + 50 {
        return None;
    }
    Some(date)
}

/// Whole years from `dob` to `today`; 0 for future dates or results outside `[0, 120]`.
pub fn age_on(dob: Option<NaiveDate>, today: NaiveDate) -> i64 {
    let Some(dob) = dob else {
        return 0;
    };
    if dob > today {
        return 0;
    }
    let mut age = i64::from(today.year() - dob.year());
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    if (0..=120).contains(&age) {
        age
    } else {
        0
    }
}

/// Whole days since `since`, never negative.
pub fn tenure_days(since: Option<NaiveDate>, today: NaiveDate) -> i64 {
    since
        .map(|d| (today - d).num_days().max(0))
        .unwrap_or(0)
}

pub fn customer_segment(tenure_days: i64) -> &'static str {
    if tenure_days >= 730 {
        "VIP"
    } else if tenure_days >= 180 {
        "Regular"
    } else if tenure_days > 0 {
        "New"
    } else {
        NA
    }
}

pub fn loan_risk_category(amount: f64) -> &'static str {
    if amount > 500_000.0 {
        "High"
    } else if amount > 100_000.0 {
        "Medium"
    } else {
        "Low"
    }
}

pub fn transaction_category(amount: f64) -> &'static str {
    if amount > 10_000.0 {
        "Large"
    } else if amount > 1_000.0 {
        "Medium"
    } else {
        "Small"
    }
}

/// Calendar months between start and end; 0 when the end is missing or precedes the start.
pub fn loan_duration_months(start: NaiveDate, end: Option<NaiveDate>) -> i64 {
    match end {
        Some(end) if end >= start => {
            i64::from(end.year() - start.year()) * 12 + i64::from(end.month())
                - i64::from(start.month())
        }
        _ => 0,
    }
}

pub fn normalize_gender(raw: Option<&str>) -> &'static str {
    match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
        Some("m") | Some("male") => "Male",
        Some("f") | Some("female") => "Female",
        _ => NA,
    }
}

pub fn fraud_flag(raw: Option<&str>) -> bool {
    raw.map(is_truthy).unwrap_or(false)
}

/// Linear-interpolated quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// `[Q1 - 1.5·IQR, Q3 + 1.5·IQR]`, or `None` with fewer than four values or no spread.
pub fn iqr_bounds(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 4 {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    if iqr <= 0.0 {
        return None;
    }
    Some((q1 - 1.5 * iqr, q3 + 1.5 * iqr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn day_first_and_iso_forms_agree() {
        let today = ymd(2024, 6, 1);
        let expected = Some(ymd(2020, 3, 15));
        assert_eq!(parse_date(Some("15-03-2020"), today), expected);
        assert_eq!(parse_date(Some("15/03/2020"), today), expected);
        assert_eq!(parse_date(Some("2020-03-15"), today), expected);
        assert_eq!(parse_date(Some("15.03.2020"), today), expected);
        assert_eq!(parse_date(Some("03/15/2020"), today), expected);
        assert_eq!(parse_date(Some("2020-03-15T08:30:00"), today), expected);
        assert_eq!(parse_date(Some("2020-03-15 08:30"), today), expected);
    }

    #[test]
    fn two_digit_years_use_a_sliding_window() {
        let today = ymd(2024, 6, 1);
        assert_eq!(parse_date(Some("31/12/69"), today), Some(ymd(1969, 12, 31)));
        assert_eq!(parse_date(Some("01/02/24"), today), Some(ymd(2024, 2, 1)));
        assert_eq!(parse_date(Some("01/02/25"), today), Some(ymd(1925, 2, 1)));
        assert_eq!(expand_two_digit_year(0, today), 2000);
    }

    #[test]
    fn invalid_or_out_of_range_dates_are_rejected() {
        let today = ymd(2024, 6, 1);
        assert_eq!(parse_date(Some("31/02/2020"), today), None);
        assert_eq!(parse_date(Some("1850-01-01"), today), None);
        assert_eq!(parse_date(Some("2080-01-01"), today), None);
        assert_eq!(parse_date(Some("2020/03-15"), today), None);
        assert_eq!(parse_date(Some("not a date"), today), None);
        assert_eq!(parse_date(Some("NaT"), today), None);
        assert_eq!(parse_date(None, today), None);
    }

    #[test]
    fn numbers_drop_currency_and_separators() {
        assert_eq!(parse_number(Some("₹1,25,000.50")), Some(125000.5));
        assert_eq!(parse_number(Some(" $ 2,000 ")), Some(2000.0));
        assert_eq!(parse_number(Some("abc")), None);
        assert_eq!(parse_number(Some("inf")), None);
        assert_eq!(clean_number(Some("nan"), 0.0), 0.0);
    }

    #[test]
    fn text_rules_apply_case_and_sentinel() {
        assert_eq!(clean_text(Some("  new DELHI "), TextCase::Title), "New Delhi");
        assert_eq!(clean_text(Some("maharashtra"), TextCase::Upper), "MAHARASHTRA");
        assert_eq!(clean_text(Some("A@B.COM"), TextCase::Lower), "a@b.com");
        assert_eq!(clean_text(Some("<NA>"), TextCase::Keep), "NA");
        assert_eq!(clean_text(None, TextCase::Title), "NA");
        assert_eq!(title_case("o'neil-smith"), "O'Neil-Smith");
    }

    #[test]
    fn derived_fields_bucket_and_clamp() {
        let today = ymd(2024, 6, 1);
        assert_eq!(age_on(Some(ymd(1990, 6, 2)), today), 33);
        assert_eq!(age_on(Some(ymd(1990, 6, 1)), today), 34);
        assert_eq!(age_on(Some(ymd(2030, 1, 1)), today), 0);
        assert_eq!(age_on(Some(ymd(1880, 1, 1)), today), 0);
        assert_eq!(tenure_days(Some(ymd(2024, 7, 1)), today), 0);
        assert_eq!(tenure_days(Some(ymd(2024, 5, 1)), today), 31);
        assert_eq!(customer_segment(730), "VIP");
        assert_eq!(customer_segment(180), "Regular");
        assert_eq!(customer_segment(1), "New");
        assert_eq!(customer_segment(0), "NA");
        assert_eq!(loan_risk_category(500_001.0), "High");
        assert_eq!(loan_risk_category(500_000.0), "Medium");
        assert_eq!(loan_risk_category(100_000.0), "Low");
        assert_eq!(transaction_category(10_000.5), "Large");
        assert_eq!(transaction_category(1_000.0), "Small");
        assert_eq!(
            loan_duration_months(ymd(2020, 11, 20), Some(ymd(2022, 2, 1))),
            15
        );
        assert_eq!(loan_duration_months(ymd(2020, 1, 1), Some(ymd(2019, 1, 1))), 0);
        assert_eq!(loan_duration_months(ymd(2020, 1, 1), None), 0);
    }

    #[test]
    fn gender_and_fraud_flags() {
        assert_eq!(normalize_gender(Some(" M ")), "Male");
        assert_eq!(normalize_gender(Some("female")), "Female");
        assert_eq!(normalize_gender(Some("x")), "NA");
        assert!(fraud_flag(Some("Y")));
        assert!(fraud_flag(Some("1")));
        assert!(!fraud_flag(Some("no")));
        assert!(!fraud_flag(None));
    }

    #[test]
    fn iqr_bounds_need_spread_and_four_values() {
        assert_eq!(iqr_bounds(&[1.0, 2.0, 3.0]), None);
        assert_eq!(iqr_bounds(&[5.0, 5.0, 5.0, 5.0]), None);
        let (lo, hi) = iqr_bounds(&[1.0, 2.0, 3.0, 4.0, 100.0]).expect("bounds");
        // q1 = 2, q3 = 4
        assert_eq!((lo, hi), (-1.0, 7.0));
    }
}
