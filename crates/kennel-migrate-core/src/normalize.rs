//! Field-level normalizers for legacy string values.
//!
//! None of these fail: unparseable input becomes an empty or absent value and
//! the caller decides whether that is worth an issue.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use time::{Date, Month, Time};

/// Normalized `(date, time)` pair. Both are empty when the input is unusable.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DateTimeParts {
    pub date: String,
    pub time: String,
}

impl DateTimeParts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.date.is_empty()
    }

    /// `YYYY-MM-DDTHH:MM:SS`, midnight when no time was given.
    #[must_use]
    pub fn timestamp(&self) -> Option<String> {
        if self.date.is_empty() {
            return None;
        }
        let time = if self.time.is_empty() { "00:00:00" } else { self.time.as_str() };
        Some(format!("{}T{time}", self.date))
    }
}

fn all_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit())
}

fn calendar_date(year: i32, month: u8, day: u8) -> Option<String> {
    let month = Month::try_from(month).ok()?;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    Some(format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day()))
}

fn expand_two_digit_year(year: i32) -> i32 {
    if year < 70 {
        2000 + year
    } else {
        1900 + year
    }
}

fn parse_date_part(raw: &str) -> Option<String> {
    if raw.contains('-') {
        let mut parts = raw.split('-');
        let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || year.len() != 4 || !all_digits(year) {
            return None;
        }
        if !all_digits(month) || !all_digits(day) {
            return None;
        }
        return calendar_date(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?);
    }

    if raw.contains('.') {
        let mut parts = raw.split('.');
        let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || year.len() != 4 {
            return None;
        }
        if !all_digits(day) || !all_digits(month) || !all_digits(year) {
            return None;
        }
        return calendar_date(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?);
    }

    if raw.contains('/') {
        let mut parts = raw.split('/');
        let (month, day, year) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || !all_digits(month) || !all_digits(day) || !all_digits(year) {
            return None;
        }
        let year: i32 = match year.len() {
            2 => expand_two_digit_year(year.parse().ok()?),
            4 => year.parse().ok()?,
            _ => return None,
        };
        return calendar_date(year, month.parse().ok()?, day.parse().ok()?);
    }

    None
}

/// Parse `HH:MM[:SS]` or `HH.MM` into `HH:MM:SS`. Empty on failure.
#[must_use]
pub fn parse_time(raw: &str) -> String {
    let raw = raw.trim();
    let separator = if raw.contains(':') { ':' } else { '.' };
    let parts: Vec<&str> = raw.split(separator).collect();
    if !(2..=3).contains(&parts.len()) || parts.iter().any(|part| !all_digits(part)) {
        return String::new();
    }
    if separator == '.' && parts.len() != 2 {
        return String::new();
    }

    let parsed: Option<Vec<u8>> = parts.iter().map(|part| part.parse::<u8>().ok()).collect();
    let Some(parsed) = parsed else {
        return String::new();
    };
    let second = parsed.get(2).copied().unwrap_or(0);
    match Time::from_hms(parsed[0], parsed[1], second) {
        Ok(time) => format!("{:02}:{:02}:{:02}", time.hour(), time.minute(), time.second()),
        Err(_) => String::new(),
    }
}

/// Parse ISO `YYYY-MM-DD[( |T)HH:MM[:SS]]`, European `DD.MM.YYYY[ HH:MM[:SS]]`
/// or US `MM/DD/YY`.
#[must_use]
pub fn parse_date_time(raw: &str) -> DateTimeParts {
    let raw = raw.trim();
    if raw.is_empty() {
        return DateTimeParts::default();
    }

    let (date_part, time_part) = match raw.find([' ', 'T']) {
        Some(index) => (&raw[..index], raw[index + 1..].trim()),
        None => (raw, ""),
    };

    let Some(date) = parse_date_part(date_part) else {
        return DateTimeParts::default();
    };

    if time_part.is_empty() {
        return DateTimeParts { date, time: String::new() };
    }

    let time = parse_time(time_part);
    if time.is_empty() {
        return DateTimeParts::default();
    }
    DateTimeParts { date, time }
}

/// Lowercased email, `Some("")` for empty input, `None` when the shape is
/// not `local@domain.tld`.
#[must_use]
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Some(email);
    }
    if email.chars().any(char::is_whitespace) {
        return None;
    }

    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return None;
    }
    if domain.split('.').any(str::is_empty) {
        return None;
    }
    Some(email)
}

/// Keep digits and a leading `+`; a leading `00` becomes `+`.
#[must_use]
pub fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('+') {
        return format!("+{digits}");
    }
    match digits.strip_prefix("00") {
        Some(rest) if !rest.is_empty() => format!("+{rest}"),
        _ => digits,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Flag {
    Yes,
    No,
    Empty,
    Unrecognized,
}

impl Flag {
    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Yes => Some(true),
            Self::No => Some(false),
            Self::Empty | Self::Unrecognized => None,
        }
    }
}

#[must_use]
pub fn parse_flag(raw: &str) -> Flag {
    match raw.trim().to_lowercase().as_str() {
        "" => Flag::Empty,
        "ja" | "j" | "yes" | "y" | "true" | "1" | "x" | "wahr" => Flag::Yes,
        "nein" | "n" | "no" | "false" | "0" | "falsch" => Flag::No,
        _ => Flag::Unrecognized,
    }
}

/// Outcome of two legacy flags that must not both be set.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exclusive {
    First,
    Second,
    Neither,
    Unknown,
    Ambiguous,
}

#[must_use]
pub fn exclusive_flags(first: Flag, second: Flag) -> Exclusive {
    match (first, second) {
        (Flag::Yes, Flag::Yes) => Exclusive::Ambiguous,
        (Flag::Yes, _) => Exclusive::First,
        (_, Flag::Yes) => Exclusive::Second,
        (Flag::No, Flag::No | Flag::Empty) | (Flag::Empty, Flag::No) => Exclusive::Neither,
        _ => Exclusive::Unknown,
    }
}

/// Parse a monetary amount (`12,50`, `12.50`, `-3`, `4 €`) into cents.
#[must_use]
pub fn parse_cents(raw: &str) -> Option<i64> {
    let mut value = raw.trim();
    for suffix in ["€", "EUR", "eur"] {
        value = value.strip_suffix(suffix).unwrap_or(value).trim_end();
    }
    let (negative, value) = match value.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, value),
    };

    let (whole, fraction) = match value.find([',', '.']) {
        Some(index) => (&value[..index], &value[index + 1..]),
        None => (value, ""),
    };
    if !all_digits(whole) || fraction.len() > 2 {
        return None;
    }
    if !fraction.is_empty() && !all_digits(fraction) {
        return None;
    }

    let whole: i64 = whole.parse().ok()?;
    let fraction: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction.parse().ok()?,
    };
    let cents = whole.checked_mul(100)?.checked_add(fraction)?;
    Some(if negative { -cents } else { cents })
}

#[must_use]
pub fn parse_count(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if !all_digits(raw) {
        return None;
    }
    raw.parse().ok()
}

/// Split a multi-valued legacy reference (`"3, 4;5|6"`) into a set.
#[must_use]
pub fn split_relation(raw: &str) -> BTreeSet<String> {
    raw.split([',', ';', '|'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Numeric-aware ordering for legacy keys: `"2" < "10" < "a"`.
#[must_use]
pub fn natural_cmp(lhs: &str, rhs: &str) -> Ordering {
    match (lhs.parse::<u64>(), rhs.parse::<u64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right).then_with(|| lhs.cmp(rhs)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => lhs.cmp(rhs),
    }
}
