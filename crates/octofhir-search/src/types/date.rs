//! Date search parameter implementation.
//!
//! Date search supports the following prefixes:
//! - eq: equal (default) - within the precision range
//! - ne: not equal - outside the precision range
//! - gt: at or after the upper bound
//! - ge: at or after the lower bound
//! - lt: before the lower bound
//! - le: before the upper bound
//!
//! Date precision is determined by the input format:
//! - Year: 2023 -> [2023-01-01, 2024-01-01)
//! - Month: 2023-01 -> [2023-01-01, 2023-02-01)
//! - Day: 2023-01-15 -> [2023-01-15, 2023-01-16)
//! - RFC 3339 instant: compared with the plain operator
//!
//! Partial dates keep these range semantics everywhere a date leaf is
//! compiled, chain and `_has` leaves included: `eq2000-01-01` binds both
//! bounds and `gt` compares against the upper bound. Only full instants map
//! a prefix straight onto its SQL operator.
//!
//! Anything else never matches.

use crate::parameters::SearchPrefix;
use crate::sql_builder::{Predicate, SqlBuilderError, SqlParam};
use time::format_description::well_known::Rfc3339;
use time::{Date, Duration, Month, OffsetDateTime, Time};

/// Represents a date range based on precision. Instants have `start == end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl DateRange {
    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }
}

/// Build a date predicate for a `[prefix]date` value.
pub fn date_predicate(column: &str, value: &str, start: usize) -> Predicate {
    let (prefix, raw) = SearchPrefix::split(value);
    match parse_date_range(raw) {
        Ok(range) => range_predicate(column, prefix, &range, start),
        Err(e) => {
            tracing::debug!(column, value, error = %e, "unmatchable date value");
            Predicate::always_false()
        }
    }
}

fn range_predicate(column: &str, prefix: SearchPrefix, range: &DateRange, p: usize) -> Predicate {
    let start_ts = SqlParam::Timestamp(format_datetime(&range.start));
    let end_ts = SqlParam::Timestamp(format_datetime(&range.end));

    if range.is_instant() {
        return Predicate::new(
            format!("{column} {} ${p}", prefix.sql_operator()),
            vec![start_ts],
        );
    }

    match prefix {
        SearchPrefix::Eq => Predicate::new(
            format!("({column} >= ${p} AND {column} < ${})", p + 1),
            vec![start_ts, end_ts],
        ),
        SearchPrefix::Ne => Predicate::new(
            format!("({column} < ${p} OR {column} >= ${})", p + 1),
            vec![start_ts, end_ts],
        ),
        SearchPrefix::Gt => Predicate::new(format!("{column} >= ${p}"), vec![end_ts]),
        SearchPrefix::Ge => Predicate::new(format!("{column} >= ${p}"), vec![start_ts]),
        SearchPrefix::Lt => Predicate::new(format!("{column} < ${p}"), vec![start_ts]),
        SearchPrefix::Le => Predicate::new(format!("{column} < ${p}"), vec![end_ts]),
    }
}

/// Parse a date string into a range based on precision.
///
/// Supported formats:
/// - Year: 2023
/// - Year-Month: 2023-01
/// - Date: 2023-01-15
/// - RFC 3339: 2023-01-15T10:30:00Z or 2023-01-15T10:30:00+05:00
pub fn parse_date_range(date_str: &str) -> Result<DateRange, SqlBuilderError> {
    let trimmed = date_str.trim();
    let invalid = |what: &str| SqlBuilderError::InvalidSearchValue(format!("Invalid {what}: {trimmed}"));
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    let midnight = |year: i32, month: Month, day: u8| {
        Date::from_calendar_date(year, month, day)
            .map(|d| d.with_time(Time::MIDNIGHT).assume_utc())
            .map_err(|e| SqlBuilderError::InvalidSearchValue(format!("Invalid date: {e}")))
    };

    // Year only: 2023
    if trimmed.len() == 4 && all_digits(trimmed) {
        let year: i32 = trimmed.parse().map_err(|_| invalid("year"))?;
        return Ok(DateRange {
            start: midnight(year, Month::January, 1)?,
            end: midnight(year + 1, Month::January, 1)?,
        });
    }

    // Year-Month: 2023-01
    if trimmed.len() == 7
        && let Some((y, m)) = trimmed.split_once('-')
        && all_digits(y)
        && all_digits(m)
    {
        let year: i32 = y.parse().map_err(|_| invalid("year"))?;
        let month_num: u8 = m.parse().map_err(|_| invalid("month"))?;
        let month = Month::try_from(month_num).map_err(|_| invalid("month"))?;
        let end = if month == Month::December {
            midnight(year + 1, Month::January, 1)?
        } else {
            midnight(year, month.next(), 1)?
        };
        return Ok(DateRange {
            start: midnight(year, month, 1)?,
            end,
        });
    }

    // Full date: 2023-01-15
    if trimmed.len() == 10 && !trimmed.contains('T') {
        let date = Date::parse(
            trimmed,
            time::macros::format_description!("[year]-[month]-[day]"),
        )
        .map_err(|e| SqlBuilderError::InvalidSearchValue(format!("Invalid date: {e}")))?;

        let start = date.with_time(Time::MIDNIGHT).assume_utc();
        return Ok(DateRange {
            start,
            end: start + Duration::days(1),
        });
    }

    let instant = OffsetDateTime::parse(trimmed, &Rfc3339)
        .map_err(|e| SqlBuilderError::InvalidSearchValue(format!("Invalid datetime: {e}")))?;
    Ok(DateRange {
        start: instant,
        end: instant,
    })
}

/// Format a datetime as RFC 3339.
pub(crate) fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(&Rfc3339).unwrap_or_else(|_| dt.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_year() {
        let range = parse_date_range("2023").unwrap();
        assert_eq!(format_datetime(&range.start), "2023-01-01T00:00:00Z");
        assert_eq!(format_datetime(&range.end), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_parse_year_month() {
        let range = parse_date_range("2023-12").unwrap();
        assert_eq!(format_datetime(&range.start), "2023-12-01T00:00:00Z");
        assert_eq!(format_datetime(&range.end), "2024-01-01T00:00:00Z");

        let range = parse_date_range("2023-02").unwrap();
        assert_eq!(format_datetime(&range.end), "2023-03-01T00:00:00Z");
    }

    #[test]
    fn test_parse_date() {
        let range = parse_date_range("2023-01-15").unwrap();
        assert_eq!(format_datetime(&range.start), "2023-01-15T00:00:00Z");
        assert_eq!(format_datetime(&range.end), "2023-01-16T00:00:00Z");
    }

    #[test]
    fn test_parse_instant() {
        let range = parse_date_range("2023-01-15T10:30:00Z").unwrap();
        assert!(range.is_instant());
        assert_eq!(format_datetime(&range.start), "2023-01-15T10:30:00Z");
    }

    #[test]
    fn test_date_eq_uses_range() {
        let pred = date_predicate("birth_date", "2023-01-15", 1);
        assert_eq!(pred.sql, "(birth_date >= $1 AND birth_date < $2)");
        assert_eq!(
            pred.params,
            vec![
                SqlParam::Timestamp("2023-01-15T00:00:00Z".into()),
                SqlParam::Timestamp("2023-01-16T00:00:00Z".into()),
            ]
        );
    }

    #[test]
    fn test_date_prefixes() {
        let pred = date_predicate("birth_date", "gt2023", 3);
        assert_eq!(pred.sql, "birth_date >= $3");
        assert_eq!(pred.params, vec![SqlParam::Timestamp("2024-01-01T00:00:00Z".into())]);

        let pred = date_predicate("birth_date", "lt2023", 1);
        assert_eq!(pred.sql, "birth_date < $1");
        assert_eq!(pred.params, vec![SqlParam::Timestamp("2023-01-01T00:00:00Z".into())]);

        let pred = date_predicate("birth_date", "ne2023-05", 1);
        assert_eq!(pred.sql, "(birth_date < $1 OR birth_date >= $2)");
    }

    #[test]
    fn test_date_instant_uses_plain_operator() {
        let pred = date_predicate("last_updated", "ge2024-03-01T12:00:00Z", 2);
        assert_eq!(pred.sql, "last_updated >= $2");
        assert_eq!(pred.arg_count(), 1);
    }

    #[test]
    fn test_invalid_date_matches_nothing() {
        assert!(date_predicate("birth_date", "yesterday", 1).is_always_false());
        assert!(date_predicate("birth_date", "2023-13", 1).is_always_false());
        assert!(date_predicate("birth_date", "2023-01-15T10:30", 1).is_always_false());
    }
}
