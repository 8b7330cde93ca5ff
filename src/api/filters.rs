use crate::api::error::ApiError;
use crate::schema::{subtasks, tasks};
use crate::tables::Status;
use chrono::{NaiveDate, NaiveDateTime};
use diesel::dsl::sql;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::Bool;
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;

pub type BoxedTaskQuery = tasks::BoxedQuery<'static, Pg>;
pub type BoxedSubTaskQuery = subtasks::BoxedQuery<'static, Pg>;

lazy_static! {
    /// Weekday names to ISO numbers (Monday = 1 .. Sunday = 7). English
    /// abbreviations and full names plus Ukrainian and Russian full names.
    static ref WEEKDAYS: HashMap<&'static str, u8> = HashMap::from([
        ("mon", 1),
        ("monday", 1),
        ("tue", 2),
        ("tuesday", 2),
        ("wed", 3),
        ("wednesday", 3),
        ("thu", 4),
        ("thursday", 4),
        ("fri", 5),
        ("friday", 5),
        ("sat", 6),
        ("saturday", 6),
        ("sun", 7),
        ("sunday", 7),
        ("понеділок", 1),
        ("вівторок", 2),
        ("середа", 3),
        ("четвер", 4),
        ("п'ятниця", 5),
        ("субота", 6),
        ("неділя", 7),
        ("понедельник", 1),
        ("вторник", 2),
        ("среда", 3),
        ("четверг", 4),
        ("пятница", 5),
        ("суббота", 6),
        ("воскресенье", 7),
    ]);
}

/// Resolves a weekday name to its ISO number, falling back to the first
/// three characters so full English names also match their abbreviation.
/// Unknown names return `None` and the caller skips the filter.
pub fn weekday_number(name: &str) -> Option<u8> {
    let key = name.trim().to_lowercase();
    if key.is_empty() {
        return None;
    }
    WEEKDAYS.get(key.as_str()).copied().or_else(|| {
        let prefix: String = key.chars().take(3).collect();
        WEEKDAYS.get(prefix.as_str()).copied()
    })
}

/// Accepted timestamp shapes for the deadline range bounds. A bare date
/// means midnight at the start of that day.
pub fn parse_datetime_param(field: &'static str, value: &str) -> Result<NaiveDateTime, ApiError> {
    let value = value.trim();
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(parsed) = date.and_hms_opt(0, 0, 0) {
            return Ok(parsed);
        }
    }
    Err(ApiError::field(field, "Enter a valid date/time."))
}

/// Escapes LIKE wildcards so user input only ever matches literally.
pub fn ilike_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Allow-listed `ordering` values. Anything not in the list falls back to
/// newest-first, it is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    CreatedAtAsc,
    CreatedAtDesc,
    DeadlineAsc,
    DeadlineDesc,
}

impl Ordering {
    pub fn parse(value: Option<&str>) -> Ordering {
        match value.map(str::trim) {
            Some("created_at") => Ordering::CreatedAtAsc,
            Some("-created_at") => Ordering::CreatedAtDesc,
            Some("deadline") => Ordering::DeadlineAsc,
            Some("-deadline") => Ordering::DeadlineDesc,
            _ => Ordering::CreatedAtDesc,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskFilterParams {
    pub status: Option<String>,
    pub deadline_after: Option<String>,
    pub deadline_before: Option<String>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub weekday: Option<String>,
    // Raw string; non-numeric values 404 like out-of-range pages
    pub page: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubTaskFilterParams {
    pub status: Option<String>,
    pub task_title: Option<String>,
    pub deadline_after: Option<String>,
    pub deadline_before: Option<String>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub page: Option<String>,
}

pub fn filtered_tasks(params: &TaskFilterParams) -> Result<BoxedTaskQuery, ApiError> {
    let mut query = tasks::table.into_boxed();

    // Unknown status values are ignored rather than rejected
    if let Some(raw) = params.status.as_deref() {
        if let Some(status) = Status::parse(raw) {
            query = query.filter(tasks::status.eq(status));
        }
    }
    if let Some(raw) = params.deadline_after.as_deref() {
        let bound = parse_datetime_param("deadline_after", raw)?;
        query = query.filter(tasks::deadline.ge(bound));
    }
    if let Some(raw) = params.deadline_before.as_deref() {
        let bound = parse_datetime_param("deadline_before", raw)?;
        query = query.filter(tasks::deadline.le(bound));
    }
    if let Some(needle) = params.search.as_deref() {
        let needle = needle.trim();
        if !needle.is_empty() {
            let pattern = ilike_pattern(needle);
            query = query.filter(
                tasks::title
                    .ilike(pattern.clone())
                    .or(tasks::description.ilike(pattern)),
            );
        }
    }
    if let Some(name) = params.weekday.as_deref() {
        // The number comes from the allow-list map, never from the request
        if let Some(number) = weekday_number(name) {
            query = query.filter(sql::<Bool>(&format!(
                "EXTRACT(ISODOW FROM deadline) = {number}"
            )));
        }
    }

    Ok(apply_task_ordering(query, params.ordering.as_deref()))
}

fn apply_task_ordering(query: BoxedTaskQuery, ordering: Option<&str>) -> BoxedTaskQuery {
    match Ordering::parse(ordering) {
        Ordering::CreatedAtAsc => query
            .order(tasks::created_at.asc())
            .then_order_by(tasks::id.asc()),
        Ordering::CreatedAtDesc => query
            .order(tasks::created_at.desc())
            .then_order_by(tasks::id.desc()),
        Ordering::DeadlineAsc => query
            .order(tasks::deadline.asc())
            .then_order_by(tasks::id.asc()),
        Ordering::DeadlineDesc => query
            .order(tasks::deadline.desc())
            .then_order_by(tasks::id.desc()),
    }
}

pub fn filtered_subtasks(params: &SubTaskFilterParams) -> Result<BoxedSubTaskQuery, ApiError> {
    let mut query = subtasks::table.into_boxed();

    if let Some(raw) = params.status.as_deref() {
        if let Some(status) = Status::parse(raw) {
            query = query.filter(subtasks::status.eq(status));
        }
    }
    if let Some(title) = params.task_title.as_deref() {
        let title = title.trim();
        if !title.is_empty() {
            let pattern = ilike_pattern(title);
            query = query.filter(
                subtasks::task_id.eq_any(
                    tasks::table
                        .filter(tasks::title.ilike(pattern))
                        .select(tasks::id),
                ),
            );
        }
    }
    if let Some(raw) = params.deadline_after.as_deref() {
        let bound = parse_datetime_param("deadline_after", raw)?;
        query = query.filter(subtasks::deadline.ge(bound));
    }
    if let Some(raw) = params.deadline_before.as_deref() {
        let bound = parse_datetime_param("deadline_before", raw)?;
        query = query.filter(subtasks::deadline.le(bound));
    }
    if let Some(needle) = params.search.as_deref() {
        let needle = needle.trim();
        if !needle.is_empty() {
            let pattern = ilike_pattern(needle);
            query = query.filter(
                subtasks::title
                    .ilike(pattern.clone())
                    .or(subtasks::description.ilike(pattern)),
            );
        }
    }

    Ok(apply_subtask_ordering(query, params.ordering.as_deref()))
}

fn apply_subtask_ordering(query: BoxedSubTaskQuery, ordering: Option<&str>) -> BoxedSubTaskQuery {
    match Ordering::parse(ordering) {
        Ordering::CreatedAtAsc => query
            .order(subtasks::created_at.asc())
            .then_order_by(subtasks::id.asc()),
        Ordering::CreatedAtDesc => query
            .order(subtasks::created_at.desc())
            .then_order_by(subtasks::id.desc()),
        Ordering::DeadlineAsc => query
            .order(subtasks::deadline.asc())
            .then_order_by(subtasks::id.asc()),
        Ordering::DeadlineDesc => query
            .order(subtasks::deadline.desc())
            .then_order_by(subtasks::id.desc()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weekday_english_names_and_abbreviations() {
        assert_eq!(weekday_number("monday"), Some(1));
        assert_eq!(weekday_number("Mon"), Some(1));
        assert_eq!(weekday_number("THURSDAY"), Some(4));
        assert_eq!(weekday_number(" fri "), Some(5));
        assert_eq!(weekday_number("sunday"), Some(7));
    }

    #[test]
    fn test_weekday_cyrillic_names() {
        assert_eq!(weekday_number("середа"), Some(3));
        assert_eq!(weekday_number("П'ятниця"), Some(5));
        assert_eq!(weekday_number("воскресенье"), Some(7));
        assert_eq!(weekday_number("Понедельник"), Some(1));
    }

    #[test]
    fn test_weekday_unknown_names() {
        assert_eq!(weekday_number("someday"), None);
        assert_eq!(weekday_number(""), None);
        assert_eq!(weekday_number("8"), None);
    }

    #[test]
    fn test_parse_datetime_param_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        assert_eq!(
            parse_datetime_param("deadline_after", "2025-03-09T14:30:00").unwrap(),
            expected
        );
        assert_eq!(
            parse_datetime_param("deadline_after", "2025-03-09 14:30:00").unwrap(),
            expected
        );
        assert_eq!(
            parse_datetime_param("deadline_after", "2025-03-09T14:30:00Z").unwrap(),
            expected
        );

        let midnight = NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            parse_datetime_param("deadline_after", "2025-03-09").unwrap(),
            midnight
        );
    }

    #[test]
    fn test_parse_datetime_param_rejects_garbage() {
        let err = parse_datetime_param("deadline_before", "next tuesday").unwrap_err();
        let ApiError::Validation(fields) = err else {
            panic!("expected a validation error");
        };
        assert!(fields.contains_key("deadline_before"));
    }

    #[test]
    fn test_ilike_pattern_escapes_wildcards() {
        assert_eq!(ilike_pattern("buy milk"), "%buy milk%");
        assert_eq!(ilike_pattern("100%"), "%100\\%%");
        assert_eq!(ilike_pattern("a_b"), "%a\\_b%");
        assert_eq!(ilike_pattern("back\\slash"), "%back\\\\slash%");
    }

    #[test]
    fn test_ordering_allow_list() {
        assert_eq!(Ordering::parse(Some("created_at")), Ordering::CreatedAtAsc);
        assert_eq!(Ordering::parse(Some("-created_at")), Ordering::CreatedAtDesc);
        assert_eq!(Ordering::parse(Some("deadline")), Ordering::DeadlineAsc);
        assert_eq!(Ordering::parse(Some("-deadline")), Ordering::DeadlineDesc);
        // Unknown columns fall back to the default instead of erroring
        assert_eq!(Ordering::parse(Some("owner__email")), Ordering::CreatedAtDesc);
        assert_eq!(Ordering::parse(Some("id; DROP TABLE")), Ordering::CreatedAtDesc);
        assert_eq!(Ordering::parse(None), Ordering::CreatedAtDesc);
    }

    #[test]
    fn test_filtered_tasks_rejects_bad_bounds_only() {
        let params = TaskFilterParams {
            status: Some("mystery".to_string()),
            weekday: Some("someday".to_string()),
            ..TaskFilterParams::default()
        };
        // Unknown status and weekday are silently ignored
        assert!(filtered_tasks(&params).is_ok());

        let params = TaskFilterParams {
            deadline_after: Some("not-a-date".to_string()),
            ..TaskFilterParams::default()
        };
        assert!(filtered_tasks(&params).is_err());
    }
}
