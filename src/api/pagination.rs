use crate::api::error::ApiError;
use base64::prelude::*;
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;

pub const TASK_PAGE_SIZE: i64 = 20;
pub const CATEGORY_PAGE_SIZE: i64 = 20;
pub const SUBTASK_PAGE_SIZE: i64 = 5;
pub const CURSOR_PAGE_SIZE: i64 = 6;

/// Page-number envelope: total row count plus pointers to the neighboring
/// pages. `next` and `previous` are bare page numbers to feed back through
/// the `page` query parameter, not URLs; null means there is no page on
/// that side. Costs a COUNT query, which the cursor mode avoids.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub count: i64,
    pub next: Option<u32>,
    pub previous: Option<u32>,
    pub results: Vec<T>,
}

/// Validates the raw 1-based `page` parameter against the filtered row
/// count and returns the number with its SQL offset. Non-numeric and
/// out-of-range values are a 404, except page 1 of an empty result which
/// is an empty page.
pub fn page_bounds(page: Option<&str>, page_size: i64, count: i64) -> Result<(u32, i64), ApiError> {
    let invalid = || ApiError::NotFoundDetail("Invalid page.");
    let page: u32 = match page {
        None => 1,
        Some(raw) => raw.trim().parse().map_err(|_| invalid())?,
    };
    if page == 0 {
        return Err(invalid());
    }
    let offset = (i64::from(page) - 1) * page_size;
    if offset >= count && page != 1 {
        return Err(invalid());
    }
    Ok((page, offset))
}

pub fn page_envelope<T>(page: u32, page_size: i64, count: i64, results: Vec<T>) -> Page<T> {
    let has_next = i64::from(page) * page_size < count;
    Page {
        count,
        next: has_next.then(|| page + 1),
        previous: (page > 1).then(|| page - 1),
        results,
    }
}

/// Cursor envelope: no counts and no backward pointer, just an opaque
/// token for the next slice.
#[derive(Debug, Serialize)]
pub struct CursorPage<T> {
    pub next: Option<String>,
    pub results: Vec<T>,
}

/// The cursor encodes the position of the last row handed out as
/// `<created_at micros>:<id>`. The pair is unique and ordering by it keeps
/// pages stable while new rows arrive at the head of the feed.
pub fn encode_cursor(created_at: NaiveDateTime, id: i32) -> String {
    let micros = created_at.and_utc().timestamp_micros();
    BASE64_URL_SAFE_NO_PAD.encode(format!("{micros}:{id}"))
}

pub fn decode_cursor(raw: &str) -> Result<(NaiveDateTime, i32), ApiError> {
    let invalid = || ApiError::NotFoundDetail("Invalid cursor.");
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(raw.trim())
        .map_err(|_| invalid())?;
    let text = String::from_utf8(bytes).map_err(|_| invalid())?;
    let (micros, id) = text.split_once(':').ok_or_else(invalid)?;
    let micros: i64 = micros.parse().map_err(|_| invalid())?;
    let id: i32 = id.parse().map_err(|_| invalid())?;
    let created_at = DateTime::from_timestamp_micros(micros)
        .ok_or_else(invalid)?
        .naive_utc();
    Ok((created_at, id))
}
