use crate::api::error::ApiError;
use crate::api::filters::{filtered_tasks, parse_datetime_param, TaskFilterParams};
use crate::api::notify::StatusChange;
use crate::api::pagination::{
    decode_cursor, encode_cursor, page_bounds, page_envelope, CursorPage, Page, CURSOR_PAGE_SIZE,
    TASK_PAGE_SIZE,
};
use crate::api::permissions::can_modify;
use crate::schema::{categories, subtasks, task_categories, tasks, users};
use crate::tables::{NewTask, Status, SubTask, Task, TaskCategory, TaskChanges, User};
use crate::TASKS_API;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::auth::AuthUser;
use super::state::AppState;
use super::subtasks::SubTaskResponse;
use super::{double_option, status_choice, validate_title, AppJson};

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: Option<String>,
    pub deadline: Option<String>,
    #[serde(default)]
    pub categories: Vec<i32>,
}

#[derive(Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub deadline: Option<Option<String>>,
    pub categories: Option<Vec<i32>>,
}

/// Shape returned by create and update: category links as ids.
#[derive(Serialize)]
pub struct TaskWriteResponse {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub owner: Option<i32>,
    pub categories: Vec<i32>,
}

impl TaskWriteResponse {
    fn new(task: Task, category_ids: Vec<i32>) -> Self {
        Self {
            id: task.id,
            title: task.title,
            description: task.description,
            status: task.status,
            deadline: task.deadline,
            created_at: task.created_at,
            owner: task.owner_id,
            categories: category_ids,
        }
    }
}

#[derive(Serialize)]
pub struct TaskListItem {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub owner: Option<i32>,
    pub categories: Vec<i32>,
}

/// Detail view inlines what a client would otherwise fetch separately:
/// the owner's username, live category names, and the subtasks.
#[derive(Serialize)]
pub struct TaskDetailResponse {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub owner: Option<String>,
    pub categories: Vec<String>,
    pub subtasks: Vec<SubTaskResponse>,
}

#[derive(Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub overdue: i64,
}

#[derive(Default, Deserialize)]
pub struct CursorParams {
    pub cursor: Option<String>,
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route(
            format!("/{TASKS_API}/").as_str(),
            get(list_tasks).post(create_task),
        )
        .route(format!("/{TASKS_API}/stats/").as_str(), get(task_stats))
        .route(format!("/{TASKS_API}/my/").as_str(), get(my_tasks))
        .route(
            format!("/{TASKS_API}/:id/").as_str(),
            get(get_task)
                .put(update_task)
                .patch(update_task)
                .delete(delete_task),
        )
}

/// Category ids per task for a page of rows, one query for the whole page.
fn category_links(
    conn: &mut PgConnection,
    task_ids: &[i32],
) -> Result<HashMap<i32, Vec<i32>>, ApiError> {
    let links = task_categories::table
        .filter(task_categories::task_id.eq_any(task_ids))
        .order(task_categories::category_id.asc())
        .load::<TaskCategory>(conn)?;

    let mut grouped: HashMap<i32, Vec<i32>> = HashMap::new();
    for link in links {
        grouped.entry(link.task_id).or_default().push(link.category_id);
    }
    Ok(grouped)
}

fn list_items(rows: Vec<Task>, mut links: HashMap<i32, Vec<i32>>) -> Vec<TaskListItem> {
    rows.into_iter()
        .map(|task| TaskListItem {
            categories: links.remove(&task.id).unwrap_or_default(),
            id: task.id,
            title: task.title,
            description: task.description,
            status: task.status,
            deadline: task.deadline,
            created_at: task.created_at,
            owner: task.owner_id,
        })
        .collect()
}

/// Checks that every requested category id points at a live category and
/// returns the ids deduplicated, keeping first occurrence order.
fn checked_category_ids(
    conn: &mut PgConnection,
    requested: &[i32],
) -> Result<Vec<i32>, ApiError> {
    let mut seen = HashSet::new();
    let ids: Vec<i32> = requested
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();

    if ids.is_empty() {
        return Ok(ids);
    }

    let found: HashSet<i32> = categories::table
        .filter(categories::is_deleted.eq(false))
        .filter(categories::id.eq_any(&ids))
        .select(categories::id)
        .load::<i32>(conn)?
        .into_iter()
        .collect();

    if let Some(missing) = ids.iter().find(|id| !found.contains(id)) {
        return Err(ApiError::field(
            "categories",
            format!("Invalid pk \"{missing}\" - object does not exist."),
        ));
    }

    Ok(ids)
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskFilterParams>,
) -> Result<Json<Page<TaskListItem>>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let count = filtered_tasks(&params)?
        .count()
        .get_result::<i64>(&mut conn)?;
    let (page, offset) = page_bounds(params.page.as_deref(), TASK_PAGE_SIZE, count)?;

    let rows = filtered_tasks(&params)?
        .offset(offset)
        .limit(TASK_PAGE_SIZE)
        .select(Task::as_select())
        .load::<Task>(&mut conn)?;

    let ids: Vec<i32> = rows.iter().map(|task| task.id).collect();
    let links = category_links(&mut conn, &ids)?;

    Ok(Json(page_envelope(
        page,
        TASK_PAGE_SIZE,
        count,
        list_items(rows, links),
    )))
}

async fn create_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppJson(payload): AppJson<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskWriteResponse>), ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let title = validate_title(&payload.title)?;
    let status = match payload.status.as_deref() {
        Some(raw) => status_choice(raw)?,
        None => Default::default(),
    };
    let deadline = payload
        .deadline
        .as_deref()
        .map(|raw| parse_datetime_param("deadline", raw))
        .transpose()?;
    if let Some(deadline) = deadline {
        if deadline <= Utc::now().naive_utc() {
            return Err(ApiError::field(
                "deadline",
                "Deadline cannot be in the past.",
            ));
        }
    }
    let category_ids = checked_category_ids(&mut conn, &payload.categories)?;

    let task = conn.transaction::<Task, DieselError, _>(|conn| {
        let task = diesel::insert_into(tasks::table)
            .values(&NewTask {
                title,
                description: payload.description.trim(),
                status,
                deadline,
                created_at: Utc::now().naive_utc(),
                owner_id: Some(user.id),
            })
            .returning(Task::as_select())
            .get_result::<Task>(conn)?;

        let links: Vec<TaskCategory> = category_ids
            .iter()
            .map(|&category_id| TaskCategory {
                task_id: task.id,
                category_id,
            })
            .collect();
        if !links.is_empty() {
            diesel::insert_into(task_categories::table)
                .values(&links)
                .execute(conn)?;
        }

        Ok(task)
    })?;

    Ok((
        StatusCode::CREATED,
        Json(TaskWriteResponse::new(task, category_ids)),
    ))
}

async fn task_stats(State(state): State<AppState>) -> Result<Json<TaskStats>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let total = tasks::table.count().get_result::<i64>(&mut conn)?;

    // Only statuses that occur appear; a status no task carries has no key
    let by_status: BTreeMap<String, i64> = tasks::table
        .group_by(tasks::status)
        .select((tasks::status, count_star()))
        .load::<(Status, i64)>(&mut conn)?
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count))
        .collect();

    let overdue = tasks::table
        .filter(tasks::deadline.lt(Utc::now().naive_utc()))
        .filter(tasks::status.ne(Status::Done))
        .count()
        .get_result::<i64>(&mut conn)?;

    Ok(Json(TaskStats {
        total,
        by_status,
        overdue,
    }))
}

/// The caller's tasks, newest first, in cursor mode. No COUNT query: one
/// row beyond the page size is fetched to decide whether a next cursor
/// exists, and the cursor pins the position so rows created after the
/// first request cannot shift later pages.
async fn my_tasks(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<CursorParams>,
) -> Result<Json<CursorPage<TaskListItem>>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let mut query = tasks::table
        .filter(tasks::owner_id.eq(user.id))
        .into_boxed();
    if let Some(raw) = params.cursor.as_deref() {
        let (created, id) = decode_cursor(raw)?;
        query = query.filter(
            tasks::created_at
                .lt(created)
                .or(tasks::created_at.eq(created).and(tasks::id.lt(id))),
        );
    }

    let mut rows = query
        .order(tasks::created_at.desc())
        .then_order_by(tasks::id.desc())
        .limit(CURSOR_PAGE_SIZE + 1)
        .select(Task::as_select())
        .load::<Task>(&mut conn)?;

    let has_more = rows.len() as i64 > CURSOR_PAGE_SIZE;
    rows.truncate(CURSOR_PAGE_SIZE as usize);
    let next = if has_more {
        rows.last().map(|task| encode_cursor(task.created_at, task.id))
    } else {
        None
    };

    let ids: Vec<i32> = rows.iter().map(|task| task.id).collect();
    let links = category_links(&mut conn, &ids)?;

    Ok(Json(CursorPage {
        next,
        results: list_items(rows, links),
    }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i32>,
) -> Result<Json<TaskDetailResponse>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let task = tasks::table
        .find(task_id)
        .select(Task::as_select())
        .first::<Task>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    let owner = match task.owner_id {
        Some(owner_id) => users::table
            .find(owner_id)
            .select(users::username)
            .first::<String>(&mut conn)
            .optional()?,
        None => None,
    };

    let category_names = task_categories::table
        .inner_join(categories::table)
        .filter(task_categories::task_id.eq(task.id))
        .filter(categories::is_deleted.eq(false))
        .select(categories::name)
        .order(categories::name.asc())
        .load::<String>(&mut conn)?;

    let subtask_rows = subtasks::table
        .filter(subtasks::task_id.eq(task.id))
        .order(subtasks::created_at.desc())
        .then_order_by(subtasks::id.desc())
        .select(SubTask::as_select())
        .load::<SubTask>(&mut conn)?;

    Ok(Json(TaskDetailResponse {
        id: task.id,
        title: task.title,
        description: task.description,
        status: task.status,
        deadline: task.deadline,
        created_at: task.created_at,
        owner,
        categories: category_names,
        subtasks: subtask_rows.into_iter().map(Into::into).collect(),
    }))
}

async fn update_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(task_id): Path<i32>,
    AppJson(payload): AppJson<UpdateTaskRequest>,
) -> Result<Json<TaskWriteResponse>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let existing = tasks::table
        .find(task_id)
        .select(Task::as_select())
        .first::<Task>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    if !can_modify(existing.owner_id, &user) {
        return Err(ApiError::Forbidden);
    }

    let title = payload.title.as_deref().map(validate_title).transpose()?;
    let status = payload.status.as_deref().map(status_choice).transpose()?;
    let deadline = match payload.deadline.as_ref() {
        None => None,
        Some(None) => Some(None),
        Some(Some(raw)) => Some(Some(parse_datetime_param("deadline", raw)?)),
    };
    let category_ids = match payload.categories.as_deref() {
        Some(requested) => Some(checked_category_ids(&mut conn, requested)?),
        None => None,
    };

    let old_status = existing.status;
    let changes = TaskChanges {
        title,
        description: payload.description.as_deref().map(str::trim),
        status,
        deadline,
    };

    let (task, linked) = conn.transaction::<(Task, Vec<i32>), DieselError, _>(|conn| {
        let task = if changes.is_noop() {
            existing.clone()
        } else {
            diesel::update(tasks::table.find(existing.id))
                .set(&changes)
                .returning(Task::as_select())
                .get_result::<Task>(conn)?
        };

        let linked = match &category_ids {
            Some(ids) => {
                diesel::delete(
                    task_categories::table.filter(task_categories::task_id.eq(task.id)),
                )
                .execute(conn)?;
                let links: Vec<TaskCategory> = ids
                    .iter()
                    .map(|&category_id| TaskCategory {
                        task_id: task.id,
                        category_id,
                    })
                    .collect();
                if !links.is_empty() {
                    diesel::insert_into(task_categories::table)
                        .values(&links)
                        .execute(conn)?;
                }
                ids.clone()
            }
            None => task_categories::table
                .filter(task_categories::task_id.eq(task.id))
                .order(task_categories::category_id.asc())
                .select(task_categories::category_id)
                .load::<i32>(conn)?,
        };

        Ok((task, linked))
    })?;

    if task.status != old_status {
        queue_status_notification(&state, &mut conn, &task, old_status)?;
    }

    Ok(Json(TaskWriteResponse::new(task, linked)))
}

/// Emails the owner after a status change has been committed. Delivery runs
/// on a blocking worker so the response never waits on SMTP.
fn queue_status_notification(
    state: &AppState,
    conn: &mut PgConnection,
    task: &Task,
    old_status: Status,
) -> Result<(), ApiError> {
    let Some(owner_id) = task.owner_id else {
        return Ok(());
    };
    let Some(owner) = users::table
        .find(owner_id)
        .select(User::as_select())
        .first::<User>(conn)
        .optional()?
    else {
        return Ok(());
    };
    if owner.email.is_empty() {
        return Ok(());
    }

    let mailer = Arc::clone(&state.mailer);
    let task_id = task.id;
    let title = task.title.clone();
    let new_status = task.status;
    tokio::task::spawn_blocking(move || {
        mailer.send_status_change(
            &owner.email,
            &StatusChange {
                task_id,
                task_title: &title,
                username: &owner.username,
                old_status,
                new_status,
            },
        );
    });

    Ok(())
}

async fn delete_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(task_id): Path<i32>,
) -> Result<StatusCode, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let existing = tasks::table
        .find(task_id)
        .select(Task::as_select())
        .first::<Task>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    if !can_modify(existing.owner_id, &user) {
        return Err(ApiError::Forbidden);
    }

    // Subtasks and category links go with it via ON DELETE CASCADE
    diesel::delete(tasks::table.find(existing.id)).execute(&mut conn)?;

    Ok(StatusCode::NO_CONTENT)
}
