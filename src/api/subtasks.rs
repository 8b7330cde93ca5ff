use crate::api::error::ApiError;
use crate::api::filters::{filtered_subtasks, parse_datetime_param, SubTaskFilterParams};
use crate::api::pagination::{page_bounds, page_envelope, Page, SUBTASK_PAGE_SIZE};
use crate::api::permissions::can_modify;
use crate::schema::{subtasks, tasks};
use crate::tables::{NewSubTask, SubTask, SubTaskChanges};
use crate::SUBTASKS_API;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::auth::AuthUser;
use super::state::AppState;
use super::{double_option, status_choice, validate_title, AppJson};

#[derive(Deserialize)]
pub struct CreateSubTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: Option<String>,
    pub deadline: Option<String>,
    pub task: i32,
}

#[derive(Default, Deserialize)]
pub struct UpdateSubTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub deadline: Option<Option<String>>,
}

#[derive(Serialize)]
pub struct SubTaskResponse {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: crate::tables::Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub task: i32,
}

impl From<SubTask> for SubTaskResponse {
    fn from(subtask: SubTask) -> Self {
        Self {
            id: subtask.id,
            title: subtask.title,
            description: subtask.description,
            status: subtask.status,
            deadline: subtask.deadline,
            created_at: subtask.created_at,
            task: subtask.task_id,
        }
    }
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route(
            format!("/{SUBTASKS_API}/").as_str(),
            get(list_subtasks).post(create_subtask),
        )
        .route(
            format!("/{SUBTASKS_API}/:id/").as_str(),
            get(get_subtask)
                .put(update_subtask)
                .patch(update_subtask)
                .delete(delete_subtask),
        )
}

async fn list_subtasks(
    State(state): State<AppState>,
    Query(params): Query<SubTaskFilterParams>,
) -> Result<Json<Page<SubTaskResponse>>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let count = filtered_subtasks(&params)?
        .count()
        .get_result::<i64>(&mut conn)?;
    let (page, offset) = page_bounds(params.page.as_deref(), SUBTASK_PAGE_SIZE, count)?;

    let rows = filtered_subtasks(&params)?
        .offset(offset)
        .limit(SUBTASK_PAGE_SIZE)
        .select(SubTask::as_select())
        .load::<SubTask>(&mut conn)?;

    let results = rows.into_iter().map(Into::into).collect();
    Ok(Json(page_envelope(page, SUBTASK_PAGE_SIZE, count, results)))
}

async fn create_subtask(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppJson(payload): AppJson<CreateSubTaskRequest>,
) -> Result<(StatusCode, Json<SubTaskResponse>), ApiError> {
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

    let parent_exists = diesel::select(diesel::dsl::exists(
        tasks::table.filter(tasks::id.eq(payload.task)),
    ))
    .get_result::<bool>(&mut conn)?;
    if !parent_exists {
        return Err(ApiError::field(
            "task",
            format!("Invalid pk \"{}\" - object does not exist.", payload.task),
        ));
    }

    let subtask = diesel::insert_into(subtasks::table)
        .values(&NewSubTask {
            title,
            description: payload.description.trim(),
            status,
            deadline,
            created_at: Utc::now().naive_utc(),
            task_id: payload.task,
            owner_id: Some(user.id),
        })
        .returning(SubTask::as_select())
        .get_result::<SubTask>(&mut conn)?;

    Ok((StatusCode::CREATED, Json(subtask.into())))
}

async fn get_subtask(
    State(state): State<AppState>,
    Path(subtask_id): Path<i32>,
) -> Result<Json<SubTaskResponse>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let subtask = subtasks::table
        .find(subtask_id)
        .select(SubTask::as_select())
        .first::<SubTask>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(subtask.into()))
}

async fn update_subtask(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(subtask_id): Path<i32>,
    AppJson(payload): AppJson<UpdateSubTaskRequest>,
) -> Result<Json<SubTaskResponse>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let existing = subtasks::table
        .find(subtask_id)
        .select(SubTask::as_select())
        .first::<SubTask>(&mut conn)
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

    let changes = SubTaskChanges {
        title,
        description: payload.description.as_deref().map(str::trim),
        status,
        deadline,
    };
    if changes.is_noop() {
        return Ok(Json(existing.into()));
    }

    let subtask = diesel::update(subtasks::table.find(existing.id))
        .set(&changes)
        .returning(SubTask::as_select())
        .get_result::<SubTask>(&mut conn)?;

    Ok(Json(subtask.into()))
}

async fn delete_subtask(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(subtask_id): Path<i32>,
) -> Result<StatusCode, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let existing = subtasks::table
        .find(subtask_id)
        .select(SubTask::as_select())
        .first::<SubTask>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    if !can_modify(existing.owner_id, &user) {
        return Err(ApiError::Forbidden);
    }

    diesel::delete(subtasks::table.find(existing.id)).execute(&mut conn)?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::create_user;
    use crate::tables::{NewTask, Status, Task, User};
    use uuid::Uuid;

    fn insert_task(conn: &mut PgConnection, title: &str, owner: &User) -> Task {
        diesel::insert_into(tasks::table)
            .values(&NewTask {
                title,
                description: "",
                status: Status::New,
                deadline: None,
                created_at: Utc::now().naive_utc(),
                owner_id: Some(owner.id),
            })
            .returning(Task::as_select())
            .get_result::<Task>(conn)
            .expect("insert parent task")
    }

    #[tokio::test]
    async fn test_subtask_crud_and_ownership() {
        let Some(state) = crate::test_utils::try_state() else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let mut conn = state.pool.get().expect("pool");

        let suffix = Uuid::new_v4().simple().to_string();
        let owner = create_user(
            &mut conn,
            &format!("sub_owner_{suffix}"),
            &format!("sub_owner_{suffix}@example.com"),
            "plum-orchard-9",
            "",
            "",
            false,
        )
        .expect("create owner");
        let stranger = create_user(
            &mut conn,
            &format!("sub_other_{suffix}"),
            &format!("sub_other_{suffix}@example.com"),
            "plum-orchard-9",
            "",
            "",
            false,
        )
        .expect("create stranger");

        let parent = insert_task(&mut conn, &format!("sub_parent_{suffix}"), &owner);

        // Create under the parent
        let (status, created) = create_subtask(
            State(state.clone()),
            AuthUser(owner.clone()),
            AppJson(CreateSubTaskRequest {
                title: format!("sub_item_{suffix}"),
                description: "step one".to_string(),
                status: None,
                deadline: Some("2030-01-02T03:04:05".to_string()),
                task: parent.id,
            }),
        )
        .await
        .expect("create should succeed");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.0.status, Status::New);
        assert_eq!(created.0.task, parent.id);
        let subtask_id = created.0.id;

        // A missing parent is a field error
        let orphan = create_subtask(
            State(state.clone()),
            AuthUser(owner.clone()),
            AppJson(CreateSubTaskRequest {
                title: "orphan".to_string(),
                description: String::new(),
                status: None,
                deadline: None,
                task: -1,
            }),
        )
        .await;
        let Err(ApiError::Validation(fields)) = orphan else {
            panic!("expected a task field error")
        };
        assert_eq!(fields["task"][0], "Invalid pk \"-1\" - object does not exist.");

        // Non-owner writes are refused
        let forbidden = update_subtask(
            State(state.clone()),
            AuthUser(stranger.clone()),
            Path(subtask_id),
            AppJson(UpdateSubTaskRequest {
                status: Some("done".to_string()),
                ..Default::default()
            }),
        )
        .await;
        assert!(matches!(forbidden, Err(ApiError::Forbidden)));

        let forbidden_delete = delete_subtask(
            State(state.clone()),
            AuthUser(stranger.clone()),
            Path(subtask_id),
        )
        .await;
        assert!(matches!(forbidden_delete, Err(ApiError::Forbidden)));

        // An empty patch leaves the row untouched
        let unchanged = update_subtask(
            State(state.clone()),
            AuthUser(owner.clone()),
            Path(subtask_id),
            AppJson(UpdateSubTaskRequest::default()),
        )
        .await
        .expect("noop update should succeed");
        assert_eq!(unchanged.0.title, format!("sub_item_{suffix}"));

        // The owner can move it along and clear the deadline
        let updated = update_subtask(
            State(state.clone()),
            AuthUser(owner.clone()),
            Path(subtask_id),
            AppJson(UpdateSubTaskRequest {
                status: Some("done".to_string()),
                deadline: Some(None),
                ..Default::default()
            }),
        )
        .await
        .expect("owner update should succeed");
        assert_eq!(updated.0.status, Status::Done);
        assert!(updated.0.deadline.is_none());

        // Listing scoped to the parent title finds it
        let listed = list_subtasks(
            State(state.clone()),
            Query(SubTaskFilterParams {
                task_title: Some(format!("sub_parent_{suffix}")),
                ..Default::default()
            }),
        )
        .await
        .expect("list should succeed");
        assert_eq!(listed.0.count, 1);
        assert_eq!(listed.0.results[0].id, subtask_id);

        let status = delete_subtask(
            State(state.clone()),
            AuthUser(owner.clone()),
            Path(subtask_id),
        )
        .await
        .expect("owner delete should succeed");
        assert_eq!(status, StatusCode::NO_CONTENT);

        let gone = get_subtask(State(state.clone()), Path(subtask_id)).await;
        assert!(matches!(gone, Err(ApiError::NotFound)));

        diesel::delete(tasks::table.find(parent.id))
            .execute(&mut conn)
            .expect("cleanup task");
        diesel::delete(crate::schema::users::table.find(owner.id))
            .execute(&mut conn)
            .expect("cleanup owner");
        diesel::delete(crate::schema::users::table.find(stranger.id))
            .execute(&mut conn)
            .expect("cleanup stranger");
    }
}
