use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::pagination::{page_bounds, page_envelope, Page, CATEGORY_PAGE_SIZE};
use crate::schema::{categories, task_categories};
use crate::tables::{Category, NewCategory};
use crate::CATEGORIES_API;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::state::AppState;
use super::AppJson;

#[derive(Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct UpdateCategoryRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct CategoryResponse {
    pub id: i32,
    pub name: String,
}

impl From<Category> for CategoryResponse {
    fn from(category: Category) -> Self {
        Self {
            id: category.id,
            name: category.name,
        }
    }
}

/// List rows keep the soft-delete state visible so `include_deleted=true`
/// output can be told apart from live rows.
#[derive(Serialize)]
pub struct CategoryListItem {
    pub id: i32,
    pub name: String,
    pub is_deleted: bool,
    pub deleted_at: Option<chrono::NaiveDateTime>,
}

impl From<Category> for CategoryListItem {
    fn from(category: Category) -> Self {
        Self {
            id: category.id,
            name: category.name,
            is_deleted: category.is_deleted,
            deleted_at: category.deleted_at,
        }
    }
}

#[derive(Serialize)]
pub struct CategoryTaskCount {
    pub id: i32,
    pub name: String,
    pub task_count: i64,
}

#[derive(Default, Deserialize)]
pub struct CategoryListParams {
    pub page: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route(
            format!("/{CATEGORIES_API}/").as_str(),
            get(list_categories).post(create_category),
        )
        .route(
            format!("/{CATEGORIES_API}/:id/").as_str(),
            get(get_category)
                .put(update_category)
                .patch(update_category)
                .delete(delete_category),
        )
        .route(
            format!("/{CATEGORIES_API}/:id/count_tasks/").as_str(),
            get(count_tasks),
        )
}

fn validate_name(raw: &str) -> Result<&str, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::field("name", "This field may not be blank."));
    }
    if name.chars().count() > 100 {
        return Err(ApiError::field(
            "name",
            "Ensure this field has no more than 100 characters.",
        ));
    }
    Ok(name)
}

async fn list_categories(
    State(state): State<AppState>,
    Query(params): Query<CategoryListParams>,
) -> Result<Json<Page<CategoryListItem>>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let scope = || {
        if params.include_deleted {
            Category::with_deleted()
        } else {
            Category::alive()
        }
    };

    let count = scope().count().get_result::<i64>(&mut conn)?;
    let (page, offset) = page_bounds(params.page.as_deref(), CATEGORY_PAGE_SIZE, count)?;

    let rows = scope()
        .order(categories::name.asc())
        .then_order_by(categories::id.asc())
        .offset(offset)
        .limit(CATEGORY_PAGE_SIZE)
        .select(Category::as_select())
        .load::<Category>(&mut conn)?;

    let results = rows.into_iter().map(Into::into).collect();
    Ok(Json(page_envelope(page, CATEGORY_PAGE_SIZE, count, results)))
}

async fn create_category(
    State(state): State<AppState>,
    _user: AuthUser,
    AppJson(payload): AppJson<CreateCategoryRequest>,
) -> Result<(StatusCode, Json<CategoryResponse>), ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let name = validate_name(&payload.name)?;
    if Category::name_taken(&mut conn, name, None)? {
        return Err(ApiError::field(
            "name",
            "Category with this name already exists.",
        ));
    }

    // The partial unique index stays authoritative if two creates race
    // past the check above.
    let category = diesel::insert_into(categories::table)
        .values(&NewCategory { name })
        .returning(Category::as_select())
        .get_result::<Category>(&mut conn)?;

    Ok((StatusCode::CREATED, Json(category.into())))
}

async fn get_category(
    State(state): State<AppState>,
    Path(category_id): Path<i32>,
) -> Result<Json<CategoryResponse>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let category = Category::alive()
        .filter(categories::id.eq(category_id))
        .select(Category::as_select())
        .first::<Category>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(category.into()))
}

async fn update_category(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(category_id): Path<i32>,
    AppJson(payload): AppJson<UpdateCategoryRequest>,
) -> Result<Json<CategoryResponse>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let existing = Category::alive()
        .filter(categories::id.eq(category_id))
        .select(Category::as_select())
        .first::<Category>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    let name = validate_name(&payload.name)?;
    if Category::name_taken(&mut conn, name, Some(existing.id))? {
        return Err(ApiError::field(
            "name",
            "Category with this name already exists.",
        ));
    }

    let category = diesel::update(categories::table.find(existing.id))
        .set(categories::name.eq(name))
        .returning(Category::as_select())
        .get_result::<Category>(&mut conn)?;

    Ok(Json(category.into()))
}

/// Soft delete: flips the flag and stamps the time, the row stays put.
async fn delete_category(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(category_id): Path<i32>,
) -> Result<StatusCode, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let updated = diesel::update(
        categories::table
            .find(category_id)
            .filter(categories::is_deleted.eq(false)),
    )
    .set((
        categories::is_deleted.eq(true),
        categories::deleted_at.eq(Some(Utc::now().naive_utc())),
    ))
    .execute(&mut conn)?;

    if updated == 0 {
        return Err(ApiError::NotFound);
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn count_tasks(
    State(state): State<AppState>,
    Path(category_id): Path<i32>,
) -> Result<Json<CategoryTaskCount>, ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let category = Category::alive()
        .filter(categories::id.eq(category_id))
        .select(Category::as_select())
        .first::<Category>(&mut conn)
        .optional()?
        .ok_or(ApiError::NotFound)?;

    let task_count = task_categories::table
        .filter(task_categories::category_id.eq(category.id))
        .count()
        .get_result::<i64>(&mut conn)?;

    Ok(Json(CategoryTaskCount {
        id: category.id,
        name: category.name,
        task_count,
    }))
}
