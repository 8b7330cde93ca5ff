use crate::schema::*;
use diesel::deserialize::{FromSql, Result};
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

diesel::define_sql_function! {
    /// Postgres `lower()`, backing the case-insensitive uniqueness checks.
    fn lower(value: Text) -> Text;
}

/// Lifecycle state shared by tasks and subtasks, stored as lowercase text.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    New,
    InProgress,
    Pending,
    Blocked,
    Done,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::New => "new",
            Status::InProgress => "in_progress",
            Status::Pending => "pending",
            Status::Blocked => "blocked",
            Status::Done => "done",
        }
    }

    /// Lenient parser used for query parameters; unknown values yield `None`
    /// so callers can ignore the filter instead of failing the request.
    pub fn parse(value: &str) -> Option<Status> {
        match value.trim().to_lowercase().as_str() {
            "new" => Some(Status::New),
            "in_progress" => Some(Status::InProgress),
            "pending" => Some(Status::Pending),
            "blocked" => Some(Status::Blocked),
            "done" => Some(Status::Done),
            _ => None,
        }
    }

    /// A transition into this status counts as closing the task.
    pub fn is_closed(self) -> bool {
        matches!(self, Status::Done)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::New
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Pg> for Status {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> diesel::serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for Status {
    fn from_sql(bytes: PgValue) -> Result<Self> {
        let raw = String::from_utf8(bytes.as_bytes().to_vec())?;
        Status::parse(&raw).ok_or_else(|| format!("unrecognized status value: {raw}").into())
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub is_staff: bool,
    pub date_joined: chrono::NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub is_staff: bool,
    pub date_joined: chrono::NaiveDateTime,
}

impl User {
    pub fn find_by_username(conn: &mut PgConnection, name: &str) -> QueryResult<Option<User>> {
        use crate::schema::users::dsl::*;
        users
            .filter(username.eq(name))
            .select(User::as_select())
            .first::<User>(conn)
            .optional()
    }

    pub fn username_taken(conn: &mut PgConnection, name: &str) -> QueryResult<bool> {
        use crate::schema::users::dsl::*;
        diesel::select(diesel::dsl::exists(users.filter(username.eq(name))))
            .get_result::<bool>(conn)
    }

    /// Email comparisons ignore case, matching the unique index.
    pub fn email_taken(conn: &mut PgConnection, address: &str) -> QueryResult<bool> {
        use crate::schema::users::dsl::*;
        diesel::select(diesel::dsl::exists(
            users.filter(lower(email).eq(address.to_lowercase())),
        ))
        .get_result::<bool>(conn)
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::categories)]
pub struct Category {
    pub id: i32,
    pub name: String,
    pub is_deleted: bool,
    pub deleted_at: Option<chrono::NaiveDateTime>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::categories)]
pub struct NewCategory<'a> {
    pub name: &'a str,
}

impl Category {
    /// Default query scope: categories that have not been soft-deleted.
    /// Every read path goes through this unless it opts into
    /// `with_deleted` explicitly.
    pub fn alive() -> categories::BoxedQuery<'static, Pg> {
        categories::table
            .filter(categories::is_deleted.eq(false))
            .into_boxed()
    }

    /// Unscoped entry point that still reaches soft-deleted rows.
    pub fn with_deleted() -> categories::BoxedQuery<'static, Pg> {
        categories::table.into_boxed()
    }

    /// Case-insensitive name collision check among live rows only; a
    /// soft-deleted category frees its name for reuse.
    pub fn name_taken(
        conn: &mut PgConnection,
        name: &str,
        exclude_id: Option<i32>,
    ) -> QueryResult<bool> {
        let base = categories::table
            .filter(categories::is_deleted.eq(false))
            .filter(lower(categories::name).eq(name.to_lowercase()));
        match exclude_id {
            Some(id) => diesel::select(diesel::dsl::exists(
                base.filter(categories::id.ne(id)),
            ))
            .get_result::<bool>(conn),
            None => diesel::select(diesel::dsl::exists(base)).get_result::<bool>(conn),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::tasks)]
pub struct Task {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub owner_id: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::tasks)]
pub struct NewTask<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub status: Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub owner_id: Option<i32>,
}

/// Partial update for a task; `None` leaves the column untouched while
/// `Some(None)` on the deadline clears it.
#[derive(AsChangeset)]
#[diesel(table_name = crate::schema::tasks)]
pub struct TaskChanges<'a> {
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub status: Option<Status>,
    pub deadline: Option<Option<chrono::NaiveDateTime>>,
}

impl TaskChanges<'_> {
    pub fn is_noop(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.deadline.is_none()
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::subtasks)]
pub struct SubTask {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub task_id: i32,
    pub owner_id: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::subtasks)]
pub struct NewSubTask<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub status: Status,
    pub deadline: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub task_id: i32,
    pub owner_id: Option<i32>,
}

#[derive(AsChangeset)]
#[diesel(table_name = crate::schema::subtasks)]
pub struct SubTaskChanges<'a> {
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub status: Option<Status>,
    pub deadline: Option<Option<chrono::NaiveDateTime>>,
}

impl SubTaskChanges<'_> {
    pub fn is_noop(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.deadline.is_none()
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::task_categories)]
pub struct TaskCategory {
    pub task_id: i32,
    pub category_id: i32,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::schema::revoked_tokens)]
pub struct RevokedToken {
    pub id: i32,
    pub jti: String,
    pub revoked_at: chrono::NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::revoked_tokens)]
pub struct NewRevokedToken<'a> {
    pub jti: &'a str,
    pub revoked_at: chrono::NaiveDateTime,
}

impl RevokedToken {
    pub fn is_revoked(conn: &mut PgConnection, token_id: &str) -> QueryResult<bool> {
        use crate::schema::revoked_tokens::dsl::*;
        diesel::select(diesel::dsl::exists(revoked_tokens.filter(jti.eq(token_id))))
            .get_result::<bool>(conn)
    }

    /// Blacklists a refresh token. Revoking the same token twice is fine.
    pub fn revoke(conn: &mut PgConnection, token_id: &str) -> QueryResult<usize> {
        use crate::schema::revoked_tokens::dsl::*;
        diesel::insert_into(revoked_tokens)
            .values(&NewRevokedToken {
                jti: token_id,
                revoked_at: chrono::Utc::now().naive_utc(),
            })
            .on_conflict(jti)
            .do_nothing()
            .execute(conn)
    }
}
