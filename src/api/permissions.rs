use crate::tables::User;

/// Write rule shared by tasks and subtasks: reads are open, but a record
/// may only be modified or deleted by its owner. Records without an owner
/// (imported before ownership existed) are reserved for staff accounts.
pub fn can_modify(owner_id: Option<i32>, user: &User) -> bool {
    match owner_id {
        Some(owner) => owner == user.id,
        None => user.is_staff,
    }
}
