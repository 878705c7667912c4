//! Caller identity.
//!
//! Every caller-scoped query takes a [`Caller`] explicitly instead of
//! reading an ambient security context.

/// The authenticated user on whose behalf a call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller {
    /// Panel user id. Tasks owned by, or effectively run as, this user
    /// are visible to the caller.
    pub user_id: i64,
}

impl Caller {
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }
}
