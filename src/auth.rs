use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Caller role, supplied (and authenticated) by the calling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Teacher,
    BranchAdmin,
    SuperAdmin,
}

/// Identity the engine trusts for authorization and audit attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: Ulid,
    pub role: Role,
    /// Home branch; required for BranchAdmin scoping, optional otherwise.
    pub branch_id: Option<Ulid>,
}

impl AuthContext {
    pub fn new(user_id: Ulid, role: Role, branch_id: Option<Ulid>) -> Self {
        Self { user_id, role, branch_id }
    }

    pub fn student(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Student, None)
    }

    pub fn teacher(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Teacher, None)
    }

    pub fn branch_admin(user_id: Ulid, branch_id: Ulid) -> Self {
        Self::new(user_id, Role::BranchAdmin, Some(branch_id))
    }

    pub fn super_admin(user_id: Ulid) -> Self {
        Self::new(user_id, Role::SuperAdmin, None)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::BranchAdmin | Role::SuperAdmin)
    }

    /// Staff = anyone acting in an operational capacity (not a student).
    pub fn is_staff(&self) -> bool {
        !matches!(self.role, Role::Student)
    }

    /// Admin authority over a branch: SuperAdmin everywhere, BranchAdmin
    /// only over their own branch.
    pub fn administers_branch(&self, branch_id: Ulid) -> bool {
        match self.role {
            Role::SuperAdmin => true,
            Role::BranchAdmin => self.branch_id == Some(branch_id),
            _ => false,
        }
    }
}
