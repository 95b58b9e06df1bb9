//! Role-based access control.
//!
//! The [`RbacStore`] holds permissions and roles for the whole process.
//! Roles grant permissions directly and through inheritance; the effective
//! permission set of a role is the union of its own permissions and those of
//! every role it transitively inherits.
//!
//! Inheritance edges can be added one at a time, so the store cannot rule
//! out cycles on insert. Evaluation walks the graph depth-first and aborts
//! with [`RbacError::CycleDetected`] when it meets a role already on the
//! current path. [`RbacStore::check_integrity`] runs the same walk over the
//! whole graph.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// Wildcard that matches any resource or action.
pub const WILDCARD: &str = "*";

/// Errors from store mutations and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RbacError {
    /// A permission with this id already exists.
    #[error("permission already exists: {0}")]
    DuplicatePermission(String),

    /// A role with this id already exists.
    #[error("role already exists: {0}")]
    DuplicateRole(String),

    /// The referenced permission does not exist.
    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    /// The referenced role does not exist.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// The role is still inherited by another role.
    #[error("role {role} is inherited by {dependent}")]
    RoleInUse {
        /// The role being removed.
        role: String,
        /// A role that inherits it.
        dependent: String,
    },

    /// The inheritance graph contains a cycle.
    #[error("inheritance cycle: {}", path.join(" -> "))]
    CycleDetected {
        /// Role ids along the cycle, first and last equal.
        path: Vec<String>,
    },
}

/// A permission on a `(resource, action)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    /// Unique id, e.g. `user.read`.
    pub id: String,
    /// Resource name or `*`.
    pub resource: String,
    /// Action name or `*`.
    pub action: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Permission {
    /// Creates a permission.
    #[must_use]
    pub fn new(id: impl Into<String>, resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            action: action.into(),
            description: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns `true` if this permission grants `action` on `resource`.
    #[must_use]
    pub fn matches(&self, resource: &str, action: &str) -> bool {
        (self.resource == WILDCARD || self.resource == resource)
            && (self.action == WILDCARD || self.action == action)
    }
}

/// A named bundle of permissions with optional parent roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Unique id, e.g. `admin`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Directly granted permission ids.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    /// Parent role ids.
    #[serde(default)]
    pub inherits: BTreeSet<String>,
}

impl Role {
    /// Creates a role with no permissions and no parents.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            permissions: BTreeSet::new(),
            inherits: BTreeSet::new(),
        }
    }

    /// Grants a permission.
    #[must_use]
    pub fn with_permission(mut self, permission_id: impl Into<String>) -> Self {
        self.permissions.insert(permission_id.into());
        self
    }

    /// Adds a parent role.
    #[must_use]
    pub fn inheriting(mut self, role_id: impl Into<String>) -> Self {
        self.inherits.insert(role_id.into());
        self
    }
}

#[derive(Debug, Default)]
struct Policy {
    permissions: HashMap<String, Permission>,
    roles: HashMap<String, Role>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

impl Policy {
    /// Depth-first walk from `roots`, collecting reachable permission ids.
    ///
    /// Unknown root roles are skipped.
    fn reachable_permissions<'p, 'r, I>(&'p self, roots: I) -> Result<HashSet<&'p str>, RbacError>
    where
        I: IntoIterator<Item = &'r str>,
    {
        let mut marks: HashMap<&'p str, Mark> = HashMap::new();
        let mut granted: HashSet<&'p str> = HashSet::new();

        for root in roots {
            let Some((root_id, root_role)) = self.roles.get_key_value(root) else {
                continue;
            };
            if marks.contains_key(root_id.as_str()) {
                continue;
            }

            let mut stack: Vec<(&'p str, Vec<&'p str>)> = Vec::new();
            marks.insert(root_id.as_str(), Mark::OnPath);
            granted.extend(root_role.permissions.iter().map(String::as_str));
            stack.push((
                root_id.as_str(),
                root_role.inherits.iter().map(String::as_str).collect(),
            ));

            while let Some((_, pending)) = stack.last_mut() {
                let Some(child) = pending.pop() else {
                    if let Some((done, _)) = stack.pop() {
                        marks.insert(done, Mark::Done);
                    }
                    continue;
                };

                match marks.get(child) {
                    Some(Mark::Done) => {}
                    Some(Mark::OnPath) => {
                        let start = stack.iter().position(|(id, _)| *id == child).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|(id, _)| (*id).to_string()).collect();
                        path.push(child.to_string());
                        return Err(RbacError::CycleDetected { path });
                    }
                    None => {
                        if let Some((child_id, role)) = self.roles.get_key_value(child) {
                            marks.insert(child_id.as_str(), Mark::OnPath);
                            granted.extend(role.permissions.iter().map(String::as_str));
                            stack.push((
                                child_id.as_str(),
                                role.inherits.iter().map(String::as_str).collect(),
                            ));
                        }
                    }
                }
            }
        }

        Ok(granted)
    }
}

/// Process-wide role and permission registry.
///
/// Lookups and evaluations take a read lock; mutations take a write lock.
///
/// # Example
///
/// ```
/// use bastion_auth::rbac::{Permission, RbacStore, Role};
///
/// let store = RbacStore::new();
/// store.add_permission(Permission::new("report.read", "report", "read")).unwrap();
/// store.add_role(Role::new("analyst", "Analyst").with_permission("report.read")).unwrap();
///
/// assert!(store.check_permission(["analyst"], "report", "read").unwrap());
/// assert!(!store.check_permission(["analyst"], "report", "delete").unwrap());
/// ```
#[derive(Debug, Default)]
pub struct RbacStore {
    policy: RwLock<Policy>,
}

impl RbacStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the default policy.
    ///
    /// Permissions: `user.create`, `user.read`, `user.update`, `user.delete`
    /// and `admin.all` (`*` on `*`). Roles: `admin` (`admin.all`), `user`
    /// (`user.read`) and `moderator` (`user.read`, `user.update`, inherits
    /// `user`).
    #[must_use]
    pub fn with_default_policy() -> Self {
        let mut policy = Policy::default();
        for action in ["create", "read", "update", "delete"] {
            let permission = Permission::new(format!("user.{action}"), "user", action)
                .with_description(format!("{action} users"));
            policy.permissions.insert(permission.id.clone(), permission);
        }
        let admin_all = Permission::new("admin.all", WILDCARD, WILDCARD)
            .with_description("full access to every resource");
        policy.permissions.insert(admin_all.id.clone(), admin_all);

        let roles = [
            Role::new("admin", "Administrator").with_permission("admin.all"),
            Role::new("user", "User").with_permission("user.read"),
            Role::new("moderator", "Moderator")
                .with_permission("user.read")
                .with_permission("user.update")
                .inheriting("user"),
        ];
        for role in roles {
            policy.roles.insert(role.id.clone(), role);
        }

        Self {
            policy: RwLock::new(policy),
        }
    }

    /// Registers a permission.
    pub fn add_permission(&self, permission: Permission) -> Result<(), RbacError> {
        let mut policy = self.policy.write();
        if policy.permissions.contains_key(&permission.id) {
            return Err(RbacError::DuplicatePermission(permission.id));
        }
        tracing::debug!(permission = %permission.id, "permission added");
        policy.permissions.insert(permission.id.clone(), permission);
        Ok(())
    }

    /// Removes a permission and revokes it from every role.
    pub fn remove_permission(&self, permission_id: &str) -> Result<Permission, RbacError> {
        let mut policy = self.policy.write();
        let removed = policy
            .permissions
            .remove(permission_id)
            .ok_or_else(|| RbacError::UnknownPermission(permission_id.to_string()))?;
        for role in policy.roles.values_mut() {
            role.permissions.remove(permission_id);
        }
        tracing::debug!(permission = %permission_id, "permission removed");
        Ok(removed)
    }

    /// Registers a role.
    ///
    /// Every referenced permission and parent role must already exist.
    pub fn add_role(&self, role: Role) -> Result<(), RbacError> {
        let mut policy = self.policy.write();
        if policy.roles.contains_key(&role.id) {
            return Err(RbacError::DuplicateRole(role.id));
        }
        if let Some(missing) = role
            .permissions
            .iter()
            .find(|p| !policy.permissions.contains_key(*p))
        {
            return Err(RbacError::UnknownPermission(missing.clone()));
        }
        if let Some(missing) = role.inherits.iter().find(|r| !policy.roles.contains_key(*r)) {
            return Err(RbacError::UnknownRole(missing.clone()));
        }
        tracing::debug!(role = %role.id, "role added");
        policy.roles.insert(role.id.clone(), role);
        Ok(())
    }

    /// Removes a role.
    ///
    /// Fails while another role still inherits it.
    pub fn remove_role(&self, role_id: &str) -> Result<Role, RbacError> {
        let mut policy = self.policy.write();
        if !policy.roles.contains_key(role_id) {
            return Err(RbacError::UnknownRole(role_id.to_string()));
        }
        if let Some(dependent) = policy
            .roles
            .values()
            .find(|r| r.id != role_id && r.inherits.contains(role_id))
        {
            return Err(RbacError::RoleInUse {
                role: role_id.to_string(),
                dependent: dependent.id.clone(),
            });
        }
        let removed = policy
            .roles
            .remove(role_id)
            .ok_or_else(|| RbacError::UnknownRole(role_id.to_string()))?;
        tracing::debug!(role = %role_id, "role removed");
        Ok(removed)
    }

    /// Grants a permission to a role. Granting twice is a no-op.
    pub fn assign_permission(&self, role_id: &str, permission_id: &str) -> Result<(), RbacError> {
        let mut policy = self.policy.write();
        if !policy.permissions.contains_key(permission_id) {
            return Err(RbacError::UnknownPermission(permission_id.to_string()));
        }
        let role = policy
            .roles
            .get_mut(role_id)
            .ok_or_else(|| RbacError::UnknownRole(role_id.to_string()))?;
        role.permissions.insert(permission_id.to_string());
        Ok(())
    }

    /// Adds a single inheritance edge `role_id -> parent_id`.
    ///
    /// The edge may close a cycle; that is reported at evaluation time.
    pub fn add_inheritance(&self, role_id: &str, parent_id: &str) -> Result<(), RbacError> {
        let mut policy = self.policy.write();
        if !policy.roles.contains_key(parent_id) {
            return Err(RbacError::UnknownRole(parent_id.to_string()));
        }
        let role = policy
            .roles
            .get_mut(role_id)
            .ok_or_else(|| RbacError::UnknownRole(role_id.to_string()))?;
        role.inherits.insert(parent_id.to_string());
        Ok(())
    }

    /// Returns a role by id.
    #[must_use]
    pub fn get_role(&self, role_id: &str) -> Option<Role> {
        self.policy.read().roles.get(role_id).cloned()
    }

    /// Returns a permission by id.
    #[must_use]
    pub fn get_permission(&self, permission_id: &str) -> Option<Permission> {
        self.policy.read().permissions.get(permission_id).cloned()
    }

    /// Lists roles ordered by id.
    #[must_use]
    pub fn list_roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.policy.read().roles.values().cloned().collect();
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        roles
    }

    /// Lists permissions ordered by id.
    #[must_use]
    pub fn list_permissions(&self) -> Vec<Permission> {
        let mut permissions: Vec<Permission> =
            self.policy.read().permissions.values().cloned().collect();
        permissions.sort_by(|a, b| a.id.cmp(&b.id));
        permissions
    }

    /// Computes the effective permission set of a union of roles.
    ///
    /// Unknown roles contribute nothing. The result is ordered by id.
    pub fn effective_permissions<'a, I>(&self, roles: I) -> Result<Vec<Permission>, RbacError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let policy = self.policy.read();
        let granted = policy.reachable_permissions(roles)?;
        let mut permissions: Vec<Permission> = granted
            .into_iter()
            .filter_map(|id| policy.permissions.get(id).cloned())
            .collect();
        permissions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(permissions)
    }

    /// Returns `true` if any of `roles` grants `action` on `resource`.
    pub fn check_permission<I, S>(&self, roles: I, resource: &str, action: &str) -> Result<bool, RbacError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roles: Vec<S> = roles.into_iter().collect();
        let policy = self.policy.read();
        let granted = policy.reachable_permissions(roles.iter().map(|r| r.as_ref()))?;
        Ok(granted
            .into_iter()
            .filter_map(|id| policy.permissions.get(id))
            .any(|p| p.matches(resource, action)))
    }

    /// Walks the whole inheritance graph and reports the first cycle found.
    pub fn check_integrity(&self) -> Result<(), RbacError> {
        let policy = self.policy.read();
        let mut ids: Vec<&str> = policy.roles.keys().map(String::as_str).collect();
        ids.sort_unstable();
        policy.reachable_permissions(ids).map(|_| ())
    }

    /// Returns the number of roles.
    #[must_use]
    pub fn role_count(&self) -> usize {
        self.policy.read().roles.len()
    }

    /// Returns the number of permissions.
    #[must_use]
    pub fn permission_count(&self) -> usize {
        self.policy.read().permissions.len()
    }
}

/// Returns `true` if `user_roles` and `required` share at least one role.
pub fn has_any_role<U, R>(user_roles: U, required: R) -> bool
where
    U: IntoIterator,
    U::Item: AsRef<str>,
    R: IntoIterator,
    R::Item: AsRef<str>,
{
    let user: HashSet<String> = user_roles.into_iter().map(|r| r.as_ref().to_string()).collect();
    required.into_iter().any(|r| user.contains(r.as_ref()))
}

/// Returns `true` if `user_roles` contains every role in `required`.
pub fn has_all_roles<U, R>(user_roles: U, required: R) -> bool
where
    U: IntoIterator,
    U::Item: AsRef<str>,
    R: IntoIterator,
    R::Item: AsRef<str>,
{
    let user: HashSet<String> = user_roles.into_iter().map(|r| r.as_ref().to_string()).collect();
    required.into_iter().all(|r| user.contains(r.as_ref()))
}
