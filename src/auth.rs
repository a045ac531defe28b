//! Workspace access checks performed before a run touches any state.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::id::Id;
use crate::workflow::Workspace;

pub trait Authorizer: Send + Sync {
    fn authorize(&self, workspace: &Workspace) -> Result<()>;
}

/// Grants every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _workspace: &Workspace) -> Result<()> {
        Ok(())
    }
}

/// Grants access to an explicit set of workspaces.
#[derive(Debug, Default, Clone)]
pub struct WorkspaceAllowList {
    allowed: HashSet<Id>,
}

impl WorkspaceAllowList {
    pub fn new(allowed: impl IntoIterator<Item = Id>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn allow(&mut self, workspace_id: Id) {
        self.allowed.insert(workspace_id);
    }
}

impl Authorizer for WorkspaceAllowList {
    fn authorize(&self, workspace: &Workspace) -> Result<()> {
        if self.allowed.contains(&workspace.id) {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "no access to workspace '{}'",
                workspace.name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_allow_list() {
        let workspace = Workspace {
            id: Id::new(),
            name: "W".into(),
        };
        let mut list = WorkspaceAllowList::default();
        assert_eq!(
            list.authorize(&workspace).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
        list.allow(workspace.id);
        assert!(list.authorize(&workspace).is_ok());
        assert!(AllowAll.authorize(&workspace).is_ok());
    }
}
