//! Users, groups and ACL entries. Thin checks in front of the API.

use crate::api::{AclEntry, ClusterApi, Group, Params, User};
use crate::error::PveError;

fn validate_userid(userid: &str) -> Result<(), PveError> {
    match userid.split_once('@') {
        Some((name, realm)) if !name.is_empty() && !realm.is_empty() => Ok(()),
        _ => Err(PveError::invalid(format!(
            "user id '{userid}' must have the form user@realm"
        ))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub userid: String,
    pub password: Option<String>,
    pub email: Option<String>,
    pub comment: Option<String>,
    pub groups: Vec<String>,
}

pub async fn list_users<A: ClusterApi>(api: &A) -> Result<Vec<User>, PveError> {
    let mut users = api.users().await?;
    users.sort_by(|a, b| a.userid.cmp(&b.userid));
    Ok(users)
}

pub async fn add_user<A: ClusterApi>(api: &A, user: &NewUser) -> Result<(), PveError> {
    validate_userid(&user.userid)?;
    let params = Params::new()
        .set("userid", &user.userid)
        .opt("password", user.password.as_deref())
        .opt("email", user.email.as_deref())
        .opt("comment", user.comment.as_deref());
    let params = if user.groups.is_empty() {
        params
    } else {
        params.set("groups", user.groups.join(","))
    };
    api.create_user(&params).await
}

pub async fn delete_user<A: ClusterApi>(api: &A, userid: &str) -> Result<(), PveError> {
    validate_userid(userid)?;
    api.delete_user(userid).await
}

pub async fn list_groups<A: ClusterApi>(api: &A) -> Result<Vec<Group>, PveError> {
    let mut groups = api.groups().await?;
    groups.sort_by(|a, b| a.groupid.cmp(&b.groupid));
    Ok(groups)
}

pub async fn add_group<A: ClusterApi>(
    api: &A,
    groupid: &str,
    comment: Option<&str>,
) -> Result<(), PveError> {
    if groupid.is_empty() {
        return Err(PveError::invalid("group id must not be empty"));
    }
    let params = Params::new().set("groupid", groupid).opt("comment", comment);
    api.create_group(&params).await
}

pub async fn delete_group<A: ClusterApi>(api: &A, groupid: &str) -> Result<(), PveError> {
    if groupid.is_empty() {
        return Err(PveError::invalid("group id must not be empty"));
    }
    api.delete_group(groupid).await
}

pub async fn list_acl<A: ClusterApi>(api: &A) -> Result<Vec<AclEntry>, PveError> {
    api.acl().await
}

/// Who an ACL entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    User(String),
    Group(String),
}

/// One role on one path for one subject.
#[derive(Debug, Clone)]
pub struct AclChange {
    pub path: String,
    pub role: String,
    pub subject: Subject,
    pub propagate: bool,
}

fn acl_params(change: &AclChange) -> Result<Params, PveError> {
    if !change.path.starts_with('/') {
        return Err(PveError::invalid(format!(
            "ACL path '{}' must start with '/'",
            change.path
        )));
    }
    if change.role.is_empty() {
        return Err(PveError::invalid("ACL role must not be empty"));
    }
    let params = Params::new()
        .set("path", &change.path)
        .set("roles", &change.role)
        .set("propagate", u8::from(change.propagate));
    Ok(match &change.subject {
        Subject::User(u) => {
            validate_userid(u)?;
            params.set("users", u)
        }
        Subject::Group(g) => params.set("groups", g),
    })
}

pub async fn grant<A: ClusterApi>(api: &A, change: &AclChange) -> Result<(), PveError> {
    let params = acl_params(change)?;
    api.update_acl(&params).await
}

pub async fn revoke<A: ClusterApi>(api: &A, change: &AclChange) -> Result<(), PveError> {
    let params = acl_params(change)?.set("delete", 1);
    api.update_acl(&params).await
}
