//! The auth driver plugs into site-specific identity management. It turns
//! credentials into a user identity carrying a tenant ID and a permission
//! predicate. Identities are JSON round-trippable so they can be embedded in
//! bearer tokens.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use crate::configuration::StaticUser;
use crate::errors::RegistryV2Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    View,
    Pull,
    Push,
    Delete,
    Change,
    ViewQuota,
    ChangeQuota,
}

impl Permission {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "view" => Some(Self::View),
            "pull" => Some(Self::Pull),
            "push" => Some(Self::Push),
            "delete" => Some(Self::Delete),
            "change" => Some(Self::Change),
            "viewquota" => Some(Self::ViewQuota),
            "changequota" => Some(Self::ChangeQuota),
            _ => None,
        }
    }
}

/// How much trust a request deserves beyond its explicit permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    Regular,
    Anonymous,
    /// Another keppel in our peer group, doing replication pulls.
    Peer,
}

pub trait UserIdentity: Send + Sync {
    fn plugin_type_id(&self) -> &'static str;
    fn user_type(&self) -> UserType;
    fn user_name(&self) -> String;
    fn has_permission(&self, permission: Permission, auth_tenant_id: &str) -> bool;
    fn serialize_to_json(&self) -> serde_json::Value;
}

#[async_trait]
pub trait AuthDriver: Send + Sync {
    fn plugin_type_id(&self) -> &'static str;

    /// Resolves username/password credentials into a user identity.
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn UserIdentity>, RegistryV2Error>;

    /// Rehydrates a user identity that `serialize_to_json` produced. Some
    /// identity types need the driver to fill in data that is not embedded.
    fn deserialize_user_identity(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Arc<dyn UserIdentity>, RegistryV2Error>;
}

////////////////////////////////////////////////////////////////////////////////
// identities that exist independently of the configured driver

/// An unauthenticated client. Carries no permissions of its own; RBAC
/// policies may still open pull access for it.
pub struct AnonymousIdentity;

impl UserIdentity for AnonymousIdentity {
    fn plugin_type_id(&self) -> &'static str {
        "anon"
    }

    fn user_type(&self) -> UserType {
        UserType::Anonymous
    }

    fn user_name(&self) -> String {
        String::new()
    }

    fn has_permission(&self, _permission: Permission, _auth_tenant_id: &str) -> bool {
        false
    }

    fn serialize_to_json(&self) -> serde_json::Value {
        json!(true)
    }
}

/// A peer keppel doing replication pulls on behalf of its own users. Peers
/// may read everything; the token scopes restrict what each token can do.
pub struct PeerIdentity {
    pub peer_hostname: String,
}

impl UserIdentity for PeerIdentity {
    fn plugin_type_id(&self) -> &'static str {
        "peer"
    }

    fn user_type(&self) -> UserType {
        UserType::Peer
    }

    fn user_name(&self) -> String {
        format!("replication@{}", self.peer_hostname)
    }

    fn has_permission(&self, permission: Permission, _auth_tenant_id: &str) -> bool {
        matches!(permission, Permission::View | Permission::Pull)
    }

    fn serialize_to_json(&self) -> serde_json::Value {
        json!(self.peer_hostname)
    }
}

////////////////////////////////////////////////////////////////////////////////
// "static" auth driver: a fixed userlist from the environment

pub struct StaticAuthDriver {
    users: Vec<StaticUser>,
}

impl StaticAuthDriver {
    pub fn new(users: Vec<StaticUser>) -> Self {
        StaticAuthDriver { users }
    }

    fn identity_for(&self, user: &StaticUser) -> Arc<dyn UserIdentity> {
        let permissions = user
            .permissions
            .iter()
            .filter_map(|name| Permission::from_name(name))
            .collect();
        Arc::new(StaticUserIdentity {
            username: user.username.clone(),
            auth_tenant_id: user.auth_tenant_id.clone(),
            permissions,
        })
    }
}

#[async_trait]
impl AuthDriver for StaticAuthDriver {
    fn plugin_type_id(&self) -> &'static str {
        "static"
    }

    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn UserIdentity>, RegistryV2Error> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == username && u.password == password)
            .ok_or_else(|| RegistryV2Error::Unauthorized("wrong credentials".into()))?;
        Ok(self.identity_for(user))
    }

    fn deserialize_user_identity(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Arc<dyn UserIdentity>, RegistryV2Error> {
        let username = payload
            .as_str()
            .ok_or_else(|| RegistryV2Error::Unauthorized("malformed embedded identity".into()))?;
        let user = self
            .users
            .iter()
            .find(|u| u.username == username)
            .ok_or_else(|| RegistryV2Error::Unauthorized("user no longer exists".into()))?;
        Ok(self.identity_for(user))
    }
}

struct StaticUserIdentity {
    username: String,
    auth_tenant_id: String,
    permissions: HashSet<Permission>,
}

impl UserIdentity for StaticUserIdentity {
    fn plugin_type_id(&self) -> &'static str {
        "static"
    }

    fn user_type(&self) -> UserType {
        UserType::Regular
    }

    fn user_name(&self) -> String {
        self.username.clone()
    }

    fn has_permission(&self, permission: Permission, auth_tenant_id: &str) -> bool {
        self.auth_tenant_id == auth_tenant_id && self.permissions.contains(&permission)
    }

    fn serialize_to_json(&self) -> serde_json::Value {
        json!(self.username)
    }
}
