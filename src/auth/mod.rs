//! Audiences, scopes and authorization decisions for the token service.

pub mod keys;
pub mod token;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::configuration::Configuration;
use crate::db::{self, DbPool};
use crate::drivers::auth::{Permission, UserIdentity, UserType};
use crate::errors::RegistryV2Error;
use crate::policies::RbacPermission;
use keys::IssuerKey;

/// An audience for which we can issue tokens: the combination of "normal or
/// anycast endpoint" and "domain-remapped account, if any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audience {
    pub is_anycast: bool,
    /// For domain-remapped APIs, the account name from the domain.
    #[serde(default)]
    pub account_name: String,
}

impl Audience {
    /// Resolves a hostname (from a request URL, the `service` query parameter
    /// of an auth request, or a token's `aud` claim) into an audience.
    /// Unknown hostnames fall back to the default audience.
    pub fn identify(hostname: &str, config: &Configuration) -> Audience {
        if !hostname.is_empty() {
            if hostname == config.api_public_hostname {
                return Audience::default();
            }
            if Some(hostname) == config.anycast_api_public_hostname.as_deref() {
                return Audience { is_anycast: true, account_name: String::new() };
            }
        }

        // domain-remapped API: `<account>.<public-host>`
        if let Some((head, tail)) = hostname.split_once('.') {
            if db::is_account_name(head) && !tail.is_empty() {
                if tail == config.api_public_hostname {
                    return Audience { is_anycast: false, account_name: head.to_string() };
                }
                if Some(tail) == config.anycast_api_public_hostname.as_deref() {
                    return Audience { is_anycast: true, account_name: head.to_string() };
                }
            }
        }

        Audience::default()
    }

    /// The hostname used as the `aud` claim in tokens and the `service` value
    /// in auth challenges. Inverse of `identify`.
    pub fn hostname(&self, config: &Configuration) -> String {
        let mut result = if self.is_anycast {
            config.anycast_api_public_hostname.clone().unwrap_or_default()
        } else {
            config.api_public_hostname.clone()
        };
        if !self.account_name.is_empty() {
            result = format!("{}.{}", self.account_name, result);
        }
        result
    }

    /// Applies our domain remapping to a peer's hostname, so that forwarded
    /// domain-remapped requests stay domain-remapped.
    pub fn map_peer_hostname(&self, peer_hostname: &str) -> String {
        if self.account_name.is_empty() {
            peer_hostname.to_string()
        } else {
            format!("{}.{}", self.account_name, peer_hostname)
        }
    }

    /// The issuer keys for this audience: index 0 signs, all validate.
    pub fn issuer_keys<'c>(&self, config: &'c Configuration) -> &'c [IssuerKey] {
        if self.is_anycast {
            &config.anycast_issuer_keys
        } else {
            &config.issuer_keys
        }
    }
}

/// One entry of a token's `access` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl Scope {
    pub fn repository(name: &str, actions: &[&str]) -> Self {
        Scope {
            resource_type: "repository".into(),
            name: name.into(),
            actions: actions.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn catalog() -> Self {
        Scope {
            resource_type: "registry".into(),
            name: "catalog".into(),
            actions: vec!["*".into()],
        }
    }

    pub fn account(name: &str, actions: &[&str]) -> Self {
        Scope {
            resource_type: "keppel_account".into(),
            name: name.into(),
            actions: actions.iter().map(ToString::to_string).collect(),
        }
    }

    /// Parses the `scope` query parameter format `type:name:action1,action2`.
    /// The name may itself contain colons (e.g. `repository:foo/bar:pull`
    /// never does, but port-qualified names can), so we split from both ends.
    pub fn parse(input: &str) -> Option<Scope> {
        let (resource_type, rest) = input.split_once(':')?;
        let (name, actions) = rest.rsplit_once(':')?;
        if resource_type.is_empty() || name.is_empty() {
            return None;
        }
        Some(Scope {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            actions: actions.split(',').filter(|a| !a.is_empty()).map(ToString::to_string).collect(),
        })
    }

    pub fn contains_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// A set of scopes with merging on (type, name).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeSet(Vec<Scope>);

impl ScopeSet {
    pub fn add(&mut self, scope: Scope) {
        for existing in &mut self.0 {
            if existing.resource_type == scope.resource_type && existing.name == scope.name {
                for action in scope.actions {
                    if !existing.contains_action(&action) {
                        existing.actions.push(action);
                    }
                }
                return;
            }
        }
        self.0.push(scope);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Scope> {
        self.0
    }

    pub fn grants(&self, resource_type: &str, name: &str, action: &str) -> bool {
        self.0
            .iter()
            .any(|s| s.resource_type == resource_type && s.name == name && s.contains_action(action))
    }
}

impl FromIterator<Scope> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        let mut set = ScopeSet::default();
        for scope in iter {
            set.add(scope);
        }
        set
    }
}

/// The result of authenticating and authorizing a request or token request.
pub struct Authorization {
    pub user_identity: Arc<dyn UserIdentity>,
    pub scope_set: ScopeSet,
    pub audience: Audience,
}

impl Authorization {
    pub fn user_name(&self) -> String {
        self.user_identity.user_name()
    }
}

/// Filters the requested scopes down to what the identity is actually allowed
/// to do, consulting account ownership and RBAC policies. This runs during
/// token issuance; registry handlers afterwards only check token scopes.
pub async fn filter_scopes(
    pool: &DbPool,
    audience: &Audience,
    identity: &Arc<dyn UserIdentity>,
    requested: ScopeSet,
) -> Result<ScopeSet, RegistryV2Error> {
    let mut granted = ScopeSet::default();

    for scope in requested.iter() {
        match scope.resource_type.as_str() {
            "registry" if scope.name == "catalog" => {
                // the catalog handler enumerates accessible accounts itself;
                // anonymous clients have nothing to enumerate
                if identity.user_type() != UserType::Anonymous {
                    granted.add(Scope::catalog());
                }
            }
            "repository" => {
                let Some((account_name, repo_name)) = split_repository_scope(&scope.name, audience) else {
                    continue;
                };
                let Some(account) = db::find_account(pool, &account_name).await? else {
                    continue;
                };

                let mut actions = Vec::new();
                for action in &scope.actions {
                    let allowed = match action.as_str() {
                        "pull" => {
                            can_pull(identity, &account, &repo_name)?
                        }
                        // anycast tokens are issued anonymously and never
                        // grant writes
                        "push" if !audience.is_anycast => {
                            !account.is_replica()
                                && identity.has_permission(Permission::Push, &account.auth_tenant_id)
                        }
                        "delete" if !audience.is_anycast => {
                            identity.has_permission(Permission::Delete, &account.auth_tenant_id)
                        }
                        _ => false,
                    };
                    if allowed {
                        actions.push(action.as_str());
                    }
                }
                if !actions.is_empty() {
                    granted.add(Scope::repository(&scope.name, &actions));
                }
            }
            "keppel_account" => {
                let Some(account) = db::find_account(pool, &scope.name).await? else {
                    continue;
                };
                let mut actions = Vec::new();
                for action in &scope.actions {
                    let allowed = match action.as_str() {
                        "view" => {
                            identity.user_type() == UserType::Peer
                                || identity.has_permission(Permission::View, &account.auth_tenant_id)
                        }
                        "change" => identity.has_permission(Permission::Change, &account.auth_tenant_id),
                        "viewquota" => identity.has_permission(Permission::ViewQuota, &account.auth_tenant_id),
                        "changequota" => identity.has_permission(Permission::ChangeQuota, &account.auth_tenant_id),
                        _ => false,
                    };
                    if allowed {
                        actions.push(action.as_str());
                    }
                }
                if !actions.is_empty() {
                    granted.add(Scope::account(&scope.name, &actions));
                }
            }
            _ => {}
        }
    }

    Ok(granted)
}

fn can_pull(
    identity: &Arc<dyn UserIdentity>,
    account: &crate::db::Account,
    repo_name: &str,
) -> Result<bool, RegistryV2Error> {
    if identity.user_type() == UserType::Peer {
        return Ok(true);
    }
    if identity.has_permission(Permission::Pull, &account.auth_tenant_id) {
        return Ok(true);
    }

    let user_name = identity.user_name();
    for policy in account.rbac_policies()? {
        if !policy.matches(repo_name, &user_name) {
            continue;
        }
        if identity.user_type() == UserType::Anonymous {
            if policy.grants(RbacPermission::AnonymousPull) || policy.grants(RbacPermission::AnonymousFirstPull) {
                return Ok(true);
            }
        } else if policy.grants(RbacPermission::Pull) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Splits a repository scope name into account and repo. On domain-remapped
/// APIs the account comes from the audience and the scope name is the bare
/// repo path; otherwise the first path element is the account.
pub fn split_repository_scope(name: &str, audience: &Audience) -> Option<(String, String)> {
    if !audience.account_name.is_empty() {
        return Some((audience.account_name.clone(), name.to_string()));
    }
    let (account_name, repo_name) = name.split_once('/')?;
    if !db::is_account_name(account_name) || repo_name.is_empty() {
        return None;
    }
    Some((account_name.to_string(), repo_name.to_string()))
}
