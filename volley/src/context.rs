//! Shared benchmark context and the per-iteration view of it.
//!
//! The [`SharedContext`] is built by whoever set up the cloud under test
//! (users, tenants, admin credentials) and is only ever read by the runner.
//! Every iteration gets a [`ContextSnapshot`]: the one user it acts as, that
//! user's tenant, and everything else carried through unchanged.

use std::{collections::HashMap, fmt, sync::Arc};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub tenant_name: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("tenant_name", &self.tenant_name)
            .field("region_name", &self.region_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub tenant_id: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How an iteration picks the user it runs as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserChoice {
    #[default]
    Random,
    /// `users[index % users.len()]`
    RoundRobin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub tenants: HashMap<String, Tenant>,
    #[serde(default)]
    pub admin: Option<Credential>,
    #[serde(default)]
    pub user_choice: UserChoice,
    /// Anything else the setup stage put in the context.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SharedContext {
    fn pick_user(&self, index: u64) -> Option<&User> {
        if self.users.is_empty() {
            return None;
        }
        let slot = match self.user_choice {
            UserChoice::Random => rand::thread_rng().gen_range(0..self.users.len()),
            UserChoice::RoundRobin => (index % self.users.len() as u64) as usize,
        };
        self.users.get(slot)
    }
}

/// Read-only view of the [`SharedContext`] for one iteration.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    index: u64,
    user: Option<User>,
    tenant: Option<Tenant>,
    shared: Arc<SharedContext>,
}

impl ContextSnapshot {
    pub fn new(shared: &Arc<SharedContext>, index: u64) -> Self {
        let user = shared.pick_user(index).cloned();
        let tenant = user
            .as_ref()
            .and_then(|u| shared.tenants.get(&u.tenant_id))
            .cloned();
        Self {
            index,
            user,
            tenant,
            shared: Arc::clone(shared),
        }
    }

    /// Zero-based index handed out by the iteration counter.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// One-based iteration number, as shown to humans.
    pub fn iteration(&self) -> u64 {
        self.index + 1
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        self.tenant.as_ref()
    }

    pub fn admin(&self) -> Option<&Credential> {
        self.shared.admin.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.shared.extra.get(key)
    }
}
