//! Caller accounts: which plan a caller is on.
//!
//! The pipeline only needs a caller's plan to pick a size ceiling, so it
//! depends on the small [`AccountStore`] capability rather than on any
//! particular registry. There are no credentials here: the caller key is
//! whatever the outer layer already established.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use webmforge_common::{CallerId, Plan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub key: CallerId,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(key: CallerId, plan: Plan) -> Self {
        let now = Utc::now();
        Self {
            key,
            plan,
            created_at: now,
            updated_at: now,
        }
    }
}

pub trait AccountStore: Send + Sync {
    fn find_by_key(&self, key: &CallerId) -> Option<Account>;

    /// Insert or replace the account, keeping the original creation time.
    /// Returns the stored account.
    fn upsert(&self, account: Account) -> Account;
}

/// Process-local account registry.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<CallerId, Account>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn find_by_key(&self, key: &CallerId) -> Option<Account> {
        self.accounts.get(key).map(|a| a.value().clone())
    }

    fn upsert(&self, account: Account) -> Account {
        let mut entry = self
            .accounts
            .entry(account.key.clone())
            .or_insert_with(|| account.clone());
        entry.plan = account.plan;
        entry.updated_at = Utc::now();
        let stored = entry.value().clone();
        tracing::info!(caller = %stored.key, plan = %stored.plan, "Account updated");
        stored
    }
}
