//! Catalogue of the server collections mirrored locally.
//!
//! Every kind maps to one SQLite mirror table, one REST collection and the
//! document field the UI sorts lists by.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Record,
    Invoice,
    Customer,
    Payment,
    UtilityService,
    Wallet,
    WithdrawalRequest,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Record,
        EntityKind::Invoice,
        EntityKind::Customer,
        EntityKind::Payment,
        EntityKind::UtilityService,
        EntityKind::Wallet,
        EntityKind::WithdrawalRequest,
    ];

    /// Name used in the queue table and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Record => "records",
            Self::Invoice => "invoices",
            Self::Customer => "customers",
            Self::Payment => "payments",
            Self::UtilityService => "utilityServices",
            Self::Wallet => "wallets",
            Self::WithdrawalRequest => "withdrawalRequests",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.table() == s)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown entity kind: {s}")))
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Record => "records",
            Self::Invoice => "invoices",
            Self::Customer => "customers",
            Self::Payment => "payments",
            Self::UtilityService => "utility_services",
            Self::Wallet => "wallets",
            Self::WithdrawalRequest => "withdrawal_requests",
        }
    }

    pub fn api_path(&self) -> &'static str {
        match self {
            Self::Record => "/api/records",
            Self::Invoice => "/api/invoices",
            Self::Customer => "/api/customers",
            Self::Payment => "/api/payments",
            Self::UtilityService => "/api/services",
            Self::Wallet => "/api/wallets",
            Self::WithdrawalRequest => "/api/withdrawals",
        }
    }

    /// Document field lists are ordered by (newest first).
    pub fn sort_field(&self) -> &'static str {
        match self {
            Self::Record => "date",
            Self::Invoice => "issueDate",
            _ => "createdAt",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            _ => Err(StoreError::InvalidData(format!("unknown sync status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(StoreError::InvalidData(format!("unknown queue action: {s}"))),
        }
    }
}
