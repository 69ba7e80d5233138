//! DeviceToken entity - A push target owned by the auth service

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

/// Read-only here: tokens are mutated by the auth service and soft-deleted
/// through the token-deletion queue when a platform reports them unregistered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceToken {
    pub user_id: UserId,
    pub token: String,
    pub platform: Platform,
}
