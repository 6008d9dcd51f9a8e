use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 锁表中的一行：(cluster id, key) → (token, 租约到期时间)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub cluster_id: String,
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 成功获取锁后交给持有者的凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
