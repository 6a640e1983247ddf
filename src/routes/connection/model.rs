//! 连接请求状态机与社交图操作。
//!
//! 每个请求有两个副本（接收者收件箱、发送者已发送列表），每条连接是
//! 两行方向记录。任何涉及多行的变更都在一个事务里提交，提交后通过
//! `pg_notify` 通知受影响用户的实时订阅。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::routes::user::model::User;
use crate::utils::error_codes;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_ACCEPTED: &str = "accepted";
pub const STATUS_REJECTED: &str = "rejected";

pub const BOX_INBOX: &str = "inbox";
pub const BOX_SENT: &str = "sent";

/// 挂起请求变更的通知频道，负载为受影响用户id
pub const NOTIFY_CHANNEL: &str = "connection_requests";

/// 请求状态只允许 pending -> accepted / rejected，取消是删除而非状态迁移
pub fn is_valid_transition(current: &str, next: &str) -> bool {
    current == STATUS_PENDING && (next == STATUS_ACCEPTED || next == STATUS_REJECTED)
}

#[derive(Debug)]
pub enum RequestError {
    /// 自己向自己发起
    SelfRequest,
    /// 双方已经是连接
    AlreadyConnected,
    /// 同方向已存在待处理请求
    RequestExists,
    /// 存在屏蔽关系
    Blocked,
    /// 客户端带来的请求id已被别的请求占用
    IdInUse,
    /// 请求已不在待处理状态
    NotPending,
    NotFound,
    Database(sqlx::Error),
}

impl From<sqlx::Error> for RequestError {
    fn from(e: sqlx::Error) -> Self {
        RequestError::Database(e)
    }
}

impl RequestError {
    pub fn code(&self) -> i32 {
        match self {
            RequestError::SelfRequest => error_codes::INVALID_REQUEST,
            RequestError::AlreadyConnected => error_codes::ALREADY_CONNECTED,
            RequestError::RequestExists => error_codes::REQUEST_EXISTS,
            RequestError::Blocked => error_codes::USER_BLOCKED,
            RequestError::IdInUse => error_codes::INVALID_REQUEST,
            RequestError::NotPending => error_codes::INVALID_REQUEST,
            RequestError::NotFound => error_codes::NOT_FOUND,
            RequestError::Database(_) => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RequestError::SelfRequest => "不能向自己发起连接请求".into(),
            RequestError::AlreadyConnected => "你们已经是连接".into(),
            RequestError::RequestExists => "已存在待处理的连接请求".into(),
            RequestError::Blocked => "无法向该用户发起连接请求".into(),
            RequestError::IdInUse => "请求id不可用".into(),
            RequestError::NotPending => "该请求已被处理".into(),
            RequestError::NotFound => "请求或用户不存在".into(),
            RequestError::Database(e) => e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConnectionRequest {
    pub request_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub from_username: String,
    pub to_username: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// 连接边的单侧视图：对端id和建立连接时对端的用户名快照
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Connection {
    pub user_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct BlockedUser {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

const REQUEST_COLUMNS: &str =
    "request_id, from_user_id, to_user_id, from_username, to_username, status, created_at";

/// 请求副本写入失败时按违反的唯一索引区分失败原因
fn map_request_insert_error(e: sqlx::Error) -> RequestError {
    let msg = e.to_string();
    if msg.contains("connection_requests_pending_idx") {
        // 预检查与写入之间的并发重复由部分唯一索引兜底
        RequestError::RequestExists
    } else if msg.contains("connection_requests_request_box_idx") {
        RequestError::IdInUse
    } else {
        RequestError::Database(e)
    }
}

/// 提交后通知某用户的挂起请求集合可能已变化。
/// 通知失败只记录日志，不影响已提交的变更。
pub async fn notify_pending_changed(pool: &PgPool, user_id: &str) {
    if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(user_id)
        .execute(pool)
        .await
    {
        tracing::warn!("Failed to notify pending change for {}: {}", user_id, e);
    }
}

impl ConnectionRequest {
    /// 发起连接请求。失败原因彼此区分：自我请求、已是连接、重复请求、
    /// 屏蔽关系（由配置开关控制是否检查）。
    ///
    /// 客户端可以带上自己生成的请求id，这样重试是幂等的：同id同目标的
    /// 已有请求会被原样返回而不是报重复；id被别的请求占用则拒绝。
    pub async fn send(
        pool: &PgPool,
        from_user_id: &str,
        to_user_id: &str,
        request_id: Option<String>,
        check_blocks: bool,
    ) -> Result<Self, RequestError> {
        if from_user_id == to_user_id {
            return Err(RequestError::SelfRequest);
        }

        let from_user = User::find_by_id(pool, from_user_id)
            .await?
            .ok_or(RequestError::NotFound)?;
        let to_user = User::find_by_id(pool, to_user_id)
            .await?
            .ok_or(RequestError::NotFound)?;

        // 重试同一个客户端生成的id直接返回已有请求，
        // 但只有方向和目标都一致的已有请求才算重试命中
        if let Some(id) = &request_id {
            if let Some(existing) = Self::find_by_owner(pool, from_user_id, id).await? {
                if existing.from_user_id == from_user_id && existing.to_user_id == to_user_id {
                    return Ok(existing);
                }
                return Err(RequestError::IdInUse);
            }
        }

        if check_blocks && BlockedUser::blocked_either_way(pool, from_user_id, to_user_id).await? {
            return Err(RequestError::Blocked);
        }

        if Connection::exists(pool, from_user_id, to_user_id).await? {
            return Err(RequestError::AlreadyConnected);
        }

        if Self::find_pending(pool, from_user_id, to_user_id)
            .await?
            .is_some()
        {
            return Err(RequestError::RequestExists);
        }

        let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // 两个副本在同一事务写入：接收者收件箱 + 发送者已发送列表
        let mut tx = pool.begin().await?;

        let insert = format!(
            r#"
            INSERT INTO connection_requests
                (owner_id, box_kind, request_id, from_user_id, to_user_id,
                 from_username, to_username, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, '{STATUS_PENDING}')
            RETURNING {REQUEST_COLUMNS}
            "#
        );

        sqlx::query(&insert)
            .bind(to_user_id)
            .bind(BOX_INBOX)
            .bind(&request_id)
            .bind(from_user_id)
            .bind(to_user_id)
            .bind(&from_user.username)
            .bind(&to_user.username)
            .execute(&mut *tx)
            .await
            .map_err(map_request_insert_error)?;

        let request = sqlx::query_as::<_, ConnectionRequest>(&insert)
            .bind(from_user_id)
            .bind(BOX_SENT)
            .bind(&request_id)
            .bind(from_user_id)
            .bind(to_user_id)
            .bind(&from_user.username)
            .bind(&to_user.username)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_request_insert_error)?;

        tx.commit().await?;

        tracing::info!(
            "Connection request {} sent: {} -> {}",
            request.request_id,
            from_user_id,
            to_user_id
        );
        notify_pending_changed(pool, to_user_id).await;
        Ok(request)
    }

    /// 接受或拒绝请求。只有接收者能处理；两个副本的状态在同一事务更新，
    /// 接受时还在同一事务写入两条方向连接记录。
    pub async fn handle(
        pool: &PgPool,
        actor_id: &str,
        request_id: &str,
        accept: bool,
    ) -> Result<Self, RequestError> {
        let next_status = if accept { STATUS_ACCEPTED } else { STATUS_REJECTED };

        let mut tx = pool.begin().await?;

        // 锁定收件箱副本；按 owner 查找即隐含了操作者必须是接收者
        let request = sqlx::query_as::<_, ConnectionRequest>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM connection_requests
            WHERE owner_id = $1 AND box_kind = $2 AND request_id = $3
            FOR UPDATE
            "#
        ))
        .bind(actor_id)
        .bind(BOX_INBOX)
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(RequestError::NotFound)?;

        if !is_valid_transition(&request.status, next_status) {
            return Err(RequestError::NotPending);
        }

        // 只更新这一对用户的收件箱和已发送两份副本，id相同的无关行不能被波及
        sqlx::query(
            r#"
            UPDATE connection_requests
            SET status = $1
            WHERE request_id = $2 AND from_user_id = $3 AND to_user_id = $4
            "#,
        )
        .bind(next_status)
        .bind(request_id)
        .bind(&request.from_user_id)
        .bind(&request.to_user_id)
        .execute(&mut *tx)
        .await?;

        if accept {
            // 对称边：两侧各一行，用户名取请求创建时的快照
            sqlx::query(
                r#"
                INSERT INTO connections (owner_id, peer_id, peer_username)
                VALUES ($1, $2, $3), ($4, $5, $6)
                ON CONFLICT (owner_id, peer_id) DO NOTHING
                "#,
            )
            .bind(&request.to_user_id)
            .bind(&request.from_user_id)
            .bind(&request.from_username)
            .bind(&request.from_user_id)
            .bind(&request.to_user_id)
            .bind(&request.to_username)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            "Connection request {} {} by {}",
            request_id,
            next_status,
            actor_id
        );
        notify_pending_changed(pool, actor_id).await;
        notify_pending_changed(pool, &request.from_user_id).await;

        Ok(ConnectionRequest {
            status: next_status.to_string(),
            ..request
        })
    }

    /// 取消自己发出的待处理请求。按方向定位（调用方不需要持有请求id），
    /// 两个副本在同一事务删除。
    pub async fn cancel(
        pool: &PgPool,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<(), RequestError> {
        let mut tx = pool.begin().await?;

        let result = sqlx::query(
            r#"
            DELETE FROM connection_requests
            WHERE from_user_id = $1 AND to_user_id = $2 AND status = $3
            "#,
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .bind(STATUS_PENDING)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RequestError::NotFound);
        }

        tx.commit().await?;

        tracing::info!(
            "Connection request cancelled: {} -> {}",
            from_user_id,
            to_user_id
        );
        notify_pending_changed(pool, to_user_id).await;
        Ok(())
    }

    pub async fn find_by_owner(
        pool: &PgPool,
        owner_id: &str,
        request_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ConnectionRequest>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM connection_requests
            WHERE owner_id = $1 AND request_id = $2
            "#
        ))
        .bind(owner_id)
        .bind(request_id)
        .fetch_optional(pool)
        .await
    }

    /// 当前用户收件箱中的待处理请求。永不走缓存；来自自己的记录在
    /// 查询层面就被过滤掉（对 send 侧检查的纵深防御）。
    pub async fn pending_incoming(
        pool: &PgPool,
        user_id: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ConnectionRequest>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM connection_requests
            WHERE owner_id = $1 AND box_kind = $2 AND status = $3
              AND from_user_id <> $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .bind(BOX_INBOX)
        .bind(STATUS_PENDING)
        .fetch_all(pool)
        .await
    }

    /// 当前用户的已发送列表（含已被接受/拒绝的）
    pub async fn sent(pool: &PgPool, user_id: &str) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ConnectionRequest>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM connection_requests
            WHERE owner_id = $1 AND box_kind = $2
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .bind(BOX_SENT)
        .fetch_all(pool)
        .await
    }

    pub async fn find_pending(
        pool: &PgPool,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ConnectionRequest>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM connection_requests
            WHERE owner_id = $1 AND box_kind = $2
              AND to_user_id = $3 AND status = $4
            "#
        ))
        .bind(from_user_id)
        .bind(BOX_SENT)
        .bind(to_user_id)
        .bind(STATUS_PENDING)
        .fetch_optional(pool)
        .await
    }

    pub async fn has_pending(
        pool: &PgPool,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<bool, sqlx::Error> {
        Ok(Self::find_pending(pool, from_user_id, to_user_id)
            .await?
            .is_some())
    }

    pub async fn has_incoming(
        pool: &PgPool,
        user_id: &str,
        from_user_id: &str,
    ) -> Result<bool, sqlx::Error> {
        Ok(Self::find_pending(pool, from_user_id, user_id)
            .await?
            .is_some())
    }
}

impl Connection {
    pub async fn list(pool: &PgPool, user_id: &str) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Connection>(
            r#"
            SELECT peer_id AS user_id, peer_username AS username, created_at
            FROM connections
            WHERE owner_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn exists(pool: &PgPool, user_id: &str, peer_id: &str) -> Result<bool, sqlx::Error> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM connections WHERE owner_id = $1 AND peer_id = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(peer_id)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    /// 断开连接：删除两侧方向记录，并清理两个方向上可能残留的请求副本，
    /// 防止断开后还留着一条可被接受的旧请求。
    pub async fn remove(
        pool: &PgPool,
        user_id: &str,
        peer_id: &str,
    ) -> Result<(), RequestError> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM connections
            WHERE (owner_id = $1 AND peer_id = $2) OR (owner_id = $2 AND peer_id = $1)
            "#,
        )
        .bind(user_id)
        .bind(peer_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM connection_requests
            WHERE (from_user_id = $1 AND to_user_id = $2)
               OR (from_user_id = $2 AND to_user_id = $1)
            "#,
        )
        .bind(user_id)
        .bind(peer_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!("Connection removed: {} <-> {}", user_id, peer_id);
        notify_pending_changed(pool, user_id).await;
        notify_pending_changed(pool, peer_id).await;
        Ok(())
    }
}

impl BlockedUser {
    /// 屏蔽用户。屏蔽记录是单向的，但已有连接必须在同一事务里双向删除
    /// （屏蔽优先于连接），残留请求一并清理。
    pub async fn block(
        pool: &PgPool,
        user_id: &str,
        target_id: &str,
    ) -> Result<(), RequestError> {
        if user_id == target_id {
            return Err(RequestError::SelfRequest);
        }

        User::find_by_id(pool, target_id)
            .await?
            .ok_or(RequestError::NotFound)?;

        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO blocked_users (owner_id, blocked_id)
            VALUES ($1, $2)
            ON CONFLICT (owner_id, blocked_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM connections
            WHERE (owner_id = $1 AND peer_id = $2) OR (owner_id = $2 AND peer_id = $1)
            "#,
        )
        .bind(user_id)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM connection_requests
            WHERE (from_user_id = $1 AND to_user_id = $2)
               OR (from_user_id = $2 AND to_user_id = $1)
            "#,
        )
        .bind(user_id)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!("User {} blocked {}", user_id, target_id);
        notify_pending_changed(pool, user_id).await;
        notify_pending_changed(pool, target_id).await;
        Ok(())
    }

    pub async fn unblock(
        pool: &PgPool,
        user_id: &str,
        target_id: &str,
    ) -> Result<(), RequestError> {
        let result = sqlx::query(
            r#"
            DELETE FROM blocked_users WHERE owner_id = $1 AND blocked_id = $2
            "#,
        )
        .bind(user_id)
        .bind(target_id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RequestError::NotFound);
        }
        Ok(())
    }

    pub async fn list(pool: &PgPool, user_id: &str) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, BlockedUser>(
            r#"
            SELECT blocked_id AS user_id, created_at
            FROM blocked_users
            WHERE owner_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    /// 任一方向存在屏蔽即视为屏蔽
    pub async fn blocked_either_way(
        pool: &PgPool,
        user_id: &str,
        peer_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let (blocked,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM blocked_users
                WHERE (owner_id = $1 AND blocked_id = $2)
                   OR (owner_id = $2 AND blocked_id = $1)
            )
            "#,
        )
        .bind(user_id)
        .bind(peer_id)
        .fetch_one(pool)
        .await?;
        Ok(blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_transition_to_accepted_or_rejected() {
        assert!(is_valid_transition(STATUS_PENDING, STATUS_ACCEPTED));
        assert!(is_valid_transition(STATUS_PENDING, STATUS_REJECTED));
    }

    #[test]
    fn transitions_are_monotonic() {
        // 已处理的请求不能再迁移
        assert!(!is_valid_transition(STATUS_ACCEPTED, STATUS_REJECTED));
        assert!(!is_valid_transition(STATUS_REJECTED, STATUS_ACCEPTED));
        assert!(!is_valid_transition(STATUS_ACCEPTED, STATUS_PENDING));
        assert!(!is_valid_transition(STATUS_PENDING, STATUS_PENDING));
    }

    #[test]
    fn error_codes_are_distinct_per_failure() {
        let errors = [
            RequestError::SelfRequest,
            RequestError::AlreadyConnected,
            RequestError::RequestExists,
            RequestError::Blocked,
            RequestError::NotFound,
        ];
        for (i, a) in errors.iter().enumerate() {
            for (j, b) in errors.iter().enumerate() {
                if i != j {
                    assert_ne!(a.code(), b.code(), "{:?} vs {:?}", a, b);
                }
            }
        }
    }
}
