use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::utils::{hash_password, verify_password};

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub qr_code_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 对外可见的用户资料，进入实体缓存的就是这个形状
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub card_id: Option<String>,
    pub qr_code_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUsernameRequest {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshTokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct CheckTokenResponse {
    pub user_id: String,
}

const PROFILE_SELECT: &str = r#"
    SELECT u.user_id, u.username, c.card_id, u.qr_code_url
    FROM users u
    LEFT JOIN cards c ON c.user_id = u.user_id
"#;

/// 转义 LIKE 通配符，用户输入只能按字面量匹配
fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl User {
    pub async fn create(
        pool: &PgPool,
        username: &str,
        password: &str,
    ) -> Result<Self, sqlx::Error> {
        let user_id = uuid::Uuid::new_v4().to_string();
        let password_hash = hash_password(password)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to hash password: {}", e)))?;

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (user_id, username, password_hash)
            VALUES ($1, $2, $3)
            RETURNING user_id, username, password_hash, qr_code_url, created_at
            "#,
        )
        .bind(&user_id)
        .bind(username)
        .bind(&password_hash)
        .fetch_one(pool)
        .await?;

        tracing::info!("Created user {} ({})", user.username, user.user_id);
        Ok(user)
    }

    pub async fn find_by_id(pool: &PgPool, user_id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, username, password_hash, qr_code_url, created_at
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_username(
        pool: &PgPool,
        username: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, username, password_hash, qr_code_url, created_at
            FROM users
            WHERE LOWER(username) = LOWER($1)
            "#,
        )
        .bind(username)
        .fetch_optional(pool)
        .await
    }

    /// 用户名占用检查，不区分大小写
    pub async fn username_taken(pool: &PgPool, username: &str) -> Result<bool, sqlx::Error> {
        let (taken,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(SELECT 1 FROM users WHERE LOWER(username) = LOWER($1))
            "#,
        )
        .bind(username)
        .fetch_one(pool)
        .await?;
        Ok(taken)
    }

    pub async fn update_username(
        pool: &PgPool,
        user_id: &str,
        username: &str,
    ) -> Result<Self, sqlx::Error> {
        // 旧请求记录上的冗余用户名保持写入时的快照，这里不回填
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET username = $1
            WHERE user_id = $2
            RETURNING user_id, username, password_hash, qr_code_url, created_at
            "#,
        )
        .bind(username)
        .bind(user_id)
        .fetch_one(pool)
        .await
    }

    pub async fn update_password(
        pool: &PgPool,
        user_id: &str,
        password: &str,
    ) -> Result<Self, sqlx::Error> {
        let password_hash = hash_password(password)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to hash password: {}", e)))?;

        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET password_hash = $1
            WHERE user_id = $2
            RETURNING user_id, username, password_hash, qr_code_url, created_at
            "#,
        )
        .bind(&password_hash)
        .bind(user_id)
        .fetch_one(pool)
        .await
    }

    pub async fn verify_login(&self, password: &str) -> Result<bool, bcrypt::BcryptError> {
        match &self.password_hash {
            Some(hash) => verify_password(password, hash),
            None => Ok(false),
        }
    }
}

impl UserProfile {
    pub async fn find_by_id(pool: &PgPool, user_id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, UserProfile>(&format!("{} WHERE u.user_id = $1", PROFILE_SELECT))
            .bind(user_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_username(
        pool: &PgPool,
        username: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, UserProfile>(&format!(
            "{} WHERE LOWER(u.username) = LOWER($1)",
            PROFILE_SELECT
        ))
        .bind(username)
        .fetch_optional(pool)
        .await
    }

    /// 用户名前缀搜索，结果写入实体缓存供后续按id查询复用
    pub async fn search_by_prefix(
        pool: &PgPool,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, UserProfile>(&format!(
            "{} WHERE u.username LIKE $1 ORDER BY u.username LIMIT $2",
            PROFILE_SELECT
        ))
        .bind(format!("{}%", escape_like(&prefix.to_lowercase())))
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_like_neutralizes_wildcards() {
        assert_eq!(escape_like("%"), "\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
        // 正常前缀原样通过
        assert_eq!(escape_like("alice"), "alice");
    }
}
