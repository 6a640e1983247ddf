use axum::{
    extract::{Extension, Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::{
    AppState,
    utils::{
        Claims, error_codes, error_to_api_response, generate_token, success_to_api_response,
        username::{parse_profile_link, validate_username},
    },
};

use super::model::{
    CheckTokenResponse, LoginRequest, LoginResponse, RefreshTokenResponse, RegisterRequest,
    RegisterResponse, UpdatePasswordRequest, UpdateUsernameRequest, User, UserProfile,
};

#[derive(Debug, Deserialize)]
pub struct UsernameQuery {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveLinkQuery {
    pub link: String,
}

#[axum::debug_handler]
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    // 用户名规则校验，每种失败单独提示
    if let Err(kind) = validate_username(&req.username) {
        return (
            StatusCode::OK,
            error_to_api_response(error_codes::VALIDATION_ERROR, kind.message().to_string()),
        );
    }

    if req.password.len() < 6 || req.password.len() > 24 {
        return (
            StatusCode::OK,
            error_to_api_response(
                error_codes::VALIDATION_ERROR,
                "密码长度必须在6到24个字符之间".to_string(),
            ),
        );
    }

    match User::username_taken(&state.pool, &req.username).await {
        Ok(true) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::USER_EXISTS, "该用户名已被占用".to_string()),
            );
        }
        Ok(false) => {}
        Err(_) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "数据库错误".to_string()),
            );
        }
    }

    match User::create(&state.pool, &req.username, &req.password).await {
        Ok(user) => match generate_token(&user.user_id, &state.config) {
            Ok(token) => (
                StatusCode::OK,
                success_to_api_response(RegisterResponse {
                    user_id: user.user_id,
                    username: user.username,
                    token,
                }),
            ),
            Err(_) => (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "生成令牌失败".to_string()),
            ),
        },
        Err(e) => {
            // 占用检查与插入之间存在竞争，唯一索引兜底
            if e.to_string().contains("unique constraint") {
                (
                    StatusCode::OK,
                    error_to_api_response(error_codes::USER_EXISTS, "该用户名已被占用".to_string()),
                )
            } else {
                (
                    StatusCode::OK,
                    error_to_api_response(error_codes::INTERNAL_ERROR, "创建用户失败".to_string()),
                )
            }
        }
    }
}

#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let user = match User::find_by_username(&state.pool, &req.username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::NOT_FOUND, "用户不存在".to_string()),
            );
        }
        Err(_) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "数据库错误".to_string()),
            );
        }
    };

    match user.verify_login(&req.password).await {
        Ok(true) => (),
        Ok(false) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::AUTH_FAILED, "密码无效".to_string()),
            );
        }
        Err(_) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "数据库错误".to_string()),
            );
        }
    }

    match generate_token(&user.user_id, &state.config) {
        Ok(token) => (
            StatusCode::OK,
            success_to_api_response(LoginResponse {
                user_id: user.user_id,
                token,
            }),
        ),
        Err(_) => (
            StatusCode::OK,
            error_to_api_response(error_codes::INTERNAL_ERROR, "生成令牌失败".to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn refresh_token(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match generate_token(&claims.sub, &state.config) {
        Ok(token) => (
            StatusCode::OK,
            success_to_api_response(RefreshTokenResponse { token }),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, "刷新令牌失败".to_string()),
        ),
    }
}

/// 中间件已验证token，这里直接返回成功
#[axum::debug_handler]
pub async fn check_token(Extension(claims): Extension<Claims>) -> impl IntoResponse {
    (
        StatusCode::OK,
        success_to_api_response(CheckTokenResponse { user_id: claims.sub }),
    )
}

#[axum::debug_handler]
pub async fn update_username(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
    Json(req): Json<UpdateUsernameRequest>,
) -> impl IntoResponse {
    if let Err(kind) = validate_username(&req.username) {
        return (
            StatusCode::OK,
            error_to_api_response(error_codes::VALIDATION_ERROR, kind.message().to_string()),
        );
    }

    match User::username_taken(&state.pool, &req.username).await {
        Ok(true) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::USER_EXISTS, "该用户名已被占用".to_string()),
            );
        }
        Ok(false) => {}
        Err(_) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "数据库错误".to_string()),
            );
        }
    }

    match User::update_username(&state.pool, &claims.sub, &req.username).await {
        Ok(user) => {
            // 改名后失效缓存中的旧资料
            state.cache.users.remove(&user.user_id).await;
            (StatusCode::OK, success_to_api_response(user))
        }
        Err(e) => {
            if e.to_string().contains("unique constraint") {
                (
                    StatusCode::OK,
                    error_to_api_response(error_codes::USER_EXISTS, "该用户名已被占用".to_string()),
                )
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
                )
            }
        }
    }
}

#[axum::debug_handler]
pub async fn update_password(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
    Json(req): Json<UpdatePasswordRequest>,
) -> impl IntoResponse {
    if req.password.len() < 6 || req.password.len() > 24 {
        return (
            StatusCode::BAD_REQUEST,
            error_to_api_response(
                error_codes::VALIDATION_ERROR,
                "密码长度必须在6到24个字符之间".to_string(),
            ),
        );
    }

    match User::update_password(&state.pool, &claims.sub, &req.password).await {
        Ok(user) => (StatusCode::OK, success_to_api_response(user)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn find_by_username(
    State(state): State<AppState>,
    Query(query): Query<UsernameQuery>,
) -> impl IntoResponse {
    match UserProfile::find_by_username(&state.pool, &query.username).await {
        Ok(Some(profile)) => {
            state
                .cache
                .users
                .put(profile.user_id.clone(), profile.clone())
                .await;
            (StatusCode::OK, success_to_api_response(profile))
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_to_api_response(error_codes::NOT_FOUND, "用户不存在".to_string()),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

/// 解析 `app://profile/{username}` 深链并返回对应用户资料，
/// 供客户端在建立任何关系前展示确认页
#[axum::debug_handler]
pub async fn resolve_profile_link(
    State(state): State<AppState>,
    Query(query): Query<ResolveLinkQuery>,
) -> impl IntoResponse {
    let Some(username) = parse_profile_link(&query.link) else {
        return (
            StatusCode::OK,
            error_to_api_response(error_codes::INVALID_REQUEST, "无效的分享链接".to_string()),
        );
    };

    match UserProfile::find_by_username(&state.pool, username).await {
        Ok(Some(profile)) => {
            state
                .cache
                .users
                .put(profile.user_id.clone(), profile.clone())
                .await;
            (StatusCode::OK, success_to_api_response(profile))
        }
        Ok(None) => (
            StatusCode::OK,
            error_to_api_response(error_codes::NOT_FOUND, "用户不存在".to_string()),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn find_by_id(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> impl IntoResponse {
    // 先查实体缓存，未命中再读库
    if let Some(profile) = state.cache.users.get(&query.user_id).await {
        tracing::debug!("Get user profile from cache: {}", query.user_id);
        return (StatusCode::OK, success_to_api_response(profile));
    }

    match UserProfile::find_by_id(&state.pool, &query.user_id).await {
        Ok(Some(profile)) => {
            state
                .cache
                .users
                .put(profile.user_id.clone(), profile.clone())
                .await;
            (StatusCode::OK, success_to_api_response(profile))
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_to_api_response(error_codes::NOT_FOUND, "用户不存在".to_string()),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    if query.q.is_empty() {
        return (
            StatusCode::OK,
            success_to_api_response(Vec::<UserProfile>::new()),
        );
    }

    let limit = query.limit.unwrap_or(20).clamp(1, 50);
    match UserProfile::search_by_prefix(&state.pool, &query.q, limit).await {
        Ok(profiles) => {
            // 搜索结果写入缓存，后续按id的查询直接命中
            for profile in &profiles {
                state
                    .cache
                    .users
                    .put(profile.user_id.clone(), profile.clone())
                    .await;
            }
            (StatusCode::OK, success_to_api_response(profiles))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}
