use axum::{
    extract::{
        Extension, Json, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    AppState,
    utils::{
        ApiResponse, Claims, error_codes, error_to_api_response, success_to_api_response,
    },
};

use super::listener::RequestListener;
use super::model::{BlockedUser, Connection, ConnectionRequest, RequestError};

#[derive(Debug, Deserialize)]
pub struct SendRequestRequest {
    pub to_user_id: String,
    /// 客户端生成的请求id，带上它重试就是幂等的
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HandleRequestRequest {
    pub request_id: String,
    pub accept: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequestRequest {
    pub to_user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PeerRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PeerQuery {
    pub user_id: String,
}

/// 界面用来决定展示哪个操作按钮的点查询结果，永远查库不走缓存
#[derive(Debug, Serialize)]
pub struct RequestStateResponse {
    pub connected: bool,
    pub has_pending: bool,
    pub has_incoming: bool,
    pub pending_request: Option<ConnectionRequest>,
}

fn error_response<T>(e: RequestError) -> (StatusCode, axum::Json<ApiResponse<T>>) {
    let status = match &e {
        RequestError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, error_to_api_response(e.code(), e.message()))
}

#[axum::debug_handler]
pub async fn send_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendRequestRequest>,
) -> impl IntoResponse {
    match ConnectionRequest::send(
        &state.pool,
        &claims.sub,
        &req.to_user_id,
        req.request_id,
        state.config.block_check_on_request,
    )
    .await
    {
        Ok(request) => (StatusCode::OK, success_to_api_response(request)),
        Err(e) => error_response(e),
    }
}

#[axum::debug_handler]
pub async fn respond_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<HandleRequestRequest>,
) -> impl IntoResponse {
    match ConnectionRequest::handle(&state.pool, &claims.sub, &req.request_id, req.accept).await {
        Ok(request) => (StatusCode::OK, success_to_api_response(request)),
        Err(e) => error_response(e),
    }
}

#[axum::debug_handler]
pub async fn cancel_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CancelRequestRequest>,
) -> impl IntoResponse {
    match ConnectionRequest::cancel(&state.pool, &claims.sub, &req.to_user_id).await {
        Ok(()) => (
            StatusCode::OK,
            success_to_api_response(serde_json::json!({ "success": true })),
        ),
        Err(e) => error_response(e),
    }
}

#[axum::debug_handler]
pub async fn remove_connection(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PeerRequest>,
) -> impl IntoResponse {
    match Connection::remove(&state.pool, &claims.sub, &req.user_id).await {
        Ok(()) => (
            StatusCode::OK,
            success_to_api_response(serde_json::json!({ "success": true })),
        ),
        Err(e) => error_response(e),
    }
}

#[axum::debug_handler]
pub async fn list_connections(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match Connection::list(&state.pool, &claims.sub).await {
        Ok(connections) => (StatusCode::OK, success_to_api_response(connections)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn pending_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match ConnectionRequest::pending_incoming(&state.pool, &claims.sub).await {
        Ok(requests) => (StatusCode::OK, success_to_api_response(requests)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn sent_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match ConnectionRequest::sent(&state.pool, &claims.sub).await {
        Ok(requests) => (StatusCode::OK, success_to_api_response(requests)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn request_state(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PeerQuery>,
) -> impl IntoResponse {
    let connected = Connection::exists(&state.pool, &claims.sub, &query.user_id).await;
    let pending = ConnectionRequest::find_pending(&state.pool, &claims.sub, &query.user_id).await;
    let incoming =
        ConnectionRequest::has_incoming(&state.pool, &claims.sub, &query.user_id).await;

    match (connected, pending, incoming) {
        (Ok(connected), Ok(pending), Ok(has_incoming)) => (
            StatusCode::OK,
            success_to_api_response(RequestStateResponse {
                connected,
                has_pending: pending.is_some(),
                has_incoming,
                pending_request: pending,
            }),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, "数据库错误".to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn block_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PeerRequest>,
) -> impl IntoResponse {
    match BlockedUser::block(&state.pool, &claims.sub, &req.user_id).await {
        Ok(()) => (
            StatusCode::OK,
            success_to_api_response(serde_json::json!({ "success": true })),
        ),
        Err(e) => error_response(e),
    }
}

#[axum::debug_handler]
pub async fn unblock_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PeerRequest>,
) -> impl IntoResponse {
    match BlockedUser::unblock(&state.pool, &claims.sub, &req.user_id).await {
        Ok(()) => (
            StatusCode::OK,
            success_to_api_response(serde_json::json!({ "success": true })),
        ),
        Err(e) => error_response(e),
    }
}

#[axum::debug_handler]
pub async fn blocked_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match BlockedUser::list(&state.pool, &claims.sub).await {
        Ok(blocked) => (StatusCode::OK, success_to_api_response(blocked)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

/// WebSocket 订阅：连接期间持续推送当前用户的待处理请求列表，
/// 每次变更整体推送（不是增量）
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Response {
    ws.on_upgrade(move |socket| stream_pending_requests(socket, state, claims))
}

async fn stream_pending_requests(mut socket: WebSocket, state: AppState, claims: Claims) {
    let mut listener = RequestListener::new(claims.sub.clone());
    let mut updates = listener.subscribe();

    if let Err(e) = listener.start(state.pool.clone()).await {
        tracing::warn!("Failed to start request listener for {}: {}", claims.sub, e);
        return;
    }

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let pending = updates.borrow_and_update().clone();
                let payload = match serde_json::to_string(&pending) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!("Failed to encode pending requests: {}", e);
                        break;
                    }
                };
                if SinkExt::send(&mut socket, Message::Text(payload.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            msg = socket.next() => {
                match msg {
                    // 客户端只读，收到关闭或出错即结束
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // 显式停掉订阅，Drop 兜底，绝不让旧会话的监听漏进新会话
    listener.stop();
}
