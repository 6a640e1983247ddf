use axum::{
    extract::{Extension, Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::{
    AppState,
    utils::{Claims, error_codes, error_to_api_response, success_to_api_response},
};

use super::model::{Card, SaveCardRequest};

#[derive(Debug, Deserialize)]
pub struct CardIdQuery {
    pub card_id: String,
}

#[axum::debug_handler]
pub async fn create_card(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SaveCardRequest>,
) -> impl IntoResponse {
    // 每个用户只有一张名片
    match Card::find_by_user(&state.pool, &claims.sub).await {
        Ok(Some(_)) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::CARD_EXISTS, "名片已存在".to_string()),
            );
        }
        Ok(None) => {}
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
            );
        }
    }

    match Card::create(&state.pool, &claims.sub, req).await {
        Ok(card) => {
            state.cache.cards.put(card.card_id.clone(), card.clone()).await;
            (StatusCode::CREATED, success_to_api_response(card))
        }
        Err(e) => {
            if e.to_string().contains("unique constraint") {
                (
                    StatusCode::OK,
                    error_to_api_response(error_codes::CARD_EXISTS, "名片已存在".to_string()),
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
pub async fn update_card(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SaveCardRequest>,
) -> impl IntoResponse {
    match Card::update(&state.pool, &claims.sub, req).await {
        Ok(Some(card)) => {
            // 更新后用新内容覆盖缓存条目
            state.cache.cards.put(card.card_id.clone(), card.clone()).await;
            (StatusCode::OK, success_to_api_response(card))
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_to_api_response(error_codes::NOT_FOUND, "名片不存在".to_string()),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn my_card(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match Card::find_by_user(&state.pool, &claims.sub).await {
        Ok(Some(card)) => (StatusCode::OK, success_to_api_response(card)),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_to_api_response(error_codes::NOT_FOUND, "名片不存在".to_string()),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

/// 公开接口，分享链接和二维码都通过名片id访问
#[axum::debug_handler]
pub async fn find_by_id(
    State(state): State<AppState>,
    Query(query): Query<CardIdQuery>,
) -> impl IntoResponse {
    if let Some(card) = state.cache.cards.get(&query.card_id).await {
        tracing::debug!("Get card from cache: {}", query.card_id);
        return (StatusCode::OK, success_to_api_response(card));
    }

    match Card::find_by_id(&state.pool, &query.card_id).await {
        Ok(Some(card)) => {
            state.cache.cards.put(card.card_id.clone(), card.clone()).await;
            (StatusCode::OK, success_to_api_response(card))
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_to_api_response(error_codes::NOT_FOUND, "名片不存在".to_string()),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(error_codes::INTERNAL_ERROR, e.to_string()),
        ),
    }
}
