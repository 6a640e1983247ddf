use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// 名片，每个用户一张，可按名片id独立访问（分享、二维码场景）
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Card {
    pub card_id: String,
    pub user_id: String,
    pub name: String,
    pub title: String,
    pub company: String,
    pub email: String,
    pub phone: String,
    pub linkedin: String,
    pub website: String,
    pub about_me: String,
    pub profile_picture_url: Option<String>,
    pub qr_code_url: Option<String>,
    pub color_scheme: String,
    pub font_style: String,
    pub layout_style: String,
    pub text_scale: f64,
    pub background_style: String,
    pub show_symbols: bool,
    pub is_vertical: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_text_scale() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_color_scheme() -> String {
    "classic".into()
}

fn default_font_style() -> String {
    "system".into()
}

fn default_layout_style() -> String {
    "standard".into()
}

fn default_background_style() -> String {
    "solid".into()
}

#[derive(Debug, Deserialize)]
pub struct SaveCardRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub linkedin: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub about_me: String,
    pub profile_picture_url: Option<String>,
    pub qr_code_url: Option<String>,
    #[serde(default = "default_color_scheme")]
    pub color_scheme: String,
    #[serde(default = "default_font_style")]
    pub font_style: String,
    #[serde(default = "default_layout_style")]
    pub layout_style: String,
    #[serde(default = "default_text_scale")]
    pub text_scale: f64,
    #[serde(default = "default_background_style")]
    pub background_style: String,
    #[serde(default = "default_true")]
    pub show_symbols: bool,
    #[serde(default)]
    pub is_vertical: bool,
}

const CARD_COLUMNS: &str = r#"
    card_id, user_id, name, title, company, email, phone, linkedin, website,
    about_me, profile_picture_url, qr_code_url, color_scheme, font_style,
    layout_style, text_scale, background_style, show_symbols, is_vertical,
    created_at, updated_at
"#;

impl Card {
    pub async fn create(
        pool: &PgPool,
        user_id: &str,
        req: SaveCardRequest,
    ) -> Result<Self, sqlx::Error> {
        let card_id = Uuid::new_v4().to_string();

        let card = sqlx::query_as::<_, Card>(&format!(
            r#"
            INSERT INTO cards (
                card_id, user_id, name, title, company, email, phone, linkedin,
                website, about_me, profile_picture_url, qr_code_url, color_scheme,
                font_style, layout_style, text_scale, background_style,
                show_symbols, is_vertical
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19)
            RETURNING {}
            "#,
            CARD_COLUMNS
        ))
        .bind(&card_id)
        .bind(user_id)
        .bind(&req.name)
        .bind(&req.title)
        .bind(&req.company)
        .bind(&req.email)
        .bind(&req.phone)
        .bind(&req.linkedin)
        .bind(&req.website)
        .bind(&req.about_me)
        .bind(&req.profile_picture_url)
        .bind(&req.qr_code_url)
        .bind(&req.color_scheme)
        .bind(&req.font_style)
        .bind(&req.layout_style)
        .bind(req.text_scale)
        .bind(&req.background_style)
        .bind(req.show_symbols)
        .bind(req.is_vertical)
        .fetch_one(pool)
        .await?;

        tracing::info!("Created card {} for user {}", card.card_id, user_id);
        Ok(card)
    }

    pub async fn update(
        pool: &PgPool,
        user_id: &str,
        req: SaveCardRequest,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            r#"
            UPDATE cards SET
                name = $1, title = $2, company = $3, email = $4, phone = $5,
                linkedin = $6, website = $7, about_me = $8,
                profile_picture_url = $9, qr_code_url = $10, color_scheme = $11,
                font_style = $12, layout_style = $13, text_scale = $14,
                background_style = $15, show_symbols = $16, is_vertical = $17,
                updated_at = NOW()
            WHERE user_id = $18
            RETURNING {}
            "#,
            CARD_COLUMNS
        ))
        .bind(&req.name)
        .bind(&req.title)
        .bind(&req.company)
        .bind(&req.email)
        .bind(&req.phone)
        .bind(&req.linkedin)
        .bind(&req.website)
        .bind(&req.about_me)
        .bind(&req.profile_picture_url)
        .bind(&req.qr_code_url)
        .bind(&req.color_scheme)
        .bind(&req.font_style)
        .bind(&req.layout_style)
        .bind(req.text_scale)
        .bind(&req.background_style)
        .bind(req.show_symbols)
        .bind(req.is_vertical)
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_id(pool: &PgPool, card_id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            "SELECT {} FROM cards WHERE card_id = $1",
            CARD_COLUMNS
        ))
        .bind(card_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_user(pool: &PgPool, user_id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            "SELECT {} FROM cards WHERE user_id = $1",
            CARD_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }
}
