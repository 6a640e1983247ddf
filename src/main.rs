use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use cardlink_backend::{
    AppState,
    cache::EntityCache,
    config::Config,
    middleware::{RateLimiter, auth_middleware, log_errors, rate_limit},
    routes,
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
use tower_http::timeout::TimeoutLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    // 设置数据库连接池
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'cardlink_backend';")
                    .await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // 设置 Redis 客户端
    let redis_client =
        redis::Client::open(config.redis_url.clone()).expect("Failed to create Redis client");
    let redis_arc = Arc::new(redis_client.clone());

    // 实体缓存在这里构造并注入，进程内唯一实例
    let cache = Arc::new(EntityCache::new(config.cache_ttl()));

    // 设置应用状态
    let state = AppState {
        pool,
        config: config.clone(),
        redis: redis_arc,
        cache,
    };

    // 设置限流器
    let rate_limiter = Arc::new(RateLimiter::new(redis_client, config.clone()));

    // 将路由分为公开路由和受保护路由
    let public_routes = Router::new()
        // 用户公开路由
        .route("/users/register", post(routes::user::register))
        .route("/users/login", post(routes::user::login))
        .route("/users/by-username", get(routes::user::find_by_username))
        .route("/users/resolve-link", get(routes::user::resolve_profile_link))
        // 名片分享与二维码入口
        .route("/cards/by-id", get(routes::card::find_by_id));

    let protected_routes = Router::new()
        // 需要认证的用户路由
        .route("/users/update-username", put(routes::user::update_username))
        .route("/users/update-password", put(routes::user::update_password))
        .route("/users/refresh-token", post(routes::user::refresh_token))
        .route("/users/check-token", get(routes::user::check_token))
        .route("/users/by-id", get(routes::user::find_by_id))
        .route("/users/search", get(routes::user::search))
        // 名片路由
        .route("/cards/create", post(routes::card::create_card))
        .route("/cards/update", put(routes::card::update_card))
        .route("/cards/mine", get(routes::card::my_card))
        // 连接请求状态机路由
        .route("/connections/request", post(routes::connection::send_request))
        .route("/connections/respond", post(routes::connection::respond_request))
        .route("/connections/cancel", post(routes::connection::cancel_request))
        .route("/connections/remove", post(routes::connection::remove_connection))
        .route("/connections/list", get(routes::connection::list_connections))
        .route(
            "/connections/requests/pending",
            get(routes::connection::pending_requests),
        )
        .route(
            "/connections/requests/sent",
            get(routes::connection::sent_requests),
        )
        .route(
            "/connections/request-state",
            get(routes::connection::request_state),
        )
        .route("/connections/block", post(routes::connection::block_user))
        .route("/connections/unblock", post(routes::connection::unblock_user))
        .route("/connections/blocked", get(routes::connection::blocked_users))
        // 实时订阅
        .route("/connections/subscribe", get(routes::connection::subscribe))
        // 应用认证中间件
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // 创建基础路由
    let router = Router::new().nest(
        &config.api_base_uri.clone(),
        Router::new().merge(public_routes).merge(protected_routes),
    );

    // 添加日志中间件、限流中间件和整体超时
    let router = router
        .layer(axum::middleware::from_fn(log_errors))
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit,
        ))
        .layer(TimeoutLayer::new(config.request_timeout()));

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        let cors = tower_http::cors::CorsLayer::permissive();
        router.layer(cors)
    };

    // 添加应用状态
    let app = router.with_state(state.clone());

    // 启动服务器
    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
