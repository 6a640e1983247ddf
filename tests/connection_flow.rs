//! 连接请求状态机的端到端场景测试。
//!
//! 需要一个可用的 Postgres，连接串取 `DATABASE_URL`，
//! 默认 ignore，本地跑：`cargo test -- --ignored`

use sqlx::PgPool;
use uuid::Uuid;

use cardlink_backend::routes::connection::model::{
    BlockedUser, Connection, ConnectionRequest, RequestError, STATUS_ACCEPTED, STATUS_PENDING,
};
use cardlink_backend::routes::user::model::User;

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for these tests");
    let pool = PgPool::connect(&url).await.expect("connect to Postgres");
    sqlx::migrate!().run(&pool).await.expect("run migrations");
    pool
}

async fn make_user(pool: &PgPool) -> User {
    let username = format!("t{}", Uuid::new_v4().simple());
    let username = &username[..20];
    User::create(pool, username, "password1").await.expect("create user")
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn duplicate_send_fails_with_request_exists() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .expect("first send succeeds");

    let err = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .expect_err("second send must fail");
    assert!(matches!(err, RequestError::RequestExists), "{:?}", err);
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn self_request_always_fails() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;

    let err = ConnectionRequest::send(&pool, &a.user_id, &a.user_id, None, true)
        .await
        .expect_err("self request must fail");
    assert!(matches!(err, RequestError::SelfRequest), "{:?}", err);
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn retry_with_client_generated_id_is_idempotent() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    let id = Uuid::new_v4().to_string();
    let first = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, Some(id.clone()), true)
        .await
        .expect("first send succeeds");
    let retry = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, Some(id.clone()), true)
        .await
        .expect("retry with same id succeeds");
    assert_eq!(first.request_id, retry.request_id);

    // 只有一条待处理请求
    let pending = ConnectionRequest::pending_incoming(&pool, &b.user_id)
        .await
        .unwrap();
    assert_eq!(
        pending.iter().filter(|r| r.from_user_id == a.user_id).count(),
        1
    );
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn reused_foreign_request_id_is_rejected() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;
    let c = make_user(&pool).await;
    let d = make_user(&pool).await;

    // C -> D 的待处理请求
    let victim = ConnectionRequest::send(&pool, &c.user_id, &d.user_id, None, true)
        .await
        .unwrap();

    // A 把别人的请求id塞进自己发给 B 的请求，必须被拒绝
    let err = ConnectionRequest::send(
        &pool,
        &a.user_id,
        &b.user_id,
        Some(victim.request_id.clone()),
        true,
    )
    .await
    .expect_err("foreign request id must be rejected");
    assert!(matches!(err, RequestError::IdInUse), "{:?}", err);

    // C -> D 的请求不受影响，D 仍可正常接受
    let untouched = ConnectionRequest::find_by_owner(&pool, &d.user_id, &victim.request_id)
        .await
        .unwrap()
        .expect("victim inbox copy exists");
    assert_eq!(untouched.status, STATUS_PENDING);
    ConnectionRequest::handle(&pool, &d.user_id, &victim.request_id, true)
        .await
        .expect("victim request still handled normally");

    // B 这边什么都没收到
    let b_pending = ConnectionRequest::pending_incoming(&pool, &b.user_id)
        .await
        .unwrap();
    assert!(b_pending.iter().all(|r| r.from_user_id != a.user_id));
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn retry_id_only_matches_same_target() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;
    let c = make_user(&pool).await;

    let id = Uuid::new_v4().to_string();
    ConnectionRequest::send(&pool, &a.user_id, &b.user_id, Some(id.clone()), true)
        .await
        .expect("send to B succeeds");

    // 同id换了目标不是重试，不能拿 A -> B 的旧请求充数
    let err = ConnectionRequest::send(&pool, &a.user_id, &c.user_id, Some(id.clone()), true)
        .await
        .expect_err("same id with a different target must be rejected");
    assert!(matches!(err, RequestError::IdInUse), "{:?}", err);

    // C 没有收到任何请求
    let c_pending = ConnectionRequest::pending_incoming(&pool, &c.user_id)
        .await
        .unwrap();
    assert!(c_pending.iter().all(|r| r.from_user_id != a.user_id));
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn accept_updates_both_copies_and_creates_symmetric_edges() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    let request = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .unwrap();
    assert_eq!(request.status, STATUS_PENDING);
    assert_eq!(request.from_username, a.username);

    ConnectionRequest::handle(&pool, &b.user_id, &request.request_id, true)
        .await
        .expect("recipient accepts");

    // 两个副本都变成 accepted
    let inbox_copy = ConnectionRequest::find_by_owner(&pool, &b.user_id, &request.request_id)
        .await
        .unwrap()
        .expect("inbox copy exists");
    let sent_copy = ConnectionRequest::find_by_owner(&pool, &a.user_id, &request.request_id)
        .await
        .unwrap()
        .expect("sent copy exists");
    assert_eq!(inbox_copy.status, STATUS_ACCEPTED);
    assert_eq!(sent_copy.status, STATUS_ACCEPTED);

    // 对称边，各自带对端的用户名快照
    let a_connections = Connection::list(&pool, &a.user_id).await.unwrap();
    let b_connections = Connection::list(&pool, &b.user_id).await.unwrap();
    let a_edge = a_connections
        .iter()
        .find(|c| c.user_id == b.user_id)
        .expect("A has edge to B");
    let b_edge = b_connections
        .iter()
        .find(|c| c.user_id == a.user_id)
        .expect("B has edge to A");
    assert_eq!(a_edge.username, b.username);
    assert_eq!(b_edge.username, a.username);
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn only_recipient_can_handle_request() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    let request = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .unwrap();

    // 发送者自己的副本在已发送列表，不在收件箱，按收件箱处理会找不到
    let err = ConnectionRequest::handle(&pool, &a.user_id, &request.request_id, true)
        .await
        .expect_err("sender must not be able to accept");
    assert!(matches!(err, RequestError::NotFound), "{:?}", err);
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn handled_request_cannot_transition_again() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    let request = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .unwrap();
    ConnectionRequest::handle(&pool, &b.user_id, &request.request_id, false)
        .await
        .unwrap();

    let err = ConnectionRequest::handle(&pool, &b.user_id, &request.request_id, true)
        .await
        .expect_err("rejected request must stay rejected");
    assert!(matches!(err, RequestError::NotPending), "{:?}", err);
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn cancel_deletes_both_copies() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    let request = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .unwrap();
    ConnectionRequest::cancel(&pool, &a.user_id, &b.user_id)
        .await
        .expect("sender cancels by direction");

    assert!(
        ConnectionRequest::find_by_owner(&pool, &b.user_id, &request.request_id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        ConnectionRequest::find_by_owner(&pool, &a.user_id, &request.request_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn remove_connection_cleans_edges_and_lingering_requests() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    let request = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .unwrap();
    ConnectionRequest::handle(&pool, &b.user_id, &request.request_id, true)
        .await
        .unwrap();

    Connection::remove(&pool, &a.user_id, &b.user_id)
        .await
        .expect("remove connection");

    assert!(!Connection::exists(&pool, &a.user_id, &b.user_id).await.unwrap());
    assert!(!Connection::exists(&pool, &b.user_id, &a.user_id).await.unwrap());

    // 双向都不残留任何请求副本
    assert!(
        ConnectionRequest::find_by_owner(&pool, &a.user_id, &request.request_id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        ConnectionRequest::find_by_owner(&pool, &b.user_id, &request.request_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "requires a running Postgres"]
async fn block_removes_connection_and_stops_new_requests() {
    let pool = test_pool().await;
    let a = make_user(&pool).await;
    let b = make_user(&pool).await;

    let request = ConnectionRequest::send(&pool, &a.user_id, &b.user_id, None, true)
        .await
        .unwrap();
    ConnectionRequest::handle(&pool, &b.user_id, &request.request_id, true)
        .await
        .unwrap();

    BlockedUser::block(&pool, &a.user_id, &b.user_id)
        .await
        .expect("A blocks B");

    // 屏蔽优先于连接：两侧边都被删除
    assert!(!Connection::exists(&pool, &a.user_id, &b.user_id).await.unwrap());
    assert!(!Connection::exists(&pool, &b.user_id, &a.user_id).await.unwrap());

    // 被屏蔽方发不了新请求（开启屏蔽检查时）
    let err = ConnectionRequest::send(&pool, &b.user_id, &a.user_id, None, true)
        .await
        .expect_err("blocked user must not send");
    assert!(matches!(err, RequestError::Blocked), "{:?}", err);

    // 关闭屏蔽检查的配置下允许发送
    BlockedUser::unblock(&pool, &a.user_id, &b.user_id)
        .await
        .expect("unblock");
    ConnectionRequest::send(&pool, &b.user_id, &a.user_id, None, true)
        .await
        .expect("send works again after unblock");
}
