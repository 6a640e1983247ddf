//! 挂起请求的实时订阅桥。
//!
//! 数据库端的变更通过 `pg_notify` 发到固定频道，负载是受影响用户id。
//! 桥收到与自己相关的通知后整表重读挂起列表（不是增量），过滤掉
//! `from_user_id == user_id` 的记录后整体替换当前值。消费方通过
//! watch 通道观察替换结果。

use std::future::Future;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::model::{ConnectionRequest, NOTIFY_CHANNEL};

pub struct RequestListener {
    user_id: String,
    current: watch::Sender<Vec<ConnectionRequest>>,
    // 保留一个接收端，保证没有订阅者时通道也不关闭
    current_rx: watch::Receiver<Vec<ConnectionRequest>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RequestListener {
    pub fn new(user_id: impl Into<String>) -> Self {
        let (current, current_rx) = watch::channel(Vec::new());
        Self {
            user_id: user_id.into(),
            current,
            current_rx,
            tasks: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ConnectionRequest>> {
        self.current_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// 打开订阅。已经在订阅时会先拆掉旧的，任一时刻至多一个存活订阅。
    pub async fn start(&mut self, pool: PgPool) -> Result<(), sqlx::Error> {
        let mut pg = PgListener::connect_with(&pool).await?;
        pg.listen(NOTIFY_CHANNEL).await?;

        let (tx, rx) = mpsc::channel::<String>(16);
        let user_id = self.user_id.clone();
        self.attach(rx, move || {
            let pool = pool.clone();
            let user_id = user_id.clone();
            async move { ConnectionRequest::pending_incoming(&pool, &user_id).await }
        });

        // 把数据库通知转发进内部通道
        let forward = tokio::spawn(async move {
            loop {
                match pg.recv().await {
                    Ok(notification) => {
                        if tx.send(notification.payload().to_string()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Realtime listener connection lost: {}", e);
                        break;
                    }
                }
            }
        });
        self.tasks.push(forward);

        Ok(())
    }

    /// 挂上通知源和重读函数。先停掉已有任务再生成新的中继。
    fn attach<F, Fut>(&mut self, mut notifications: mpsc::Receiver<String>, mut reload: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<ConnectionRequest>, sqlx::Error>> + Send,
    {
        self.stop();

        let user_id = self.user_id.clone();
        let current = self.current.clone();
        let relay = tokio::spawn(async move {
            // 启动即发布一次完整快照
            publish(&current, &user_id, reload().await);

            while let Some(payload) = notifications.recv().await {
                if payload != user_id {
                    continue;
                }
                publish(&current, &user_id, reload().await);
            }
        });
        self.tasks.push(relay);
    }

    /// 取消订阅并释放任务，可重复调用
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RequestListener {
    // 连接断开时订阅必须跟着消失，不能泄漏到下一个会话
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(
    current: &watch::Sender<Vec<ConnectionRequest>>,
    user_id: &str,
    result: Result<Vec<ConnectionRequest>, sqlx::Error>,
) {
    match result {
        Ok(requests) => {
            // 纵深防御：send 侧已经禁止自我请求，这里再过滤一遍
            let filtered: Vec<ConnectionRequest> = requests
                .into_iter()
                .filter(|r| r.from_user_id != user_id)
                .collect();
            current.send_replace(filtered);
        }
        Err(e) => {
            tracing::warn!("Failed to reload pending requests for {}: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn request(id: &str, from: &str, to: &str) -> ConnectionRequest {
        ConnectionRequest {
            request_id: id.to_string(),
            from_user_id: from.to_string(),
            to_user_id: to.to_string(),
            from_username: format!("name_{from}"),
            to_username: format!("name_{to}"),
            status: "pending".to_string(),
            created_at: Utc::now(),
        }
    }

    async fn wait_changed(rx: &mut watch::Receiver<Vec<ConnectionRequest>>) {
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("listener did not publish in time")
            .expect("watch channel closed");
    }

    #[tokio::test]
    async fn publishes_snapshot_on_matching_notification() {
        let mut listener = RequestListener::new("u2");
        let mut rx = listener.subscribe();

        let (tx, notifications) = mpsc::channel(16);
        listener.attach(notifications, || async {
            Ok(vec![request("r1", "u1", "u2")])
        });

        // 启动快照
        wait_changed(&mut rx).await;
        assert_eq!(rx.borrow_and_update().len(), 1);

        tx.send("u2".to_string()).await.unwrap();
        wait_changed(&mut rx).await;
        let pending = rx.borrow_and_update().clone();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, "r1");
    }

    #[tokio::test]
    async fn filters_self_requests_defensively() {
        let mut listener = RequestListener::new("u2");
        let mut rx = listener.subscribe();

        let (_tx, notifications) = mpsc::channel(16);
        listener.attach(notifications, || async {
            Ok(vec![request("r1", "u1", "u2"), request("r2", "u2", "u2")])
        });

        wait_changed(&mut rx).await;
        let pending = rx.borrow_and_update().clone();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].from_user_id, "u1");
    }

    #[tokio::test]
    async fn ignores_notifications_for_other_users() {
        let mut listener = RequestListener::new("u2");
        let mut rx = listener.subscribe();

        let (tx, notifications) = mpsc::channel(16);
        listener.attach(notifications, || async {
            Ok(vec![request("r1", "u1", "u2")])
        });
        wait_changed(&mut rx).await;

        tx.send("someone_else".to_string()).await.unwrap();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
        assert!(timed_out.is_err(), "unrelated payload must not republish");
    }

    #[tokio::test]
    async fn starting_twice_keeps_exactly_one_subscription() {
        let mut listener = RequestListener::new("u2");
        let mut rx = listener.subscribe();

        let (tx1, notifications1) = mpsc::channel(16);
        listener.attach(notifications1, || async {
            Ok(vec![request("old", "u1", "u2")])
        });
        wait_changed(&mut rx).await;

        let (tx2, notifications2) = mpsc::channel(16);
        listener.attach(notifications2, || async {
            Ok(vec![request("new", "u3", "u2")])
        });
        wait_changed(&mut rx).await;

        assert_eq!(listener.tasks.len(), 1);

        // 旧订阅已拆除，它的通知源不会再触发发布
        let _ = tx1.send("u2".to_string()).await;
        tx2.send("u2".to_string()).await.unwrap();
        wait_changed(&mut rx).await;
        let pending = rx.borrow_and_update().clone();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, "new");
    }

    #[tokio::test]
    async fn publish_is_full_replace_not_merge() {
        let mut listener = RequestListener::new("u2");
        let mut rx = listener.subscribe();

        let requests = std::sync::Arc::new(std::sync::Mutex::new(vec![
            request("r1", "u1", "u2"),
            request("r2", "u3", "u2"),
        ]));
        let source = requests.clone();
        let (tx, notifications) = mpsc::channel(16);
        listener.attach(notifications, move || {
            let source = source.clone();
            async move { Ok(source.lock().unwrap().clone()) }
        });
        wait_changed(&mut rx).await;
        assert_eq!(rx.borrow_and_update().len(), 2);

        // 存储端只剩一条，重新发布后旧值必须整体被替换
        requests.lock().unwrap().remove(0);
        tx.send("u2".to_string()).await.unwrap();
        wait_changed(&mut rx).await;
        let pending = rx.borrow_and_update().clone();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, "r2");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut listener = RequestListener::new("u2");
        let (_tx, notifications) = mpsc::channel(16);
        listener.attach(notifications, || async { Ok(Vec::new()) });
        assert!(listener.is_active());

        listener.stop();
        listener.stop();
        assert!(!listener.is_active());
    }
}
