//! Event Bus - 週期事件發布/訂閱
//!
//! 將週期事件分發給同一主題的所有訂閱者：
//! - 按訂閱順序投遞
//! - 單一訂閱者失敗不影響其他訂閱者
//! - 週期結束時關閉該週期的訂閱流

use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{CycleEvent, Topic};
use crate::error::Result;

/// 訂閱者
struct Subscriber {
    id: u64,
    name: String,
    /// 只接收此週期的事件；None 表示接收全部，並於下一個週期結束時關閉
    scope: Option<Uuid>,
    tx: mpsc::UnboundedSender<CycleEvent>,
}

impl Subscriber {
    fn wants(&self, event: &CycleEvent) -> bool {
        self.scope.map_or(true, |id| id == event.cycle_id)
    }

    fn closes_with(&self, cycle_id: Uuid) -> bool {
        self.scope.map_or(true, |id| id == cycle_id)
    }
}

/// 匯流排統計
#[derive(Debug, Default, Clone)]
pub struct BusStats {
    /// 發布的事件總數
    pub events_published: u64,
    /// 成功投遞數
    pub deliveries: u64,
    /// 投遞失敗數 (訂閱者已關閉)
    pub failed_deliveries: u64,
    /// 處理器回報錯誤數
    pub handler_failures: u64,
    /// 按主題統計
    pub events_by_topic: HashMap<Topic, u64>,
}

/// 單一訂閱者的事件流
///
/// 週期關閉或匯流排被丟棄時結束。
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<CycleEvent>,
}

impl Stream for EventStream {
    type Item = CycleEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// 事件處理器
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &CycleEvent) -> Result<()>;
}

/// 事件匯流排
///
/// 可複製；所有副本共用同一組訂閱。
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>,
    stats: Arc<RwLock<BusStats>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// 創建新的匯流排
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(BusStats::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// 訂閱主題
    ///
    /// 接收所有週期的事件，下一個週期結束時關閉。
    pub async fn subscribe(&self, topic: Topic, name: &str) -> EventStream {
        self.attach(topic, name, None).await
    }

    /// 訂閱單一週期的主題事件，該週期結束時關閉
    pub async fn subscribe_cycle(&self, topic: Topic, name: &str, cycle_id: Uuid) -> EventStream {
        self.attach(topic, name, Some(cycle_id)).await
    }

    async fn attach(&self, topic: Topic, name: &str, scope: Option<Uuid>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(Subscriber {
                id,
                name: name.to_string(),
                scope,
                tx,
            });
        debug!("Subscriber {} ({}) attached to {}", id, name, topic);
        EventStream { rx }
    }

    /// 以處理器訂閱主題
    ///
    /// 處理器錯誤只記錄，不中斷後續事件。訂閱流關閉（下一個週期結束）後任務結束。
    pub async fn subscribe_handler(
        &self,
        topic: Topic,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> tokio::task::JoinHandle<()> {
        let mut stream = self.subscribe(topic, name).await;
        let stats = Arc::clone(&self.stats);
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Err(e) = handler.handle(&event).await {
                    warn!("Handler {} failed on {} event: {}", name, event.topic, e);
                    stats.write().await.handler_failures += 1;
                }
            }
            debug!("Handler {} stream closed", name);
        })
    }

    /// 發布事件到其主題的所有訂閱者
    pub async fn publish(&self, event: CycleEvent) {
        let topic = event.topic;
        let mut delivered = 0u64;
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read().await;
            if let Some(list) = subscribers.get(&topic) {
                for sub in list.iter().filter(|s| s.wants(&event)) {
                    if sub.tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        warn!(
                            "Subscriber {} ({}) dropped, skipping {} event",
                            sub.id, sub.name, topic
                        );
                        closed.push(sub.id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            if let Some(list) = self.subscribers.write().await.get_mut(&topic) {
                list.retain(|s| !closed.contains(&s.id));
            }
        }

        let mut stats = self.stats.write().await;
        stats.events_published += 1;
        stats.deliveries += delivered;
        stats.failed_deliveries += closed.len() as u64;
        *stats.events_by_topic.entry(topic).or_insert(0) += 1;
    }

    /// 週期結束：關閉該週期及未限定週期的訂閱流
    pub async fn close_cycle(&self, cycle_id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        let mut count = 0usize;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|s| !s.closes_with(cycle_id));
            count += before - list.len();
        }
        subscribers.retain(|_, list| !list.is_empty());
        if count > 0 {
            debug!("Cycle {} closed {} subscriptions", cycle_id, count);
        }
    }

    /// 關閉所有訂閱流 (停機)
    pub async fn close(&self) {
        let mut subscribers = self.subscribers.write().await;
        let count: usize = subscribers.values().map(Vec::len).sum();
        subscribers.clear();
        if count > 0 {
            info!("Event bus closed {} subscriptions", count);
        }
    }

    /// 主題訂閱者數量
    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .await
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// 獲取統計
    pub async fn stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }
}
