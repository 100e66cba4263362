use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::BusConfig,
    error::BusResult,
    pubsub::{name::normalize_namespace, Node, NodeCore, TopicRegistry, TopicSnapshot},
    rpc::{self, RpcResponse, RpcShared},
    transport::ConnectionLayer,
};

/// Внутренность шины, разделяемая всеми хэндлами.
///
/// Раньше такое состояние принято было делать процессным синглтоном;
/// здесь оно — явный объект, так что в одном процессе спокойно живут
/// несколько независимых шин (чем и пользуется петлевой транспорт).
pub(crate) struct BusInner {
    config: BusConfig,
    registry: TopicRegistry,
    nodes: RwLock<Vec<Weak<NodeCore>>>,
    next_node_id: AtomicU64,
    pause_incoming: AtomicBool,
    rpc: Arc<RpcShared>,
}

impl BusInner {
    pub(crate) fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub(crate) fn default_queue_limit(&self) -> usize {
        self.config.default_queue_limit
    }

    pub(crate) fn rpc(&self) -> &Arc<RpcShared> {
        &self.rpc
    }

    /// Убирает узел из списка живых (вызывается при завершении узла).
    pub(crate) fn forget_node(
        &self,
        node_id: u64,
    ) {
        self.nodes
            .write()
            .retain(|weak| weak.upgrade().is_some_and(|n| n.id() != node_id));
    }

    fn live_nodes(&self) -> Vec<Arc<NodeCore>> {
        let mut nodes = self.nodes.write();
        nodes.retain(|weak| weak.strong_count() > 0);
        nodes.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Сводные счётчики шины.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub nodes: usize,
    pub topics: usize,
    /// Конвертов в недоставленных входящих буферах узлов.
    pub queued_incoming: usize,
    /// Всего конвертов, положенных в локальные буферы.
    pub delivered_local: u64,
    /// Всего конвертов, отправленных удалённым звеньям.
    pub forwarded_remote: u64,
}

/// Шина сообщений: явный контекст всей болтовни процесса.
///
/// Содержит реестр топиков, список живых узлов и состояние
/// запрос-ответ. Хэндл дёшев в клонировании; все клоны разделяют одну
/// шину.
///
/// # Примечание
///
/// Сама по себе шина ничего не гоняет: доставку двигает владелец,
/// вызывая [`process_nodes`](Bus::process_nodes) в своём темпе, либо
/// фоновой насос [`start_pump`](Bus::start_pump).
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Шина с настройками по умолчанию.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        let bus = Self {
            inner: Arc::new(BusInner {
                config,
                registry: TopicRegistry::new(),
                nodes: RwLock::new(Vec::new()),
                next_node_id: AtomicU64::new(1),
                pause_incoming: AtomicBool::new(false),
                rpc: Arc::new(RpcShared::new()),
            }),
        };
        debug!(
            default_queue_limit = bus.inner.config.default_queue_limit,
            "Bus created"
        );
        bus
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &Arc<BusInner> {
        &self.inner
    }

    pub(crate) fn inner_weak(&self) -> Weak<BusInner> {
        Arc::downgrade(&self.inner)
    }

    /// Создаёт узел, привязанный к пространству имён.
    ///
    /// # Ошибки
    ///
    /// Возвращает ошибку, если пространство имён пустое или содержит
    /// пробельные символы.
    pub fn node(
        &self,
        namespace: &str,
    ) -> BusResult<Node> {
        let ns = normalize_namespace(namespace)?;
        let id = self.inner.next_node_id.fetch_add(1, Ordering::SeqCst);
        let core = NodeCore::new(id, ns.clone());
        {
            let mut nodes = self.inner.nodes.write();
            nodes.retain(|weak| weak.strong_count() > 0);
            nodes.push(Arc::downgrade(&core));
        }
        info!(node_id = id, namespace = %ns, "Node created");
        Ok(Node::new(self.inner.clone(), core))
    }

    /// Один оборот насоса: сперва очереди издателей всех узлов, затем
    /// входящие буферы (если диспатч не приостановлен).
    pub fn process_nodes(&self) {
        let nodes = self.inner.live_nodes();
        for node in &nodes {
            node.process_publishers();
        }
        if self.inner.pause_incoming.load(Ordering::SeqCst) {
            return;
        }
        for node in &nodes {
            node.process_incoming();
        }
    }

    /// Приостанавливает (или возобновляет) диспатч входящих во всём
    /// процессе. Исходящие очереди продолжают разгружаться, конверты
    /// копятся в буферах узлов.
    pub fn set_pause_incoming(
        &self,
        pause: bool,
    ) {
        let was = self.inner.pause_incoming.swap(pause, Ordering::SeqCst);
        if was != pause {
            info!(pause, "Incoming dispatch pause toggled");
        }
    }

    pub fn is_incoming_paused(&self) -> bool {
        self.inner.pause_incoming.load(Ordering::SeqCst)
    }

    /// Ставит слой соединений. Уже объявленные топики и живые
    /// интересы повторяются новому слою.
    pub fn attach_connections(
        &self,
        layer: Arc<dyn ConnectionLayer>,
    ) {
        self.inner.registry.set_connections(layer);
    }

    /// Запускает фоновый поток, зовущий
    /// [`process_nodes`](Bus::process_nodes) с настроенным интервалом.
    /// Насос останавливается при уничтожении возвращённого хэндла.
    pub fn start_pump(&self) -> PumpHandle {
        let bus = self.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let interval = Duration::from_millis(self.inner.config.pump_interval_ms.max(1));
        let handle = thread::spawn(move || {
            debug!("Bus pump started");
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                bus.process_nodes();
                thread::sleep(interval);
            }
            debug!("Bus pump stopped");
        });
        PumpHandle {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Срез всех живых топиков шины.
    pub fn topics(&self) -> Vec<TopicSnapshot> {
        self.inner.registry.topic_snapshots()
    }

    /// Сводные счётчики шины.
    pub fn stats(&self) -> BusStats {
        let nodes = self.inner.live_nodes();
        let queued_incoming = nodes.iter().map(|n| n.inbox_len()).sum();
        let snapshots = self.inner.registry.topic_snapshots();
        BusStats {
            nodes: nodes.len(),
            topics: snapshots.len(),
            queued_incoming,
            delivered_local: snapshots.iter().map(|t| t.delivered_local).sum(),
            forwarded_remote: snapshots.iter().map(|t| t.forwarded_remote).sum(),
        }
    }

    /// Пространства имён живых узлов, без повторов.
    pub fn namespaces(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .inner
            .live_nodes()
            .iter()
            .map(|n| n.namespace().to_string())
            .collect();
        list.sort();
        list.dedup();
        list
    }

    pub fn node_count(&self) -> usize {
        self.inner.live_nodes().len()
    }

    /// Синхронный запрос к миру `world`; см. [`rpc::request`].
    pub fn request(
        &self,
        world: &str,
        verb: &str,
        data: &str,
        timeout: Option<Duration>,
    ) -> BusResult<RpcResponse> {
        rpc::request(self, world, verb, data, timeout)
    }

    /// Запрос без ожидания ответа; см. [`rpc::request_no_reply`].
    pub fn request_no_reply(
        &self,
        world: &str,
        verb: &str,
        data: &str,
    ) -> BusResult<()> {
        rpc::request_no_reply(self, world, verb, data)
    }
}

/// Хэндл фонового насоса. Бросить его — значит остановить насос.
pub struct PumpHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// Останавливает насос и дожидается завершения потока.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Bus pump thread panicked");
            }
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.halt();
    }
}

////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////
