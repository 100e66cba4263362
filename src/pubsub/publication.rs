use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::transport::RemoteLink;

use super::{message::Envelope, node::NodeCore};

/// Локальный получатель: входящий буфер одного узла.
pub(crate) struct LocalTarget {
    pub node_id: u64,
    pub node: Weak<NodeCore>,
    pub latched: bool,
}

struct PubState {
    local: Vec<LocalTarget>,
    remote_sinks: Vec<Arc<dyn RemoteLink>>,
    /// Имена удалённых издателей, питающих эту публикацию.
    remote_sources: Vec<String>,
    /// Число живых локальных издателей темы. Несколько издателей
    /// делят одну публикацию; объявление гаснет с уходом последнего.
    local_advertisers: usize,
    /// Топик объявлен "залипающим": каждый новый подписчик получает
    /// последнее сообщение, даже если сам не просил.
    latched_topic: bool,
    /// Последний опубликованный конверт (для поздних подписчиков).
    latch: Option<Envelope>,
}

/// Отложенная отправка удалённым подписчикам.
///
/// Форвардинг выполняется вне блокировки состояния: никто не держит
/// замки двух публикаций одновременно, поэтому встречные потоки двух
/// процессов не могут взаимно заблокироваться.
struct ForwardItem {
    env: Envelope,
    /// `Some(peer)` — повтор залипшего сообщения только этому звену.
    only_peer: Option<String>,
}

/// Точка веера одного топика.
///
/// Держит множество заинтересованных сторон — внутрипроцессные входящие
/// буферы узлов и звенья к удалённым подписчикам — и последнее
/// опубликованное сообщение. Создаётся реестром ровно один раз на живое
/// имя топика.
pub struct Publication {
    topic: Arc<str>,
    type_name: Arc<str>,
    state: Mutex<PubState>,
    forward_queue: Mutex<VecDeque<ForwardItem>>,
    /// Эксклюзивность форвардера: сохраняет FIFO-порядок отправки.
    forward_flush: Mutex<()>,
    /// Конверты, положенные в локальные буферы.
    delivered_local: AtomicU64,
    /// Конверты, отправленные удалённым звеньям.
    forwarded_remote: AtomicU64,
}

impl fmt::Debug for Publication {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Publication")
            .field("topic", &self.topic)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl Publication {
    pub fn new(
        topic: Arc<str>,
        type_name: Arc<str>,
        advertised_locally: bool,
        latched_topic: bool,
    ) -> Self {
        Self {
            topic,
            type_name,
            state: Mutex::new(PubState {
                local: Vec::new(),
                remote_sinks: Vec::new(),
                remote_sources: Vec::new(),
                local_advertisers: usize::from(advertised_locally),
                latched_topic,
                latch: None,
            }),
            forward_queue: Mutex::new(VecDeque::new()),
            forward_flush: Mutex::new(()),
            delivered_local: AtomicU64::new(0),
            forwarded_remote: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &Arc<str> {
        &self.topic
    }

    pub fn type_name(&self) -> &Arc<str> {
        &self.type_name
    }

    /// Публикация от локального издателя: залипание, локальный веер и
    /// отправка удалённым подписчикам.
    pub fn publish(&self, env: Envelope) {
        {
            let mut state = self.state.lock();
            state.latch = Some(env.clone());
            self.fan_out_local(&mut state, &env);
            if !state.remote_sinks.is_empty() {
                self.forward_queue.lock().push_back(ForwardItem {
                    env,
                    only_peer: None,
                });
            }
        }
        self.flush_forwards();
    }

    /// Доставка конверта, пришедшего от удалённого издателя: только
    /// локальный веер, без обратной отправки в сеть.
    pub fn deliver_local(&self, env: Envelope) {
        let mut state = self.state.lock();
        state.latch = Some(env.clone());
        self.fan_out_local(&mut state, &env);
    }

    /// Кладёт конверт в буферы всех живых локальных получателей;
    /// мёртвые (узел уже уничтожен) вычищаются по дороге.
    fn fan_out_local(
        &self,
        state: &mut PubState,
        env: &Envelope,
    ) {
        let topic = &self.topic;
        let delivered = &self.delivered_local;
        state.local.retain(|target| match target.node.upgrade() {
            Some(node) => {
                node.enqueue(env.clone());
                delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                debug!(topic = %topic, node_id = target.node_id, "Dropping dead local target");
                false
            }
        });
        trace!(topic = %topic, bytes = env.len(), "Fanned out to local targets");
    }

    /// Гонит очередь отложенных отправок удалённым звеньям.
    ///
    /// Звено, вернувшее ошибку, считается мёртвым и выбрасывается;
    /// локальная доставка при этом не страдает.
    fn flush_forwards(&self) {
        let _flusher = self.forward_flush.lock();
        loop {
            let item = match self.forward_queue.lock().pop_front() {
                Some(item) => item,
                None => break,
            };
            let sinks: Vec<Arc<dyn RemoteLink>> = self.state.lock().remote_sinks.clone();
            let mut dead: Vec<String> = Vec::new();
            for sink in sinks {
                if let Some(ref peer) = item.only_peer {
                    if sink.peer() != peer {
                        continue;
                    }
                }
                match sink.forward(&item.env) {
                    Ok(()) => {
                        self.forwarded_remote.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(
                            topic = %self.topic,
                            peer = sink.peer(),
                            error = %e,
                            "Remote link failed, dropping it"
                        );
                        dead.push(sink.peer().to_string());
                    }
                }
            }
            if !dead.is_empty() {
                let mut state = self.state.lock();
                state
                    .remote_sinks
                    .retain(|sink| !dead.iter().any(|peer| sink.peer() == peer));
            }
        }
    }

    /// Подключает локального подписчика.
    ///
    /// Если топик залипающий (или подписчик просил залипание) и есть
    /// сохранённое сообщение — оно кладётся в буфер узла немедленно,
    /// до любых последующих публикаций. Уже подключённому узлу
    /// сообщение повторяется только при переходе его подписки в
    /// залипшую: залипшее подключение получало повтор при первом входе.
    pub(crate) fn attach_local(
        &self,
        target: LocalTarget,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut push_new = false;
        let replay = match state
            .local
            .iter_mut()
            .find(|t| t.node_id == target.node_id)
        {
            Some(existing) => {
                let upgraded = target.latched && !existing.latched;
                existing.latched |= target.latched;
                existing.node = target.node.clone();
                upgraded
            }
            None => {
                push_new = true;
                state.latched_topic || target.latched
            }
        };
        if replay {
            if let (Some(env), Some(node)) = (state.latch.clone(), target.node.upgrade()) {
                node.enqueue(env);
                self.delivered_local.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %self.topic, node_id = target.node_id, "Replayed latched message");
            }
        }
        if push_new {
            state.local.push(target);
        }
    }

    /// Отключает локального подписчика.
    pub(crate) fn detach_local(
        &self,
        node_id: u64,
    ) -> bool {
        let mut state = self.state.lock();
        let before = state.local.len();
        state.local.retain(|t| t.node_id != node_id);
        state.local.len() != before
    }

    /// Подключает удалённое звено-приёмник; залипшее сообщение
    /// повторяется новому звену через общую очередь отправки.
    /// Повторное подключение того же пира заменяет старое звено.
    pub fn add_remote_sink(
        &self,
        link: Arc<dyn RemoteLink>,
    ) {
        {
            let mut state = self.state.lock();
            let replaced = state.remote_sinks.iter().any(|s| s.peer() == link.peer());
            state.remote_sinks.retain(|sink| sink.peer() != link.peer());
            if !replaced && (state.latched_topic || link.latched()) {
                if let Some(env) = state.latch.clone() {
                    self.forward_queue.lock().push_back(ForwardItem {
                        env,
                        only_peer: Some(link.peer().to_string()),
                    });
                }
            }
            state.remote_sinks.push(link);
        }
        self.flush_forwards();
    }

    pub fn remove_remote_sink(
        &self,
        peer: &str,
    ) -> bool {
        let mut state = self.state.lock();
        let before = state.remote_sinks.len();
        state.remote_sinks.retain(|sink| sink.peer() != peer);
        state.remote_sinks.len() != before
    }

    /// Отмечает удалённого издателя этого топика. Идемпотентно по
    /// имени пира.
    pub fn add_remote_source(
        &self,
        peer: &str,
    ) {
        let mut state = self.state.lock();
        if !state.remote_sources.iter().any(|p| p == peer) {
            state.remote_sources.push(peer.to_string());
        }
    }

    pub fn remove_remote_source(
        &self,
        peer: &str,
    ) {
        self.state.lock().remote_sources.retain(|p| p != peer);
    }

    /// Учитывает ещё одного локального издателя темы.
    pub fn add_advertiser(&self) {
        self.state.lock().local_advertisers += 1;
    }

    /// Списывает одного локального издателя.
    pub fn remove_advertiser(&self) {
        let mut state = self.state.lock();
        state.local_advertisers = state.local_advertisers.saturating_sub(1);
    }

    pub fn is_advertised(&self) -> bool {
        self.state.lock().local_advertisers > 0
    }

    pub fn mark_latched_topic(&self) {
        self.state.lock().latched_topic = true;
    }

    pub fn is_latched_topic(&self) -> bool {
        self.state.lock().latched_topic
    }

    /// Последнее опубликованное сообщение (для поздних подписчиков).
    pub fn latch(&self) -> Option<Envelope> {
        self.state.lock().latch.clone()
    }

    /// Есть ли хоть один получатель — локальный или удалённый.
    pub fn has_connections(&self) -> bool {
        let state = self.state.lock();
        state.local.iter().any(|t| t.node.strong_count() > 0) || !state.remote_sinks.is_empty()
    }

    pub fn local_count(&self) -> usize {
        self.state.lock().local.len()
    }

    pub fn remote_sink_count(&self) -> usize {
        self.state.lock().remote_sinks.len()
    }

    pub fn remote_source_count(&self) -> usize {
        self.state.lock().remote_sources.len()
    }

    /// Публикацию можно удалить, когда ушёл последний локальный
    /// издатель и не осталось ни одного удалённого звена (в любую
    /// сторону).
    pub fn removable(&self) -> bool {
        let state = self.state.lock();
        state.local_advertisers == 0
            && state.remote_sinks.is_empty()
            && state.remote_sources.is_empty()
    }

    pub fn delivered_local(&self) -> u64 {
        self.delivered_local.load(Ordering::Relaxed)
    }

    pub fn forwarded_remote(&self) -> u64 {
        self.forwarded_remote.load(Ordering::Relaxed)
    }
}
