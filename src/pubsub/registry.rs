use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    error::{BusError, BusResult},
    transport::{ConnectionLayer, NullConnections, RemoteLink, RemotePublisherInfo, TopicInfo},
};

use super::{
    message::{BusMessage, Envelope, StringMsg},
    name::{debug_mirror_name, intern_name, ANY_TYPE_NAME},
    node::NodeCore,
    publication::{LocalTarget, Publication},
};

/// Записанный интерес узла к топику. Живёт и без публикации: как
/// только топик объявят, интерес превратится в подключение.
struct Interest {
    node_id: u64,
    node: Weak<NodeCore>,
    type_name: Arc<str>,
    latched: bool,
}

/// Срез состояния одного топика для инструментов и CLI.
#[derive(Debug, Clone, Serialize)]
pub struct TopicSnapshot {
    pub topic: String,
    pub type_name: String,
    pub advertised: bool,
    pub latched: bool,
    pub has_latched_value: bool,
    pub local_subscribers: usize,
    pub remote_sinks: usize,
    pub remote_sources: usize,
    pub delivered_local: u64,
    pub forwarded_remote: u64,
}

/// Реестр топиков одной шины.
///
/// Владеет картой `топик -> публикация` и списком ожидающих интересов.
/// Все операции над картами короткие: ни одна не вызывает колбэки и не
/// ходит в слой соединений под замком, поэтому обработчики могут
/// заново входить в реестр без самоблокировки.
pub struct TopicRegistry {
    topics: RwLock<HashMap<Arc<str>, Arc<Publication>>>,
    interest: RwLock<HashMap<Arc<str>, Vec<Interest>>>,
    connections: RwLock<Arc<dyn ConnectionLayer>>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            interest: RwLock::new(HashMap::new()),
            connections: RwLock::new(Arc::new(NullConnections)),
        }
    }

    fn conn(&self) -> Arc<dyn ConnectionLayer> {
        self.connections.read().clone()
    }

    /// Меняет слой соединений и повторяет ему всё уже объявленное и
    /// все живые интересы, чтобы новый слой мог достроить связи.
    pub fn set_connections(
        &self,
        layer: Arc<dyn ConnectionLayer>,
    ) {
        info!(layer = layer.name(), "Connection layer attached");
        *self.connections.write() = layer.clone();
        for topic_info in self.advertised_topics() {
            if let Err(e) = layer.advertise(&topic_info) {
                warn!(topic = %topic_info.topic, error = %e, "Connection layer rejected advertise");
            }
        }
        for topic in self.interested_topics() {
            if let Err(e) = layer.find_publishers(&topic) {
                warn!(topic = %topic, error = %e, "Connection layer failed to search publishers");
            }
        }
    }

    /// Объявляет топик. Возвращает публикацию и её отладочное зеркало.
    ///
    /// Повторное объявление с тем же типом учитывает ещё одного
    /// издателя той же публикации; конфликт типов — ошибка
    /// конфигурации, объявление не выполняется.
    pub fn advertise(
        &self,
        topic: &Arc<str>,
        type_name: &Arc<str>,
        latch: bool,
    ) -> BusResult<(Arc<Publication>, Arc<Publication>)> {
        let mirror_name = debug_mirror_name(topic);
        let string_type = intern_name(StringMsg::TYPE_NAME);
        let (publication, mirror) = {
            let mut topics = self.topics.write();
            let publication = match topics.get(topic) {
                Some(existing) => {
                    if existing.type_name() != type_name {
                        return Err(BusError::TypeConflict {
                            topic: topic.to_string(),
                            existing: existing.type_name().to_string(),
                            requested: type_name.to_string(),
                        });
                    }
                    existing.add_advertiser();
                    if latch {
                        existing.mark_latched_topic();
                    }
                    existing.clone()
                }
                None => {
                    let created = Arc::new(Publication::new(
                        topic.clone(),
                        type_name.clone(),
                        true,
                        latch,
                    ));
                    topics.insert(topic.clone(), created.clone());
                    created
                }
            };
            let mirror = match topics.get(&mirror_name) {
                Some(existing) => {
                    existing.add_advertiser();
                    existing.clone()
                }
                None => {
                    let created = Arc::new(Publication::new(
                        mirror_name.clone(),
                        string_type.clone(),
                        true,
                        false,
                    ));
                    topics.insert(mirror_name.clone(), created.clone());
                    created
                }
            };
            (publication, mirror)
        };

        self.attach_interested(&publication);
        self.attach_interested(&mirror);

        let conn = self.conn();
        for info in [
            TopicInfo {
                topic: topic.clone(),
                type_name: type_name.clone(),
                latched: latch,
            },
            TopicInfo {
                topic: mirror_name,
                type_name: string_type,
                latched: false,
            },
        ] {
            if let Err(e) = conn.advertise(&info) {
                warn!(topic = %info.topic, error = %e, "Connection layer rejected advertise");
            }
        }
        Ok((publication, mirror))
    }

    /// Записывает интерес узла и, если публикация уже живёт,
    /// подключает узел немедленно. Слой соединений в любом случае
    /// получает просьбу поискать удалённых издателей.
    pub(crate) fn subscribe(
        &self,
        topic: &Arc<str>,
        type_name: &Arc<str>,
        latched: bool,
        node: &Arc<NodeCore>,
    ) -> BusResult<()> {
        if let Some(publication) = self.topics.read().get(topic).cloned() {
            if type_name.as_ref() != ANY_TYPE_NAME && publication.type_name() != type_name {
                return Err(BusError::TypeConflict {
                    topic: topic.to_string(),
                    existing: publication.type_name().to_string(),
                    requested: type_name.to_string(),
                });
            }
        }

        {
            let mut interest = self.interest.write();
            let list = interest.entry(topic.clone()).or_default();
            match list.iter_mut().find(|i| i.node_id == node.id()) {
                Some(entry) => {
                    entry.latched |= latched;
                    entry.node = Arc::downgrade(node);
                    entry.type_name = type_name.clone();
                }
                None => list.push(Interest {
                    node_id: node.id(),
                    node: Arc::downgrade(node),
                    type_name: type_name.clone(),
                    latched,
                }),
            }
        }

        // Объявление могло проскочить между проверкой типа и записью
        // интереса, поэтому карта перечитывается; повторное подключение
        // того же узла публикация склеивает сама.
        if let Some(publication) = self.topics.read().get(topic).cloned() {
            if type_name.as_ref() == ANY_TYPE_NAME || publication.type_name() == type_name {
                publication.attach_local(LocalTarget {
                    node_id: node.id(),
                    node: Arc::downgrade(node),
                    latched,
                });
            } else {
                warn!(
                    topic = %topic,
                    node_id = node.id(),
                    wanted = %type_name,
                    actual = %publication.type_name(),
                    "Topic advertised with another type while subscribing, not attaching"
                );
            }
        }

        if let Err(e) = self.conn().find_publishers(topic) {
            warn!(topic = %topic, error = %e, "Connection layer failed to search publishers");
        }
        Ok(())
    }

    /// Снимает интерес узла. Если он был последним локальным, слой
    /// соединений просят остановить удалённую доставку топика.
    pub fn unsubscribe(
        &self,
        topic: &str,
        node_id: u64,
    ) {
        let mut last_local = false;
        {
            let mut interest = self.interest.write();
            match interest.get_mut(topic) {
                Some(list) => {
                    list.retain(|i| i.node_id != node_id);
                    if list.is_empty() {
                        interest.remove(topic);
                        last_local = true;
                    }
                }
                None => {
                    error!(topic = %topic, node_id, "Unsubscribe from unknown topic, ignoring");
                    return;
                }
            }
        }
        if let Some(publication) = self.topics.read().get(topic).cloned() {
            publication.detach_local(node_id);
        }
        if last_local {
            if let Err(e) = self.conn().stop_delivery(topic) {
                warn!(topic = %topic, error = %e, "Connection layer failed to stop delivery");
            }
        }
        debug!(topic = %topic, node_id, last_local, "Unsubscribed");
    }

    /// Снимает одно локальное объявление топика (и его зеркала).
    /// Публикация удаляется и слой соединений уведомляется, только
    /// когда ушёл последний местный издатель и не осталось удалённых
    /// звеньев.
    pub fn unadvertise(
        &self,
        topic: &str,
    ) {
        let mirror_name = debug_mirror_name(topic);
        let mut released_main = false;
        let mut released_mirror = false;
        {
            let mut topics = self.topics.write();
            let Some(publication) = topics.get(topic) else {
                error!(topic = %topic, "Unadvertise of unknown topic, ignoring");
                return;
            };
            publication.remove_advertiser();
            if publication.removable() {
                topics.remove(topic);
                released_main = true;
            }
            if let Some(mirror) = topics.get(&*mirror_name) {
                mirror.remove_advertiser();
                if mirror.removable() {
                    topics.remove(&*mirror_name);
                    released_mirror = true;
                }
            }
        }
        let conn = self.conn();
        if released_main {
            if let Err(e) = conn.unadvertise(topic) {
                warn!(topic = %topic, error = %e, "Connection layer failed to unadvertise");
            }
        }
        if released_mirror {
            if let Err(e) = conn.unadvertise(&mirror_name) {
                warn!(topic = %mirror_name, error = %e, "Connection layer failed to unadvertise");
            }
        }
        info!(topic = %topic, removed = released_main, "Topic unadvertised");
    }

    /// Подключает к публикации исходящее звено на удалённого
    /// подписчика. Вызывается слоем соединений.
    pub fn connect_pub_to_sub(
        &self,
        topic: &str,
        link: Arc<dyn RemoteLink>,
    ) -> BusResult<()> {
        let Some(publication) = self.topics.read().get(topic).cloned() else {
            error!(topic = %topic, "Remote subscriber for unknown topic, ignoring");
            return Err(BusError::UnknownTopic(topic.to_string()));
        };
        info!(topic = %topic, peer = link.peer(), "Remote subscriber connected");
        publication.add_remote_sink(link);
        Ok(())
    }

    /// Регистрирует удалённого издателя: публикация создаётся при
    /// необходимости, ожидающие интересы подключаются. Вызывается
    /// слоем соединений.
    pub fn connect_sub_to_pub(
        &self,
        info: RemotePublisherInfo,
    ) -> BusResult<()> {
        let publication = {
            let mut topics = self.topics.write();
            match topics.get(&*info.topic) {
                Some(existing) => {
                    if existing.type_name() != &info.type_name {
                        error!(
                            topic = %info.topic,
                            existing = %existing.type_name(),
                            remote = %info.type_name,
                            "Remote publisher type conflict, ignoring"
                        );
                        return Err(BusError::TypeConflict {
                            topic: info.topic.to_string(),
                            existing: existing.type_name().to_string(),
                            requested: info.type_name.to_string(),
                        });
                    }
                    existing.clone()
                }
                None => {
                    let created = Arc::new(Publication::new(
                        info.topic.clone(),
                        info.type_name.clone(),
                        false,
                        info.latched,
                    ));
                    topics.insert(info.topic.clone(), created.clone());
                    created
                }
            }
        };
        publication.add_remote_source(&info.peer);
        if info.latched {
            publication.mark_latched_topic();
        }
        self.attach_interested(&publication);
        info!(topic = %info.topic, peer = %info.peer, "Remote publisher connected");
        Ok(())
    }

    /// Удалённый подписчик отвалился: звено убирается, пустая
    /// публикация может быть разобрана.
    pub fn remote_sink_gone(
        &self,
        topic: &str,
        peer: &str,
    ) {
        if let Some(publication) = self.topics.read().get(topic).cloned() {
            if publication.remove_remote_sink(peer) {
                debug!(topic = %topic, peer, "Remote sink removed");
            }
        }
        self.maybe_teardown(topic);
    }

    /// Удалённый издатель пропал; симметрично
    /// [`remote_sink_gone`](TopicRegistry::remote_sink_gone).
    pub fn remote_source_gone(
        &self,
        topic: &str,
        peer: &str,
    ) {
        if let Some(publication) = self.topics.read().get(topic).cloned() {
            publication.remove_remote_source(peer);
        }
        self.maybe_teardown(topic);
    }

    /// Конверт, принятый с той стороны: раздаётся только локальным
    /// получателям, обратно в сеть не уходит.
    pub fn dispatch_remote(
        &self,
        env: Envelope,
    ) {
        match self.topics.read().get(&env.topic).cloned() {
            Some(publication) => publication.deliver_local(env),
            None => {
                debug!(topic = %env.topic, "Remote envelope for unknown topic, discarding");
            }
        }
    }

    /// Подключает к публикации все записанные интересы с подходящим
    /// типом. Мёртвые узлы вычищаются из списка.
    fn attach_interested(
        &self,
        publication: &Arc<Publication>,
    ) {
        let topic = publication.topic().clone();
        let pending: Vec<(u64, Weak<NodeCore>, bool, Arc<str>)> = {
            let mut interest = self.interest.write();
            let Some(list) = interest.get_mut(&topic) else {
                return;
            };
            list.retain(|i| i.node.strong_count() > 0);
            list.iter()
                .map(|i| (i.node_id, i.node.clone(), i.latched, i.type_name.clone()))
                .collect()
        };
        for (node_id, node, latched, type_name) in pending {
            if type_name.as_ref() != ANY_TYPE_NAME && &type_name != publication.type_name() {
                warn!(
                    topic = %topic,
                    node_id,
                    wanted = %type_name,
                    actual = %publication.type_name(),
                    "Interest type does not match topic, not attaching"
                );
                continue;
            }
            publication.attach_local(LocalTarget {
                node_id,
                node,
                latched,
            });
        }
    }

    fn maybe_teardown(
        &self,
        topic: &str,
    ) {
        let mut removed = false;
        {
            let mut topics = self.topics.write();
            if let Some(publication) = topics.get(topic) {
                if publication.removable() {
                    topics.remove(topic);
                    removed = true;
                }
            }
        }
        if removed {
            debug!(topic = %topic, "Publication removed");
            if let Err(e) = self.conn().unadvertise(topic) {
                warn!(topic = %topic, error = %e, "Connection layer failed to unadvertise");
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // Обзор состояния
    ////////////////////////////////////////////////////////////////////

    /// Есть ли живая публикация топика.
    pub fn has_topic(
        &self,
        topic: &str,
    ) -> bool {
        self.topics.read().contains_key(topic)
    }

    pub(crate) fn publication(
        &self,
        topic: &str,
    ) -> Option<Arc<Publication>> {
        self.topics.read().get(topic).cloned()
    }

    /// Есть ли локальный интерес к топику.
    pub fn has_interest(
        &self,
        topic: &str,
    ) -> bool {
        self.interest
            .read()
            .get(topic)
            .is_some_and(|list| list.iter().any(|i| i.node.strong_count() > 0))
    }

    /// Залипший ли интерес: просил ли хоть один местный подписчик
    /// топика залипшую доставку.
    pub fn has_latched_interest(
        &self,
        topic: &str,
    ) -> bool {
        self.interest
            .read()
            .get(topic)
            .is_some_and(|list| list.iter().any(|i| i.latched))
    }

    /// Локально объявленные топики (включая зеркала).
    pub fn advertised_topics(&self) -> Vec<TopicInfo> {
        self.topics
            .read()
            .values()
            .filter(|p| p.is_advertised())
            .map(|p| TopicInfo {
                topic: p.topic().clone(),
                type_name: p.type_name().clone(),
                latched: p.is_latched_topic(),
            })
            .collect()
    }

    /// Описание одного объявленного топика.
    pub fn advertised(
        &self,
        topic: &str,
    ) -> Option<TopicInfo> {
        self.topics.read().get(topic).and_then(|p| {
            p.is_advertised().then(|| TopicInfo {
                topic: p.topic().clone(),
                type_name: p.type_name().clone(),
                latched: p.is_latched_topic(),
            })
        })
    }

    /// Топики, к которым есть живой локальный интерес.
    pub fn interested_topics(&self) -> Vec<Arc<str>> {
        self.interest
            .read()
            .iter()
            .filter(|(_, list)| list.iter().any(|i| i.node.strong_count() > 0))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Срез всех живых топиков, отсортированный по имени.
    pub fn topic_snapshots(&self) -> Vec<TopicSnapshot> {
        let mut snapshots: Vec<TopicSnapshot> = self
            .topics
            .read()
            .values()
            .map(|p| TopicSnapshot {
                topic: p.topic().to_string(),
                type_name: p.type_name().to_string(),
                advertised: p.is_advertised(),
                latched: p.is_latched_topic(),
                has_latched_value: p.latch().is_some(),
                local_subscribers: p.local_count(),
                remote_sinks: p.remote_sink_count(),
                remote_sources: p.remote_source_count(),
                delivered_local: p.delivered_local(),
                forwarded_remote: p.forwarded_remote(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.topic.cmp(&b.topic));
        snapshots
    }
}

////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////
