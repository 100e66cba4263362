use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::{
    bus::BusInner,
    error::{BusError, BusResult},
};

use super::{
    message::{BusMessage, Envelope},
    name::{decode_topic_name, intern_name, is_debug_mirror, ANY_TYPE_NAME},
    publisher::{AdvertiseOptions, Publisher, PublisherCore},
    subscriber::{Handler, RawHandler, Subscriber, TypedHandler},
};

struct HandlerEntry {
    id: u64,
    handler: Arc<dyn Handler>,
}

/// Разделяемое ядро узла.
///
/// На него ссылаются публикации (слабо, как на получателя), хэндлы
/// подписок и сам [`Node`]. Входящий буфер и карта обработчиков живут
/// здесь, чтобы доставка не зависела от владения пользовательским
/// хэндлом.
pub(crate) struct NodeCore {
    id: u64,
    namespace: Arc<str>,
    inbox: Mutex<VecDeque<Envelope>>,
    handlers: RwLock<HashMap<Arc<str>, Vec<HandlerEntry>>>,
    publishers: Mutex<Vec<Weak<PublisherCore>>>,
    finished: AtomicBool,
    next_handler_id: AtomicU64,
}

impl NodeCore {
    pub fn new(
        id: u64,
        namespace: Arc<str>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            namespace,
            inbox: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(HashMap::new()),
            publishers: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            next_handler_id: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn namespace(&self) -> &Arc<str> {
        &self.namespace
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Кладёт конверт во входящий буфер. Конверты завершённого узла
    /// молча выбрасываются.
    pub fn enqueue(
        &self,
        env: Envelope,
    ) {
        if self.is_finished() {
            trace!(node_id = self.id, topic = %env.topic, "Node finished, discarding envelope");
            return;
        }
        self.inbox.lock().push_back(env);
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().len()
    }

    pub fn add_handler(
        &self,
        topic: Arc<str>,
        handler: Arc<dyn Handler>,
    ) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .entry(topic)
            .or_default()
            .push(HandlerEntry { id, handler });
        id
    }

    /// Снимает обработчик. Возвращает `(снят ли, сколько осталось на
    /// этом топике)` — по нулю оставшихся вызывающий решает, снимать
    /// ли интерес узла в реестре.
    pub fn remove_handler(
        &self,
        topic: &str,
        handler_id: u64,
    ) -> (bool, usize) {
        let mut map = self.handlers.write();
        let Some(entries) = map.get_mut(topic) else {
            return (false, 0);
        };
        let before = entries.len();
        entries.retain(|e| e.id != handler_id);
        let removed = entries.len() != before;
        let remaining = entries.len();
        if entries.is_empty() {
            map.remove(topic);
        }
        (removed, remaining)
    }

    /// Забирает карту обработчиков целиком (при завершении узла).
    fn take_handler_topics(&self) -> Vec<Arc<str>> {
        self.handlers.write().drain().map(|(topic, _)| topic).collect()
    }

    pub fn register_publisher(
        &self,
        publisher: &Arc<PublisherCore>,
    ) {
        let mut list = self.publishers.lock();
        list.retain(|weak| weak.strong_count() > 0);
        list.push(Arc::downgrade(publisher));
    }

    /// Прогоняет очереди всех живых издателей узла: каждому даётся
    /// шанс отправить не более одного сообщения за тик.
    pub fn process_publishers(&self) {
        if self.is_finished() {
            return;
        }
        let live: Vec<Arc<PublisherCore>> = {
            let mut list = self.publishers.lock();
            list.retain(|weak| weak.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        let now = Instant::now();
        for publisher in live {
            publisher.send_pending(now);
        }
    }

    /// Разгребает входящий буфер, вызывая обработчики подходящего
    /// топика. Буфер сначала изымается под замком, а обработчики
    /// вызываются уже без него, поэтому колбэк может свободно
    /// подписываться и публиковать.
    pub fn process_incoming(&self) -> usize {
        if self.is_finished() {
            return 0;
        }
        let drained: VecDeque<Envelope> = std::mem::take(&mut *self.inbox.lock());
        if drained.is_empty() {
            return 0;
        }
        let mut dispatched = 0;
        for env in drained {
            let matched: Vec<Arc<dyn Handler>> = {
                let map = self.handlers.read();
                match map.get(&env.topic) {
                    Some(entries) => entries.iter().map(|e| e.handler.clone()).collect(),
                    None => Vec::new(),
                }
            };
            for handler in matched {
                handler.dispatch(&env);
                dispatched += 1;
            }
        }
        dispatched
    }
}

/// Участник шины, привязанный к пространству имён.
///
/// Узел — точка входа прикладного кода: через него объявляются топики
/// ([`advertise`](Node::advertise)) и оформляются подписки
/// ([`subscribe`](Node::subscribe)). Доставка управляется снаружи:
/// владелец обязан регулярно вызывать
/// [`process_publishers`](Node::process_publishers) и
/// [`process_incoming`](Node::process_incoming) (обычно это делает
/// [`Bus::process_nodes`](crate::Bus::process_nodes)).
///
/// # Примечание
///
/// Уничтожение узла (или явный [`fini`](Node::fini)) освобождает все
/// его подписки и издателей.
pub struct Node {
    core: Arc<NodeCore>,
    bus: Arc<BusInner>,
}

impl Node {
    pub(crate) fn new(
        bus: Arc<BusInner>,
        core: Arc<NodeCore>,
    ) -> Self {
        Self { core, bus }
    }

    pub(crate) fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    /// Уникальный в рамках процесса идентификатор узла.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Пространство имён, в котором узел разрешает короткие имена.
    pub fn namespace(&self) -> &str {
        &self.core.namespace
    }

    fn ensure_active(&self) -> BusResult<()> {
        if self.core.is_finished() {
            return Err(BusError::NodeFinished(self.core.namespace.to_string()));
        }
        Ok(())
    }

    /// Объявляет топик и возвращает типизированного издателя.
    ///
    /// Короткие имена (`~/foo`, `foo`) разворачиваются относительно
    /// пространства имён узла. Повторное объявление того же топика с
    /// тем же типом безвредно; с другим типом — ошибка
    /// [`BusError::TypeConflict`].
    ///
    /// # Ошибки
    ///
    /// Возвращает ошибку, если имя не разбирается, зарезервировано под
    /// служебные топики, тип конфликтует с уже объявленным или узел
    /// уже завершён.
    pub fn advertise<T: BusMessage>(
        &self,
        topic: &str,
        options: AdvertiseOptions,
    ) -> BusResult<Publisher<T>> {
        self.ensure_active()?;
        let full = decode_topic_name(&self.core.namespace, topic)?;
        if is_debug_mirror(&full) {
            return Err(BusError::ReservedTopicName(full.to_string()));
        }
        let type_name = intern_name(T::TYPE_NAME);
        let (publication, mirror) =
            self.bus
                .registry()
                .advertise(&full, &type_name, options.latch)?;
        let resolved = options.resolve(self.bus.default_queue_limit());
        let core = PublisherCore::new(
            full.clone(),
            type_name,
            resolved,
            publication,
            mirror,
            Arc::downgrade(&self.core),
            Arc::downgrade(&self.bus),
        );
        self.core.register_publisher(&core);
        info!(
            node_id = self.core.id,
            topic = %full,
            type_name = T::TYPE_NAME,
            "Topic advertised"
        );
        Ok(Publisher::new(core))
    }

    fn subscribe_with_handler(
        &self,
        full: Arc<str>,
        type_name: Arc<str>,
        latched: bool,
        handler: Arc<dyn Handler>,
    ) -> BusResult<Subscriber> {
        let handler_id = self.core.add_handler(full.clone(), handler);
        if let Err(e) = self
            .bus
            .registry()
            .subscribe(&full, &type_name, latched, &self.core)
        {
            self.core.remove_handler(&full, handler_id);
            return Err(e);
        }
        info!(
            node_id = self.core.id,
            topic = %full,
            type_name = %type_name,
            "Subscribed"
        );
        Ok(Subscriber::new(
            full,
            handler_id,
            Arc::downgrade(&self.core),
            Arc::downgrade(&self.bus),
        ))
    }

    /// Подписывается на топик с типизированным колбэком.
    ///
    /// Колбэк вызывается из [`process_incoming`](Node::process_incoming)
    /// в потоке, который гоняет насос, без удерживаемых блокировок.
    ///
    /// # Ошибки
    ///
    /// Возвращает ошибку при неразборчивом имени, конфликте типа с
    /// живой публикацией или уже завершённом узле.
    pub fn subscribe<T, F>(
        &self,
        topic: &str,
        callback: F,
    ) -> BusResult<Subscriber>
    where
        T: BusMessage,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_impl::<T, F>(topic, false, callback)
    }

    /// То же, что [`subscribe`](Node::subscribe), но с запросом
    /// залипшей доставки: если у публикации сохранено последнее
    /// сообщение, оно попадёт в буфер узла немедленно.
    pub fn subscribe_latched<T, F>(
        &self,
        topic: &str,
        callback: F,
    ) -> BusResult<Subscriber>
    where
        T: BusMessage,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_impl::<T, F>(topic, true, callback)
    }

    fn subscribe_impl<T, F>(
        &self,
        topic: &str,
        latched: bool,
        callback: F,
    ) -> BusResult<Subscriber>
    where
        T: BusMessage,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let full = decode_topic_name(&self.core.namespace, topic)?;
        let handler = Arc::new(TypedHandler::<T, F>::new(full.clone(), callback));
        let type_name = handler.type_name().clone();
        self.subscribe_with_handler(full, type_name, latched, handler)
    }

    /// Подписывается на топик без знания схемы: колбэк получает сырой
    /// конверт. Проверка типа при этом не выполняется.
    pub fn subscribe_raw<F>(
        &self,
        topic: &str,
        callback: F,
    ) -> BusResult<Subscriber>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let full = decode_topic_name(&self.core.namespace, topic)?;
        let handler = Arc::new(RawHandler::new(full.clone(), callback));
        let type_name = intern_name(ANY_TYPE_NAME);
        self.subscribe_with_handler(full, type_name, false, handler)
    }

    /// Отправляет накопленное издателями узла. Обычно вызывается из
    /// общего насоса шины, но доступен и для ручного управления.
    pub fn process_publishers(&self) {
        self.core.process_publishers();
    }

    /// Разгребает входящий буфер узла. Возвращает число вызванных
    /// обработчиков.
    pub fn process_incoming(&self) -> usize {
        self.core.process_incoming()
    }

    /// Завершает узел: снимает подписки, освобождает издателей и
    /// выбрасывает недоставленные конверты.
    pub fn fini(self) {}

    fn shutdown(&self) {
        if self.core.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let publishers: Vec<Arc<PublisherCore>> = {
            let mut list = self.core.publishers.lock();
            list.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for publisher in publishers {
            publisher.deactivate();
        }
        for topic in self.core.take_handler_topics() {
            self.bus.registry().unsubscribe(&topic, self.core.id);
        }
        self.core.inbox.lock().clear();
        self.bus.forget_node(self.core.id);
        debug!(node_id = self.core.id, namespace = %self.core.namespace, "Node finalized");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        bus::Bus,
        pubsub::{message::StringMsg, publisher::AdvertiseOptions},
    };

    fn core() -> Arc<NodeCore> {
        NodeCore::new(7, intern_name("/test"))
    }

    /// Проверяет доставку конверта типизированному обработчику.
    #[test]
    fn test_process_incoming_dispatches_to_handler() {
        let node = core();
        let topic = intern_name("/test/chat");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let handler = Arc::new(TypedHandler::<StringMsg, _>::new(
            topic.clone(),
            move |msg: &StringMsg| {
                assert_eq!(msg.data, "hello");
                seen_cb.fetch_add(1, Ordering::SeqCst);
            },
        ));
        node.add_handler(topic.clone(), handler);

        let env = Envelope::encode(topic, &StringMsg::new("hello")).unwrap();
        node.enqueue(env);
        assert_eq!(node.process_incoming(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(node.inbox_len(), 0);
    }

    /// Конверт чужого топика не должен трогать обработчики.
    #[test]
    fn test_unrelated_topic_not_dispatched() {
        let node = core();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let handler = Arc::new(TypedHandler::<StringMsg, _>::new(
            intern_name("/test/a"),
            move |_: &StringMsg| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            },
        ));
        node.add_handler(intern_name("/test/a"), handler);

        let env = Envelope::encode(intern_name("/test/b"), &StringMsg::new("x")).unwrap();
        node.enqueue(env);
        assert_eq!(node.process_incoming(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    /// Снятие обработчика сообщает, остались ли ещё на топике.
    #[test]
    fn test_remove_handler_counts_remaining() {
        let node = core();
        let topic = intern_name("/test/t");
        let h1 = node.add_handler(
            topic.clone(),
            Arc::new(RawHandler::new(topic.clone(), |_| {})),
        );
        let h2 = node.add_handler(
            topic.clone(),
            Arc::new(RawHandler::new(topic.clone(), |_| {})),
        );

        assert_eq!(node.remove_handler(&topic, h1), (true, 1));
        assert_eq!(node.remove_handler(&topic, h1), (false, 1));
        assert_eq!(node.remove_handler(&topic, h2), (true, 0));
    }

    /// Завершённый узел выбрасывает входящие конверты.
    #[test]
    fn test_finished_node_discards() {
        let node = core();
        node.finished.store(true, Ordering::SeqCst);
        let env = Envelope::encode(intern_name("/test/t"), &StringMsg::new("x")).unwrap();
        node.enqueue(env);
        assert_eq!(node.inbox_len(), 0);
        assert_eq!(node.process_incoming(), 0);
    }

    /// `subscribe_latched` получает сохранённое сообщение даже на
    /// обычном (незалипающем) топике; обычная подписка — нет.
    #[test]
    fn test_subscribe_latched_replays_on_plain_topic() {
        let bus = Bus::new();
        let pub_node = bus.node("/test").unwrap();
        let publisher = pub_node
            .advertise::<StringMsg>("~/state", AdvertiseOptions::default())
            .unwrap();
        publisher.publish(&StringMsg::new("m1")).unwrap();
        bus.process_nodes();

        let plain_node = bus.node("/plain").unwrap();
        let latched_node = bus.node("/late").unwrap();
        let plain_seen = Arc::new(AtomicUsize::new(0));
        let plain_cb = plain_seen.clone();
        let latched_seen = Arc::new(Mutex::new(Vec::new()));
        let latched_cb = latched_seen.clone();
        let _s1 = plain_node
            .subscribe::<StringMsg, _>("/test/state", move |_| {
                plain_cb.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let _s2 = latched_node
            .subscribe_latched::<StringMsg, _>("/test/state", move |msg| {
                latched_cb.lock().push(msg.data.clone());
            })
            .unwrap();
        bus.process_nodes();

        assert_eq!(plain_seen.load(Ordering::SeqCst), 0);
        assert_eq!(*latched_seen.lock(), vec!["m1"]);
    }

    /// Узел с живой обычной подпиской получает сохранённое сообщение,
    /// когда та же тема подписывается повторно с залипанием.
    #[test]
    fn test_latched_resubscribe_replays_on_same_node() {
        let bus = Bus::new();
        let pub_node = bus.node("/test").unwrap();
        let publisher = pub_node
            .advertise::<StringMsg>("~/state", AdvertiseOptions::default())
            .unwrap();
        publisher.publish(&StringMsg::new("m1")).unwrap();
        bus.process_nodes();

        let sub_node = bus.node("/sub").unwrap();
        let plain_seen = Arc::new(Mutex::new(Vec::new()));
        let plain_cb = plain_seen.clone();
        let _plain = sub_node
            .subscribe::<StringMsg, _>("/test/state", move |msg| {
                plain_cb.lock().push(msg.data.clone());
            })
            .unwrap();
        bus.process_nodes();
        assert!(plain_seen.lock().is_empty());

        let latched_seen = Arc::new(Mutex::new(Vec::new()));
        let latched_cb = latched_seen.clone();
        let _latched = sub_node
            .subscribe_latched::<StringMsg, _>("/test/state", move |msg| {
                latched_cb.lock().push(msg.data.clone());
            })
            .unwrap();
        bus.process_nodes();
        assert_eq!(*latched_seen.lock(), vec!["m1"]);
    }

    /// Сырая подписка видит конверт как есть и не конфликтует с типом
    /// топика, объявленным позже.
    #[test]
    fn test_subscribe_raw_receives_envelope() {
        let bus = Bus::new();
        let node = bus.node("/test").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let _sub = node
            .subscribe_raw("~/chat", move |env| {
                let data = match env.decode_as::<StringMsg>() {
                    Ok(msg) => msg.data,
                    Err(e) => panic!("decode failed: {e}"),
                };
                seen_cb.lock().push((env.type_name.to_string(), data));
            })
            .unwrap();

        let publisher = node
            .advertise::<StringMsg>("~/chat", AdvertiseOptions::default())
            .unwrap();
        publisher.publish(&StringMsg::new("raw")).unwrap();
        bus.process_nodes();
        bus.process_nodes();

        assert_eq!(
            *seen.lock(),
            vec![("simbus.msgs.StringMsg".to_string(), "raw".to_string())]
        );
    }
}
