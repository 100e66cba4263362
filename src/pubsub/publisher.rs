use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    bus::BusInner,
    error::{BusError, BusResult},
};

use super::{
    message::{BusMessage, Envelope, StringMsg},
    node::NodeCore,
    publication::Publication,
};

/// Шаг опроса в [`wait_for_connections`](Publisher::wait_for_connections).
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Параметры объявления топика.
#[derive(Debug, Clone, Copy)]
pub struct AdvertiseOptions {
    /// Ёмкость исходящей очереди; `0` — взять умолчание шины.
    pub queue_limit: usize,
    /// Минимальный интервал между отправками; `Duration::ZERO` — без
    /// ограничения темпа.
    pub update_period: Duration,
    /// Залипающий топик: поздние подписчики получают последнее
    /// сообщение сразу.
    pub latch: bool,
}

impl Default for AdvertiseOptions {
    fn default() -> Self {
        Self {
            queue_limit: 0,
            update_period: Duration::ZERO,
            latch: false,
        }
    }
}

impl AdvertiseOptions {
    /// Объявление с ограничением темпа в герцах.
    pub fn rate_hz(hz: f64) -> Self {
        let update_period = if hz > 0.0 {
            Duration::from_secs_f64(1.0 / hz)
        } else {
            Duration::ZERO
        };
        Self {
            update_period,
            ..Self::default()
        }
    }

    /// Объявление залипающего топика.
    pub fn latched() -> Self {
        Self {
            latch: true,
            ..Self::default()
        }
    }

    pub(crate) fn resolve(
        self,
        default_queue_limit: usize,
    ) -> ResolvedOptions {
        ResolvedOptions {
            queue_limit: if self.queue_limit == 0 {
                default_queue_limit
            } else {
                self.queue_limit
            },
            update_period: self.update_period,
        }
    }
}

pub(crate) struct ResolvedOptions {
    pub queue_limit: usize,
    pub update_period: Duration,
}

struct QueuedEnvelope {
    seq: u64,
    env: Envelope,
    /// Отрисованная строка для зеркального топика; `None`, если на
    /// момент публикации зеркало никто не слушал.
    dbg: Option<String>,
}

struct SendQueue {
    entries: VecDeque<QueuedEnvelope>,
    next_seq: u64,
    last_send: Option<Instant>,
    /// Номера сообщений, чьей судьбы ждёт блокирующий вызов.
    awaited: HashSet<u64>,
    /// Исходы ожидаемых сообщений: `true` — отправлено, `false` —
    /// вытеснено или выброшено при освобождении издателя.
    outcomes: HashMap<u64, bool>,
}

impl SendQueue {
    fn resolve(
        &mut self,
        seq: u64,
        sent: bool,
    ) -> bool {
        if self.awaited.remove(&seq) {
            self.outcomes.insert(seq, sent);
            true
        } else {
            false
        }
    }
}

/// Внутренность издателя, разделяемая хэндлом и узлом.
pub(crate) struct PublisherCore {
    topic: Arc<str>,
    type_name: Arc<str>,
    queue_limit: usize,
    update_period: Duration,
    publication: Arc<Publication>,
    mirror: Arc<Publication>,
    node: Weak<NodeCore>,
    bus: Weak<BusInner>,
    queue: Mutex<SendQueue>,
    cond: Condvar,
    /// Последний фактически отправленный конверт.
    prev: Mutex<Option<Envelope>>,
    /// Сигнал "переполнение уже зафиксировано": предупреждаем один раз
    /// на эпизод, а не на каждое вытесненное сообщение.
    overflow_warned: AtomicBool,
    active: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl PublisherCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: Arc<str>,
        type_name: Arc<str>,
        options: ResolvedOptions,
        publication: Arc<Publication>,
        mirror: Arc<Publication>,
        node: Weak<NodeCore>,
        bus: Weak<BusInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic,
            type_name,
            queue_limit: options.queue_limit.max(1),
            update_period: options.update_period,
            publication,
            mirror,
            node,
            bus,
            queue: Mutex::new(SendQueue {
                entries: VecDeque::new(),
                next_seq: 1,
                last_send: None,
                awaited: HashSet::new(),
                outcomes: HashMap::new(),
            }),
            cond: Condvar::new(),
            prev: Mutex::new(None),
            overflow_warned: AtomicBool::new(false),
            active: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn topic(&self) -> &Arc<str> {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_usable(&self) -> BusResult<()> {
        match self.node.upgrade() {
            Some(node) if self.is_active() && !node.is_finished() => Ok(()),
            Some(node) => Err(BusError::NodeFinished(node.namespace().to_string())),
            None => Err(BusError::NodeFinished(self.topic.to_string())),
        }
    }

    /// Ставит конверт в исходящую очередь.
    ///
    /// При переполнении вытесняется самое старое сообщение. При
    /// `block = true` вызов не возвращается, пока судьба конверта не
    /// решится: `Ok(true)` — отправлен, `Ok(false)` — вытеснен или
    /// выброшен при освобождении издателя.
    pub fn enqueue(
        &self,
        env: Envelope,
        dbg: Option<String>,
        block: bool,
    ) -> BusResult<bool> {
        self.ensure_usable()?;
        let mut queue = self.queue.lock();
        while queue.entries.len() >= self.queue_limit {
            if let Some(evicted) = queue.entries.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if queue.resolve(evicted.seq, false) {
                    self.cond.notify_all();
                }
                if !self.overflow_warned.swap(true, Ordering::SeqCst) {
                    warn!(
                        topic = %self.topic,
                        limit = self.queue_limit,
                        "Publisher queue overflow, dropping oldest messages"
                    );
                } else {
                    trace!(topic = %self.topic, "Queue still overflowing, dropped oldest");
                }
            }
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push_back(QueuedEnvelope { seq, env, dbg });
        if !block {
            return Ok(true);
        }
        queue.awaited.insert(seq);
        loop {
            if let Some(sent) = queue.outcomes.remove(&seq) {
                return Ok(sent);
            }
            self.cond.wait(&mut queue);
        }
    }

    /// Отправляет не более одного сообщения из очереди, если темп
    /// позволяет. Вызывается узлом раз за тик.
    pub fn send_pending(
        &self,
        now: Instant,
    ) {
        if !self.is_active() {
            return;
        }
        let mut queue = self.queue.lock();
        if queue.entries.is_empty() {
            return;
        }
        if self.update_period > Duration::ZERO {
            if let Some(last) = queue.last_send {
                if now.duration_since(last) < self.update_period {
                    return;
                }
            }
        }
        let Some(item) = queue.entries.pop_front() else {
            return;
        };
        queue.last_send = Some(now);
        if queue.entries.len() < self.queue_limit {
            self.overflow_warned.store(false, Ordering::SeqCst);
        }

        // Очередь остаётся под замком на время отправки: это
        // сериализует издателя и сохраняет FIFO даже при нескольких
        // тикающих потоках.
        self.publication.publish(item.env.clone());
        self.sent.fetch_add(1, Ordering::Relaxed);
        *self.prev.lock() = Some(item.env);

        if let Some(dbg) = item.dbg {
            if self.mirror.has_connections() {
                match Envelope::encode(self.mirror.topic().clone(), &StringMsg::new(dbg)) {
                    Ok(mirror_env) => self.mirror.publish(mirror_env),
                    Err(e) => warn!(topic = %self.mirror.topic(), error = %e, "Failed to encode mirror message"),
                }
            }
        }

        if queue.resolve(item.seq, true) {
            self.cond.notify_all();
        }
    }

    /// Нужна ли отрисовка отладочной строки: да, когда зеркало
    /// кто-нибудь слушает.
    pub fn mirror_wanted(&self) -> bool {
        self.mirror.has_connections()
    }

    pub fn has_connections(&self) -> bool {
        self.publication.has_connections()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().entries.len()
    }

    pub fn prev_envelope(&self) -> Option<Envelope> {
        self.prev.lock().clone()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Гасит издателя: будит блокированные вызовы, выбрасывает очередь
    /// и снимает объявление топика в реестре. Идемпотентно.
    pub fn release(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            let pending: Vec<u64> = queue.entries.drain(..).map(|item| item.seq).collect();
            if !pending.is_empty() {
                debug!(
                    topic = %self.topic,
                    pending = pending.len(),
                    "Publisher released with pending messages"
                );
            }
            for seq in pending {
                queue.resolve(seq, false);
            }
            self.cond.notify_all();
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.registry().unadvertise(&self.topic);
        }
    }

    /// То же, что [`release`](PublisherCore::release) — вызывается при
    /// завершении узла-владельца.
    pub fn deactivate(&self) {
        self.release();
    }
}

/// Типизированный издатель, выданный
/// [`Node::advertise`](super::node::Node::advertise).
///
/// Сообщения не уходят в момент вызова [`publish`](Publisher::publish):
/// они копятся в ограниченной очереди и отправляются по одному при
/// каждом прогоне насоса, с учётом заданного темпа. Уничтожение хэндла
/// снимает объявление топика.
pub struct Publisher<T> {
    core: Arc<PublisherCore>,
    _marker: PhantomData<fn(T)>,
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.core.topic)
            .field("type_name", &self.core.type_name)
            .finish_non_exhaustive()
    }
}

impl<T: BusMessage> Publisher<T> {
    pub(crate) fn new(core: Arc<PublisherCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// Полное имя топика.
    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    /// Имя типа сообщений топика.
    pub fn type_name(&self) -> &str {
        &self.core.type_name
    }

    /// Ставит сообщение в очередь на отправку и сразу возвращается.
    ///
    /// Переполненная очередь вытесняет самое старое сообщение; первый
    /// сброс в эпизоде переполнения отмечается предупреждением в логе.
    ///
    /// # Ошибки
    ///
    /// Возвращает ошибку, если сообщение не сериализуется или издатель
    /// уже освобождён (узел завершён).
    pub fn publish(
        &self,
        msg: &T,
    ) -> BusResult<()> {
        let env = Envelope::encode(self.core.topic.clone(), msg)?;
        let dbg = self.core.mirror_wanted().then(|| msg.debug_string());
        self.core.enqueue(env, dbg, false)?;
        Ok(())
    }

    /// Как [`publish`](Publisher::publish), но вызов не возвращается,
    /// пока конверт не будет отправлен в публикацию.
    ///
    /// Возвращает `Ok(true)`, если сообщение действительно ушло, и
    /// `Ok(false)`, если его вытеснило переполнение или издатель был
    /// освобождён до отправки. Ждать придётся чужого потока: очередь
    /// разгружает насос, поэтому блокирующая публикация из потока,
    /// который сам же и тикает шину, завершится только вытеснением.
    pub fn publish_blocking(
        &self,
        msg: &T,
    ) -> BusResult<bool> {
        let env = Envelope::encode(self.core.topic.clone(), msg)?;
        let dbg = self.core.mirror_wanted().then(|| msg.debug_string());
        self.core.enqueue(env, dbg, true)
    }

    /// Есть ли у топика хоть один получатель, локальный или удалённый.
    pub fn has_connections(&self) -> bool {
        self.core.has_connections()
    }

    /// Блокирует вызывающий поток, пока у топика не появится
    /// получатель.
    ///
    /// # Примечание
    ///
    /// Таймаута нет: если подписчик так и не придёт, вызов не
    /// вернётся (он отпускается лишь при освобождении издателя).
    pub fn wait_for_connections(&self) {
        while self.core.is_active() && !self.core.has_connections() {
            thread::sleep(CONNECTION_POLL_INTERVAL);
        }
    }

    /// Последнее отправленное сообщение, если оно было.
    pub fn prev_msg(&self) -> Option<T> {
        self.core
            .prev_envelope()
            .and_then(|env| env.decode_as::<T>().ok())
    }

    /// Сообщений в исходящей очереди.
    pub fn queue_len(&self) -> usize {
        self.core.queue_len()
    }

    /// Отправлено сообщений за время жизни издателя.
    pub fn sent_count(&self) -> u64 {
        self.core.sent_count()
    }

    /// Вытеснено сообщений при переполнении очереди.
    pub fn dropped_count(&self) -> u64 {
        self.core.dropped_count()
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.core.release();
    }
}

////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////
