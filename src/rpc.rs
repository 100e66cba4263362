//! Синхронный запрос-ответ поверх асинхронного веера топиков.
//!
//! Протокол нарочно прост: запрос улетает в `<мир>/request`, ответ
//! приходит в `<мир>/response`, сопоставление — только по растущему
//! `id`. Вызывающий поток блокируется на общей условной переменной и
//! после каждого пробуждения перепроверяет собственный `id`; ложные
//! пробуждения — часть контракта. Ответ, не нашедший ожидающего
//! запроса, молча выбрасывается.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    bus::Bus,
    error::{BusError, BusResult},
    pubsub::{AdvertiseOptions, BusMessage, Node, Subscriber},
};

/// Статус успешного ответа.
pub const SUCCESS_STATUS: &str = "success";

/// Шаг перепроверки ожидающего запроса. Ответ обычно будит ожидающего
/// через условную переменную раньше; шаг страхует от доставок из
/// чужих потоков.
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Сообщение-запрос, публикуемое в `<мир>/request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Уникален в рамках шины; только по нему сопоставляется ответ.
    pub id: u64,
    /// Глагол: что сделать.
    pub request: String,
    /// Непрозрачные данные запроса.
    pub data: String,
}

impl BusMessage for RpcRequest {
    const TYPE_NAME: &'static str = "simbus.msgs.Request";
}

/// Сообщение-ответ, публикуемое в `<мир>/response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Эхо `id` запроса.
    pub id: u64,
    /// Эхо глагола запроса.
    pub request: String,
    /// `"success"` либо текст ошибки.
    pub response: String,
    /// Сериализованная полезная нагрузка ответа.
    pub serialized_data: Bytes,
    /// Имя схемы полезной нагрузки.
    pub type_name: String,
}

impl BusMessage for RpcResponse {
    const TYPE_NAME: &'static str = "simbus.msgs.Response";
}

impl RpcResponse {
    pub fn is_success(&self) -> bool {
        self.response == SUCCESS_STATUS
    }

    /// Разбирает полезную нагрузку как `T`, сверив имя схемы.
    pub fn decode_payload<T: BusMessage>(&self) -> BusResult<T> {
        if self.type_name != T::TYPE_NAME {
            return Err(crate::error::DecodeError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: self.type_name.clone(),
            }
            .into());
        }
        Ok(T::decode(&self.serialized_data)?)
    }
}

struct PendingRequest {
    id: u64,
    response: Option<RpcResponse>,
}

/// Состояние запросов шины: список ожидающих и общая условная
/// переменная. Разделяется всеми вызовами [`request`] одной шины.
pub(crate) struct RpcShared {
    pending: Mutex<Vec<PendingRequest>>,
    cond: Condvar,
    next_id: AtomicU64,
}

impl RpcShared {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn begin(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push(PendingRequest { id, response: None });
        id
    }

    /// Пробует сопоставить ответ ожидающему запросу. `false` — никто
    /// такого `id` не ждёт, ответ выбрасывается.
    fn complete(
        &self,
        resp: &RpcResponse,
    ) -> bool {
        let mut pending = self.pending.lock();
        match pending
            .iter_mut()
            .find(|p| p.id == resp.id && p.response.is_none())
        {
            Some(slot) => {
                slot.response = Some(resp.clone());
                self.cond.notify_all();
                true
            }
            None => false,
        }
    }

    fn forget(
        &self,
        id: u64,
    ) {
        self.pending.lock().retain(|p| p.id != id);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Синхронный запрос к миру `world`.
///
/// Под капотом создаётся временный узел: он объявляет `~/request`,
/// подписывается на `~/response`, публикует запрос со свежим `id` и
/// блокируется до сопоставленного ответа. Свой издатель и входящий
/// буфер вызов прокачивает сам, так что запрос работает и без
/// фонового насоса — лишь бы отвечающую сторону кто-нибудь тикал.
///
/// # Ошибки
///
/// `timeout = Some(..)` ограничивает ожидание и возвращает
/// [`BusError::RequestTimeout`]; `None` блокирует вызывающий поток до
/// ответа, сколько бы его ни пришлось ждать.
pub fn request(
    bus: &Bus,
    world: &str,
    verb: &str,
    data: &str,
    timeout: Option<Duration>,
) -> BusResult<RpcResponse> {
    let shared = bus.inner().rpc().clone();
    let node = bus.node(world)?;

    let matcher = shared.clone();
    let _subscription = node.subscribe::<RpcResponse, _>("~/response", move |resp| {
        if !matcher.complete(resp) {
            debug!(id = resp.id, "Unmatched response, discarding");
        }
    })?;
    let publisher = node.advertise::<RpcRequest>("~/request", AdvertiseOptions::default())?;

    let id = shared.begin();
    let started = Instant::now();
    publisher.publish(&RpcRequest {
        id,
        request: verb.to_string(),
        data: data.to_string(),
    })?;
    info!(id, verb, world, "Request sent");

    let deadline = timeout.map(|t| started + t);
    loop {
        // Прокачка — строго вне замка списка: диспатч ответа сам
        // берёт этот замок из колбэка.
        node.process_publishers();
        node.process_incoming();

        {
            let mut pending = shared.pending.lock();
            if let Some(pos) = pending
                .iter()
                .position(|p| p.id == id && p.response.is_some())
            {
                let entry = pending.remove(pos);
                drop(pending);
                if let Some(resp) = entry.response {
                    debug!(
                        id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Response matched"
                    );
                    return Ok(resp);
                }
                return Err(BusError::Internal(format!(
                    "request {id} lost its response"
                )));
            }

            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        drop(pending);
                        shared.forget(id);
                        warn!(id, verb, "Request timed out");
                        return Err(BusError::RequestTimeout {
                            id,
                            verb: verb.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    RESPONSE_POLL_INTERVAL.min(d - now)
                }
                None => RESPONSE_POLL_INTERVAL,
            };
            // Ложное пробуждение безопасно: цикл перепроверит id.
            shared.cond.wait_for(&mut pending, wait);
        }
    }
}

/// Публикует запрос, не дожидаясь ответа. Полезно для команд, у
/// которых нет осмысленного результата.
pub fn request_no_reply(
    bus: &Bus,
    world: &str,
    verb: &str,
    data: &str,
) -> BusResult<()> {
    let node = bus.node(world)?;
    let publisher = node.advertise::<RpcRequest>("~/request", AdvertiseOptions::default())?;
    let id = bus.inner().rpc().next_id.fetch_add(1, Ordering::SeqCst);
    publisher.publish(&RpcRequest {
        id,
        request: verb.to_string(),
        data: data.to_string(),
    })?;
    // Выталкиваем очередь сами: узел умрёт при выходе из функции.
    node.process_publishers();
    info!(id, verb, world, "Fire-and-forget request sent");
    Ok(())
}

/// Ответ обработчика [`serve`].
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub status: String,
    pub payload: Bytes,
    pub type_name: String,
}

impl RpcReply {
    /// Успешный ответ с типизированной полезной нагрузкой.
    pub fn success<T: BusMessage>(payload: &T) -> BusResult<Self> {
        Ok(Self {
            status: SUCCESS_STATUS.to_string(),
            payload: T::encode(payload)?,
            type_name: T::TYPE_NAME.to_string(),
        })
    }

    /// Ответ-отказ с текстом причины.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: reason.into(),
            payload: Bytes::new(),
            type_name: String::new(),
        }
    }
}

/// Живой отвечающий: узел, который держит подписку на `~/request` и
/// издателя `~/response`. Уничтожение хэндла снимает оба.
pub struct RpcServer {
    node: Node,
    _subscription: Subscriber,
}

impl RpcServer {
    pub fn world(&self) -> &str {
        self.node.namespace()
    }
}

/// Поднимает отвечающую сторону мира `world`: каждый входящий запрос
/// прогоняется через `handler`, результат уходит в `~/response` с эхом
/// `id`. Узел отвечающего прокачивается общим насосом шины.
pub fn serve<F>(
    bus: &Bus,
    world: &str,
    handler: F,
) -> BusResult<RpcServer>
where
    F: Fn(&RpcRequest) -> RpcReply + Send + Sync + 'static,
{
    let node = bus.node(world)?;
    let publisher = node.advertise::<RpcResponse>("~/response", AdvertiseOptions::default())?;
    let subscription = node.subscribe::<RpcRequest, _>("~/request", move |req| {
        let reply = handler(req);
        let resp = RpcResponse {
            id: req.id,
            request: req.request.clone(),
            response: reply.status,
            serialized_data: reply.payload,
            type_name: reply.type_name,
        };
        if let Err(e) = publisher.publish(&resp) {
            warn!(id = req.id, error = %e, "Failed to publish response");
        }
    })?;
    info!(world, "Request handler serving");
    Ok(RpcServer {
        node,
        _subscription: subscription,
    })
}

////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////
