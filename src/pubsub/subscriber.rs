use std::{marker::PhantomData, sync::Arc, sync::Weak};

use tracing::{debug, warn};

use crate::bus::BusInner;

use super::{
    message::{BusMessage, Envelope},
    name::{intern_name, ANY_TYPE_NAME},
    node::NodeCore,
};

/// Обработчик входящих конвертов одного топика.
///
/// Узел хранит обработчики за типовым стиранием и вызывает их без
/// каких-либо удерживаемых блокировок, поэтому обработчик может сам
/// подписываться, объявлять топики и публиковать.
pub trait Handler: Send + Sync {
    /// Полное имя топика, на который назначен обработчик.
    fn topic(&self) -> &Arc<str>;

    /// Имя типа, которое обработчик готов принять (`*` — любой).
    fn type_name(&self) -> &Arc<str>;

    /// Разбирает конверт и вызывает пользовательский колбэк.
    fn dispatch(&self, env: &Envelope);
}

/// Типизированный обработчик: десериализует полезную нагрузку в `T`.
pub(crate) struct TypedHandler<T, F> {
    topic: Arc<str>,
    type_name: Arc<str>,
    callback: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> TypedHandler<T, F>
where
    T: BusMessage,
    F: Fn(&T) + Send + Sync,
{
    pub fn new(
        topic: Arc<str>,
        callback: F,
    ) -> Self {
        Self {
            topic,
            type_name: intern_name(T::TYPE_NAME),
            callback,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Handler for TypedHandler<T, F>
where
    T: BusMessage,
    F: Fn(&T) + Send + Sync,
{
    fn topic(&self) -> &Arc<str> {
        &self.topic
    }

    fn type_name(&self) -> &Arc<str> {
        &self.type_name
    }

    fn dispatch(
        &self,
        env: &Envelope,
    ) {
        match env.decode_as::<T>() {
            Ok(msg) => (self.callback)(&msg),
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    type_name = %env.type_name,
                    error = %e,
                    "Failed to decode incoming message, skipping"
                );
            }
        }
    }
}

/// Сырой обработчик: отдаёт конверт как есть, без десериализации.
/// Полезен инструментам, которым неизвестна схема сообщения.
pub(crate) struct RawHandler<F> {
    topic: Arc<str>,
    type_name: Arc<str>,
    callback: F,
}

impl<F> RawHandler<F>
where
    F: Fn(&Envelope) + Send + Sync,
{
    pub fn new(
        topic: Arc<str>,
        callback: F,
    ) -> Self {
        Self {
            topic,
            type_name: intern_name(ANY_TYPE_NAME),
            callback,
        }
    }
}

impl<F> Handler for RawHandler<F>
where
    F: Fn(&Envelope) + Send + Sync,
{
    fn topic(&self) -> &Arc<str> {
        &self.topic
    }

    fn type_name(&self) -> &Arc<str> {
        &self.type_name
    }

    fn dispatch(
        &self,
        env: &Envelope,
    ) {
        (self.callback)(env)
    }
}

/// Хэндл подписки, выданный [`Node::subscribe`](super::node::Node::subscribe).
///
/// Пока хэндл жив, колбэк получает сообщения. Уничтожение хэндла (или
/// явный [`unsubscribe`](Subscriber::unsubscribe)) снимает колбэк с
/// узла, а если это был последний колбэк узла на данный топик — и
/// интерес узла в реестре.
#[derive(Debug)]
pub struct Subscriber {
    topic: Arc<str>,
    handler_id: u64,
    node: Weak<NodeCore>,
    bus: Weak<BusInner>,
}

impl Subscriber {
    pub(crate) fn new(
        topic: Arc<str>,
        handler_id: u64,
        node: Weak<NodeCore>,
        bus: Weak<BusInner>,
    ) -> Self {
        Self {
            topic,
            handler_id,
            node,
            bus,
        }
    }

    /// Полное имя топика подписки.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Явная отписка. Эквивалент уничтожения хэндла.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let (removed, remaining) = node.remove_handler(&self.topic, self.handler_id);
        if !removed {
            return;
        }
        debug!(topic = %self.topic, node_id = node.id(), "Subscriber dropped");
        if remaining == 0 {
            if let Some(bus) = self.bus.upgrade() {
                bus.registry().unsubscribe(&self.topic, node.id());
            }
        }
    }
}
