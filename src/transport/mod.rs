//! Транспортный слой Simbus.
//!
//! Сама шина процессных границ не переступает: всё межпроцессное
//! общение делегируется подключаемому слою соединений. Здесь описан
//! контракт, который такой слой обязан выполнять, и две встроенные
//! реализации.
//!
//! ## Подмодули
//!
//! - `loopback`: связывает две шины одного процесса как "удалённые"
//!   стороны — основной инструмент для тестов и демонстраций.
//!
//! Контракт: слой узнаёт, какие топики объявлены локально
//! ([`ConnectionLayer::advertise`]), ищет удалённых издателей по
//! просьбе реестра ([`ConnectionLayer::find_publishers`]) и вплетает
//! найденные стороны обратно в реестр через
//! [`connect_pub_to_sub`](crate::pubsub::TopicRegistry::connect_pub_to_sub) /
//! [`connect_sub_to_pub`](crate::pubsub::TopicRegistry::connect_sub_to_pub).

use std::sync::Arc;

use crate::{error::BusResult, pubsub::Envelope};

pub mod loopback;

pub use loopback::LoopbackConnections;

/// Описание объявленного топика, передаваемое слою соединений.
#[derive(Debug, Clone)]
pub struct TopicInfo {
    pub topic: Arc<str>,
    pub type_name: Arc<str>,
    pub latched: bool,
}

/// Сведения об удалённом издателе, найденном слоем соединений.
#[derive(Debug, Clone)]
pub struct RemotePublisherInfo {
    pub topic: Arc<str>,
    pub type_name: Arc<str>,
    /// Человекочитаемое имя стороны, например `"loopback:b"`.
    pub peer: String,
    pub latched: bool,
}

/// Контракт слоя соединений.
///
/// Все методы вызываются реестром без удерживаемых блокировок, так что
/// реализация может свободно обращаться к реестру в ответ. Ошибки слоя
/// не фатальны: реестр пишет предупреждение и продолжает локальную
/// доставку.
pub trait ConnectionLayer: Send + Sync {
    /// Имя слоя для логов и диагностики.
    fn name(&self) -> &str;

    /// Локально объявлен топик: слой должен сообщить об этом наружу и
    /// подключить уже известных удалённых подписчиков.
    fn advertise(&self, info: &TopicInfo) -> BusResult<()>;

    /// Топик больше не обслуживается этим процессом.
    fn unadvertise(&self, topic: &str) -> BusResult<()>;

    /// Появился локальный интерес: слой ищет удалённых издателей и
    /// подключает их через реестр.
    fn find_publishers(&self, topic: &str) -> BusResult<()>;

    /// Последний локальный интерес пропал: удалённую доставку этого
    /// топика можно останавливать.
    fn stop_delivery(&self, topic: &str) -> BusResult<()>;
}

/// Исходящее звено к одному удалённому подписчику топика.
///
/// Звено, вернувшее ошибку из [`forward`](RemoteLink::forward),
/// считается мёртвым и выбрасывается публикацией.
pub trait RemoteLink: Send + Sync {
    /// Имя стороны на том конце.
    fn peer(&self) -> &str;

    /// Просил ли удалённый подписчик залипшую доставку.
    fn latched(&self) -> bool;

    /// Передаёт конверт на ту сторону.
    fn forward(&self, env: &Envelope) -> BusResult<()>;
}

/// Слой-заглушка: сетевого транспорта нет, шина работает только внутри
/// процесса. Ставится по умолчанию.
#[derive(Debug, Default)]
pub struct NullConnections;

impl ConnectionLayer for NullConnections {
    fn name(&self) -> &str {
        "null"
    }

    fn advertise(
        &self,
        _info: &TopicInfo,
    ) -> BusResult<()> {
        Ok(())
    }

    fn unadvertise(
        &self,
        _topic: &str,
    ) -> BusResult<()> {
        Ok(())
    }

    fn find_publishers(
        &self,
        _topic: &str,
    ) -> BusResult<()> {
        Ok(())
    }

    fn stop_delivery(
        &self,
        _topic: &str,
    ) -> BusResult<()> {
        Ok(())
    }
}
