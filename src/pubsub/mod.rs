//! Подсистема Publish–Subscribe (pub/sub).
//!
//! Ядро шины: от разбора имён топиков до веера доставки и реестра.
//!
//! - `name`: разбор и нормализация имён топиков, пул интернирования,
//!   соглашение об отладочных зеркалах.
//! - `message`: конверт с полезной нагрузкой и трейт сообщений шины.
//! - `publication`: точка веера одного топика — локальные получатели,
//!   удалённые звенья, залипшее сообщение.
//! - `registry`: карта `топик -> публикация`, интересы узлов и связь
//!   со слоем соединений.
//! - `node`: участник шины; входящий буфер, карта обработчиков и
//!   прокачка издателей.
//! - `publisher`: типизированный издатель с ограниченной очередью и
//!   темпом отправки.
//! - `subscriber`: обработчики входящих и хэндл подписки.
//!
//! Публичный API переэкспортирует основные типы всех подмодулей.

pub mod message;
pub mod name;
pub mod node;
pub mod publication;
pub mod publisher;
pub mod registry;
pub mod subscriber;

pub use message::{BusMessage, Envelope, StringMsg};
pub use node::Node;
pub use publication::Publication;
pub use publisher::{AdvertiseOptions, Publisher};
pub use registry::{TopicRegistry, TopicSnapshot};
pub use subscriber::{Handler, Subscriber};

pub(crate) use node::NodeCore;
