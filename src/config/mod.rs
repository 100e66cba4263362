//! Конфигурация шины.
//!
//! Значения берутся из умолчаний и переопределяются переменными
//! окружения с префиксом `SIMBUS_` (см. [`BusConfig::load`]).

mod settings;

pub use settings::BusConfig;
