use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Настройки шины сообщений.
///
/// Каждое поле можно переопределить переменной окружения с префиксом
/// `SIMBUS_`: например, `SIMBUS_DEFAULT_QUEUE_LIMIT=50` или
/// `SIMBUS_PUMP_INTERVAL_MS=1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Ёмкость исходящей очереди издателя, когда при объявлении темы
    /// запрошен лимит `0` ("возьми умолчание шины").
    pub default_queue_limit: usize,
    /// Интервал фонового насоса шины в миллисекундах.
    pub pump_interval_ms: u64,
}

impl BusConfig {
    /// Загружает конфигурацию: умолчания плюс переменные окружения.
    ///
    /// # Ошибки
    ///
    /// Возвращает [`ConfigError`], если переменная окружения задана,
    /// но не приводится к типу поля.
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .set_default("default_queue_limit", 1000)?
            .set_default("pump_interval_ms", 5)?
            .add_source(Environment::with_prefix("SIMBUS"))
            .build()?;
        cfg.try_deserialize()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_queue_limit: 1000,
            pump_interval_ms: 5,
        }
    }
}

////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////
