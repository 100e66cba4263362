use std::{env, fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Конфигурация логирования.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Уровень по умолчанию: `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Дублировать логи в консоль.
    pub console_enabled: bool,
    /// Писать логи в файл через неблокирующий аппендер.
    pub file_enabled: bool,
    /// Каталог файловых логов.
    pub log_dir: PathBuf,
    /// Префикс имени файла лога.
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_enabled: true,
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            file_prefix: "simbus.log".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Переопределяет поля значениями из переменных окружения
    /// `SIMBUS_LOG_LEVEL`, `SIMBUS_LOG_DIR` и `SIMBUS_LOG_TO_FILE`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("SIMBUS_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(dir) = env::var("SIMBUS_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(value) = env::var("SIMBUS_LOG_TO_FILE") {
            self.file_enabled = matches!(value.as_str(), "1" | "true" | "yes");
        }
    }

    /// Директива фильтра, применяемая когда `RUST_LOG` не задан,
    /// например `simbus=info`.
    pub fn build_filter_directive(&self) -> String {
        format!("simbus={}", self.level)
    }

    /// Создаёт каталог логов, если его ещё нет.
    pub fn ensure_log_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.log_dir)
    }
}

////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////
