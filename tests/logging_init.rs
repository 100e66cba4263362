//! Инициализация логирования с файловым синком.
//!
//! Файл держит единственный тест: глобальный подписчик tracing можно
//! поставить только один раз на процесс.

use simbus::{init_logging, LoggingConfig};

/// Тест проверяет поднятие файлового синка: каталог логов создаётся,
/// handle отражает активный аппендер.
#[test]
fn test_file_logging_initializes() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoggingConfig {
        console_enabled: false,
        file_enabled: true,
        log_dir: dir.path().join("logs"),
        ..Default::default()
    };

    let handle = init_logging(config).unwrap();
    assert!(handle.file_logging_active());

    tracing::info!(component = "test", "file sink smoke line");
    assert!(dir.path().join("logs").is_dir());
}
