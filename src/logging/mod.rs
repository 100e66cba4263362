pub mod config;
pub mod handle;

pub use config::LoggingConfig;
pub use handle::LoggingHandle;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Инициализация логирования с конфигурацией.
///
/// Фильтр берётся из `RUST_LOG`, а когда переменная не задана,
/// собирается из [`LoggingConfig::build_filter_directive`]. Консольный
/// и файловый слои включаются независимо; файловый пишет через
/// неблокирующий аппендер с ежедневной ротацией.
///
/// Вызывать можно один раз на процесс: повторная инициализация
/// глобального подписчика вернёт ошибку из `tracing`.
pub fn init_logging(
    mut config: LoggingConfig
) -> Result<LoggingHandle, Box<dyn std::error::Error>> {
    config.apply_env_overrides();

    let env_filter = build_filter(&config);
    let mut layers = Vec::new();

    if config.console_enabled {
        layers.push(fmt::layer().with_target(true).boxed());
    }

    let file_guard = if config.file_enabled {
        config.ensure_log_dir()?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        console_enabled = config.console_enabled,
        file_enabled = config.file_enabled,
        "Logging initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(env_filter) => env_filter,
        Err(_) => {
            let directive = config.build_filter_directive();
            match EnvFilter::try_new(&directive) {
                Ok(filter) => filter,
                Err(e) => {
                    // Логирование ещё не поднято, остаётся stderr.
                    eprintln!(
                        "Invalid log filter directive '{directive}': {e}; falling back to 'info'"
                    );
                    EnvFilter::new("info")
                }
            }
        }
    }
}
