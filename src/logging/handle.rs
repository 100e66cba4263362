use tracing_appender::non_blocking::WorkerGuard;

/// Handle жизненного цикла логирования.
///
/// Держит guard неблокирующего файлового аппендера: пока handle жив,
/// фоновый поток дописывает буфер, а на `Drop` буфер сбрасывается на
/// диск. Ронять handle раньше конца программы нельзя, иначе хвост
/// лога потеряется.
pub struct LoggingHandle {
    _file_guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    pub(crate) fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            _file_guard: file_guard,
        }
    }

    /// Активен ли файловый аппендер.
    pub fn file_logging_active(&self) -> bool {
        self._file_guard.is_some()
    }
}
