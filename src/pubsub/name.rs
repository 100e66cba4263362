use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::{BusError, BusResult};

/// Суффикс автоматического debug-зеркала.
///
/// Для каждого локально объявленного топика `T` реестр создаёт
/// компаньон `T/__dbg` со строковым представлением трафика. Суффикс
/// объявлен константой, а не собирается конкатенацией на месте, чтобы
/// соглашение было явным и проверяемым.
pub const DEBUG_MIRROR_SUFFIX: &str = "/__dbg";

/// Тип-шаблон "любой тип" для сырых (без схемы) подписок.
pub const ANY_TYPE_NAME: &str = "*";

/// Пул для повторного использования `Arc<str>` по одинаковым именам топиков.
/// Crate-private: другие модули внутри этого крейта видят, а внешние — нет.
static TOPIC_INTERN: Lazy<DashMap<String, Arc<str>>> = Lazy::new(DashMap::new);

/// Возвращает interned `Arc<str>` для данного имени топика.
/// При первом вызове для нового имени создаёт `Arc<str>` и сохраняет его в пуле.
#[inline(always)]
pub fn intern_name<S: AsRef<str>>(name: S) -> Arc<str> {
    let key = name.as_ref();
    if let Some(existing) = TOPIC_INTERN.get(key) {
        existing.clone()
    } else {
        let s = key.to_string();
        let arc: Arc<str> = Arc::from(s.clone());
        TOPIC_INTERN.insert(s, arc.clone());
        arc
    }
}

/// Нормализует пространство имён узла до канонического вида `/a/b`.
///
/// Принимает как `world`, так и `/world` или `world/`; пустое имя —
/// ошибка конфигурации.
pub fn normalize_namespace(raw: &str) -> BusResult<Arc<str>> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(BusError::InvalidTopicName(format!(
            "empty node namespace: '{raw}'"
        )));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(BusError::InvalidTopicName(format!(
            "namespace contains whitespace: '{raw}'"
        )));
    }
    Ok(intern_name(format!("/{trimmed}")))
}

/// Разворачивает имя топика, заданное узлом, в полностью
/// квалифицированное имя.
///
/// Правила (в порядке применения):
/// - разделители `::` переписываются в `/` (имена-фильтры вида
///   `model::link` приходят из внешних подсистем);
/// - `~` и `~/foo` раскрываются в пространство имён узла;
/// - абсолютное имя `/a/b` проходит как есть;
/// - относительное имя `foo` присоединяется к пространству имён.
///
/// Реестр работает только с полностью квалифицированными именами —
/// это инвариант всего модуля.
pub fn decode_topic_name(namespace: &Arc<str>, raw: &str) -> BusResult<Arc<str>> {
    if raw.is_empty() {
        return Err(BusError::InvalidTopicName("empty topic name".into()));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(BusError::InvalidTopicName(format!(
            "topic name contains whitespace: '{raw}'"
        )));
    }

    let rewritten = raw.replace("::", "/");

    let full = if rewritten == "~" {
        namespace.to_string()
    } else if let Some(rest) = rewritten.strip_prefix("~/") {
        format!("{namespace}/{rest}")
    } else if rewritten.starts_with('/') {
        rewritten
    } else {
        format!("{namespace}/{rewritten}")
    };

    if full.contains("//") {
        return Err(BusError::InvalidTopicName(format!(
            "topic name contains empty segment: '{full}'"
        )));
    }

    Ok(intern_name(full))
}

/// Имя debug-зеркала для топика.
#[inline]
pub fn debug_mirror_name(topic: &str) -> Arc<str> {
    intern_name(format!("{topic}{DEBUG_MIRROR_SUFFIX}"))
}

/// Является ли имя топика debug-зеркалом.
#[inline]
pub fn is_debug_mirror(topic: &str) -> bool {
    topic.ends_with(DEBUG_MIRROR_SUFFIX)
}
