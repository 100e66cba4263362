use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};

use super::name::intern_name;

/// Непрозрачная единица доставки: полное имя топика, имя схемы и
/// закодированная полезная нагрузка.
///
/// Шина не интерпретирует `payload`; договорённость о формате лежит на
/// типе сообщения (см. [`BusMessage`]). Имя схемы хранится рядом, чтобы
/// стороны топика могли проверить совместимость до декодирования.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Полностью квалифицированное имя топика.
    pub topic: Arc<str>,
    /// Имя схемы полезной нагрузки.
    pub type_name: Arc<str>,
    /// Закодированная полезная нагрузка.
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(
        topic: Arc<str>,
        type_name: Arc<str>,
        payload: Bytes,
    ) -> Self {
        Self {
            topic,
            type_name,
            payload,
        }
    }

    /// Кодирует типизированное сообщение в конверт для топика.
    pub fn encode<T: BusMessage>(
        topic: Arc<str>,
        msg: &T,
    ) -> Result<Self, EncodeError> {
        Ok(Self {
            topic,
            type_name: intern_name(T::TYPE_NAME),
            payload: msg.encode()?,
        })
    }

    /// Декодирует конверт в `T`, предварительно сверив имя схемы.
    ///
    /// # Возвращает
    /// - `Ok(T)` при совпадении схемы и успешном декодировании
    /// - `Err(DecodeError::TypeMismatch)` если конверт несёт другой тип
    pub fn decode_as<T: BusMessage>(&self) -> Result<T, DecodeError> {
        if &*self.type_name != T::TYPE_NAME {
            return Err(DecodeError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: self.type_name.to_string(),
            });
        }
        T::decode(&self.payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Типизированное сообщение шины.
///
/// Единственное, что обязан указать конкретный тип — стабильное имя
/// схемы `TYPE_NAME`: все издатели и подписчики одного топика обязаны
/// совпасть по нему (первый `advertise` фиксирует тип топика).
/// Кодек по умолчанию — bincode поверх serde; `debug_string` питает
/// debug-зеркало `topic/__dbg` и по умолчанию использует `Debug`.
pub trait BusMessage:
    fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Имя схемы сообщения, например `"sim.msgs.Pose"`.
    const TYPE_NAME: &'static str;

    fn encode(&self) -> Result<Bytes, EncodeError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| EncodeError::Serialize {
                type_name: Self::TYPE_NAME.to_string(),
                reason: e.to_string(),
            })
    }

    fn decode(payload: &Bytes) -> Result<Self, DecodeError> {
        bincode::deserialize(payload).map_err(|e| DecodeError::Deserialize {
            type_name: Self::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })
    }

    /// Человекочитаемое представление для debug-зеркала.
    fn debug_string(&self) -> String {
        format!("{self:?}")
    }
}

/// Сообщение с единственным строковым полем.
///
/// Этим типом всегда публикуется debug-зеркало `topic/__dbg`:
/// инструменты могут читать трафик любого топика, не зная его схемы.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringMsg {
    pub data: String,
}

impl StringMsg {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl BusMessage for StringMsg {
    const TYPE_NAME: &'static str = "simbus.msgs.StringMsg";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pose {
        x: f64,
        y: f64,
        yaw: f64,
    }

    impl BusMessage for Pose {
        const TYPE_NAME: &'static str = "sim.msgs.Pose";
    }

    /// Проверяет кодирование и обратное декодирование через конверт.
    #[test]
    fn test_envelope_roundtrip() {
        let pose = Pose {
            x: 1.0,
            y: -2.5,
            yaw: 0.25,
        };
        let env = Envelope::encode(intern_name("/world/pose"), &pose).unwrap();
        assert_eq!(&*env.topic, "/world/pose");
        assert_eq!(&*env.type_name, "sim.msgs.Pose");
        assert!(!env.is_empty());

        let back: Pose = env.decode_as().unwrap();
        assert_eq!(back, pose);
    }

    /// Проверяет, что декодирование с чужим именем схемы отклоняется
    /// до попытки разбора байтов.
    #[test]
    fn test_decode_type_mismatch() {
        let env = Envelope::encode(intern_name("/world/pose"), &StringMsg::new("hi")).unwrap();
        let err = env.decode_as::<Pose>().unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { .. }));
    }

    /// Проверяет debug-представление по умолчанию (через Debug).
    #[test]
    fn test_default_debug_string() {
        let pose = Pose {
            x: 1.0,
            y: 0.0,
            yaw: 0.0,
        };
        let s = pose.debug_string();
        assert!(s.contains("Pose"));
        assert!(s.contains("1.0"));
    }
}
