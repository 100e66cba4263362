//! Петлевой транспорт: две шины одного процесса, связанные как
//! "удалённые" стороны. Конверты пересекают границу синхронно, без
//! сокетов, что делает слой удобным для тестов, демонстраций и
//! встраивания двух изолированных подсистем в один процесс.

use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::{
    bus::{Bus, BusInner},
    error::{BusError, BusResult},
    pubsub::Envelope,
};

use super::{ConnectionLayer, RemoteLink, RemotePublisherInfo, TopicInfo};

/// Звено, доставляющее конверты в реестр парной шины.
struct LoopbackLink {
    peer: String,
    latched: bool,
    target: Weak<BusInner>,
}

impl RemoteLink for LoopbackLink {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn latched(&self) -> bool {
        self.latched
    }

    fn forward(
        &self,
        env: &Envelope,
    ) -> BusResult<()> {
        let Some(bus) = self.target.upgrade() else {
            return Err(BusError::Connection(format!(
                "peer bus '{}' is gone",
                self.peer
            )));
        };
        bus.registry().dispatch_remote(env.clone());
        Ok(())
    }
}

/// Одна сторона петлевой пары.
///
/// Устанавливается на шину как слой соединений; держит слабые ссылки
/// на обе шины и при каждом объявлении или интересе достраивает звенья
/// между их реестрами. Исчезновение любой из шин безопасно: звенья
/// начинают возвращать ошибку и вычищаются публикациями.
pub struct LoopbackConnections {
    label: String,
    peer_label: String,
    own: Weak<BusInner>,
    peer: Weak<BusInner>,
}

impl LoopbackConnections {
    /// Связывает две шины петлёй: каждая видит другую как удалённый
    /// процесс. Уже объявленные топики и записанные интересы
    /// подхватываются сразу.
    pub fn pair(
        a: &Bus,
        b: &Bus,
    ) {
        Self::pair_named(a, b, "loopback:a", "loopback:b");
    }

    /// То же, что [`pair`](LoopbackConnections::pair), но с заданными
    /// именами сторон (видны в логах и снимках топиков).
    pub fn pair_named(
        a: &Bus,
        b: &Bus,
        label_a: &str,
        label_b: &str,
    ) {
        let conn_a = Arc::new(Self {
            label: label_a.to_string(),
            peer_label: label_b.to_string(),
            own: a.inner_weak(),
            peer: b.inner_weak(),
        });
        let conn_b = Arc::new(Self {
            label: label_b.to_string(),
            peer_label: label_a.to_string(),
            own: b.inner_weak(),
            peer: a.inner_weak(),
        });
        a.attach_connections(conn_a);
        b.attach_connections(conn_b);
        info!(a = label_a, b = label_b, "Loopback pair established");
    }

    fn both(&self) -> Option<(Arc<BusInner>, Arc<BusInner>)> {
        Some((self.own.upgrade()?, self.peer.upgrade()?))
    }

    /// Своя шина издаёт `info.topic`, парная им интересуется: ставит
    /// звено "свой издатель -> чужой подписчик".
    fn wire_own_pub_to_peer_sub(
        &self,
        info: &TopicInfo,
    ) -> BusResult<()> {
        let Some((own, peer)) = self.both() else {
            return Ok(());
        };
        let latched = info.latched || peer.registry().has_latched_interest(&info.topic);
        let link = Arc::new(LoopbackLink {
            peer: self.peer_label.clone(),
            latched,
            target: self.peer.clone(),
        });
        // Сначала приёмная сторона: публикация пира должна существовать
        // к моменту, когда звено повторит ей залипшее сообщение.
        peer.registry().connect_sub_to_pub(RemotePublisherInfo {
            topic: info.topic.clone(),
            type_name: info.type_name.clone(),
            peer: self.label.clone(),
            latched: info.latched,
        })?;
        own.registry().connect_pub_to_sub(&info.topic, link)?;
        debug!(topic = %info.topic, from = %self.label, to = %self.peer_label, "Loopback wired");
        Ok(())
    }

    /// Парная шина издаёт `info.topic`, своя им интересуется: звено в
    /// обратную сторону.
    fn wire_peer_pub_to_own_sub(
        &self,
        info: &TopicInfo,
    ) -> BusResult<()> {
        let Some((own, peer)) = self.both() else {
            return Ok(());
        };
        let latched = info.latched || own.registry().has_latched_interest(&info.topic);
        let link = Arc::new(LoopbackLink {
            peer: self.label.clone(),
            latched,
            target: self.own.clone(),
        });
        // Порядок тот же: своя публикация раньше звена с реплеем.
        own.registry().connect_sub_to_pub(RemotePublisherInfo {
            topic: info.topic.clone(),
            type_name: info.type_name.clone(),
            peer: self.peer_label.clone(),
            latched: info.latched,
        })?;
        peer.registry().connect_pub_to_sub(&info.topic, link)?;
        debug!(topic = %info.topic, from = %self.peer_label, to = %self.label, "Loopback wired");
        Ok(())
    }
}

impl ConnectionLayer for LoopbackConnections {
    fn name(&self) -> &str {
        &self.label
    }

    fn advertise(
        &self,
        info: &TopicInfo,
    ) -> BusResult<()> {
        let Some(peer) = self.peer.upgrade() else {
            return Ok(());
        };
        if peer.registry().has_interest(&info.topic) {
            self.wire_own_pub_to_peer_sub(info)?;
        }
        Ok(())
    }

    fn unadvertise(
        &self,
        topic: &str,
    ) -> BusResult<()> {
        if let Some(peer) = self.peer.upgrade() {
            peer.registry().remote_source_gone(topic, &self.label);
        }
        Ok(())
    }

    fn find_publishers(
        &self,
        topic: &str,
    ) -> BusResult<()> {
        let Some(peer) = self.peer.upgrade() else {
            return Ok(());
        };
        if let Some(info) = peer.registry().advertised(topic) {
            self.wire_peer_pub_to_own_sub(&info)?;
        }
        Ok(())
    }

    fn stop_delivery(
        &self,
        topic: &str,
    ) -> BusResult<()> {
        if let Some(peer) = self.peer.upgrade() {
            peer.registry().remote_sink_gone(topic, &self.label);
        }
        if let Some(own) = self.own.upgrade() {
            own.registry().remote_source_gone(topic, &self.peer_label);
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::pubsub::{AdvertiseOptions, StringMsg};

    fn two_buses() -> (Bus, Bus) {
        let a = Bus::new();
        let b = Bus::new();
        LoopbackConnections::pair(&a, &b);
        (a, b)
    }

    /// Сообщение пересекает границу шин: издатель на одной, подписчик
    /// на другой.
    #[test]
    fn test_cross_bus_delivery() {
        let (bus_a, bus_b) = two_buses();
        let pub_node = bus_a.node("/sim").unwrap();
        let sub_node = bus_b.node("/gui").unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_cb = received.clone();
        let _sub = sub_node
            .subscribe::<StringMsg, _>("/sim/status", move |msg| {
                received_cb.lock().push(msg.data.clone());
            })
            .unwrap();

        let publisher = pub_node
            .advertise::<StringMsg>("~/status", AdvertiseOptions::default())
            .unwrap();
        assert!(publisher.has_connections());

        publisher.publish(&StringMsg::new("stepping")).unwrap();
        bus_a.process_nodes();
        bus_b.process_nodes();

        assert_eq!(*received.lock(), vec!["stepping"]);
    }

    /// Подписка до объявления: интерес доезжает до чужого издателя.
    #[test]
    fn test_subscribe_before_remote_advertise() {
        let (bus_a, bus_b) = two_buses();
        let sub_node = bus_b.node("/gui").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let _sub = sub_node
            .subscribe::<StringMsg, _>("/sim/clock", move |_| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let pub_node = bus_a.node("/sim").unwrap();
        let publisher = pub_node
            .advertise::<StringMsg>("~/clock", AdvertiseOptions::default())
            .unwrap();
        publisher.publish(&StringMsg::new("tick")).unwrap();
        bus_a.process_nodes();
        bus_b.process_nodes();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// Залипшее сообщение доезжает до позднего подписчика на другой
    /// шине ровно один раз.
    #[test]
    fn test_latched_replay_across_buses() {
        let (bus_a, bus_b) = two_buses();
        let pub_node = bus_a.node("/sim").unwrap();
        let publisher = pub_node
            .advertise::<StringMsg>("~/world", AdvertiseOptions::latched())
            .unwrap();
        publisher.publish(&StringMsg::new("ready")).unwrap();
        bus_a.process_nodes();

        // Подписчик приходит после публикации.
        let sub_node = bus_b.node("/gui").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let _sub = sub_node
            .subscribe::<StringMsg, _>("/sim/world", move |msg| {
                seen_cb.lock().push(msg.data.clone());
            })
            .unwrap();
        bus_b.process_nodes();

        assert_eq!(*seen.lock(), vec!["ready"]);
    }

    /// Отписка на чужой шине разбирает звено: издатель остаётся без
    /// получателей, новые сообщения никуда не уходят.
    #[test]
    fn test_unsubscribe_tears_down_remote_link() {
        let (bus_a, bus_b) = two_buses();
        let pub_node = bus_a.node("/sim").unwrap();
        let sub_node = bus_b.node("/gui").unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let sub = sub_node
            .subscribe::<StringMsg, _>("/sim/status", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let publisher = pub_node
            .advertise::<StringMsg>("~/status", AdvertiseOptions::default())
            .unwrap();
        publisher.publish(&StringMsg::new("one")).unwrap();
        bus_a.process_nodes();
        bus_b.process_nodes();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        assert!(!publisher.has_connections());

        publisher.publish(&StringMsg::new("two")).unwrap();
        bus_a.process_nodes();
        bus_b.process_nodes();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
