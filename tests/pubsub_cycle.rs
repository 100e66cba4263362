//! Сквозные сценарии pub/sub на одной шине: полный цикл доставки,
//! повторные и конфликтующие объявления, ограничение очереди,
//! latched-подписка и debug-зеркало.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
    Mutex,
};

use simbus::{AdvertiseOptions, Bus, BusError, StringMsg};

/// Прокачивает шину несколько раз: очередь издателя отдаёт по одному
/// конверту за тик.
fn pump(
    bus: &Bus,
    times: usize,
) {
    for _ in 0..times {
        bus.process_nodes();
    }
}

/// Тест проверяет полный цикл: объявление, подписка, публикация,
/// доставка обработчику и счётчики доставки в снимке темы.
#[test]
fn test_full_local_cycle() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();
    let viewer = bus.node("viewer").unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _sub = viewer
        .subscribe::<StringMsg, _>("/world/pose", move |msg| {
            sink.lock().unwrap().push(msg.data.clone());
        })
        .unwrap();

    let publisher = world
        .advertise::<StringMsg>("~/pose", AdvertiseOptions::default())
        .unwrap();
    assert!(publisher.has_connections());

    for i in 0..3 {
        publisher.publish(&StringMsg::new(format!("pose {i}"))).unwrap();
    }
    pump(&bus, 5);

    let got = received.lock().unwrap().clone();
    assert_eq!(got, vec!["pose 0", "pose 1", "pose 2"]);

    let snapshot = bus
        .topics()
        .into_iter()
        .find(|s| s.topic == "/world/pose")
        .unwrap();
    assert!(snapshot.advertised);
    assert_eq!(snapshot.local_subscribers, 1);
    assert_eq!(snapshot.delivered_local, 3);
}

/// Тест проверяет, что повторное объявление той же темы тем же типом
/// допустимо, а другим типом — отклоняется с конфликтом.
#[test]
fn test_repeat_and_conflicting_advertise() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();

    let _first = world
        .advertise::<StringMsg>("~/status", AdvertiseOptions::default())
        .unwrap();
    let _second = world
        .advertise::<StringMsg>("~/status", AdvertiseOptions::default())
        .unwrap();

    let err = world
        .advertise::<simbus::RpcRequest>("~/status", AdvertiseOptions::default())
        .unwrap_err();
    assert!(matches!(err, BusError::TypeConflict { .. }));
}

/// Тест проверяет, что подписка с несовпадающим типом на уже
/// типизированную тему отклоняется.
#[test]
fn test_subscribe_type_conflict() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();

    let _publisher = world
        .advertise::<StringMsg>("~/status", AdvertiseOptions::default())
        .unwrap();
    let err = world
        .subscribe::<simbus::RpcRequest, _>("~/status", |_req| {})
        .unwrap_err();
    assert!(matches!(err, BusError::TypeConflict { .. }));
}

/// Тест проверяет ограничение очереди от публикации до доставки:
/// при лимите 3 и пяти публикациях без прокачки доходят три последних.
#[test]
fn test_queue_bound_end_to_end() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();
    let viewer = bus.node("viewer").unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _sub = viewer
        .subscribe::<StringMsg, _>("/world/pose", move |msg| {
            sink.lock().unwrap().push(msg.data.clone());
        })
        .unwrap();

    let options = AdvertiseOptions {
        queue_limit: 3,
        ..Default::default()
    };
    let publisher = world.advertise::<StringMsg>("~/pose", options).unwrap();

    for i in 0..5 {
        publisher.publish(&StringMsg::new(format!("{i}"))).unwrap();
    }
    pump(&bus, 10);

    let got = received.lock().unwrap().clone();
    assert_eq!(got, vec!["2", "3", "4"]);
    assert_eq!(publisher.dropped_count(), 2);
    assert_eq!(publisher.sent_count(), 3);
}

/// Тест проверяет latched-тему: опоздавший подписчик получает
/// последнее значение один раз, без дублей.
#[test]
fn test_latched_late_joiner() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();
    let viewer = bus.node("viewer").unwrap();

    let publisher = world
        .advertise::<StringMsg>("~/scene", AdvertiseOptions::latched())
        .unwrap();
    publisher.publish(&StringMsg::new("old")).unwrap();
    publisher.publish(&StringMsg::new("current")).unwrap();
    pump(&bus, 5);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _sub = viewer
        .subscribe::<StringMsg, _>("/world/scene", move |msg| {
            sink.lock().unwrap().push(msg.data.clone());
        })
        .unwrap();
    pump(&bus, 3);

    let got = received.lock().unwrap().clone();
    assert_eq!(got, vec!["current"]);
}

/// Тест проверяет, что и не-latched подписчик latched-темы получает
/// реплей: latched-семантику несёт тема, а не подписка.
#[test]
fn test_latched_topic_replays_to_plain_subscriber() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();

    let publisher = world
        .advertise::<StringMsg>("~/scene", AdvertiseOptions::latched())
        .unwrap();
    publisher.publish(&StringMsg::new("v1")).unwrap();
    pump(&bus, 3);

    let hits = Arc::new(AtomicU64::new(0));
    let counter = hits.clone();
    let viewer = bus.node("viewer").unwrap();
    let _sub = viewer
        .subscribe::<StringMsg, _>("/world/scene", move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    pump(&bus, 3);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Тест проверяет гигиену отписки: после Drop последнего подписчика
/// и издателя тема исчезает из реестра.
#[test]
fn test_unsubscribe_hygiene() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();
    let viewer = bus.node("viewer").unwrap();

    let publisher = world
        .advertise::<StringMsg>("~/pose", AdvertiseOptions::default())
        .unwrap();
    let sub = viewer
        .subscribe::<StringMsg, _>("/world/pose", |_msg| {})
        .unwrap();
    let names: Vec<String> = bus.topics().into_iter().map(|s| s.topic).collect();
    assert!(names.contains(&"/world/pose".to_string()));
    assert!(names.contains(&"/world/pose/__dbg".to_string()));

    drop(sub);
    assert!(!publisher.has_connections());

    drop(publisher);
    assert!(bus.topics().is_empty());
}

/// Тест проверяет debug-зеркало: подписка на `T/__dbg` получает
/// строковое представление трафика `T`.
#[test]
fn test_debug_mirror_end_to_end() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();
    let tools = bus.node("tools").unwrap();

    let rendered = Arc::new(Mutex::new(Vec::new()));
    let sink = rendered.clone();
    let _mirror_sub = tools
        .subscribe::<StringMsg, _>("/world/pose/__dbg", move |msg| {
            sink.lock().unwrap().push(msg.data.clone());
        })
        .unwrap();

    let publisher = world
        .advertise::<StringMsg>("~/pose", AdvertiseOptions::default())
        .unwrap();
    publisher.publish(&StringMsg::new("hello")).unwrap();
    pump(&bus, 3);

    let got = rendered.lock().unwrap().clone();
    assert_eq!(got.len(), 1);
    assert!(got[0].contains("hello"), "рендер зеркала: {}", got[0]);
}

/// Тест проверяет запрет на объявление зеркала вручную.
#[test]
fn test_reserved_mirror_name_rejected() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();

    let err = world
        .advertise::<StringMsg>("~/pose/__dbg", AdvertiseOptions::default())
        .unwrap_err();
    assert!(matches!(err, BusError::ReservedTopicName(_)));
}

/// Тест проверяет публикацию с ожиданием: вызов возвращает `true`,
/// когда конверт отправлен, и `false`, когда его вытеснили.
#[test]
fn test_publish_blocking_outcomes() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();
    let viewer = bus.node("viewer").unwrap();
    let _sub = viewer
        .subscribe::<StringMsg, _>("/world/pose", |_msg| {})
        .unwrap();

    let publisher = world
        .advertise::<StringMsg>("~/pose", AdvertiseOptions::default())
        .unwrap();

    let bus_for_pump = bus.clone();
    let pumper = std::thread::spawn(move || {
        for _ in 0..2000 {
            bus_for_pump.process_nodes();
            if bus_for_pump.stats().delivered_local >= 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    });

    let sent = publisher
        .publish_blocking(&StringMsg::new("important"))
        .unwrap();
    assert!(sent);
    pumper.join().unwrap();
}

/// Тест проверяет, что после Fini узла публикация отклоняется.
#[test]
fn test_publish_after_fini_rejected() {
    let bus = Bus::new();
    let world = bus.node("world").unwrap();
    let publisher = world
        .advertise::<StringMsg>("~/pose", AdvertiseOptions::default())
        .unwrap();

    world.fini();
    let err = publisher.publish(&StringMsg::new("late")).unwrap_err();
    assert!(matches!(err, BusError::NodeFinished(_)));
}
