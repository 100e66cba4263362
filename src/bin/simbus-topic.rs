//! CLI инструмент simbus
//!
//! Утилита командной строки для осмотра шины: список тем, детали
//! одной темы и живая демонстрация обмена, включая передачу между
//! двумя шинами через loopback-слой.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use simbus::{
    init_logging, rpc, AdvertiseOptions, Bus, BusConfig, LoggingConfig, LoopbackConnections, Node,
    Publisher, RpcReply, StringMsg, Subscriber, TopicSnapshot,
};

/// Основная структура CLI аргументов
#[derive(Parser)]
#[command(name = "simbus-topic")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "simbus-topic - Inspect and exercise a simbus message bus", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Включить подробный вывод (debug)
    #[arg(short, long, help = "Включить подробный вывод для отладки")]
    verbose: bool,
    /// Подавить большинство логов (только warn/error)
    #[arg(short = 'q', long, help = "Подавить логирование (только warn/error)")]
    quiet: bool,
    /// Формат вывода результатов
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        help = "Формат вывода снимков тем"
    )]
    output: OutputFormat,
    /// Подкоманда для выполнения
    #[command(subcommand)]
    command: Commands,
}

/// Формат вывода CLI
#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    /// Человекочитаемый формат
    Pretty,
    /// JSON формат
    Json,
}

/// Подкоманды CLI
#[derive(Subcommand)]
enum Commands {
    /// Список тем демонстрационной шины
    #[command(alias = "ls")]
    List {
        /// Сколько сообщений прогнать перед снимком
        #[arg(
            short = 'n',
            long,
            default_value = "3",
            help = "Количество сообщений до снятия снимка"
        )]
        messages: u32,
    },
    /// Детали одной темы демонстрационной шины
    Info {
        /// Полное имя темы (например, /world/pose)
        #[arg(help = "Полное имя темы (например, '/world/pose')")]
        topic: String,
    },
    /// Сквозная демонстрация: pub/sub, зеркало, запрос/ответ
    Demo {
        /// Количество публикуемых сообщений
        #[arg(
            short = 'n',
            long,
            default_value = "5",
            help = "Количество публикуемых сообщений"
        )]
        messages: u32,
        /// Гнать трафик через пару шин, связанных loopback-слоем
        #[arg(long, help = "Связать две шины loopback-слоем")]
        remote: bool,
    },
    /// Версия и параметры сборки
    Version,
}

/// Точка входа в CLI
///
/// Разбирает аргументы, инициализирует логирование и вызывает
/// обработчик подкоманды.
fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LoggingConfig::default();
    log_config.level = if cli.verbose {
        "debug".to_string()
    } else if cli.quiet {
        "warn".to_string()
    } else {
        "info".to_string()
    };
    let _log_handle = init_logging(log_config).map_err(|e| anyhow::anyhow!("{e}"))?;

    match &cli.command {
        Commands::List { messages } => cmd_list(*messages, &cli.output),
        Commands::Info { topic } => cmd_info(topic, &cli.output),
        Commands::Demo { messages, remote } => {
            if *remote {
                cmd_demo_remote(*messages)
            } else {
                cmd_demo_local(*messages)
            }
        }
        Commands::Version => {
            println!(
                "simbus-topic {} ({} {})",
                env!("CARGO_PKG_VERSION"),
                env!("GIT_COMMIT"),
                env!("BUILD_TIME"),
            );
            Ok(())
        }
    }
}

/// Шина с конфигурацией из окружения: переменные `SIMBUS_*`
/// переопределяют умолчания.
fn bus_from_env() -> Result<Bus> {
    let config = BusConfig::load().context("bus config from environment")?;
    Ok(Bus::with_config(config))
}

/// Демонстрационный мир: шина, два узла и немного трафика.
///
/// Поля держатся живыми до конца работы подкоманды, иначе Drop
/// издателей и подписчика снял бы темы из реестра ещё до снимка.
struct DemoWorld {
    bus: Bus,
    _world: Node,
    _viewer: Node,
    _pose: Publisher<StringMsg>,
    _stats: Publisher<StringMsg>,
    _sub: Subscriber,
    received: Arc<AtomicU64>,
}

/// Собирает демонстрационную шину и прокачивает `messages` сообщений.
fn build_demo_world(messages: u32) -> Result<DemoWorld> {
    let bus = bus_from_env()?;
    let world = bus.node("world").context("node 'world'")?;
    let viewer = bus.node("viewer").context("node 'viewer'")?;

    let pose = world
        .advertise::<StringMsg>("~/pose", AdvertiseOptions::latched())
        .context("advertise ~/pose")?;
    let stats = world
        .advertise::<StringMsg>("~/stats", AdvertiseOptions::default())
        .context("advertise ~/stats")?;

    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let sub = viewer
        .subscribe::<StringMsg, _>("/world/pose", move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .context("subscribe /world/pose")?;

    for i in 0..messages {
        pose.publish(&StringMsg::new(format!("pose #{i}")))?;
        stats.publish(&StringMsg::new(format!("tick {i}")))?;
        bus.process_nodes();
    }

    Ok(DemoWorld {
        bus,
        _world: world,
        _viewer: viewer,
        _pose: pose,
        _stats: stats,
        _sub: sub,
        received,
    })
}

/// Список тем демонстрационной шины
fn cmd_list(
    messages: u32,
    output: &OutputFormat,
) -> Result<()> {
    let demo = build_demo_world(messages)?;
    let snapshots = demo.bus.topics();
    debug!(
        topics = snapshots.len(),
        namespaces = ?demo.bus.namespaces(),
        received = demo.received.load(Ordering::SeqCst),
        "Snapshot taken"
    );
    print_snapshots(&snapshots, output)
}

/// Детали одной темы
fn cmd_info(
    topic: &str,
    output: &OutputFormat,
) -> Result<()> {
    let demo = build_demo_world(3)?;
    let snapshots = demo.bus.topics();
    let found: Vec<TopicSnapshot> = snapshots
        .into_iter()
        .filter(|s| s.topic == topic)
        .collect();
    if found.is_empty() {
        anyhow::bail!("тема '{topic}' не найдена; попробуйте 'simbus-topic list'");
    }
    print_snapshots(&found, output)
}

/// Локальная демонстрация: трафик, зеркало и запрос/ответ.
fn cmd_demo_local(messages: u32) -> Result<()> {
    let demo = build_demo_world(messages)?;

    // Отвечающая сторона и запрос через ту же шину.
    let _server = rpc::serve(&demo.bus, "world", |req| {
        match RpcReply::success(&StringMsg::new(format!("done: {}", req.data))) {
            Ok(reply) => reply,
            Err(e) => RpcReply::error(e.to_string()),
        }
    })?;
    let pump = demo.bus.start_pump();
    let response = demo.bus.request(
        "world",
        "entity_info",
        "box_1",
        Some(Duration::from_millis(500)),
    )?;
    pump.stop();

    println!("Сообщений опубликовано: {messages}");
    println!(
        "Сообщений получено:     {}",
        demo.received.load(Ordering::SeqCst)
    );
    println!("Ответ на запрос:        {}", response.response);
    if response.is_success() {
        let payload: StringMsg = response.decode_payload()?;
        println!("Полезная нагрузка:      {}", payload.data);
    }
    Ok(())
}

/// Межшинная демонстрация через loopback-слой.
fn cmd_demo_remote(messages: u32) -> Result<()> {
    let bus_a = bus_from_env()?;
    let bus_b = bus_from_env()?;
    LoopbackConnections::pair(&bus_a, &bus_b);

    let sender = bus_a.node("world")?;
    let receiver = bus_b.node("viewer")?;

    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let _sub = receiver.subscribe::<StringMsg, _>("/world/pose", move |_msg| {
        counter.fetch_add(1, Ordering::SeqCst);
    })?;
    let pose = sender.advertise::<StringMsg>("~/pose", AdvertiseOptions::default())?;

    for i in 0..messages {
        pose.publish(&StringMsg::new(format!("pose #{i}")))?;
        bus_a.process_nodes();
        bus_b.process_nodes();
        thread::sleep(Duration::from_millis(1));
    }

    let stats_a = bus_a.stats();
    let stats_b = bus_b.stats();
    println!("Сообщений опубликовано:     {messages}");
    println!(
        "Получено на второй шине:    {}",
        received.load(Ordering::SeqCst)
    );
    println!("Переслано первой шиной:     {}", stats_a.forwarded_remote);
    println!("Доставлено второй шиной:    {}", stats_b.delivered_local);
    Ok(())
}

/// Печать снимков тем в выбранном формате.
fn print_snapshots(
    snapshots: &[TopicSnapshot],
    output: &OutputFormat,
) -> Result<()> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(snapshots)?);
        }
        OutputFormat::Pretty => {
            println!(
                "{:<28} {:<24} {:>4} {:>5} {:>5} {:>6} {:>6}",
                "TOPIC", "TYPE", "ADV", "LATCH", "SUBS", "SENT", "FWD"
            );
            for s in snapshots {
                println!(
                    "{:<28} {:<24} {:>4} {:>5} {:>5} {:>6} {:>6}",
                    s.topic,
                    s.type_name,
                    if s.advertised { "yes" } else { "no" },
                    if s.latched { "yes" } else { "no" },
                    s.local_subscribers,
                    s.delivered_local,
                    s.forwarded_remote,
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli_parsing() {
        let cli = Cli::try_parse_from(["simbus-topic", "list", "-n", "7"]).unwrap();
        match cli.command {
            Commands::List { messages } => assert_eq!(messages, 7),
            _ => panic!("ожидалась подкоманда list"),
        }
    }

    #[test]
    fn test_demo_flags() {
        let cli = Cli::try_parse_from(["simbus-topic", "demo", "--remote"]).unwrap();
        match cli.command {
            Commands::Demo { messages, remote } => {
                assert_eq!(messages, 5);
                assert!(remote);
            }
            _ => panic!("ожидалась подкоманда demo"),
        }
    }

    /// Переменные `SIMBUS_*` доходят до конфигурации собранной шины.
    #[test]
    fn test_bus_from_env_reads_overrides() {
        std::env::set_var("SIMBUS_DEFAULT_QUEUE_LIMIT", "7");
        let bus = bus_from_env().unwrap();
        std::env::remove_var("SIMBUS_DEFAULT_QUEUE_LIMIT");
        assert_eq!(bus.config().default_queue_limit, 7);
    }
}
