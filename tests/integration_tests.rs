use bytes::BytesMut;
use chrono::{Duration as ChronoDuration, Utc};
use lantern::{
    diagnostics::setup_test_logging,
    event::Event,
    format::{Field, FieldSpec, FieldsFormatter, Formatter},
    level::Level,
    log::Log,
    metrics::PipelineMetricsCollector,
    serialize::SerializableData,
    transport::{
        BufferedTransport, BulkHttpTransport, Packet, Peer, RemoteConfig, RemoteState,
        RemoteTransport, RotationConfig, SizeRotationFileTransport, SqliteConfig, SqliteTransport,
        StaticBrowser, Transport, UploaderConfig,
    },
    write_log,
};
use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use url::Url;

/// A formatter that renders the message text and counts how often it ran,
/// so tests can assert that gated events never reach formatting.
#[derive(Clone)]
struct CountingFormatter {
    calls: Arc<AtomicUsize>,
}

impl CountingFormatter {
    fn new() -> CountingFormatter {
        CountingFormatter {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Formatter for CountingFormatter {
    fn format(&self, event: &Event) -> Option<SerializableData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(SerializableData::Text(event.message.render().to_owned()))
    }
}

fn message_transport(
    formatter: Option<Box<dyn Formatter>>,
) -> Arc<BufferedTransport<(Level, String)>> {
    BufferedTransport::new(64, formatter, |event, _| {
        (event.level, event.message.render().to_owned())
    })
}

fn logger_with(
    transports: Vec<Arc<dyn Transport>>,
    level: Level,
    metric_name: &'static str,
) -> Log {
    Log::builder()
        .subsystem("com.example.app")
        .category("pipeline")
        .level(level)
        .manager(move |mut manager| {
            for transport in transports {
                manager = manager.transport(transport);
            }
            manager
                .synchronous(true)
                .metrics(
                    PipelineMetricsCollector::new_with_metric_name(metric_name)
                        .unwrap_or_else(|_| PipelineMetricsCollector::detached()),
                )
                .logger(setup_test_logging())
        })
        .build()
}

#[test]
fn severity_gating_drops_below_level_without_formatting() {
    let formatter = CountingFormatter::new();
    let calls = Arc::clone(&formatter.calls);
    let transport = message_transport(Some(Box::new(formatter)));
    let log = logger_with(
        vec![Arc::clone(&transport) as Arc<dyn Transport>],
        Level::Warning,
        "gating_metrics",
    );

    write_log!(log, Level::Info, "x");
    write_log!(log, Level::Error, "y");
    log.flush();

    assert_eq!(
        transport.items(),
        vec![(Level::Error, "y".to_owned())]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn both_transports_observe_submission_order() {
    let first = message_transport(None);
    let second = message_transport(None);
    let log = logger_with(
        vec![
            Arc::clone(&first) as Arc<dyn Transport>,
            Arc::clone(&second) as Arc<dyn Transport>,
        ],
        Level::Trace,
        "ordering_metrics",
    );

    for message in ["a", "b", "c"] {
        log.info().unwrap().write_message(message);
    }
    log.flush();

    let expected: Vec<(Level, String)> = ["a", "b", "c"]
        .iter()
        .map(|m| (Level::Info, m.to_string()))
        .collect();
    assert_eq!(first.items(), expected);
    assert_eq!(second.items(), expected);
}

#[test]
fn scope_and_logger_tags_merge_into_events() {
    let tagged = BufferedTransport::new(16, None, |event: &Arc<Event>, _| event.all_tags());
    let log = Log::builder()
        .subsystem("com.example.app")
        .category("tags")
        .level(Level::Trace)
        .tag("component", "integration")
        .manager(|manager| {
            manager
                .transport(Arc::clone(&tagged) as Arc<dyn Transport>)
                .synchronous(true)
                .metrics(PipelineMetricsCollector::detached())
        })
        .build();

    log.info().unwrap().write_with(|event| {
        event.message = "tagged".into();
        event.scope.tags.insert("env".to_owned(), "test".to_owned());
        event
            .tags
            .insert("component".to_owned(), "caller-wins".to_owned());
    });
    log.flush();

    let merged = tagged.items().remove(0);
    assert_eq!(merged.get("env").map(String::as_str), Some("test"));
    assert_eq!(
        merged.get("component").map(String::as_str),
        Some("caller-wins")
    );
}

#[test]
fn rotating_file_transport_honors_both_caps() {
    let tempdir = TempDir::new().unwrap();
    let logger = setup_test_logging();
    let formatter = Box::new(FieldsFormatter::new(
        vec![FieldSpec::new(Field::Message)],
        " ",
    ));
    let transport = SizeRotationFileTransport::new(
        RotationConfig {
            directory: tempdir.path().to_owned(),
            prefix: "events".to_owned(),
            extension: "log".to_owned(),
            max_file_size: 1024,
            max_files_count: 3,
            min_level: None,
        },
        formatter,
        None,
        &logger,
    )
    .unwrap();
    let log = logger_with(
        vec![Arc::clone(&transport) as Arc<dyn Transport>],
        Level::Trace,
        "rotation_metrics",
    );

    // 64 bytes per line; 4096 bytes total.
    let line = "r".repeat(63);
    for _ in 0..64 {
        log.info().unwrap().write_message(line.as_str());
    }
    log.flush();

    let archives = transport.archives().unwrap();
    assert_eq!(archives.len(), 3);
    assert!(transport.current_path().exists());

    let mut sorted = archives.clone();
    sorted.sort();
    assert_eq!(archives, sorted, "archive names must sort by timestamp");

    // Re-listing yields the same set; nothing is silently deleted.
    assert_eq!(transport.archives().unwrap(), archives);
}

#[test]
fn sqlite_transport_persists_and_purges() {
    let tempdir = TempDir::new().unwrap();
    let logger = setup_test_logging();
    let transport = SqliteTransport::new(
        SqliteConfig {
            path: tempdir.path().join("events.sqlite"),
            flush_size: 1000,
            flush_interval: Duration::from_secs(3600),
            lifetime: Some(Duration::from_secs(60)),
            purge_min_interval: Duration::from_secs(10),
            ..SqliteConfig::default()
        },
        Vec::new(),
        None,
        &logger,
    )
    .unwrap();
    let log = logger_with(
        vec![Arc::clone(&transport) as Arc<dyn Transport>],
        Level::Trace,
        "sqlite_metrics",
    );

    let stale_timestamp = Utc::now() - ChronoDuration::seconds(120);
    for i in 0..10 {
        log.info().unwrap().write_with(move |event| {
            event.message = format!("fresh {}", i).into();
        });
    }
    for i in 0..10 {
        log.info().unwrap().write_with(move |event| {
            event.message = format!("stale {}", i).into();
            event.timestamp = stale_timestamp;
        });
    }
    log.flush();

    // The batch commit ran one purge pass: stale rows are gone.
    assert_eq!(transport.stored_count().unwrap(), 10);
}

#[test]
fn remote_transport_handshakes_and_streams() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let logger = setup_test_logging();
    let transport = RemoteTransport::new(
        RemoteConfig {
            ping_interval: Duration::from_millis(100),
            ping_watchdog: Duration::from_secs(5),
            ..RemoteConfig::default()
        },
        Arc::new(StaticBrowser::new(vec![Peer {
            name: "collector".to_owned(),
            addr: listener.local_addr().unwrap(),
        }])),
        &logger,
    );
    let log = logger_with(
        vec![Arc::clone(&transport) as Arc<dyn Transport>],
        Level::Trace,
        "remote_metrics",
    );

    let (mut server, _) = listener.accept().unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut receive = BytesMut::new();
    let read_packet = |stream: &mut TcpStream, receive: &mut BytesMut| -> Packet {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(packet) = Packet::decode(receive).unwrap() {
                return packet;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0);
            receive.extend_from_slice(&chunk[..n]);
        }
    };

    assert!(matches!(
        read_packet(&mut server, &mut receive),
        Packet::ClientHello(_)
    ));
    let mut frame = BytesMut::new();
    Packet::ServerHello.encode(&mut frame).unwrap();
    server.write_all(&frame).unwrap();

    // First keep-alive proves the connected state.
    assert!(matches!(
        read_packet(&mut server, &mut receive),
        Packet::Ping
    ));
    assert_eq!(transport.state(), RemoteState::Connected);

    log.warning().unwrap().write_message("over the wire");
    log.flush();

    loop {
        match read_packet(&mut server, &mut receive) {
            Packet::Message(body) => {
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["message"], "over the wire");
                assert_eq!(value["level"], "warning");
                break;
            }
            Packet::Ping => continue,
            other => panic!("unexpected packet {:?}", other),
        }
    }
}

#[test]
fn bulk_http_transport_uploads_each_buffered_record() {
    let mocked = mockito::mock("POST", "/")
        .match_header("Content-Type", "application/json")
        .match_body(mockito::Matcher::Regex("integration-upload".to_owned()))
        .with_status(200)
        .expect(2)
        .create();

    let logger = setup_test_logging();
    let url = Url::parse(&mockito::server_url()).unwrap();
    let transport = BulkHttpTransport::new(
        UploaderConfig {
            upload_interval: Duration::from_secs(3600),
            ..UploaderConfig::for_endpoint(&url).unwrap()
        },
        lantern::metrics::UploadMetricsCollector::detached(),
        &logger,
    )
    .unwrap();
    let log = logger_with(
        vec![Arc::clone(&transport) as Arc<dyn Transport>],
        Level::Trace,
        "bulk_http_metrics",
    );

    log.info().unwrap().write_message("integration-upload 1");
    log.info().unwrap().write_message("integration-upload 2");
    log.flush();

    mocked.assert();
}

#[test]
fn transport_min_level_composes_with_logger_level() {
    let strict = message_transport(None).with_min_level(Level::Error);
    let relaxed = message_transport(None);
    let log = logger_with(
        vec![
            Arc::clone(&strict) as Arc<dyn Transport>,
            Arc::clone(&relaxed) as Arc<dyn Transport>,
        ],
        Level::Info,
        "min_level_metrics",
    );

    write_log!(log, Level::Debug, "hidden from everyone");
    write_log!(log, Level::Info, "relaxed only");
    write_log!(log, Level::Critical, "everyone");
    log.flush();

    assert_eq!(
        relaxed.items(),
        vec![
            (Level::Info, "relaxed only".to_owned()),
            (Level::Critical, "everyone".to_owned()),
        ]
    );
    assert_eq!(
        strict.items(),
        vec![(Level::Critical, "everyone".to_owned())]
    );
}
