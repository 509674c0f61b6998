//! Campaigns over TCP against a line-protocol server backed by the simulator.

use smartscan::config::{Settings, TcpSettings};
use smartscan::error::ScanError;
use smartscan::scan::SmartScan;
use smartscan::transport::simulator::quick_settings;
use smartscan::transport::{SimulatedTransport, TcpTransport, Transport};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const CONFIG: &str = r#"
    [scanning]
    max_points = 5
    duration = "30s"
    train_at = [1]
    initial_points = "center_2D"

    [[tasks]]
    label = "mean"
    function = "mean"

    [acquisition_function]
    function = "acquisition_function_nd"
    params = { a = 2.0 }

    [gp.fvgp]
    init_hyperparameters = [1.0, 2.0, 2.0, 0.5]

    [gp.training]
    hyperparameter_bounds = [[0.1, 10.0], [0.5, 20.0], [0.5, 20.0], [0.1, 5.0]]
    pop_size = 4
    max_iter = 1

    [gp.ask]
    pop_size = 8
    max_iter = 2

    [timing]
    startup_delay = "0s"
    idle_poll = "5ms"
    pause_poll = "20ms"
    warmup_poll = "10ms"
    no_data_backoff = "5ms"
    error_backoff = "5ms"
    start_retry_backoff = "20ms"
    status_poll = "10ms"
    timer_tick = "50ms"
"#;

/// Instrument server speaking the line protocol, one command per connection.
struct FakeServer {
    sim: SimulatedTransport,
    filename: PathBuf,
    commands: AtomicUsize,
}

impl FakeServer {
    async fn dispatch(&self, line: &str) -> String {
        self.commands.fetch_add(1, Ordering::SeqCst);
        let mut tokens = line.split_whitespace();
        let ack = |result: Result<(), ScanError>, tag: &str| match result {
            Ok(()) => format!("{tag} OK"),
            Err(e) => format!("ERROR {e}"),
        };
        match tokens.next() {
            Some("START") => ack(self.sim.start().await, "START"),
            Some("END") => ack(self.sim.end().await, "END"),
            Some("STATUS") => self.sim.status().await.unwrap_or_else(|e| format!("ERROR {e}")),
            Some("AXES") => "AXES 2 0 10 1 0 10 1".to_string(),
            Some("SPECTRUM_SHAPE") => "SPECTRUM_SHAPE 1 16".to_string(),
            Some("FILENAME") => format!("FILENAME {}", self.filename.display()),
            Some("ADD_POINT") => {
                let coords: Vec<f64> = tokens.filter_map(|t| t.parse().ok()).collect();
                ack(self.sim.add_point(&coords).await, "ADD_POINT")
            }
            Some("MEASURE") => self.sim.measure().await.unwrap_or_else(|e| format!("ERROR {e}")),
            _ => format!("ERROR unknown command '{line}'"),
        }
    }
}

async fn spawn_server(server: Arc<FakeServer>) -> TcpSettings {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let server = server.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                if let Ok(Some(line)) = lines.next_line().await {
                    let reply = server.dispatch(line.trim()).await;
                    let _ = write.write_all(format!("{reply}\n").as_bytes()).await;
                }
            });
        }
    });
    TcpSettings {
        host: "127.0.0.1".to_string(),
        port,
        buffer_size: 1 << 20,
        timeout: Duration::from_secs(2),
    }
}

fn fake_server(dir: &std::path::Path) -> Arc<FakeServer> {
    Arc::new(FakeServer {
        sim: SimulatedTransport::new(quick_settings(dir)).unwrap(),
        filename: dir.join("tcp_scan.h5"),
        commands: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn test_connect_reads_instrument_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let tcp = TcpTransport::new(&spawn_server(fake_server(dir.path())).await);

    let info = tcp.connect().await.unwrap();
    assert_eq!(info.grid.n_dim(), 2);
    assert_eq!(info.limits(), vec![[0.0, 10.0], [0.0, 10.0]]);
    assert_eq!(info.measurement_shape, vec![16]);
    assert_eq!(info.filename, dir.path().join("tcp_scan.h5"));

    assert_eq!(tcp.status().await.unwrap(), "READY");
    assert!(matches!(
        tcp.request("JUMP").await.map(|r| r.starts_with("ERROR")),
        Ok(true)
    ));
}

#[tokio::test]
async fn test_campaign_over_tcp_recovers_busy_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let server = fake_server(dir.path());
    // a scan left running makes the first START fail
    server.sim.start().await.unwrap();
    let tcp = spawn_server(server.clone()).await;

    let mut settings = Settings::from_toml_str(CONFIG).unwrap();
    settings.tcp = tcp.clone();
    let transport = Arc::new(TcpTransport::new(&tcp));
    let mut scan = SmartScan::new(settings, transport).unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(20), scan.run())
        .await
        .expect("campaign finishes")
        .unwrap();
    assert_eq!(summary.iterations, 5);
    assert!(summary.unique_positions >= 1);
    assert_eq!(summary.trainings, 1);
    assert!(dir.path().join("tcp_scan_settings.yaml").exists());
    assert!(dir.path().join("tcp_scan_hps.yaml").exists());
    assert!(server.commands.load(Ordering::SeqCst) > 10);
    // END was sent on the way out
    assert_eq!(server.sim.pending(), 0);
}

#[tokio::test]
async fn test_unreachable_instrument_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let settings = Settings::from_toml_str(CONFIG).unwrap();
    let tcp = TcpSettings {
        host: "127.0.0.1".to_string(),
        port,
        buffer_size: 1024,
        timeout: Duration::from_millis(500),
    };
    let mut scan = SmartScan::new(settings, Arc::new(TcpTransport::new(&tcp))).unwrap();
    let result = scan.run().await;
    assert!(matches!(result, Err(ScanError::TransportConnect(_))));
    assert!(scan.is_finalized());
}
