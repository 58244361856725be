//! End-to-end cycles against a mock presence-tracking server.

use stamping_client::client::StampingClient;
use stamping_client::config::{ClientConfig, PathsConfig, ServerConfig};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Smartclock layout, 27 chars, badge 000232, dated 2099-01-01 so the
// retry store never prunes them as stale.
const ENTRANCE_0800: &str = "E13000232000008000001019900";
const EXIT_1230: &str = "U13000232000012300001019900";
const ENTRANCE_1300: &str = "E13000232000013000001019900";
const EXIT_1700: &str = "U13000232000017000001019900";

fn config(dir: &TempDir, server: &MockServer) -> ClientConfig {
    let addr = server.address();
    let config = ClientConfig {
        paths: PathsConfig {
            base_dir: dir.path().to_path_buf(),
        },
        server: ServerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..ServerConfig::default()
        },
        ..ClientConfig::default()
    };
    config.ensure_directories().unwrap();
    config
}

fn write_source(dir: &TempDir, name: &str, lines: &[&str]) {
    let contents = lines
        .iter()
        .map(|line| format!("{line}\n"))
        .collect::<String>();
    std::fs::write(dir.path().join("source").join(name), contents).unwrap();
}

async fn received_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_run_cycle_delivers_new_lines_and_checkpoints() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/stampings/create"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = StampingClient::new(config(&dir, &server)).unwrap();
    write_source(&dir, "20990101.txt", &[ENTRANCE_0800, EXIT_1700]);

    client.run_cycle().await.unwrap();

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["matricolaFirma"], "000232");
    assert_eq!(bodies[0]["operazione"], "0");
    assert_eq!(bodies[1]["operazione"], "1");
    assert_eq!(bodies[1]["ora"], 17);

    // nothing failed, the whole file is checkpointed
    assert!(!dir.path().join("info/bad_stampings.txt").exists());
    let checkpoint = std::fs::read_to_string(dir.path().join("info/last_file.txt")).unwrap();
    assert!(checkpoint.contains("20990101.txt"));
    assert!(checkpoint.trim_end().ends_with("\t2"));
}

#[tokio::test]
async fn test_retryable_failure_is_stored_then_resent() {
    let flaky = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/stampings/create"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&flaky)
        .await;

    let dir = TempDir::new().unwrap();
    let client = StampingClient::new(config(&dir, &flaky)).unwrap();
    write_source(&dir, "20990101.txt", &[ENTRANCE_0800]);
    client.run_cycle().await.unwrap();

    let bad = std::fs::read_to_string(dir.path().join("info/bad_stampings.txt")).unwrap();
    assert_eq!(bad, format!("{ENTRANCE_0800}\n"));

    // the server recovers, the resend cycle drains the store
    let healthy = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/stampings/create"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&healthy)
        .await;
    let client = StampingClient::new(config(&dir, &healthy)).unwrap();
    client.resend_bad_cycle().await.unwrap();

    assert!(!dir.path().join("info/bad_stampings.txt").exists());
    let bodies = received_bodies(&healthy).await;
    assert_eq!(bodies[0]["matricolaFirma"], "000232");
}

#[tokio::test]
async fn test_meal_break_reasons_inferred_across_the_session() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/stampings/create"))
        .respond_with(ResponseTemplate::new(200))
        .expect(4)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = StampingClient::new(config(&dir, &server)).unwrap();
    write_source(
        &dir,
        "20990101.txt",
        &[ENTRANCE_0800, EXIT_1230, ENTRANCE_1300, EXIT_1700],
    );

    client.run_cycle().await.unwrap();

    let bodies = received_bodies(&server).await;
    let reasons: Vec<&serde_json::Value> = bodies.iter().map(|b| &b["causale"]).collect();
    // morning entrance plain, lunch exit and return flagged, evening exit plain
    assert!(reasons[0].is_null());
    assert_eq!(*reasons[1], serde_json::json!("pausaPranzo"));
    assert_eq!(*reasons[2], serde_json::json!("pausaPranzo"));
    assert!(reasons[3].is_null());
}

#[tokio::test]
async fn test_meal_break_inference_survives_incremental_resume() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/stampings/create"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = StampingClient::new(config(&dir, &server)).unwrap();

    // first run delivers the morning and the lunch exit
    write_source(&dir, "20990101.txt", &[ENTRANCE_0800, EXIT_1230]);
    client.run_cycle().await.unwrap();

    // the return from lunch lands in the file after the checkpoint
    write_source(
        &dir,
        "20990101.txt",
        &[ENTRANCE_0800, EXIT_1230, ENTRANCE_1300],
    );
    client.run_cycle().await.unwrap();

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 3);
    // the resumed run still sees the earlier stampings of the session, so
    // the 13:00 entrance is not mistaken for a first entrance
    assert_eq!(bodies[2]["ora"], 13);
    assert_eq!(bodies[2]["causale"], serde_json::json!("pausaPranzo"));
}

#[tokio::test]
async fn test_second_run_sends_nothing_when_source_is_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/stampings/create"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = StampingClient::new(config(&dir, &server)).unwrap();
    write_source(&dir, "20990101.txt", &[ENTRANCE_0800]);

    client.run_cycle().await.unwrap();
    client.run_cycle().await.unwrap();

    assert_eq!(received_bodies(&server).await.len(), 1);
}
