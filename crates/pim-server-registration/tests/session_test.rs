//! Registration sessions against a real directory and a fake launcher

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;

use pim_directory::{DirectoryClient, DirectoryServer, DirectoryServerConfig};
use pim_launcher::{InstanceHandle, LaunchError, LaunchedInstance, Launcher};
use pim_proto::Token;
use pim_registry::Registry;
use pim_server_registration::{ConnectionHint, RegistrationServer, RegistrationServerConfig};

// ============================================================================
// FAKE LAUNCHER
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Start,
    NoPort,
    Crash,
    StartButCannotStop,
}

#[derive(Debug)]
struct FakeHandle {
    terminated: Arc<AtomicBool>,
    stop_fails: bool,
}

#[async_trait]
impl InstanceHandle for FakeHandle {
    async fn terminate(&mut self) -> Result<(), LaunchError> {
        self.terminated.store(true, Ordering::SeqCst);
        if self.stop_fails {
            Err(LaunchError::Terminate("container is stuck".to_string()))
        } else {
            Ok(())
        }
    }
}

struct FakeLauncher {
    behaviour: Behaviour,
    terminated: Arc<AtomicBool>,
}

impl FakeLauncher {
    fn new(behaviour: Behaviour) -> (Arc<Self>, Arc<AtomicBool>) {
        let terminated = Arc::new(AtomicBool::new(false));
        let launcher = Arc::new(Self {
            behaviour,
            terminated: terminated.clone(),
        });
        (launcher, terminated)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self) -> Result<LaunchedInstance, LaunchError> {
        let stop_fails = match self.behaviour {
            Behaviour::NoPort => {
                return Err(LaunchError::PortUnavailable("exhausted".to_string()))
            }
            Behaviour::Crash => return Err(LaunchError::Timeout(Duration::from_secs(1))),
            Behaviour::Start => false,
            Behaviour::StartButCannotStop => true,
        };

        Ok(LaunchedInstance {
            address: "instance-host".to_string(),
            port: 31337,
            handle: Box::new(FakeHandle {
                terminated: self.terminated.clone(),
                stop_fails,
            }),
        })
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pim_server_registration=debug,pim_directory=debug")
        .with_test_writer()
        .try_init();
}

async fn start_directory() -> SocketAddr {
    let config = DirectoryServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    let server = DirectoryServer::bind(config, Arc::new(Registry::new(Duration::from_secs(30))))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn unused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn start_registration(
    launcher: Arc<dyn Launcher>,
    directory_addr: SocketAddr,
    instance_ttl: Duration,
    terminate_on_disconnect: bool,
) -> SocketAddr {
    init_tracing();

    let config = RegistrationServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        directory_addr: directory_addr.to_string(),
        directory_timeout: Duration::from_secs(2),
        instance_ttl,
        hint: ConnectionHint {
            address: "challenge.example.com".to_string(),
            port: "8443".to_string(),
            ssl: true,
        },
        terminate_on_disconnect,
    };
    let server = RegistrationServer::bind(config, launcher).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

/// Everything the server writes until it closes the connection
async fn read_all(stream: &mut TcpStream) -> String {
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut text))
        .await
        .expect("session did not close the connection")
        .unwrap();
    text
}

async fn wait_for(flag: &AtomicBool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    flag.load(Ordering::SeqCst)
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_successful_registration_then_expiry() {
    let directory_addr = start_directory().await;
    let (launcher, terminated) = FakeLauncher::new(Behaviour::Start);
    let addr = start_registration(launcher, directory_addr, Duration::from_secs(1), false).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = BufReader::new(stream).lines();

    assert_eq!(
        lines.next_line().await.unwrap().unwrap(),
        "Initializing private instance..."
    );

    let line = lines.next_line().await.unwrap().unwrap();
    let token: Token = line
        .strip_prefix("Initialized private instance with token: ")
        .unwrap_or_else(|| panic!("unexpected line {:?}", line))
        .parse()
        .unwrap();

    assert_eq!(
        lines.next_line().await.unwrap().unwrap(),
        "Use it at: ncat --ssl challenge.example.com 8443"
    );

    // The token resolves to the launched instance
    let info = DirectoryClient::new(directory_addr.to_string())
        .get_info(&token)
        .await
        .unwrap();
    assert_eq!(info.port, 31337);
    assert_eq!(info.service_name, "instance-host");
    assert!(!terminated.load(Ordering::SeqCst));

    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, "Terminating the instance...");
    assert!(terminated.load(Ordering::SeqCst));

    assert_eq!(lines.next_line().await.unwrap(), None);
}

#[tokio::test]
async fn test_unreachable_directory_stops_instance() {
    let (launcher, terminated) = FakeLauncher::new(Behaviour::Start);
    let addr = start_registration(
        launcher,
        unused_addr().await,
        Duration::from_secs(30),
        false,
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(
        read_all(&mut stream).await,
        "Initializing private instance...\nFailed to add a service!\n"
    );
    assert!(terminated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_launch_failures() {
    let directory_addr = start_directory().await;

    let (launcher, _) = FakeLauncher::new(Behaviour::NoPort);
    let addr = start_registration(launcher, directory_addr, Duration::from_secs(30), false).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(
        read_all(&mut stream).await,
        "Initializing private instance...\nFailed to obtain a free port\n"
    );

    let (launcher, _) = FakeLauncher::new(Behaviour::Crash);
    let addr = start_registration(launcher, directory_addr, Duration::from_secs(30), false).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(
        read_all(&mut stream).await,
        "Initializing private instance...\nFailed to start the private instance\n"
    );
}

#[tokio::test]
async fn test_failed_stop_is_reported() {
    let directory_addr = start_directory().await;
    let (launcher, terminated) = FakeLauncher::new(Behaviour::StartButCannotStop);
    let addr = start_registration(
        launcher,
        directory_addr,
        Duration::from_millis(200),
        false,
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let text = read_all(&mut stream).await;
    assert!(
        text.ends_with("Failed to stop the instance\n"),
        "unexpected output {:?}",
        text
    );
    assert!(terminated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_instance_outlives_client_by_default() {
    let directory_addr = start_directory().await;
    let (launcher, terminated) = FakeLauncher::new(Behaviour::Start);
    let addr = start_registration(launcher, directory_addr, Duration::from_secs(1), false).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    for _ in 0..3 {
        lines.next_line().await.unwrap().unwrap();
    }
    drop(lines);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!terminated.load(Ordering::SeqCst));

    // The timer still runs to completion with nobody listening
    assert!(wait_for(&terminated, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_terminate_on_disconnect() {
    let directory_addr = start_directory().await;
    let (launcher, terminated) = FakeLauncher::new(Behaviour::Start);
    let addr = start_registration(launcher, directory_addr, Duration::from_secs(60), true).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    for _ in 0..3 {
        lines.next_line().await.unwrap().unwrap();
    }
    drop(lines);

    assert!(wait_for(&terminated, Duration::from_secs(5)).await);
}
