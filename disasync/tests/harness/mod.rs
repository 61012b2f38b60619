use chrono::Utc;
use disasync::client::{Client, ClientConfig, DocumentHooks, SessionState};
use disasync::protocol::{EventPayload, Subscribe, Unsubscribe, UpdateCursors};
use disasync::server::{EventLog, Relay};
use disasync::{Branch, Repository, Server, ServerConfig, Tick};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::util::SubscriberInitExt;

pub const REPO: &str = "repoX";
pub const BRANCH: &str = "main";

/// Everything the relay made a client do.
#[derive(Debug, Default)]
pub struct Recorded {
    pub applied: Vec<(Tick, EventPayload)>,
    pub ready: usize,
    pub closed: usize,
    pub peers_joined: Vec<Option<u32>>,
    pub peers_left: Vec<Option<u32>>,
    pub cursors: Vec<UpdateCursors>,
}

impl Recorded {
    pub fn ticks(&self) -> Vec<Tick> {
        self.applied.iter().map(|(tick, _)| *tick).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recording(Arc<Mutex<Recorded>>);

impl Recording {
    pub fn get(&self) -> MutexGuard<'_, Recorded> {
        self.0.lock().unwrap()
    }
}

impl DocumentHooks for Recording {
    fn apply_remote_event(&mut self, tick: Tick, payload: &EventPayload) -> anyhow::Result<()> {
        self.get().applied.push((tick, payload.clone()));
        Ok(())
    }

    fn on_session_ready(&mut self, _: &str, _: &str) {
        self.get().ready += 1;
    }

    fn on_session_closed(&mut self) {
        self.get().closed += 1;
    }

    fn on_peer_subscribed(&mut self, peer: &Subscribe) {
        self.get().peers_joined.push(peer.color);
    }

    fn on_peer_unsubscribed(&mut self, peer: &Unsubscribe) {
        self.get().peers_left.push(peer.color);
    }

    fn on_cursor_update(&mut self, cursors: &UpdateCursors) {
        self.get().cursors.push(cursors.clone());
    }
}

pub struct TestContext {
    pub address: SocketAddr,
    pub relay: Arc<Relay>,
    server: JoinHandle<()>,
    _db_dir: TempDir,
    _guard: DefaultGuard,
}

impl TestContext {
    /// Starts a relay on an ephemeral port with a fresh database.
    pub async fn new() -> Self {
        let guard = tracing_subscriber::fmt()
            .with_env_filter("warn,disasync=debug")
            .with_test_writer()
            .set_default();

        let db_dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            database_path: db_dir.path().join("events.sqlite"),
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            max_peers: 16,
        };
        let log = EventLog::open(&config.database_path).expect("Failed to open event log");
        let server = Server::bind_with_log(config, log)
            .await
            .expect("Failed to bind relay");
        let address = server.local_addr().unwrap();
        let relay = server.relay();

        let server = tokio::spawn(async move {
            if let Err(error) = server.run().await {
                tracing::error!("Relay stopped: {}", error);
            }
        });

        Self {
            address,
            relay,
            server,
            _db_dir: db_dir,
            _guard: guard,
        }
    }

    pub async fn connect(&self) -> (Client, Recording) {
        let recording = Recording::default();
        let client = Client::connect(
            self.address,
            Box::new(recording.clone()),
            ClientConfig::default(),
        )
        .await
        .expect("Failed to connect to relay");
        (client, recording)
    }

    /// Creates `repoX/main` through the protocol.
    pub async fn create_branch(&self) {
        let (client, _) = self.connect().await;
        client
            .new_repository(repository(REPO))
            .await
            .expect("Failed to create repository");
        client
            .new_branch(branch(REPO, BRANCH))
            .await
            .expect("Failed to create branch");
    }

    /// Connects a client and waits until its subscription is live.
    pub async fn subscribed_client(&self, tick: Tick, color: u32) -> (Client, Recording) {
        let (client, recording) = self.connect().await;
        client.subscribe(REPO, BRANCH, tick, Some(color)).unwrap();
        wait_until("subscription to go live", || {
            client.session_state() == Some(SessionState::Live)
        })
        .await;
        (client, recording)
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn repository(name: &str) -> Repository {
    Repository {
        name: name.to_string(),
        hash: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        file: "crackme.exe".to_string(),
        kind: "Portable executable for 80386 (PE)".to_string(),
        date: Utc::now(),
    }
}

pub fn branch(repo: &str, name: &str) -> Branch {
    Branch {
        repo: repo.to_string(),
        name: name.to_string(),
        date: Utc::now(),
        tick: None,
    }
}

pub fn rename(ea: u64, name: &str) -> EventPayload {
    EventPayload::new("renamed")
        .with("ea", ea)
        .with("new_name", name.to_string())
        .with("local_name", false)
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    if polled.is_err() {
        panic!("timed out waiting for {}", what);
    }
}
