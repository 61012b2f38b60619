//! Client-side components for disasync

use crate::correlation::PendingQueries;
use crate::protocol::progress::Observer;
use crate::protocol::*;
use crate::types::{Branch, Error, ProtocolError, Repository, Result, Tick};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

pub mod replica;
pub mod settings;
pub mod sync_loop;

pub use replica::{DocumentHooks, Replica, SessionState};
pub use settings::{read_settings, write_settings, ServerEntry, Settings, SettingsNotInitialized};

/// Configuration for the disasync client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a query waits for its reply
    pub query_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A connection to a relay, replicating at most one branch at a time.
pub struct Client {
    config: ClientConfig,
    pending: Arc<PendingQueries>,
    transfers: Arc<Transfers>,
    replica: Arc<Mutex<Replica>>,
    applying_remote: Arc<AtomicBool>,
    outgoing: mpsc::UnboundedSender<Packet>,
    receiver: JoinHandle<()>,
    sender: JoinHandle<()>,
}

impl Client {
    /// Connects to a relay over TCP.
    pub async fn connect<A: ToSocketAddrs>(
        address: A,
        hooks: Box<dyn DocumentHooks>,
        config: ClientConfig,
    ) -> Result<Self> {
        let socket = TcpStream::connect(address).await?;
        socket.set_nodelay(true)?;
        tracing::info!(relay = %socket.peer_addr()?, "Connected to relay");

        Ok(Self::from_transport(socket, hooks, config))
    }

    /// Runs the client over an already established transport.
    pub fn from_transport<T>(io: T, hooks: Box<dyn DocumentHooks>, config: ClientConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (outgoing, queue) = mpsc::unbounded_channel();

        let pending = Arc::new(PendingQueries::new());
        let transfers = Arc::new(Transfers::new());
        let replica = Replica::new(hooks);
        let applying_remote = replica.remote_apply_flag();
        let replica = Arc::new(Mutex::new(replica));

        let receiver = tokio::spawn(sync_loop::receive(
            FramedRead::new(reader, PacketCodec::with_progress(transfers.clone())),
            pending.clone(),
            replica.clone(),
            outgoing.clone(),
        ));
        let sender = tokio::spawn(sync_loop::send(
            writer,
            queue,
            pending.clone(),
            transfers.clone(),
        ));

        Self {
            config,
            pending,
            transfers,
            replica,
            applying_remote,
            outgoing,
            receiver,
            sender,
        }
    }

    /// Sends a query and waits for its reply.
    pub async fn request<C: ParentCommand>(&self, query: C::Query) -> Result<C::Reply> {
        self.observed_request::<C>(query, None).await
    }

    /// Like [`request`](Self::request), handing the progress of the
    /// query's container transfer to `observer`.
    async fn observed_request<C: ParentCommand>(
        &self,
        query: C::Query,
        observer: Option<Observer>,
    ) -> Result<C::Reply> {
        let pending = self.pending.register()?;
        let _watch = observer.map(|observer| self.transfers.watch(pending.id(), observer));
        tracing::debug!(id = %pending.id(), command = C::NAME, "Sending query");
        self.send(C::request(pending.id(), query))?;

        let reply = pending.wait(C::NAME, self.config.query_timeout).await?;
        C::into_reply(reply)
            .map_err(|other| ProtocolError::Unexpected(other.tag().to_string()).into())
    }

    pub async fn get_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self
            .request::<GetRepositories>(GetRepositoriesQuery {})
            .await?
            .repos)
    }

    pub async fn get_branches(&self, repo: &str) -> Result<Vec<Branch>> {
        Ok(self
            .request::<GetBranches>(GetBranchesQuery {
                repo: repo.to_string(),
            })
            .await?
            .branches)
    }

    pub async fn new_repository(&self, repo: Repository) -> Result<()> {
        self.request::<NewRepository>(NewRepositoryQuery { repo })
            .await?;
        Ok(())
    }

    pub async fn new_branch(&self, branch: Branch) -> Result<()> {
        self.request::<NewBranch>(NewBranchQuery { branch }).await?;
        Ok(())
    }

    /// Uploads the full document of a branch.
    pub async fn upload_database(&self, repo: &str, branch: &str, content: Vec<u8>) -> Result<()> {
        self.upload(repo, branch, content, None).await
    }

    /// Uploads the full document of a branch, reporting bytes sent.
    pub async fn upload_database_with_progress<F>(
        &self,
        repo: &str,
        branch: &str,
        content: Vec<u8>,
        progress: F,
    ) -> Result<()>
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.upload(repo, branch, content, Some(Box::new(progress)))
            .await
    }

    pub async fn download_database(&self, repo: &str, branch: &str) -> Result<Vec<u8>> {
        self.download(repo, branch, None).await
    }

    /// Downloads the full document of a branch, reporting bytes received.
    pub async fn download_database_with_progress<F>(
        &self,
        repo: &str,
        branch: &str,
        progress: F,
    ) -> Result<Vec<u8>>
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.download(repo, branch, Some(Box::new(progress))).await
    }

    async fn upload(
        &self,
        repo: &str,
        branch: &str,
        content: Vec<u8>,
        observer: Option<Observer>,
    ) -> Result<()> {
        let query = UploadDatabaseQuery {
            repo: repo.to_string(),
            branch: branch.to_string(),
            content: Blob(content),
        };
        self.observed_request::<UploadDatabase>(query, observer)
            .await?;
        Ok(())
    }

    async fn download(
        &self,
        repo: &str,
        branch: &str,
        observer: Option<Observer>,
    ) -> Result<Vec<u8>> {
        let query = DownloadDatabaseQuery {
            repo: repo.to_string(),
            branch: branch.to_string(),
        };
        let reply = self
            .observed_request::<DownloadDatabase>(query, observer)
            .await?;
        Ok(reply.content.into_inner())
    }

    /// Follows a branch, first replaying every event after `tick`.
    pub fn subscribe(&self, repo: &str, branch: &str, tick: Tick, color: Option<u32>) -> Result<()> {
        let packets = sync_loop::lock(&self.replica).subscribe(repo, branch, tick, color);
        packets.into_iter().try_for_each(|packet| self.send(packet))
    }

    pub fn unsubscribe(&self) -> Result<()> {
        match sync_loop::lock(&self.replica).unsubscribe() {
            Some(packet) => self.send(packet),
            None => Ok(()),
        }
    }

    /// Publishes a mutation made to the local document.
    pub fn submit_local_event(&self, payload: EventPayload) -> Result<()> {
        let packet = sync_loop::lock(&self.replica).local_event(payload)?;
        self.send(packet)
    }

    pub fn update_cursors(&self, position: u64) -> Result<()> {
        self.send(Packet::UpdateCursors(UpdateCursors {
            position,
            color: None,
        }))
    }

    /// Watermark of the subscribed branch.
    pub fn last_tick(&self) -> Option<Tick> {
        sync_loop::lock(&self.replica).last_tick()
    }

    pub fn session_state(&self) -> Option<SessionState> {
        sync_loop::lock(&self.replica).state()
    }

    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.load(Ordering::SeqCst)
    }

    pub fn remote_apply_flag(&self) -> Arc<AtomicBool> {
        self.applying_remote.clone()
    }

    /// Get client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn send(&self, packet: Packet) -> Result<()> {
        self.outgoing
            .send(packet)
            .map_err(|_| Error::ConnectionLost)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receiver.abort();
        self.sender.abort();
    }
}
