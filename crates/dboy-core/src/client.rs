//! Client lifecycle and connection handling.
//!
//! A [`Client`] owns its configuration, the listening socket and the per-run
//! RSA key pair. Lifecycle changes run under one transition lock: callers
//! that arrive mid-transition queue on it and observe the settled state, so
//! a second `start()` during `Starting` becomes a no-op instead of a second
//! bind.

use crate::channel::SecureChannel;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::events::{ClientEvent, ClientState, Connected, Connecting, Emitter};
use crate::handshake;
use crate::keys::SessionKeyPair;
use crate::library::{resolve_dir, Library};
use crate::transfer;
use dboy_storage::{ContentHash, DownloadItem, DownloadList, WorkerPool};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OnceCell};
use tokio::task::{JoinHandle, JoinSet};

/// Resources that exist only while the client is running.
struct Running {
    local_addr: SocketAddr,
    fingerprint: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Client {
    cfg: ClientConfig,
    pool: WorkerPool,
    state: watch::Sender<ClientState>,
    running: Mutex<Option<Running>>,
    emitter: Emitter,
    downloads: OnceCell<Arc<DownloadList>>,
    library: OnceCell<Arc<Library>>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Self {
        let pool = WorkerPool::new(cfg.workers);
        Self {
            cfg,
            pool,
            state: watch::channel(ClientState::Stopped).0,
            running: Mutex::new(None),
            emitter: Emitter::default(),
            downloads: OnceCell::new(),
            library: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Route all future events to the returned receiver. A new subscription
    /// replaces the previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.emitter.subscribe()
    }

    /// Screen inbound connections before their handshake. The screen runs
    /// on the accepting task, so it should decide quickly; calling
    /// [`Connecting::reject`] closes the connection.
    pub fn on_connecting<F>(&self, screen: F)
    where
        F: Fn(&mut Connecting) + Send + Sync + 'static,
    {
        self.emitter.set_screen(Some(Arc::new(screen)));
    }

    /// Address the listener is bound to while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Fingerprint of the current session key while running.
    pub async fn fingerprint(&self) -> Option<String> {
        self.running.lock().await.as_ref().map(|r| r.fingerprint.clone())
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
        tracing::debug!("Client state: {:?}", state);
        self.emitter.emit(ClientEvent::StateChanged(state));
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.set_state(ClientState::Starting);
        match self.launch().await {
            Ok(r) => {
                tracing::info!("Listening on {} (key {})", r.local_addr, r.fingerprint);
                *running = Some(r);
                self.set_state(ClientState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Start failed: {}", e);
                self.set_state(ClientState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running> {
        let bits = self.cfg.key_bits;
        let keys = Arc::new(self.pool.run(move || SessionKeyPair::generate(bits)).await??);
        let fingerprint = keys.fingerprint();

        let listener = TcpListener::bind((self.cfg.listen_host, self.cfg.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            keys,
            self.emitter.clone(),
            self.cfg.io_timeout,
            stop_rx,
        ));

        Ok(Running {
            local_addr,
            fingerprint,
            shutdown,
            task,
        })
    }

    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(r) = running.take() else {
            return Ok(());
        };

        self.set_state(ClientState::Stopping);
        let _ = r.shutdown.send(());
        let joined = r.task.await;
        self.set_state(ClientState::Stopped);
        tracing::info!("Client stopped");

        joined.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Start when stopped, stop when running.
    pub async fn toggle(&self) -> Result<()> {
        match self.state() {
            ClientState::Running => self.stop().await,
            ClientState::Stopped => self.start().await,
            s => Err(Error::InvalidState(format!("cannot toggle while {s:?}"))),
        }
    }

    /// Open a connection and run the connector handshake.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<SecureChannel<TcpStream>> {
        let limit = self.cfg.io_timeout;
        let stream = handshake::timed(limit, async {
            Ok::<_, Error>(TcpStream::connect((host, port)).await?)
        })
        .await?;
        tracing::debug!("Connected to {}:{}", host, port);
        handshake::connect(stream, self.cfg.password_size, limit).await
    }

    /// Download every missing chunk of `item` from the peer at `host:port`.
    pub async fn fetch(&self, item: &DownloadItem, host: &str, port: u16) -> Result<ContentHash> {
        let mut channel = self.connect_to(host, port).await?;
        let result = transfer::download(&mut channel, item).await;
        channel.close().await;
        result
    }

    /// Answer chunk requests on `channel` from the local library.
    pub async fn serve(&self, mut channel: SecureChannel<TcpStream>) -> Result<()> {
        let library = self.library().await?;
        let result = transfer::serve(&mut channel, library.as_ref()).await;
        channel.close().await;
        result
    }

    /// Transfers kept in the temp directory.
    pub async fn downloads(&self) -> Result<Arc<DownloadList>> {
        self.downloads
            .get_or_try_init(|| async {
                let cwd = std::env::current_dir()?;
                let dir = resolve_dir(&cwd, &self.cfg.temp_dir).await?;
                Ok::<_, Error>(Arc::new(DownloadList::new(dir, self.pool.clone())))
            })
            .await
            .cloned()
    }

    /// Files shared from the configured folders.
    pub async fn library(&self) -> Result<Arc<Library>> {
        self.library
            .get_or_try_init(|| async {
                let cwd = std::env::current_dir()?;
                Ok::<_, Error>(Arc::new(Library::new(
                    self.cfg.shares.clone(),
                    cwd,
                    self.pool.clone(),
                )))
            })
            .await
            .cloned()
    }
}

async fn accept_loop(
    listener: TcpListener,
    keys: Arc<SessionKeyPair>,
    emitter: Emitter,
    limit: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    handshakes.spawn(handle_inbound(stream, peer, keys.clone(), emitter.clone(), limit));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    // Handshakes still in flight die with this run's key pair.
    if !handshakes.is_empty() {
        tracing::debug!("Dropping {} pending handshake(s)", handshakes.len());
    }
    handshakes.shutdown().await;
    tracing::debug!("Listener closed");
}

async fn handle_inbound(
    stream: TcpStream,
    peer: SocketAddr,
    keys: Arc<SessionKeyPair>,
    emitter: Emitter,
    limit: Duration,
) {
    let connecting = emitter.screen(peer);
    emitter.emit(ClientEvent::Connecting(connecting));
    if connecting.is_rejected() {
        tracing::debug!("Rejected {}", peer);
        return;
    }

    match handshake::accept(stream, Some(keys.as_ref()), limit).await {
        Ok(channel) => {
            drop(keys);
            tracing::info!("Peer {} connected", peer);
            emitter.emit(ClientEvent::Connected(Connected { peer, channel }));
        }
        Err(e) => tracing::debug!("Handshake with {} failed: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigInput;
    use crate::message::Message;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> ClientConfig {
        ClientConfig::resolve(ConfigInput {
            shares: Some(vec![temp.path().join("share").display().to_string()]),
            temp_dir: Some(temp.path().join("tmp")),
            listen_host: Some("127.0.0.1".into()),
            listen_port: Some(0),
            key_bits: Some(1024),
            io_timeout_secs: Some(5),
            ..Default::default()
        })
    }

    async fn next_connected(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Connected {
        loop {
            match events.recv().await.expect("event stream ended") {
                ClientEvent::Connected(c) => return c,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn start_stop_and_toggle() -> Result<()> {
        let temp = TempDir::new()?;
        let client = Client::new(config(&temp));
        let mut states = client.watch_state();

        client.stop().await?;
        assert_eq!(client.state(), ClientState::Stopped);

        client.start().await?;
        assert_eq!(client.state(), ClientState::Running);
        assert!(client.local_addr().await.is_some());
        assert!(states.has_changed().unwrap());
        let _ = states.borrow_and_update();

        client.start().await?;
        assert!(!states.has_changed().unwrap());

        client.toggle().await?;
        assert_eq!(client.state(), ClientState::Stopped);
        assert!(client.local_addr().await.is_none());

        client.toggle().await?;
        assert_eq!(client.state(), ClientState::Running);
        client.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn toggle_mid_transition_is_rejected() {
        let temp = TempDir::new().unwrap();
        let client = Client::new(config(&temp));

        for s in [ClientState::Starting, ClientState::Stopping] {
            client.state.send_replace(s);
            assert!(matches!(client.toggle().await, Err(Error::InvalidState(_))));
        }
    }

    #[tokio::test]
    async fn concurrent_starts_bind_once() -> Result<()> {
        let temp = TempDir::new()?;
        let client = Arc::new(Client::new(config(&temp)));
        let mut events = client.subscribe();

        let (a, b) = tokio::join!(client.start(), client.start());
        a?;
        b?;
        assert_eq!(client.state(), ClientState::Running);

        let mut seen = Vec::new();
        while let Ok(ClientEvent::StateChanged(s)) = events.try_recv() {
            seen.push(s);
        }
        assert_eq!(seen, vec![ClientState::Starting, ClientState::Running]);

        let (a, b) = tokio::join!(client.stop(), client.start());
        a?;
        b?;
        assert_eq!(client.state(), ClientState::Running);
        client.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn connector_message_reaches_listener() -> Result<()> {
        let temp = TempDir::new()?;
        let listener = Client::new(config(&temp));
        let mut events = listener.subscribe();
        listener.start().await?;
        let port = listener.local_addr().await.unwrap().port();

        let connector = Client::new(config(&temp));
        let mut channel = connector.connect_to("127.0.0.1", port).await?;
        channel.write(&Message::new(5)).await?;

        let mut connected = next_connected(&mut events).await;
        assert_eq!(connected.channel.read().await?, Some(Message::new(5)));

        listener.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn rejected_peer_never_gets_a_key() -> Result<()> {
        let temp = TempDir::new()?;
        let listener = Client::new(config(&temp));
        let mut events = listener.subscribe();
        listener.on_connecting(|c| c.reject());
        listener.start().await?;
        let port = listener.local_addr().await.unwrap().port();

        let connector = Client::new(config(&temp));
        let err = connector.connect_to("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Handshake(_)));

        listener.stop().await?;
        let mut saw_rejection = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ClientEvent::Connecting(c) => saw_rejection |= c.is_rejected(),
                ClientEvent::Connected(_) => panic!("rejected peer connected"),
                ClientEvent::StateChanged(_) => {}
            }
        }
        assert!(saw_rejection);
        Ok(())
    }

    #[tokio::test]
    async fn stop_abandons_pending_handshakes() -> Result<()> {
        let temp = TempDir::new()?;
        let listener = Client::new(config(&temp));
        let mut events = listener.subscribe();
        listener.start().await?;
        let port = listener.local_addr().await.unwrap().port();
        let limit = Duration::from_secs(5);

        let mut raw = TcpStream::connect(("127.0.0.1", port)).await?;
        let public = handshake::read_lp(&mut raw, limit).await?;
        listener.stop().await?;

        let sealed = SessionKeyPair::seal_for(&public, &[7u8; 32])?;
        let _ = handshake::write_lp(&mut raw, &sealed, limit).await;
        assert!(handshake::read_lp(&mut raw, limit).await.is_err());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                ClientEvent::Connected(_) => panic!("handshake finished after stop"),
                ClientEvent::StateChanged(s) => seen.push(s),
                ClientEvent::Connecting(_) => {}
            }
        }
        assert_eq!(seen.last(), Some(&ClientState::Stopped));
        Ok(())
    }

    #[tokio::test]
    async fn downloads_dir_must_be_a_directory() -> Result<()> {
        let temp = TempDir::new()?;
        let mut cfg = config(&temp);
        let file = temp.path().join("occupied");
        std::fs::write(&file, b"x")?;
        cfg.temp_dir = file;

        let client = Client::new(cfg);
        assert!(client.downloads().await.is_err());

        let ok = Client::new(config(&temp));
        let a = ok.downloads().await?;
        let b = ok.downloads().await?;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(temp.path().join("tmp").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn fetch_from_peer_library() -> Result<()> {
        let seed_dir = TempDir::new()?;
        std::fs::create_dir_all(seed_dir.path().join("share"))?;
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(seed_dir.path().join("share/song.ogg"), &data)?;

        let seed = Arc::new(Client::new(config(&seed_dir)));
        let mut events = seed.subscribe();
        seed.start().await?;
        let port = seed.local_addr().await.unwrap().port();

        let link = {
            let library = seed.library().await?;
            let item = library.collections().await[0].items().await[0].clone();
            item.url().await?
        };

        let server = seed.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ClientEvent::Connected(c) = event {
                    let server = server.clone();
                    tokio::spawn(async move {
                        let _ = server.serve(c.channel).await;
                    });
                }
            }
        });

        let leech_dir = TempDir::new()?;
        let leech = Client::new(config(&leech_dir));
        let item = leech.downloads().await?.add_by_link(&link.render()).await?;
        let hash = leech.fetch(&item, "127.0.0.1", port).await?;

        assert_eq!(hash.full_hash, link.full_hash);
        assert_eq!(item.total_bytes_received(), data.len() as u64);
        assert_eq!(std::fs::read(item.data_path())?, data);

        seed.stop().await?;
        Ok(())
    }
}
