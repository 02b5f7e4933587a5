//! Notifications raised by a [`Client`](crate::Client).

use crate::channel::SecureChannel;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ClientState {
    pub fn is_transitioning(self) -> bool {
        matches!(self, ClientState::Starting | ClientState::Stopping)
    }
}

#[derive(Debug)]
pub enum ClientEvent {
    /// A peer connected and was screened; no handshake yet. A rejected peer
    /// is closed right after this event.
    Connecting(Connecting),
    /// Handshake finished; the channel now belongs to the subscriber.
    Connected(Connected),
    StateChanged(ClientState),
}

/// An inbound connection before its handshake. Screens registered with
/// [`Client::on_connecting`](crate::Client::on_connecting) may reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connecting {
    peer: SocketAddr,
    rejected: bool,
}

impl Connecting {
    pub(crate) fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            rejected: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Close the connection without handshaking.
    pub fn reject(&mut self) {
        self.rejected = true;
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }
}

#[derive(Debug)]
pub struct Connected {
    pub peer: SocketAddr,
    pub channel: SecureChannel<TcpStream>,
}

pub(crate) type Screen = Arc<dyn Fn(&mut Connecting) + Send + Sync>;

/// Single-subscriber event sink plus the optional connection screen.
/// Events raised with nobody listening are dropped, which closes finished
/// connections.
#[derive(Clone, Default)]
pub(crate) struct Emitter {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>>,
    screen: Arc<Mutex<Option<Screen>>>,
}

impl Emitter {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
        rx
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let Ok(mut slot) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = slot.as_ref() {
            if tx.send(event).is_err() {
                *slot = None;
            }
        }
    }

    pub(crate) fn set_screen(&self, screen: Option<Screen>) {
        if let Ok(mut slot) = self.screen.lock() {
            *slot = screen;
        }
    }

    /// Run the screen, if any, over a fresh inbound connection.
    pub(crate) fn screen(&self, peer: SocketAddr) -> Connecting {
        let mut connecting = Connecting::new(peer);
        let screen = self.screen.lock().ok().and_then(|s| s.clone());
        if let Some(screen) = screen {
            screen(&mut connecting);
        }
        connecting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn unscreened_peers_pass() {
        let emitter = Emitter::default();
        assert!(!emitter.screen(peer(1)).is_rejected());
    }

    #[test]
    fn screen_decides_per_peer() {
        let emitter = Emitter::default();
        emitter.set_screen(Some(Arc::new(|c: &mut Connecting| {
            if c.peer().port() == 2 {
                c.reject();
            }
        })));
        assert!(!emitter.screen(peer(1)).is_rejected());
        assert!(emitter.screen(peer(2)).is_rejected());

        emitter.set_screen(None);
        assert!(!emitter.screen(peer(2)).is_rejected());
    }

    #[tokio::test]
    async fn emit_without_subscriber_is_dropped() {
        let emitter = Emitter::default();
        emitter.emit(ClientEvent::Connecting(Connecting::new(peer(1))));

        let mut events = emitter.subscribe();
        emitter.emit(ClientEvent::StateChanged(ClientState::Running));
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::StateChanged(ClientState::Running))
        ));
        assert!(events.try_recv().is_err());
    }
}
