//! Server accept loop
//!
//! An acceptor owns a listening transport, accepts sockets, wraps each in
//! a [`Connection`] and spawns its reader task. An [`AcceptorHandler`]
//! observes the loop and may veto individual connections. `close`
//! releases the listener and propagates GOING_AWAY to every live
//! connection; `interrupt` releases only the listener.
//!
//! [`AcceptorHandler`]: crate::handler::AcceptorHandler

use crate::connection::Connection;
use crate::handler::{AcceptorHandler, ConnectionHandler, DefaultAcceptorHandler};
use crate::registry::ConnectionRegistry;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Notify;
use wavesock_core::error::Error;
use wavesock_core::status::close_code;
use wavesock_core::{ConnectionConfig, Listener, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open,
    Interrupted,
}

struct State {
    phase: Phase,
    error: Option<Arc<Error>>,
}

/// Handle to a listening acceptor
#[derive(Clone)]
pub struct Acceptor {
    inner: Arc<Inner>,
}

struct Inner {
    secure: bool,
    config: ConnectionConfig,
    listener: StdMutex<Option<Box<dyn Listener>>>,
    state: StdMutex<State>,
    conn_handler: Arc<dyn ConnectionHandler>,
    handler: StdMutex<Arc<dyn AcceptorHandler>>,
    connections: ConnectionRegistry,
    siblings: Arc<StdMutex<Vec<Acceptor>>>,
    shutdown: Notify,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.inner.local_addr)
            .field("secure", &self.inner.secure)
            .field("open", &self.is_open())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

fn lock_ignoring_poison<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Acceptor {
    pub(crate) fn new(
        listener: Box<dyn Listener>,
        secure: bool,
        conn_handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
        siblings: Arc<StdMutex<Vec<Acceptor>>>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Arc::new(Inner {
                secure,
                config,
                listener: StdMutex::new(Some(listener)),
                state: StdMutex::new(State {
                    phase: Phase::Closed,
                    error: None,
                }),
                conn_handler,
                handler: StdMutex::new(Arc::new(DefaultAcceptorHandler)),
                connections: ConnectionRegistry::new(),
                siblings,
                shutdown: Notify::new(),
                local_addr,
            }),
        })
    }

    /// True while the accept loop is running
    pub fn is_open(&self) -> bool {
        lock_ignoring_poison(&self.inner.state).phase == Phase::Open
    }

    /// True when the listener was stopped by `interrupt` or an accept
    /// error, leaving existing connections running
    pub fn is_interrupted(&self) -> bool {
        lock_ignoring_poison(&self.inner.state).phase == Phase::Interrupted
    }

    /// True when the acceptor serves TLS connections
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    /// The accept error that interrupted the loop, if any
    pub fn error(&self) -> Option<Arc<Error>> {
        lock_ignoring_poison(&self.inner.state).error.clone()
    }

    /// Port the listener is bound to
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Address the listener is bound to
    pub fn bind_addr(&self) -> IpAddr {
        self.inner.local_addr.ip()
    }

    /// Configuration handed to accepted connections
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Snapshot of the connections accepted by this acceptor
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.list()
    }

    /// Install an acceptor handler, replacing the default
    pub fn set_handler(&self, handler: impl AcceptorHandler) -> &Self {
        *lock_ignoring_poison(&self.inner.handler) = Arc::new(handler);
        self
    }

    fn handler(&self) -> Arc<dyn AcceptorHandler> {
        lock_ignoring_poison(&self.inner.handler).clone()
    }

    /// Stop listening and close every live connection with GOING_AWAY
    pub async fn close(&self, reason: &str) {
        {
            let mut state = lock_ignoring_poison(&self.inner.state);
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
        }
        self.inner.shutdown.notify_one();
        for conn in self.inner.connections.list() {
            conn.close(close_code::GOING_AWAY, reason).await;
        }
        lock_ignoring_poison(&self.inner.siblings)
            .retain(|sibling| !Arc::ptr_eq(&sibling.inner, &self.inner));
    }

    /// Stop listening without disturbing existing connections
    pub fn interrupt(&self) {
        let mut state = lock_ignoring_poison(&self.inner.state);
        if state.phase == Phase::Open {
            state.phase = Phase::Interrupted;
            self.inner.shutdown.notify_one();
        }
    }

    /// Accept loop task
    pub(crate) async fn run(self) {
        let listener = lock_ignoring_poison(&self.inner.listener).take();
        let Some(listener) = listener else {
            return;
        };
        lock_ignoring_poison(&self.inner.state).phase = Phase::Open;
        tracing::info!(addr = %self.inner.local_addr, secure = self.inner.secure, "listening");
        self.handler().on_start(&self).await;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection::server(
                            stream,
                            peer,
                            self.inner.secure,
                            self.inner.conn_handler.clone(),
                            self.inner.config.clone(),
                            self.inner.connections.clone(),
                        );
                        if self.handler().on_accept(&self, &conn).await {
                            tracing::debug!(%peer, id = conn.id(), "connection accepted");
                            tokio::spawn(conn.run());
                        } else {
                            tracing::debug!(%peer, "connection rejected");
                            conn.shutdown_socket().await;
                        }
                    }
                    Err(error) => {
                        if self.is_open() {
                            tracing::error!(%error, "accept failed");
                            let mut state = lock_ignoring_poison(&self.inner.state);
                            state.error = Some(Arc::new(error));
                            state.phase = Phase::Interrupted;
                        }
                        break;
                    }
                },
                _ = self.inner.shutdown.notified() => break,
            }
        }

        drop(listener);
        let error = self.error();
        self.handler().on_stop(&self, error.as_deref()).await;
    }
}
