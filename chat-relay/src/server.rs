use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    ops::ControlFlow,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId, DEFAULT_WRITE_TIMEOUT},
    event::{Dispatch, Event, broadcast_text, joined_text, left_text},
    handler::Handler,
    listener,
    rate_limit::{ClientRateLimiter, RateLimitPolicy},
    reader::watch_connection,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tcp_listen: SocketAddr,
    pub ws_listen: SocketAddr,
    pub rate_limit: RateLimitPolicy,
    /// Slots in each actor's inbound channel. Producers wait when it is full.
    pub channel_capacity: usize,
    pub write_timeout: Duration,
    /// Sent verbatim to every client when the server stops.
    pub shutdown_message: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ws_listen: SocketAddr::from(([0, 0, 0, 0], 8081)),
            rate_limit: RateLimitPolicy::default(),
            channel_capacity: 100,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_message: "server shutting down\n".to_string(),
        }
    }
}

/// Bound listeners plus the settings needed to run the relay.
pub struct Server {
    tcp: TcpListener,
    ws: TcpListener,
    config: ServerConfig,
}

impl Server {
    /// Binds both listeners. This is the only step allowed to fail.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let tcp = TcpListener::bind(config.tcp_listen)
            .await
            .with_context(|| format!("failed to bind tcp listener on {}", config.tcp_listen))?;
        let ws = TcpListener::bind(config.ws_listen)
            .await
            .with_context(|| format!("failed to bind websocket listener on {}", config.ws_listen))?;
        Ok(Self { tcp, ws, config })
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn ws_addr(&self) -> std::io::Result<SocketAddr> {
        self.ws.local_addr()
    }

    /// Relays until `shutdown` resolves, then delivers the shutdown message
    /// to every client, closes them all and returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { tcp, ws, config } = self;
        let capacity = config.channel_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity);

        let handler = tokio::spawn(Handler::new(events_tx.clone()).run(dispatch_rx));
        let tcp_task = tokio::spawn(listener::accept_tcp(
            tcp,
            events_tx.clone(),
            config.write_timeout,
        ));
        let ws_events = events_tx.clone();
        let write_timeout = config.write_timeout;
        let ws_task = tokio::spawn(async move {
            if let Err(err) = listener::serve_websocket(ws, ws_events, write_timeout).await {
                warn!(error = ?err, "websocket listener stopped");
            }
        });

        let shutdown_events = events_tx.clone();
        let shutdown_message = config.shutdown_message.clone();
        let trigger = tokio::spawn(async move {
            shutdown.await;
            info!("shutdown requested");
            let _ = shutdown_events
                .send(Event::Shutdown {
                    text: shutdown_message,
                })
                .await;
        });

        info!("started server");
        let authority = Authority::new(events_tx, dispatch_tx, config.rate_limit);
        authority.run(events_rx).await;

        tcp_task.abort();
        ws_task.abort();
        trigger.abort();
        handler.await.context("broadcast handler panicked")?;

        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Registry entry for one connected client.
#[derive(Debug, Clone)]
pub struct Client {
    pub connection: ConnectionId,
    /// Sequential, 0-based, never reused.
    pub id: u64,
    pub remote: String,
}

/// The single owner of the client registry.
///
/// Handles one [`Event`] at a time, which is what keeps id assignment and
/// registry updates free of races.
pub struct Authority {
    clients: HashMap<ConnectionId, Client>,
    next_client_id: u64,
    events: mpsc::Sender<Event>,
    dispatch: mpsc::Sender<Dispatch>,
    rate_limit: RateLimitPolicy,
}

impl Authority {
    /// `events` is handed to every reader loop; `dispatch` feeds the
    /// broadcast handler.
    pub fn new(
        events: mpsc::Sender<Event>,
        dispatch: mpsc::Sender<Dispatch>,
        rate_limit: RateLimitPolicy,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 0,
            events,
            dispatch,
            rate_limit,
        }
    }

    /// Processes events until a shutdown has been forwarded.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Event>) {
        while let Some(event) = inbox.recv().await {
            if self.handle(event).await.is_break() {
                return;
            }
        }
    }

    pub fn client(&self, connection: ConnectionId) -> Option<&Client> {
        self.clients.get(&connection)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub async fn handle(&mut self, event: Event) -> ControlFlow<()> {
        let dispatch = match event {
            Event::NewConnection(connection) => self.register(connection),
            Event::DeadConnection { id } => match self.clients.remove(&id) {
                Some(client) => {
                    info!(client = client.id, peer = %client.remote, "disconnected");
                    Dispatch::Left {
                        id,
                        text: left_text(client.id),
                    }
                }
                None => {
                    debug!(connection = %id, "ignoring disconnect for unregistered connection");
                    return ControlFlow::Continue(());
                }
            },
            Event::Broadcast { id, text } => match self.clients.get(&id) {
                Some(client) => {
                    let line = broadcast_text(client.id, &text);
                    info!(client = client.id, "{}", line.trim_end());
                    Dispatch::Broadcast {
                        sender: id,
                        text: line,
                    }
                }
                None => {
                    debug!(connection = %id, "ignoring message from unregistered connection");
                    return ControlFlow::Continue(());
                }
            },
            Event::DirectMessage { id, text } => Dispatch::Direct { id, text },
            Event::Shutdown { text } => {
                info!(clients = self.clients.len(), "shutting down");
                self.clients.clear();
                let _ = self.dispatch.send(Dispatch::Shutdown { text }).await;
                return ControlFlow::Break(());
            }
        };

        if self.dispatch.send(dispatch).await.is_err() {
            warn!("broadcast handler stopped unexpectedly");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn register(&mut self, connection: Connection) -> Dispatch {
        let (handle, frames) = connection.into_parts();
        let client = Client {
            connection: handle.id(),
            id: self.next_client_id,
            remote: handle.remote_addr().to_string(),
        };
        self.next_client_id += 1;

        info!(client = client.id, peer = %client.remote, connection = %client.connection, "accepted");
        tokio::spawn(watch_connection(
            client.connection,
            frames,
            ClientRateLimiter::new(&self.rate_limit),
            self.events.clone(),
        ));

        let text = joined_text(client.id);
        self.clients.insert(client.connection, client);
        Dispatch::Joined {
            connection: handle,
            text,
        }
    }
}
