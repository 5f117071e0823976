//! Transaction status queries
//!
//! [`TransactionStatusResolver`] answers "what happened to transaction X"
//! from the live registry or, failing that, from the store under presumed
//! abort. [`StatusServer`] exposes it over a line-oriented TCP protocol:
//!
//! ```text
//! server: <process uid>          greeting
//! client: OK | DEAD              handshake
//! client: <type name or empty>   repeated until EOF
//! client: <transaction uid>
//! server: <status code>
//! ```

use crate::background::Background;
use crate::{ActionStatus, ObjectStore, StoreState, TransactionRegistry, Uid};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;

/// Status-query wire failure
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Socket I/O failed
    #[error("status protocol I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Peer closed the stream mid-exchange
    #[error("connection closed by peer")]
    Closed,
    /// Server greeting is not a process uid
    #[error("bad greeting: {0:?}")]
    BadGreeting(Box<str>),
    /// Client reply to the greeting is neither OK nor DEAD
    #[error("bad handshake reply: {0:?}")]
    BadHandshake(Box<str>),
    /// Server answer is not a status code
    #[error("bad status response: {0:?}")]
    BadResponse(Box<str>),
}

/// Resolves transaction status for this process
pub struct TransactionStatusResolver {
    registry: Arc<TransactionRegistry>,
    store: Arc<dyn ObjectStore>,
    process_uid: Uid,
}

impl TransactionStatusResolver {
    /// Resolver over a registry and store
    pub fn new(
        registry: Arc<TransactionRegistry>,
        store: Arc<dyn ObjectStore>,
        process_uid: Uid,
    ) -> Self {
        Self {
            registry,
            store,
            process_uid,
        }
    }

    /// Process this resolver speaks for
    pub fn process_uid(&self) -> Uid {
        self.process_uid
    }

    /// Status of `uid`. Without a type name every store type is searched.
    pub fn status(&self, uid: Uid, type_name: Option<&str>) -> ActionStatus {
        if let Some(coordinator) = self.registry.get(uid) {
            return coordinator.status();
        }
        match type_name {
            Some(type_name) => self.stored_status(uid, type_name),
            None => self.search(uid),
        }
    }

    fn stored_status(&self, uid: Uid, type_name: &str) -> ActionStatus {
        match self.store.current_state(uid, type_name) {
            Ok(state) => status_of(state),
            Err(e) => {
                tracing::warn!(uid = %uid, type_name = %type_name, error = %e, "Cannot read transaction state");
                ActionStatus::Invalid
            }
        }
    }

    /// The shortest type name holding `uid` is authoritative. A type whose
    /// state cannot be read makes the answer INVALID: it might hold the log.
    fn search(&self, uid: Uid) -> ActionStatus {
        let types = match self.store.all_types() {
            Ok(types) => types,
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Cannot list store types");
                return ActionStatus::Invalid;
            }
        };
        let mut best: Option<(Box<str>, StoreState)> = None;
        for type_name in types {
            let state = match self.store.current_state(uid, &type_name) {
                Ok(StoreState::Unknown) => continue,
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(uid = %uid, type_name = %type_name, error = %e, "Cannot read transaction state");
                    return ActionStatus::Invalid;
                }
            };
            let closer = best.as_ref().map_or(true, |(current, _)| {
                (type_name.len(), &type_name) < (current.len(), current)
            });
            if closer {
                best = Some((type_name, state));
            }
        }
        match best {
            Some((type_name, state)) => {
                tracing::trace!(uid = %uid, type_name = %type_name, "Status resolved from store");
                status_of(state)
            }
            None => ActionStatus::Aborted,
        }
    }
}

/// Store state to status; no entry means aborted
fn status_of(state: StoreState) -> ActionStatus {
    match state {
        StoreState::Unknown => ActionStatus::Aborted,
        StoreState::Committed => ActionStatus::Committed,
        StoreState::Uncommitted
        | StoreState::Hidden
        | StoreState::CommittedHidden
        | StoreState::UncommittedHidden => ActionStatus::Prepared,
    }
}

/// TCP front end for a [`TransactionStatusResolver`]
pub struct StatusServer {
    listener: TcpListener,
    resolver: Arc<TransactionStatusResolver>,
}

impl StatusServer {
    /// Bind to `addr`
    pub async fn bind(
        addr: impl ToSocketAddrs,
        resolver: TransactionStatusResolver,
    ) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            resolver: Arc::new(resolver),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the handle is shut down or dropped
    pub fn spawn(self) -> StatusServerHandle {
        let local_addr = self.listener.local_addr().ok();
        let Self { listener, resolver } = self;
        let background = Background::spawn(move |mut stopped| async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let resolver = Arc::clone(&resolver);
                            connections.spawn(async move {
                                if let Err(e) = serve_connection(stream, resolver).await {
                                    tracing::debug!(peer = %peer, error = %e, "Status connection ended");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "Status accept failed"),
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
            connections.shutdown().await;
        });
        StatusServerHandle {
            background,
            local_addr,
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    resolver: Arc<TransactionStatusResolver>,
) -> Result<(), ProtocolError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write
        .write_all(format!("{}\n", resolver.process_uid()).as_bytes())
        .await?;
    match lines.next_line().await? {
        Some(reply) if reply.trim() == "OK" => {}
        Some(reply) if reply.trim() == "DEAD" => return Ok(()),
        Some(reply) => return Err(ProtocolError::BadHandshake(reply.into())),
        None => return Ok(()),
    }

    while let Some(type_line) = lines.next_line().await? {
        let uid_line = lines.next_line().await?.ok_or(ProtocolError::Closed)?;
        let status = match uid_line.trim().parse::<Uid>() {
            Ok(uid) => {
                let resolver = Arc::clone(&resolver);
                let type_name = type_line.trim().to_owned();
                tokio::task::spawn_blocking(move || {
                    let hint = (!type_name.is_empty()).then_some(type_name.as_str());
                    resolver.status(uid, hint)
                })
                .await
                .unwrap_or(ActionStatus::Invalid)
            }
            Err(_) => ActionStatus::Invalid,
        };
        write
            .write_all(format!("{}\n", status.code()).as_bytes())
            .await?;
    }
    Ok(())
}

/// Running status server. Dropping the handle stops it.
pub struct StatusServerHandle {
    background: Background,
    local_addr: Option<SocketAddr>,
}

impl StatusServerHandle {
    /// Address the server listens on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Has the accept loop exited?
    pub fn is_finished(&self) -> bool {
        self.background.is_finished()
    }

    /// Stop accepting, drop open connections and wait
    pub async fn shutdown(self) {
        self.background.shutdown().await;
    }
}

/// Client side of the status protocol
pub struct StatusClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
    process_uid: Uid,
}

impl StatusClient {
    /// Connect, read the greeting and accept it
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let greeting = lines.next_line().await?.ok_or(ProtocolError::Closed)?;
        let process_uid = greeting
            .trim()
            .parse::<Uid>()
            .map_err(|_| ProtocolError::BadGreeting(greeting.as_str().into()))?;
        write.write_all(b"OK\n").await?;
        Ok(Self {
            lines,
            write,
            process_uid,
        })
    }

    /// Process the server speaks for
    pub fn process_uid(&self) -> Uid {
        self.process_uid
    }

    /// Status of `uid`; `None` searches every type
    pub async fn query(
        &mut self,
        type_name: Option<&str>,
        uid: Uid,
    ) -> Result<ActionStatus, ProtocolError> {
        self.query_text(type_name, &uid.to_string()).await
    }

    /// Status query with the uid in raw text form
    pub async fn query_text(
        &mut self,
        type_name: Option<&str>,
        uid: &str,
    ) -> Result<ActionStatus, ProtocolError> {
        let request = format!("{}\n{}\n", type_name.unwrap_or(""), uid);
        self.write.write_all(request.as_bytes()).await?;
        let line = self.lines.next_line().await?.ok_or(ProtocolError::Closed)?;
        let code = line
            .trim()
            .parse::<i32>()
            .map_err(|_| ProtocolError::BadResponse(line.as_str().into()))?;
        Ok(ActionStatus::from_code(code))
    }

    /// Close the request stream
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.write.shutdown().await?;
        Ok(())
    }
}
