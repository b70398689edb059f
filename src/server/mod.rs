//! The Iris RESTful server: acceptor, request dispatch, and slide access.
//!
//! # Architecture
//!
//! Two disjoint thread pools share the work of a request:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ reactor pool (tokio runtime)                                     │
//! │   accept -> TLS handshake -> read_request ──┐                    │
//! │        ▲                                    │ issue(task)        │
//! │        │ completion (oneshot)               ▼                    │
//! │   write_response <────────────── worker pool (lock-free FIFO)    │
//! │                                    parse target -> slide lookup  │
//! │                                    -> tile / metadata / file     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reactor tasks never touch slide files or the filesystem; the get-handler
//! runs on the worker pool and its completion fires back into the session's
//! task to perform the write.

pub mod net;
pub mod session;
pub mod tls;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::api::parser::{parse_get_request, GetRequest};
use crate::api::response::GetResponse;
use crate::config::Config;
use crate::error::StartupError;
use crate::slide::{SlideDirectory, SlideHandle};
use crate::task::WorkerPool;

use net::IDLE_DEADLINE;
use session::Session;

/// Shared server state reachable from every session task and worker.
pub(crate) struct ServerCore {
    slide_dir: PathBuf,
    doc_root: Option<PathBuf>,
    /// Resolved `Access-Control-Allow-Origin` value; `None` suppresses the
    /// header.
    cors: Option<String>,
    directory: SlideDirectory,
    pool: WorkerPool,
    tls: Option<TlsAcceptor>,
}

impl ServerCore {
    pub(crate) fn allow_origin(&self) -> Option<String> {
        self.cors.clone()
    }

    /// Hand a GET/HEAD target to the worker pool. The reactor must not do
    /// slide I/O, so this returns immediately; `completion` fires once the
    /// worker has assembled the response.
    pub(crate) fn on_get(
        self: Arc<Self>,
        session: Arc<Session>,
        target: String,
        completion: oneshot::Sender<GetResponse>,
    ) {
        let server = self.clone();
        self.pool.issue(move || {
            let response = server.process_get(&session, &target);
            let _ = completion.send(response);
        });
    }

    /// Worker-side request handling: parse, dispatch, respond.
    fn process_get(&self, session: &Session, target: &str) -> GetResponse {
        match parse_get_request(target) {
            GetRequest::File { path, mime } => self.process_file(&path, mime),
            GetRequest::Tile {
                id, layer, tile, ..
            } => match self.slide_for(session, &id) {
                Some(slide) => match slide.tile(layer, tile) {
                    Ok(data) => GetResponse::tile(data),
                    Err(error) => GetResponse::not_found(error.to_string()),
                },
                None => invalid_identifier(&id),
            },
            GetRequest::Metadata { id, .. } => match self.slide_for(session, &id) {
                Some(slide) => GetResponse::metadata(slide.info()),
                None => invalid_identifier(&id),
            },
            GetRequest::Malformed { error } => GetResponse::malformed(error),
        }
    }

    fn process_file(&self, path: &str, mime: &'static str) -> GetResponse {
        let Some(doc_root) = &self.doc_root else {
            return GetResponse::not_found(
                "This Iris RESTful implementation is not configured to run as a web server / file server.",
            );
        };
        // The parser guarantees a leading '/' and the absence of '..'.
        let resolved = doc_root.join(path.trim_start_matches('/'));
        if resolved.is_file() {
            GetResponse::file(resolved, mime)
        } else {
            GetResponse::not_found(format!("File '{path}' not found"))
        }
    }

    /// The session's sticky slide when it matches, otherwise a directory
    /// lookup whose result is retained on the session.
    fn slide_for(&self, session: &Session, id: &str) -> Option<Arc<SlideHandle>> {
        if let Some(slide) = session.sticky_slide(id) {
            return Some(slide);
        }
        let slide = self.directory.get_slide(id, &self.slide_dir)?;
        session.retain_slide(slide.clone());
        Some(slide)
    }
}

fn invalid_identifier(id: &str) -> GetResponse {
    GetResponse::not_found(format!("Slide file with identifier '{id}' not found."))
}

/// A bound, ready-to-serve server instance.
pub struct RestServer {
    core: Arc<ServerCore>,
    listener: TcpListener,
}

impl RestServer {
    /// Validate the configuration, load TLS material, and bind the IPv4
    /// listening socket. All fatal errors surface here; nothing inside
    /// [`RestServer::serve`] aborts the process.
    pub async fn bind(config: &Config) -> Result<Self, StartupError> {
        config.validate().map_err(StartupError::InvalidConfig)?;

        let tls = if config.http_only {
            warn!(
                "TLS manually disabled; the server will respond to plain HTTP and NOT to HTTPS. \
                 Remove --http-only if end-to-end encryption was intended"
            );
            None
        } else {
            let server_config =
                tls::build_server_config(config.cert.as_deref(), config.key.as_deref())?;
            Some(TlsAcceptor::from(Arc::new(server_config)))
        };

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        if let Ok(local) = listener.local_addr() {
            info!(addr = %local, https = !config.http_only, "Iris RESTful server is now listening");
        }

        Ok(Self {
            core: Arc::new(ServerCore {
                slide_dir: config.slide_dir.clone(),
                doc_root: config.doc_root.clone(),
                cors: config.allow_origin(),
                directory: SlideDirectory::new(),
                pool: WorkerPool::new(),
                tls,
            }),
            listener,
        })
    }

    /// The bound local address; useful when configured with port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the future is dropped. Each connection runs
    /// on its own task, serializing all of that session's I/O.
    pub async fn serve(self) -> std::io::Result<()> {
        loop {
            let (socket, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "failed to accept an incoming connection");
                    continue;
                }
            };

            let core = self.core.clone();
            tokio::spawn(async move {
                match core.tls.clone() {
                    Some(acceptor) => match timeout(IDLE_DEADLINE, acceptor.accept(socket)).await {
                        Ok(Ok(stream)) => net::session_loop(core, stream, remote).await,
                        Ok(Err(error)) => warn!(%remote, %error, "TLS handshake failed"),
                        Err(_) => warn!(%remote, "TLS handshake timed out"),
                    },
                    None => net::session_loop(core, socket, remote).await,
                }
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
