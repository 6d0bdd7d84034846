//! Listener and thread supervisor.
//!
//! The accept loop distributes connections round-robin to the workers and
//! drives the 1 Hz maintenance tick ($SYS publishing).

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use plume_core::error::{Error, Result};

use crate::auth::{AllowAll, Authenticator};
use crate::config::Config;
use crate::connection::Stream;
use crate::engine::Engine;
use crate::shared::SharedState;
use crate::sys_tree::SysPublisher;
use crate::worker::{Worker, WorkerMsg};

/// Token for the plain TCP listener socket.
const LISTENER: Token = Token(0);

/// Token for the TLS listener socket.
const LISTENER_TLS: Token = Token(1);

/// Control channel capacity per worker.
const CHANNEL_CAPACITY: usize = 4096;

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    tls_listener: Option<TcpListener>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    worker_senders: Vec<Sender<WorkerMsg>>,
    next_worker: usize,
    num_workers: usize,
    config: Arc<Config>,
    auth: Arc<dyn Authenticator>,
    local_addr: std::net::SocketAddr,
}

impl Server {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        Self::with_auth(config, Arc::new(AllowAll))
    }

    pub fn with_auth(config: Arc<Config>, auth: Arc<dyn Authenticator>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.server.bind)?;
        let local_addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("plume listening on {}", local_addr);

        let (tls_listener, tls_config) = if config.tls.enabled {
            let tls_config = Self::load_tls_config(&config)?;
            let mut tls_listener = TcpListener::bind(config.tls.bind)?;

            poll.registry()
                .register(&mut tls_listener, LISTENER_TLS, Interest::READABLE)?;

            info!("TLS listening on {}", config.tls.bind);

            (Some(tls_listener), Some(Arc::new(tls_config)))
        } else {
            (None, None)
        };

        let num_workers = if config.server.workers == 0 {
            num_cpus::get()
        } else {
            config.server.workers
        };

        Ok(Self {
            poll,
            listener,
            tls_listener,
            tls_config,
            worker_senders: Vec::new(),
            next_worker: 0,
            num_workers,
            config,
            auth,
            local_addr,
        })
    }

    /// The bound address of the plain listener (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    fn load_tls_config(config: &Config) -> Result<rustls::ServerConfig> {
        let cert_file = File::open(&config.tls.cert).map_err(|e| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("open TLS certificate {:?}: {}", config.tls.cert, e),
            ))
        })?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("parse TLS certificate: {}", e),
                ))
            })?;

        if certs.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "no certificates found in certificate file",
            )));
        }

        let key_file = File::open(&config.tls.key).map_err(|e| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("open TLS key {:?}: {}", config.tls.key, e),
            ))
        })?;
        let mut key_reader = BufReader::new(key_file);
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("parse TLS private key: {}", e),
                ))
            })?
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no private key found in key file",
                ))
            })?;

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("build TLS config: {}", e),
                ))
            })
    }

    /// Run the broker: spawns the engine and workers, then loops on accept
    /// and the maintenance tick.
    pub fn run(&mut self) -> Result<()> {
        let shared = Arc::new(SharedState::new(&self.config)?);
        let engine = Engine::new(shared, Arc::clone(&self.config), Arc::clone(&self.auth));

        for id in 0..self.num_workers {
            let (tx, rx) = bounded(CHANNEL_CAPACITY);
            self.worker_senders.push(tx);

            let engine = Arc::clone(&engine);
            let config = Arc::clone(&self.config);
            thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    let mut worker =
                        Worker::new(id, engine, rx, config).expect("create worker");
                    if let Err(e) = worker.run() {
                        error!("worker {} error: {}", id, e);
                    }
                })?;
        }
        info!("spawned {} worker threads", self.num_workers);

        let sys_interval = self.config.server.sys_interval;
        let sys_publisher = if sys_interval > 0 {
            info!("$SYS publishing enabled (interval: {}s)", sys_interval);
            Some(SysPublisher::new(Arc::clone(&engine)))
        } else {
            None
        };
        let mut last_sys_publish = Instant::now();

        let mut events = Events::with_capacity(256);
        loop {
            self.poll
                .poll(&mut events, Some(Duration::from_millis(100)))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_connections()?,
                    LISTENER_TLS => self.accept_tls_connections()?,
                    _ => {}
                }
            }

            if let Some(ref publisher) = sys_publisher {
                if last_sys_publish.elapsed().as_secs() >= sys_interval {
                    publisher.publish();
                    last_sys_publish = Instant::now();
                }
            }
        }
    }

    fn dispatch_conn(&mut self, stream: Stream, addr: std::net::SocketAddr) {
        let worker_id = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.num_workers;

        debug!("accepted {} -> worker {}", addr, worker_id);

        let _ = self.worker_senders[worker_id].send(WorkerMsg::NewConn { stream, addr });
    }

    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    self.dispatch_conn(Stream::tcp(socket), addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn accept_tls_connections(&mut self) -> Result<()> {
        if self.tls_listener.is_none() {
            return Ok(());
        };
        let Some(tls_config) = self.tls_config.clone() else {
            return Ok(());
        };

        loop {
            let accept_result = self.tls_listener.as_ref().unwrap().accept();
            match accept_result {
                Ok((socket, addr)) => {
                    let tls_conn = match rustls::ServerConnection::new(Arc::clone(&tls_config)) {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("TLS connection setup for {} failed: {}", addr, e);
                            continue;
                        }
                    };
                    self.dispatch_conn(Stream::tls(tls_conn, socket), addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
