use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, warn};
use quickdist_proto::Message;

use crate::framing::{recv_frame, send_frame};
use crate::TransportError;

/// How often a worker thread wakes up from a blocked read to check whether
/// the server is shutting down.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub type Handler = dyn Fn(Message) -> Message + Send + Sync;

/// A reply server: one listener socket accepting connections and handing
/// each to a fixed pool of worker threads. Every worker runs a strict
/// request/reply loop on whatever connection it holds; a handler that
/// panics, and a command the handler never expected, both turn into an
/// ERROR reply rather than dropping the connection.
pub struct ReplyServer {
    local_addr: std::net::SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ReplyServer {
    /// Binds `addr` and spawns `threads` worker threads, each running
    /// `handler` against the connections they're handed.
    pub fn bind(
        addr: &str,
        threads: usize,
        handler: Arc<Handler>,
    ) -> Result<ReplyServer, TransportError> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx): (Sender<TcpStream>, Receiver<TcpStream>) = bounded(threads.max(1) * 4);

        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let handler = Arc::clone(&handler);
                let shutdown = Arc::clone(&shutdown);
                thread::Builder::new()
                    .name(format!("quickdist-reply-worker-{i}"))
                    .spawn(move || worker_loop(rx, handler, shutdown))
                    .expect("failed to spawn reply worker thread")
            })
            .collect();

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name("quickdist-reply-accept".to_string())
            .spawn(move || accept_loop(listener, tx, accept_shutdown))
            .expect("failed to spawn accept thread");

        Ok(ReplyServer {
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
            workers,
        })
    }

    /// The address this server actually bound to, useful when `bind` was
    /// asked for an ephemeral port.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Signals every thread to stop once it notices, and waits for them to
    /// finish. Connections already accepted are allowed to run to their
    /// next idle poll before exiting.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            handle.join().ok();
        }
        for handle in self.workers.drain(..) {
            handle.join().ok();
        }
    }
}

impl Drop for ReplyServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: TcpListener, tx: Sender<TcpStream>, shutdown: Arc<AtomicBool>) {
    listener
        .set_nonblocking(true)
        .expect("failed to set listener non-blocking for shutdown polling");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {peer}");
                stream.set_nodelay(true).ok();
                if tx.send(stream).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_TIMEOUT);
            }
            Err(e) => {
                warn!("accept() failed: {e}");
                thread::sleep(POLL_TIMEOUT);
            }
        }
    }
}

fn worker_loop(rx: Receiver<TcpStream>, handler: Arc<Handler>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        let stream = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(stream) => stream,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };
        stream.set_read_timeout(Some(POLL_TIMEOUT)).ok();
        serve_connection(stream, &handler, &shutdown);
    }
}

fn serve_connection(stream: TcpStream, handler: &Arc<Handler>, shutdown: &Arc<AtomicBool>) {
    let mut reader = BufReader::new(stream.try_clone().expect("failed to clone socket"));
    let mut writer = stream;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let frame = match recv_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) if would_block(&e) => continue,
            Err(e) => {
                warn!("connection error while reading a request: {e}");
                return;
            }
        };

        let reply = match Message::decode(&frame) {
            Ok(request) if request.cmd == quickdist_proto::cmd::CLOSE => {
                debug!("refusing CLOSE request");
                Message::error("Can not close server at current version")
            }
            Ok(request) => dispatch(handler, request),
            Err(e) => Message::error(format!("malformed request: {e}")),
        };

        let Ok(payload) = reply.encode() else {
            error!("failed to encode reply, dropping connection");
            return;
        };
        if let Err(e) = send_frame(&mut writer, &payload) {
            warn!("connection error while writing a reply: {e}");
            return;
        }
    }
}

fn dispatch(handler: &Arc<Handler>, request: Message) -> Message {
    match catch_unwind(AssertUnwindSafe(|| handler(request))) {
        Ok(reply) => reply,
        Err(panic) => {
            let text = panic_message(&panic);
            error!("handler panicked: {text}");
            Message::error(format!("handler panicked: {text}"))
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
