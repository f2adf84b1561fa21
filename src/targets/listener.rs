//! Newline-delimited TCP listener shared by the network backends.

use crate::tasks::TaskGroup;
use crate::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Longest line accepted from a peer, excluding the newline.
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

pub(crate) trait LineHandler: Send + Sync + 'static {
    fn on_line(&self, line: &str, peer: SocketAddr);

    fn on_connect(&self, _peer: SocketAddr) {}

    fn on_error(&self, peer: SocketAddr, err: &std::io::Error) {
        debug!("connection from {} failed: {}", peer, err);
    }
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    oversized: AtomicU64,
}

pub(crate) struct LineListener {
    local_addr: SocketAddr,
    tasks: TaskGroup,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl LineListener {
    pub(crate) fn bind(name: &str, address: &str, handler: Arc<dyn LineHandler>) -> Result<Self> {
        Self::bind_with_limit(name, address, handler, MAX_LINE_BYTES)
    }

    pub(crate) fn bind_with_limit(
        name: &str,
        address: &str,
        handler: Arc<dyn LineHandler>,
        max_line: usize,
    ) -> Result<Self> {
        let tasks = TaskGroup::new()?;

        // Bind synchronously so address errors surface to the constructor.
        let std_listener = std::net::TcpListener::bind(address)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = {
            let _runtime = tasks.handle().enter();
            TcpListener::from_std(std_listener)?
        };

        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        tasks.spawn(accept_loop(
            listener,
            handler,
            tasks.clone(),
            Arc::clone(&running),
            Arc::clone(&counters),
            max_line,
        ));

        debug!("{} listening on {}", name, local_addr);

        Ok(Self {
            local_addr,
            tasks,
            running,
            counters,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.tasks.is_cancelled() && self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn connections(&self) -> u64 {
        self.counters.connections.load(Ordering::Relaxed)
    }

    /// Lines dropped for exceeding the length limit.
    pub(crate) fn oversized(&self) -> u64 {
        self.counters.oversized.load(Ordering::Relaxed)
    }

    /// Close the socket and wait for the accept loop and every connection.
    pub(crate) fn stop(&mut self) {
        self.tasks.shutdown();
    }
}

impl Drop for LineListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn LineHandler>,
    tasks: TaskGroup,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    max_line: usize,
) {
    let token = tasks.token();
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                counters.connections.fetch_add(1, Ordering::Relaxed);
                handler.on_connect(peer);
                tasks.spawn(read_lines(
                    stream,
                    peer,
                    Arc::clone(&handler),
                    token.clone(),
                    Arc::clone(&counters),
                    max_line,
                ));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    running.store(false, Ordering::SeqCst);
}

async fn read_lines(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn LineHandler>,
    token: CancellationToken,
    counters: Arc<Counters>,
    max_line: usize,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut discarding = false;

    loop {
        // At most one byte past the limit, so an oversized line is detected
        // without buffering it.
        let limit = (max_line + 1).saturating_sub(buf.len()).max(1) as u64;
        let mut limited = (&mut reader).take(limit);
        let read = tokio::select! {
            _ = token.cancelled() => return,
            read = limited.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                if !discarding {
                    emit(&buf, peer, handler.as_ref());
                }
                return;
            }
            Ok(_) if buf.ends_with(b"\n") => {
                if !discarding {
                    emit(&buf, peer, handler.as_ref());
                }
                discarding = false;
                buf.clear();
            }
            Ok(_) if buf.len() > max_line => {
                if !discarding {
                    counters.oversized.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping line over {} bytes from {}", max_line, peer);
                    discarding = true;
                }
                buf.clear();
            }
            Ok(_) => {}
            Err(e) => {
                handler.on_error(peer, &e);
                return;
            }
        }
    }
}

fn emit(raw: &[u8], peer: SocketAddr, handler: &dyn LineHandler) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    if !line.is_empty() {
        handler.on_line(line, peer);
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::io::Write;
    use std::net::{SocketAddr, TcpStream};
    use std::time::{Duration, Instant};

    pub(crate) fn send_lines(addr: SocketAddr, lines: &[&str]) {
        let mut stream = TcpStream::connect(addr).expect("connect to listener");
        for line in lines {
            writeln!(stream, "{}", line).unwrap();
        }
        stream.flush().unwrap();
    }

    pub(crate) fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        condition()
    }
}
