//! TCP front-end: accept connections and splice them to picked backends.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::balance::engine::LoadBalancer;

/// How long a single connection may wait for a backend pick (including any
/// refresh it has to run).
const PICK_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts connections until cancellation and hands each to a splice
/// handler. Returns once the listener has stopped and every handler has
/// drained.
pub async fn serve(listener: TcpListener, lb: Arc<LoadBalancer>, cancel: CancellationToken) {
    let local = listener.local_addr().ok();
    let handlers = TaskTracker::new();
    loop {
        debug!("Waiting for connection on {:?}", local);
        let (conn, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    debug!("Accept on {:?} returned error (stopping listener): {}", local, err);
                    break;
                }
            },
        };
        debug!("Accepted connection from {} on {:?}", peer, local);
        let lb = Arc::clone(&lb);
        let cancel = cancel.clone();
        handlers.spawn(async move {
            handle_conn(conn, lb, cancel).await;
        });
    }
    drop(listener);
    handlers.close();
    handlers.wait().await;
}

/// Picks a backend, dials it, and splices both directions until either side
/// finishes or the parent is cancelled. The client connection is closed
/// unconditionally on exit.
async fn handle_conn(mut client: TcpStream, lb: Arc<LoadBalancer>, cancel: CancellationToken) {
    let peer = client.peer_addr().ok();
    let local = client.local_addr().ok();

    let backend_addr = match lb.pick(Instant::now() + PICK_TIMEOUT).await {
        Ok(addr) => addr,
        Err(err) => {
            warn!(
                "Unable to find suitable backend for {:?} on {:?}: {}",
                peer, local, err
            );
            return;
        }
    };
    debug!(
        "Picked backend {} for {:?} on {:?}",
        backend_addr, peer, local
    );

    let mut backend = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = TcpStream::connect(backend_addr) => match dialed {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    "Connect to backend for {:?} on {:?}: {}",
                    peer, local, err
                );
                return;
            }
        },
    };

    // Cancellation drops the copy future, which tears down both directions;
    // both streams close when the handler returns.
    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut client, &mut backend) => {
            if let Err(err) = copied {
                warn!(
                    "Connection for {:?} on {:?} (backend {}): {}",
                    peer, local, backend_addr, err
                );
            }
        }
    }
}
