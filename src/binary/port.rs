//! Ephemeral port selection for spawned engines.

use crate::constants::http::LOCALHOST;
use crate::error::{EngineError, EngineResult, NetworkErrorCode};
use parking_lot::{const_mutex, Mutex};
use std::collections::VecDeque;
use tokio::net::TcpListener;

const RECENT_PORTS: usize = 64;
const MAX_PROBES: usize = 16;

/// Ports handed out recently; none is handed out again until it falls off
static RECENT: Mutex<VecDeque<u16>> = const_mutex(VecDeque::new());

/// Pick a free local port by binding to port 0
pub async fn free_port() -> EngineResult<u16> {
    for _ in 0..MAX_PROBES {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.map_err(|e| {
            EngineError::network(
                NetworkErrorCode::from_io_kind(e.kind()),
                format!("cannot probe for a free port: {e}"),
            )
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| EngineError::network(NetworkErrorCode::Other, e.to_string()))?
            .port();
        drop(listener);

        let mut recent = RECENT.lock();
        if recent.contains(&port) {
            continue;
        }
        if recent.len() == RECENT_PORTS {
            recent.pop_front();
        }
        recent.push_back(port);
        return Ok(port);
    }

    Err(EngineError::network(
        NetworkErrorCode::Other,
        "no free port found for the query engine",
    ))
}
