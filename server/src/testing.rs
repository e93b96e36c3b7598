//! Test utilities.
//!
//! [`MockUpstream`] is a minimal in-process binary cache: it serves
//! `nix-cache-info`, narinfo documents and NAR files from memory,
//! counts the requests it sees, and can be killed to simulate an
//! upstream going away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockState {
    priority: AtomicU64,
    delay: StdMutex<Option<Duration>>,
    narinfos: StdMutex<HashMap<String, String>>,
    nars: StdMutex<HashMap<String, Vec<u8>>>,
    narinfo_requests: AtomicUsize,
    nar_requests: AtomicUsize,
}

/// An in-process upstream binary cache.
pub struct MockUpstream {
    url: String,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(priority: u64) -> Self {
        let state = Arc::new(MockState {
            priority: AtomicU64::new(priority),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let router = Router::new().fallback(handle).with_state(state.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { url, state, server }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Changes the advertised priority.
    pub fn set_priority(&self, priority: u64) {
        self.state.priority.store(priority, Ordering::SeqCst);
    }

    /// Delays every response from now on.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }

    /// Registers a narinfo under its hash.
    pub fn add_nar_info(&self, hash: &str, document: &str) {
        self.state
            .narinfos
            .lock()
            .unwrap()
            .insert(hash.to_string(), document.to_string());
    }

    /// Registers a NAR under its file name, e.g. `{hash}.nar.xz`.
    pub fn add_nar(&self, file_name: &str, body: &[u8]) {
        self.state
            .nars
            .lock()
            .unwrap()
            .insert(file_name.to_string(), body.to_vec());
    }

    pub fn narinfo_requests(&self) -> usize {
        self.state.narinfo_requests.load(Ordering::SeqCst)
    }

    pub fn nar_requests(&self) -> usize {
        self.state.nar_requests.load(Ordering::SeqCst)
    }

    /// Stops serving; further connections are refused.
    pub fn kill(&self) {
        self.server.abort();
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle(State(state): State<Arc<MockState>>, req: Request<Body>) -> Response {
    let delay = *state.delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let path = req.uri().path().to_string();

    if path == "/nix-cache-info" {
        return format!(
            "StoreDir: /nix/store\nWantMassQuery: 1\nPriority: {}\n",
            state.priority.load(Ordering::SeqCst)
        )
        .into_response();
    }

    if let Some(file_name) = path.strip_prefix("/nar/") {
        state.nar_requests.fetch_add(1, Ordering::SeqCst);

        let nars = state.nars.lock().unwrap();
        return match nars.get(file_name) {
            Some(body) => body.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    if let Some(hash) = path
        .strip_prefix('/')
        .and_then(|p| p.strip_suffix(".narinfo"))
    {
        state.narinfo_requests.fetch_add(1, Ordering::SeqCst);

        let narinfos = state.narinfos.lock().unwrap();
        return match narinfos.get(hash) {
            Some(document) => document.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    StatusCode::NOT_FOUND.into_response()
}
