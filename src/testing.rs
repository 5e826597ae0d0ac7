//! Test doubles shared by the unit tests.

use crate::config::QualityProfile;
use crate::render::{RenderBackend, RenderSession};
use anyhow::anyhow;
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

type Received = Arc<Mutex<Vec<Value>>>;

/// Local webhook receiver that records every status payload.
#[derive(Clone)]
pub struct StatusSink {
    addr: SocketAddr,
    received: Received,
}

impl StatusSink {
    pub async fn start() -> Self {
        let received: Received = Arc::default();
        let app = Router::new()
            .route("/api/stream-status", post(record))
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, received }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|v| v["status"].as_str().map(str::to_string))
            .collect()
    }
}

async fn record(State(received): State<Received>, Json(body): Json<Value>) -> StatusCode {
    received.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationBehavior {
    /// Accept any URL without touching the network.
    Succeed,
    /// GET the URL and require a 200, like a real page load.
    Fetch,
    Fail,
    /// Never finish.
    Hang,
    FailLaunch,
}

#[derive(Default)]
struct Journal {
    launched: Vec<QualityProfile>,
    navigations: Vec<String>,
    closes: usize,
}

#[derive(Clone)]
pub struct FakeRenderer {
    behavior: NavigationBehavior,
    journal: Arc<Mutex<Journal>>,
}

impl FakeRenderer {
    pub fn new(behavior: NavigationBehavior) -> Self {
        Self {
            behavior,
            journal: Arc::default(),
        }
    }

    pub fn launched_profiles(&self) -> Vec<QualityProfile> {
        self.journal.lock().unwrap().launched.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.journal.lock().unwrap().navigations.clone()
    }

    pub fn closes(&self) -> usize {
        self.journal.lock().unwrap().closes
    }
}

#[async_trait]
impl RenderBackend for FakeRenderer {
    async fn launch(&self, profile: &QualityProfile) -> anyhow::Result<Box<dyn RenderSession>> {
        if self.behavior == NavigationBehavior::FailLaunch {
            return Err(anyhow!("no browser installed"));
        }
        self.journal.lock().unwrap().launched.push(*profile);
        Ok(Box::new(FakeSession {
            behavior: self.behavior,
            journal: self.journal.clone(),
        }))
    }
}

struct FakeSession {
    behavior: NavigationBehavior,
    journal: Arc<Mutex<Journal>>,
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> anyhow::Result<()> {
        match self.behavior {
            NavigationBehavior::Succeed => {}
            NavigationBehavior::Fetch => {
                let resp = reqwest::get(url).await?;
                if !resp.status().is_success() {
                    return Err(anyhow!("HTTP {}", resp.status()));
                }
            }
            NavigationBehavior::Fail => return Err(anyhow!("net::ERR_CONNECTION_REFUSED")),
            NavigationBehavior::Hang => std::future::pending::<()>().await,
            NavigationBehavior::FailLaunch => unreachable!("launch fails first"),
        }
        self.journal.lock().unwrap().navigations.push(url.to_string());
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.journal.lock().unwrap().closes += 1;
        Ok(())
    }
}
