//! In-process transport for queue and scheduler tests that do not need sockets
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use feedcast_delivery::{AttemptOutcome, DeliveryError, DeliveryRequest, Transport, TransientError};
use parking_lot::Mutex;

/// What the mock does with one request
#[derive(Debug, Clone)]
pub enum Scripted {
    Status(u16),
    Redirect(u16, String),
    Refused,
    /// Never answer; the scheduler's request timeout has to fire
    Hang,
}

#[derive(Debug, Default)]
struct State {
    script: VecDeque<Scripted>,
    requests: Vec<DeliveryRequest>,
}

/// Transport answering from a script, 204 once the script runs out
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<State>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: impl IntoIterator<Item = Scripted>) -> Self {
        let transport = Self::default();
        transport.state.lock().script.extend(script);
        transport
    }

    pub fn push(&self, scripted: Scripted) {
        self.state.lock().script.push_back(scripted);
    }

    pub fn requests(&self) -> Vec<DeliveryRequest> {
        self.state.lock().requests.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|request| request.url.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn deliver(&self, request: DeliveryRequest) -> AttemptOutcome {
        let scripted = {
            let mut state = self.state.lock();
            state.requests.push(request);
            state.script.pop_front().unwrap_or(Scripted::Status(204))
        };

        match scripted {
            Scripted::Status(status) => AttemptOutcome::from_status(status, None),
            Scripted::Redirect(status, location) => {
                AttemptOutcome::from_status(status, Some(location))
            }
            Scripted::Refused => AttemptOutcome::Failed(DeliveryError::from(
                TransientError::ConnectionFailed("connection refused".to_string()),
            )),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                AttemptOutcome::from_status(204, None)
            }
        }
    }
}
