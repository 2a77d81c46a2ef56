//! Scriptable in-process upstream.
//!
//! Scrobble responses are scripted per access token as a queue of HTTP
//! statuses; an empty script answers 201. Token refresh and code exchange
//! succeed with deterministic tokens unless told to fail.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use scrobble_core::PlaybackEvent;
use scrobble_delivery::{
    client::{ScrobbleReceipt, TokenGrant, TrackerApi},
    DeliveryError, Result,
};

/// Scripted response for one upstream call.
#[derive(Debug, Clone)]
pub enum FakeResponse {
    /// Answer with this HTTP status.
    Status(u16),
    /// Answer 429 with a `Retry-After` of this many seconds.
    RateLimited(u64),
    /// Fail before an HTTP response is received.
    NetworkError,
}

#[derive(Debug, Default)]
struct State {
    scrobble_scripts: HashMap<String, VecDeque<FakeResponse>>,
    scrobbled: Vec<(String, PlaybackEvent)>,
    refresh_failure: Option<FakeResponse>,
    display_name: Option<String>,
    display_name_fails: bool,
}

/// In-process [`TrackerApi`] with per-token scripted responses.
#[derive(Debug, Default)]
pub struct FakeTrackerApi {
    state: Mutex<State>,
    scrobble_delay: Mutex<Option<Duration>>,
    refresh_calls: AtomicUsize,
    exchange_calls: AtomicUsize,
}

impl FakeTrackerApi {
    /// Creates an upstream that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues statuses answered, in order, to scrobbles made with `access_token`.
    pub fn script_scrobbles(&self, access_token: &str, statuses: &[u16]) {
        let mut state = self.state();
        let script = state.scrobble_scripts.entry(access_token.to_string()).or_default();
        script.extend(statuses.iter().copied().map(FakeResponse::Status));
    }

    /// Queues a network failure for the next scrobble made with `access_token`.
    pub fn script_network_error(&self, access_token: &str) {
        self.state()
            .scrobble_scripts
            .entry(access_token.to_string())
            .or_default()
            .push_back(FakeResponse::NetworkError);
    }

    /// Queues a 429 carrying `Retry-After: retry_after_seconds` for the next
    /// scrobble made with `access_token`.
    pub fn script_rate_limit(&self, access_token: &str, retry_after_seconds: u64) {
        self.state()
            .scrobble_scripts
            .entry(access_token.to_string())
            .or_default()
            .push_back(FakeResponse::RateLimited(retry_after_seconds));
    }

    /// Makes every refresh fail with `status`.
    pub fn fail_refresh(&self, status: u16) {
        self.state().refresh_failure = Some(FakeResponse::Status(status));
    }

    /// Sets the display name returned after authorization.
    pub fn set_display_name(&self, name: impl Into<String>) {
        self.state().display_name = Some(name.into());
    }

    /// Makes the display-name lookup fail.
    pub fn fail_display_name(&self) {
        self.state().display_name_fails = true;
    }

    /// Delays every scrobble call.
    pub fn set_scrobble_delay(&self, delay: Duration) {
        *self.scrobble_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(delay);
    }

    /// Total scrobble calls, successful or not.
    pub fn scrobble_calls(&self) -> usize {
        self.state().scrobbled.len()
    }

    /// Scrobble calls made with `access_token`.
    pub fn scrobble_calls_for(&self, access_token: &str) -> usize {
        self.state().scrobbled.iter().filter(|(token, _)| token == access_token).count()
    }

    /// Events submitted so far, in call order.
    pub fn scrobbled_events(&self) -> Vec<PlaybackEvent> {
        self.state().scrobbled.iter().map(|(_, event)| event.clone()).collect()
    }

    /// Refresh exchanges performed.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Authorization code exchanges performed.
    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    fn into_error(response: FakeResponse) -> DeliveryError {
        match response {
            FakeResponse::Status(status) => DeliveryError::upstream(status),
            FakeResponse::RateLimited(seconds) => DeliveryError::Upstream {
                status_code: 429,
                code: None,
                description: None,
                retry_after_seconds: Some(seconds),
            },
            FakeResponse::NetworkError => DeliveryError::network("connection reset"),
        }
    }
}

#[async_trait]
impl TrackerApi for FakeTrackerApi {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            access_token: format!("access-{code}"),
            refresh_token: format!("refresh-{code}"),
            expires_in: Some(86_400),
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(failure) = self.state().refresh_failure.clone() {
            return Err(Self::into_error(failure));
        }
        Ok(TokenGrant {
            access_token: format!("refreshed-access-{n}"),
            refresh_token: format!("{refresh_token}-{n}"),
            expires_in: Some(86_400),
        })
    }

    async fn display_name(&self, _access_token: &str) -> Result<Option<String>> {
        let state = self.state();
        if state.display_name_fails {
            return Err(DeliveryError::timeout(5));
        }
        Ok(state.display_name.clone())
    }

    async fn scrobble(&self, access_token: &str, event: &PlaybackEvent) -> Result<ScrobbleReceipt> {
        let delay = *self.scrobble_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = {
            let mut state = self.state();
            state.scrobbled.push((access_token.to_string(), event.clone()));
            state.scrobble_scripts.get_mut(access_token).and_then(VecDeque::pop_front)
        };

        match response {
            None => Ok(ScrobbleReceipt { status_code: 201, id: None }),
            Some(FakeResponse::Status(status)) if (200..300).contains(&status) => {
                Ok(ScrobbleReceipt { status_code: status, id: None })
            },
            Some(failure) => Err(Self::into_error(failure)),
        }
    }
}
