//! In-memory job-dispatch platform.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fleet_id::RunnerId;
use fleet_provisioner::platform::{RunnerPage, RunnerPlatform};
use fleet_provisioner::{PlatformError, RunnerRecord, RunnerStatus};

#[derive(Debug)]
struct PlatformState {
    runners: Vec<RunnerRecord>,
    next_id: u64,
    page_size: usize,
    failing_lists: u32,
    failing_deletes: u32,
    deleted: Vec<RunnerId>,
    ghosts: HashSet<RunnerId>,
    tokens_issued: u32,
    token_requests: u32,
    token_failures: Option<(u32, u32)>,
    list_calls: u32,
}

/// A runner registry that lives in memory. Clones share state.
#[derive(Debug, Clone)]
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState {
                runners: Vec::new(),
                next_id: 1,
                page_size: 100,
                failing_lists: 0,
                failing_deletes: 0,
                deleted: Vec::new(),
                ghosts: HashSet::new(),
                tokens_issued: 0,
                token_requests: 0,
                token_failures: None,
                list_calls: 0,
            })),
        }
    }

    /// Serve listings `page_size` records at a time.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an online runner carrying `labels`.
    pub fn register(&self, labels: &[&str]) -> RunnerId {
        let mut state = self.lock();
        let id = RunnerId::new(state.next_id);
        state.next_id += 1;
        state.runners.push(RunnerRecord {
            id,
            name: format!("runner-{}", id.value()),
            labels: labels.iter().map(|l| l.to_string()).collect::<BTreeSet<_>>(),
            status: RunnerStatus::Online,
        });
        id
    }

    /// Register a runner that still shows up in listings but is already gone
    /// server-side, so deleting it reports not found.
    pub fn register_ghost(&self, labels: &[&str]) -> RunnerId {
        let id = self.register(labels);
        self.lock().ghosts.insert(id);
        id
    }

    /// Drop a record without going through the delete API, as if the runner
    /// deregistered itself.
    pub fn remove_silently(&self, id: RunnerId) {
        self.lock().runners.retain(|r| r.id != id);
    }

    /// Make the next `n` listings fail.
    pub fn fail_next_lists(&self, n: u32) {
        self.lock().failing_lists = n;
    }

    /// Make the next `n` deletions fail with a server error.
    pub fn fail_next_deletes(&self, n: u32) {
        self.lock().failing_deletes = n;
    }

    /// Once `issued` tokens have been handed out, fail the next `n` token
    /// requests with a server error.
    pub fn fail_tokens_after(&self, issued: u32, n: u32) {
        self.lock().token_failures = Some((issued, n));
    }

    pub fn runners(&self) -> Vec<RunnerRecord> {
        self.lock().runners.clone()
    }

    pub fn deleted(&self) -> Vec<RunnerId> {
        self.lock().deleted.clone()
    }

    pub fn tokens_issued(&self) -> u32 {
        self.lock().tokens_issued
    }

    /// Token requests made, failed ones included.
    pub fn token_requests(&self) -> u32 {
        self.lock().token_requests
    }

    pub fn list_calls(&self) -> u32 {
        self.lock().list_calls
    }

    /// Records carrying `label`.
    pub fn runners_with_label(&self, label: &str) -> Vec<RunnerRecord> {
        self.lock()
            .runners
            .iter()
            .filter(|r| r.has_label(label))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RunnerPlatform for FakePlatform {
    async fn list_runners(&self, page: u32) -> Result<RunnerPage, PlatformError> {
        let mut state = self.lock();
        state.list_calls += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(PlatformError::Api {
                status: 502,
                message: "bad gateway".to_string(),
            });
        }

        let start = (page.max(1) as usize - 1) * state.page_size;
        let runners = state
            .runners
            .iter()
            .skip(start)
            .take(state.page_size)
            .cloned()
            .collect();
        Ok(RunnerPage {
            runners,
            total_count: state.runners.len(),
        })
    }

    async fn create_registration_token(&self) -> Result<String, PlatformError> {
        let mut state = self.lock();
        state.token_requests += 1;
        if let Some((issued, remaining)) = state.token_failures {
            if state.tokens_issued >= issued && remaining > 0 {
                state.token_failures = Some((issued, remaining - 1));
                return Err(PlatformError::Api {
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }
        }
        state.tokens_issued += 1;
        Ok(format!("REG-TOKEN-{}", state.tokens_issued))
    }

    async fn delete_runner(&self, id: RunnerId) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(PlatformError::Api {
                status: 500,
                message: "internal error".to_string(),
            });
        }

        if state.ghosts.remove(&id) {
            state.runners.retain(|r| r.id != id);
            return Err(PlatformError::NotFound(id));
        }

        let before = state.runners.len();
        state.runners.retain(|r| r.id != id);
        if state.runners.len() == before {
            return Err(PlatformError::NotFound(id));
        }
        state.deleted.push(id);
        Ok(())
    }
}
