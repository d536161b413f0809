//! In-memory transfer service for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use archeion_common::{
    AuthError, BackendError, DirEntry, EndpointId, EntryKind, SubmissionId, TaskId,
};

use crate::service::{
    ActivationOutcome, ActivationResult, AuthorizationService, EndpointSearch, EndpointSummary,
    SearchScope, SubmitResponse, TaskEvent, TokenGrant, TokenSet, TransferRequest,
    TransferService, UserInfo,
};

/// Failure injected into the next `submit_transfer` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitFault {
    /// Fail in transport before the request reaches the service.
    Network,
    /// Time out before the request reaches the service.
    Timeout,
    /// Accept the submission, then lose the response (times out).
    DropResponse,
    /// Refuse the submission.
    Reject(String),
}

#[derive(Debug)]
struct MemoryEndpoint {
    summary: EndpointSummary,
    owned: bool,
    active: bool,
    activation_script: VecDeque<String>,
    autoactivate_calls: u32,
    entries: BTreeMap<String, EntryKind>,
}

#[derive(Debug)]
struct State {
    codes: HashSet<String>,
    issued: u64,
    auth_token: Option<String>,
    transfer_token: Option<String>,
    refresh_token: Option<String>,
    refresh_revoked: bool,
    auth_network_down: bool,
    token_lifetime: u64,
    user: UserInfo,
    endpoints: HashMap<EndpointId, MemoryEndpoint>,
    submissions: HashMap<SubmissionId, Option<TaskId>>,
    tasks: HashMap<TaskId, (TransferRequest, Vec<TaskEvent>)>,
    submit_faults: VecDeque<SubmitFault>,
    exchange_calls: u32,
    refresh_calls: u32,
    submit_calls: u32,
}

/// In-memory authorization and transfer service.
///
/// Useful for testing and development. Behaviour is scripted through the
/// setup methods; call counters make retries and refreshes observable.
pub struct MemoryService {
    state: Mutex<State>,
    refresh_delay: Duration,
}

impl MemoryService {
    /// Create a new empty service.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                codes: HashSet::new(),
                issued: 0,
                auth_token: None,
                transfer_token: None,
                refresh_token: None,
                refresh_revoked: false,
                auth_network_down: false,
                token_lifetime: 3600,
                user: UserInfo {
                    sub: "00000000-0000-0000-0000-000000000000".to_string(),
                    preferred_username: Some("tester@example.org".to_string()),
                    name: Some("Test User".to_string()),
                    email: None,
                },
                endpoints: HashMap::new(),
                submissions: HashMap::new(),
                tasks: HashMap::new(),
                submit_faults: VecDeque::new(),
                exchange_calls: 0,
                refresh_calls: 0,
                submit_calls: 0,
            }),
            refresh_delay: Duration::ZERO,
        }
    }

    /// Delay every refresh RPC, widening the window for concurrent callers.
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow `code` to be exchanged once.
    pub fn accept_code(&self, code: impl Into<String>) {
        self.state().codes.insert(code.into());
    }

    /// Issue a token set directly, as if a login had happened earlier.
    pub fn issue_tokens(&self) -> TokenSet {
        let mut state = self.state();
        Self::issue(&mut state)
    }

    /// Lifetime in seconds of tokens issued from now on.
    pub fn set_token_lifetime(&self, seconds: u64) {
        self.state().token_lifetime = seconds;
    }

    /// Revoke the refresh token; later refreshes are denied.
    pub fn revoke_refresh_token(&self) {
        self.state().refresh_revoked = true;
    }

    /// Make the authorization service unreachable.
    pub fn set_auth_network_down(&self, down: bool) {
        self.state().auth_network_down = down;
    }

    /// Identity returned by `userinfo`.
    pub fn set_user(&self, user: UserInfo) {
        self.state().user = user;
    }

    /// Register an endpoint with an empty root directory.
    pub fn add_endpoint(&self, id: &EndpointId, display_name: &str) {
        self.state().endpoints.insert(
            id.clone(),
            MemoryEndpoint {
                summary: EndpointSummary {
                    id: id.clone(),
                    display_name: Some(display_name.to_string()),
                    canonical_name: Some(format!("memory#{}", display_name)),
                },
                owned: false,
                active: false,
                activation_script: VecDeque::new(),
                autoactivate_calls: 0,
                entries: BTreeMap::new(),
            },
        );
    }

    /// Mark an endpoint as owned by the authorized user.
    pub fn set_owned(&self, id: &EndpointId) {
        if let Some(endpoint) = self.state().endpoints.get_mut(id) {
            endpoint.owned = true;
        }
    }

    /// Codes returned by the next autoactivate calls, in order.
    ///
    /// Once the script runs out, activation succeeds automatically.
    pub fn script_activation<'a>(&self, id: &EndpointId, codes: impl IntoIterator<Item = &'a str>) {
        if let Some(endpoint) = self.state().endpoints.get_mut(id) {
            endpoint
                .activation_script
                .extend(codes.into_iter().map(str::to_string));
        }
    }

    /// Let an endpoint's activation lapse.
    pub fn deactivate(&self, id: &EndpointId) {
        if let Some(endpoint) = self.state().endpoints.get_mut(id) {
            endpoint.active = false;
        }
    }

    /// Create a directory (and missing parents).
    pub fn add_dir(&self, id: &EndpointId, path: &str) {
        self.add_entry(id, path, EntryKind::Dir);
    }

    /// Create a file (and missing parent directories).
    pub fn add_file(&self, id: &EndpointId, path: &str) {
        self.add_entry(id, path, EntryKind::File);
    }

    /// Create an entry of any kind (and missing parent directories).
    pub fn add_entry(&self, id: &EndpointId, path: &str, kind: EntryKind) {
        let mut state = self.state();
        let Some(endpoint) = state.endpoints.get_mut(id) else {
            return;
        };
        let path = normalize(path);
        let mut parent = parent_of(&path);
        while let Some(dir) = parent {
            if dir != "/" {
                endpoint.entries.entry(dir.clone()).or_insert(EntryKind::Dir);
            }
            parent = parent_of(&dir);
        }
        endpoint.entries.insert(path, kind);
    }

    /// Whether a path exists on an endpoint.
    pub fn exists(&self, id: &EndpointId, path: &str) -> bool {
        let path = normalize(path);
        self.state()
            .endpoints
            .get(id)
            .map(|e| path == "/" || e.entries.contains_key(&path))
            .unwrap_or(false)
    }

    /// Inject a failure into the next submission.
    pub fn inject_submit_fault(&self, fault: SubmitFault) {
        self.state().submit_faults.push_back(fault);
    }

    /// Record a task event (becomes the newest event).
    pub fn push_task_event(&self, task_id: &TaskId, code: &str, details: &str) {
        if let Some((_, events)) = self.state().tasks.get_mut(task_id) {
            events.insert(0, TaskEvent::new(code, details));
        }
    }

    /// The request that created a task.
    pub fn submitted(&self, task_id: &TaskId) -> Option<TransferRequest> {
        self.state().tasks.get(task_id).map(|(request, _)| request.clone())
    }

    pub fn task_count(&self) -> usize {
        self.state().tasks.len()
    }

    pub fn exchange_calls(&self) -> u32 {
        self.state().exchange_calls
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state().refresh_calls
    }

    pub fn submit_calls(&self) -> u32 {
        self.state().submit_calls
    }

    pub fn autoactivate_calls(&self, id: &EndpointId) -> u32 {
        self.state()
            .endpoints
            .get(id)
            .map(|e| e.autoactivate_calls)
            .unwrap_or(0)
    }

    fn issue(state: &mut State) -> TokenSet {
        state.issued += 1;
        let n = state.issued;
        let auth_token = format!("auth-token-{}", n);
        let transfer_token = format!("transfer-token-{}", n);
        let refresh_token = format!("refresh-token-{}", n);

        state.auth_token = Some(auth_token.clone());
        state.transfer_token = Some(transfer_token.clone());
        state.refresh_token = Some(refresh_token.clone());
        state.refresh_revoked = false;

        TokenSet {
            auth_token,
            transfer: TokenGrant {
                access_token: transfer_token,
                refresh_token: Some(refresh_token),
                expires_in: state.token_lifetime,
            },
        }
    }

    fn check_token(state: &State, token: &str) -> Result<(), BackendError> {
        if state.transfer_token.as_deref() == Some(token) {
            Ok(())
        } else {
            Err(BackendError::Unauthorized("Invalid or expired token".to_string()))
        }
    }

    fn endpoint<'a>(
        state: &'a mut State,
        id: &EndpointId,
    ) -> Result<&'a mut MemoryEndpoint, BackendError> {
        state
            .endpoints
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("Endpoint not found: {}", id)))
    }

    fn active_endpoint<'a>(
        state: &'a mut State,
        id: &EndpointId,
    ) -> Result<&'a mut MemoryEndpoint, BackendError> {
        let endpoint = Self::endpoint(state, id)?;
        if !endpoint.active {
            return Err(BackendError::ActivationRequired(format!(
                "Endpoint {} must be activated",
                id
            )));
        }
        Ok(endpoint)
    }
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) | None => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
    }
}

fn is_dir(endpoint: &MemoryEndpoint, path: &str) -> bool {
    path == "/" || endpoint.entries.get(path) == Some(&EntryKind::Dir)
}

#[async_trait]
impl AuthorizationService for MemoryService {
    fn authorize_url(&self) -> Result<String, AuthError> {
        let state = self.state();
        Ok(format!(
            "https://auth.memory.invalid/authorize?client_id=memory&flow={}",
            state.issued + 1
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthError> {
        let mut state = self.state();
        state.exchange_calls += 1;

        if state.auth_network_down {
            return Err(AuthError::NetworkError("Connection refused".to_string()));
        }
        if !state.codes.remove(code) {
            return Err(AuthError::InvalidCode(format!("Code not recognized: {}", code)));
        }

        Ok(Self::issue(&mut state))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        self.state().refresh_calls += 1;

        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }

        let mut state = self.state();
        if state.auth_network_down {
            return Err(AuthError::NetworkError("Connection refused".to_string()));
        }
        if state.refresh_revoked || state.refresh_token.as_deref() != Some(refresh_token) {
            return Err(AuthError::RefreshDenied("invalid_grant".to_string()));
        }

        state.issued += 1;
        let access_token = format!("transfer-token-{}", state.issued);
        state.transfer_token = Some(access_token.clone());

        Ok(TokenGrant {
            access_token,
            refresh_token: None,
            expires_in: state.token_lifetime,
        })
    }

    async fn userinfo(&self, auth_token: &str) -> Result<UserInfo, BackendError> {
        let state = self.state();
        if state.auth_token.as_deref() != Some(auth_token) {
            return Err(BackendError::Unauthorized("Invalid auth token".to_string()));
        }
        Ok(state.user.clone())
    }
}

#[async_trait]
impl TransferService for MemoryService {
    fn name(&self) -> &str {
        "memory"
    }

    async fn endpoint_autoactivate(
        &self,
        token: &str,
        endpoint: &EndpointId,
        _if_expires_in: u64,
    ) -> Result<ActivationResult, BackendError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        let endpoint = Self::endpoint(&mut state, endpoint)?;
        endpoint.autoactivate_calls += 1;

        let result = match endpoint.activation_script.pop_front() {
            Some(code) => ActivationResult::new(code),
            None if endpoint.active => ActivationResult::new("AlreadyActivated"),
            None => ActivationResult::new("AutoActivated.CachedCredential"),
        };

        if result.outcome() == ActivationOutcome::Activated {
            endpoint.active = true;
        }
        Ok(result)
    }

    async fn list_directory(
        &self,
        token: &str,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<Vec<DirEntry>, BackendError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        let endpoint = Self::active_endpoint(&mut state, endpoint)?;
        let path = normalize(path);

        if !is_dir(endpoint, &path) {
            return Err(BackendError::NotFound(format!("Directory not found: {}", path)));
        }

        Ok(endpoint
            .entries
            .iter()
            .filter(|(entry, _)| parent_of(entry).as_deref() == Some(path.as_str()))
            .map(|(entry, kind)| {
                let name = entry.rsplit('/').next().unwrap_or(entry.as_str());
                DirEntry::new(name, *kind)
            })
            .collect())
    }

    async fn make_directory(
        &self,
        token: &str,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        let endpoint = Self::active_endpoint(&mut state, endpoint)?;
        let path = normalize(path);

        if path == "/" || endpoint.entries.contains_key(&path) {
            return Err(BackendError::AlreadyExists(format!("Path already exists: {}", path)));
        }
        let parent = parent_of(&path).unwrap_or_else(|| "/".to_string());
        if !is_dir(endpoint, &parent) {
            return Err(BackendError::NotFound(format!("Parent not found: {}", parent)));
        }

        endpoint.entries.insert(path, EntryKind::Dir);
        Ok(())
    }

    async fn rename(
        &self,
        token: &str,
        endpoint: &EndpointId,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        let endpoint = Self::active_endpoint(&mut state, endpoint)?;
        let old_path = normalize(old_path);
        let new_path = normalize(new_path);

        if !endpoint.entries.contains_key(&old_path) {
            return Err(BackendError::NotFound(format!("Path not found: {}", old_path)));
        }
        if new_path == "/" || endpoint.entries.contains_key(&new_path) {
            return Err(BackendError::AlreadyExists(format!(
                "Path already exists: {}",
                new_path
            )));
        }
        let parent = parent_of(&new_path).unwrap_or_else(|| "/".to_string());
        if !is_dir(endpoint, &parent) {
            return Err(BackendError::NotFound(format!("Parent not found: {}", parent)));
        }

        let prefix = format!("{}/", old_path);
        let moved: Vec<(String, EntryKind)> = endpoint
            .entries
            .iter()
            .filter(|(p, _)| **p == old_path || p.starts_with(&prefix))
            .map(|(p, k)| (p.clone(), *k))
            .collect();

        for (path, kind) in moved {
            endpoint.entries.remove(&path);
            let renamed = format!("{}{}", new_path, &path[old_path.len()..]);
            endpoint.entries.insert(renamed, kind);
        }
        Ok(())
    }

    async fn get_submission_id(&self, token: &str) -> Result<SubmissionId, BackendError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        let id = SubmissionId::new(Uuid::new_v4().to_string());
        state.submissions.insert(id.clone(), None);
        Ok(id)
    }

    async fn submit_transfer(
        &self,
        token: &str,
        request: &TransferRequest,
    ) -> Result<SubmitResponse, BackendError> {
        let mut state = self.state();
        state.submit_calls += 1;
        Self::check_token(&state, token)?;

        let fault = state.submit_faults.pop_front();
        match &fault {
            Some(SubmitFault::Network) => {
                return Err(BackendError::Network("Connection reset by peer".to_string()))
            }
            Some(SubmitFault::Timeout) => return Err(BackendError::Timeout),
            Some(SubmitFault::Reject(reason)) => {
                return Err(BackendError::Service {
                    code: "ClientError.BadRequest".to_string(),
                    message: reason.clone(),
                })
            }
            Some(SubmitFault::DropResponse) | None => {}
        }

        for id in [&request.source_endpoint, &request.destination_endpoint] {
            Self::active_endpoint(&mut state, id)?;
        }
        if request.items.is_empty() {
            return Err(BackendError::Service {
                code: "ClientError.BadRequest".to_string(),
                message: "A transfer requires at least one item".to_string(),
            });
        }

        let existing = state.submissions.get(&request.submission_id).cloned();
        let response = match existing {
            None => {
                return Err(BackendError::Service {
                    code: "ClientError.BadRequest".to_string(),
                    message: format!("Unknown submission id: {}", request.submission_id),
                })
            }
            Some(Some(task_id)) => SubmitResponse {
                code: "Duplicate".to_string(),
                message: "A transfer with this submission id has already been accepted"
                    .to_string(),
                task_id,
            },
            Some(None) => {
                let task_id = TaskId::new(Uuid::new_v4().to_string());
                state
                    .submissions
                    .insert(request.submission_id.clone(), Some(task_id.clone()));
                state
                    .tasks
                    .insert(task_id.clone(), (request.clone(), Vec::new()));
                SubmitResponse {
                    code: "Accepted".to_string(),
                    message: "The transfer has been accepted and a task has been created and queued for execution".to_string(),
                    task_id,
                }
            }
        };

        if fault == Some(SubmitFault::DropResponse) {
            return Err(BackendError::Timeout);
        }
        Ok(response)
    }

    async fn task_status(
        &self,
        token: &str,
        task_id: &TaskId,
    ) -> Result<Vec<TaskEvent>, BackendError> {
        let state = self.state();
        Self::check_token(&state, token)?;
        state
            .tasks
            .get(task_id)
            .map(|(_, events)| events.clone())
            .ok_or_else(|| BackendError::NotFound(format!("Task not found: {}", task_id)))
    }

    async fn cancel_task(&self, token: &str, task_id: &TaskId) -> Result<(), BackendError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        let (_, events) = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BackendError::NotFound(format!("Task not found: {}", task_id)))?;
        events.insert(0, TaskEvent::new("CANCELED", "The task has been cancelled"));
        Ok(())
    }

    async fn get_endpoint(
        &self,
        token: &str,
        endpoint: &EndpointId,
    ) -> Result<EndpointSummary, BackendError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        Ok(Self::endpoint(&mut state, endpoint)?.summary.clone())
    }

    async fn endpoint_search(
        &self,
        token: &str,
        search: &EndpointSearch,
    ) -> Result<Vec<EndpointSummary>, BackendError> {
        let state = self.state();
        Self::check_token(&state, token)?;
        let query = search.query.as_deref().map(str::to_lowercase);

        let mut results: Vec<EndpointSummary> = state
            .endpoints
            .values()
            .filter(|e| search.scope == SearchScope::All || e.owned)
            .filter(|e| match &query {
                Some(q) => e.summary.name().to_lowercase().contains(q.as_str()),
                None => true,
            })
            .map(|e| e.summary.clone())
            .collect();

        results.sort_by_key(|s| s.name());
        results.truncate(search.limit as usize);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_id() -> EndpointId {
        EndpointId::new("499930f1-5c43-11e7-bf29-22000b9a448b").unwrap()
    }

    async fn ready_service() -> (MemoryService, String) {
        let service = MemoryService::new();
        let tokens = service.issue_tokens();
        service.add_endpoint(&endpoint_id(), "lab");
        service
            .endpoint_autoactivate(&tokens.transfer.access_token, &endpoint_id(), 3600)
            .await
            .unwrap();
        (service, tokens.transfer.access_token)
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(normalize("data/"), "/data");
        assert_eq!(normalize(""), "/");
        assert_eq!(parent_of("/data/a.txt").as_deref(), Some("/data"));
        assert_eq!(parent_of("/data").as_deref(), Some("/"));
        assert_eq!(parent_of("/"), None);
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let service = MemoryService::new();
        service.accept_code("abc");

        assert!(service.exchange_code("abc").await.is_ok());
        assert!(matches!(
            service.exchange_code("abc").await,
            Err(AuthError::InvalidCode(_))
        ));
        assert_eq!(service.exchange_calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_replaces_transfer_token() {
        let service = MemoryService::new();
        let tokens = service.issue_tokens();
        let refresh = tokens.transfer.refresh_token.clone().unwrap();

        let grant = service.refresh_token(&refresh).await.unwrap();
        assert_ne!(grant.access_token, tokens.transfer.access_token);

        service.revoke_refresh_token();
        assert!(matches!(
            service.refresh_token(&refresh).await,
            Err(AuthError::RefreshDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_and_mkdir() {
        let (service, token) = ready_service().await;
        service.add_file(&endpoint_id(), "/data/a.txt");
        service.add_dir(&endpoint_id(), "/data/sub");

        let entries = service
            .list_directory(&token, &endpoint_id(), "/data")
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);

        service
            .make_directory(&token, &endpoint_id(), "/data/new")
            .await
            .unwrap();
        assert!(matches!(
            service.make_directory(&token, &endpoint_id(), "/data/new").await,
            Err(BackendError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let (service, token) = ready_service().await;
        service.add_file(&endpoint_id(), "/old/nested/file.bin");

        service
            .rename(&token, &endpoint_id(), "/old", "/new")
            .await
            .unwrap();

        assert!(service.exists(&endpoint_id(), "/new/nested/file.bin"));
        assert!(!service.exists(&endpoint_id(), "/old"));
    }

    #[tokio::test]
    async fn test_inactive_endpoint_requires_activation() {
        let (service, token) = ready_service().await;
        service.deactivate(&endpoint_id());

        assert!(matches!(
            service.list_directory(&token, &endpoint_id(), "/").await,
            Err(BackendError::ActivationRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_token_rejected() {
        let (service, _token) = ready_service().await;
        assert!(matches!(
            service.list_directory("bogus", &endpoint_id(), "/").await,
            Err(BackendError::Unauthorized(_))
        ));
    }
}
