//! Guide post: the single admission point for tree-mutating requests.
//!
//! A request is checked against its repository's tree keeper, recorded in
//! the job ledger and only then handed to the keeper's mailbox. Nothing is
//! written for a request that is turned away.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use soma_state::{Job, JobResult, JobStatus, Repository, StateStore, epoch_secs};
use soma_treekeeper::{JobAction, JobReply, Supervisor};

use crate::error::{GuidePostError, GuidePostResult};

/// A tree-mutating request as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Action name, e.g. `create_group`.
    pub action: String,
    /// Repository id or name. Takes precedence over `bucket_id`.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// An accepted request.
#[derive(Debug)]
pub struct Admission {
    pub job_id: String,
    pub repository_id: String,
    /// Resolves once the keeper has executed the job.
    pub completion: JobReply,
}

#[derive(Clone)]
pub struct GuidePost {
    store: StateStore,
    supervisor: Supervisor,
}

impl GuidePost {
    pub fn new(store: StateStore, supervisor: Supervisor) -> Self {
        Self { store, supervisor }
    }

    /// Admit one request: resolve its repository, check the keeper, record
    /// the job and forward it.
    pub async fn admit(&self, request: AdmissionRequest) -> GuidePostResult<Admission> {
        let repository_id = self.resolve_repository(&request)?;

        let keeper = self
            .supervisor
            .handle(&repository_id)
            .await
            .ok_or_else(|| GuidePostError::UnknownRepository(repository_id.clone()))?;
        if !keeper.is_ready() {
            return Err(GuidePostError::ServiceUnavailable(repository_id));
        }
        if keeper.is_broken() {
            return Err(GuidePostError::RepositoryBroken(repository_id));
        }

        let action = JobAction::parse(&request.action, request.payload.clone())?;

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            result: JobResult::Pending,
            job_type: action.name().to_string(),
            repository_id: repository_id.clone(),
            user: request.user,
            team: request.team,
            request: request.payload,
            error: None,
            sequence: 0,
            queued_at: epoch_secs(),
            started_at: None,
            finished_at: None,
        };
        let written = self.store.insert_job(&job)?;
        if written != 1 {
            return Err(GuidePostError::RequestError(format!(
                "job {}: expected 1 row written, got {written}",
                job.id
            )));
        }

        let job_id = job.id.clone();
        let completion = match keeper.submit(job, action).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(%job_id, %repository_id, error = %e, "job could not be forwarded");
                self.store.finish_job(&job_id, Some(e.to_string()))?;
                return Err(GuidePostError::RequestError(e.to_string()));
            }
        };

        info!(%job_id, %repository_id, action = %request.action, "job admitted");
        Ok(Admission {
            job_id,
            repository_id,
            completion,
        })
    }

    fn resolve_repository(&self, request: &AdmissionRequest) -> GuidePostResult<String> {
        if let Some(wanted) = request.repository.as_deref() {
            if let Some(repository) = self.store.get::<Repository>(wanted)? {
                return Ok(repository.id);
            }
            let mut by_name = self.store.list_where(|r: &Repository| r.name == wanted)?;
            return match by_name.pop() {
                Some(repository) if by_name.is_empty() => Ok(repository.id),
                Some(_) => Err(GuidePostError::InvalidRequest(format!(
                    "repository name {wanted} is ambiguous"
                ))),
                None => Err(GuidePostError::UnknownRepository(wanted.to_string())),
            };
        }

        if let Some(bucket_id) = request.bucket_id.as_deref() {
            let repository = self
                .store
                .repository_for_bucket(bucket_id)?
                .ok_or_else(|| GuidePostError::NotFound(format!("bucket {bucket_id}")))?;
            debug!(%bucket_id, repository_id = %repository.id, "repository resolved via bucket");
            return Ok(repository.id);
        }

        Err(GuidePostError::InvalidRequest(
            "request names neither a repository nor a bucket".into(),
        ))
    }
}
