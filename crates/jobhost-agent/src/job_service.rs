use std::collections::BTreeMap;

use jobhost_core::{EnvironmentSpec, JobId, JobInfo as CoreJobInfo, JobStatus as CoreJobStatus};
use jobhost_proto::agent_v1::job_service_server::{JobService, JobServiceServer};
use jobhost_proto::agent_v1::{
    GetJobLogsRequest, GetJobLogsResponse, GetJobRequest, GetJobResponse, GetJobStatusRequest,
    GetJobStatusResponse, JobInfo, JobStatus, ListJobsRequest, ListJobsResponse, StopJobRequest,
    StopJobResponse, SubmitJobRequest, SubmitJobResponse, TailJobLogsRequest, TailJobLogsResponse,
};
use tonic::{Request, Response, Status};

use crate::error::JobError;
use crate::manager::{JobManager, SubmitOptions};

const DEFAULT_TAIL_LIMIT_BYTES: usize = 64 * 1024;
const MAX_TAIL_LIMIT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JobApi {
    manager: JobManager,
}

impl JobApi {
    pub fn new(manager: JobManager) -> Self {
        Self { manager }
    }
}

fn map_status(s: CoreJobStatus) -> JobStatus {
    match s {
        CoreJobStatus::Pending => JobStatus::Pending,
        CoreJobStatus::Running => JobStatus::Running,
        CoreJobStatus::Succeeded => JobStatus::Succeeded,
        CoreJobStatus::Failed => JobStatus::Failed,
        CoreJobStatus::Stopped => JobStatus::Stopped,
    }
}

fn map_job(j: CoreJobInfo) -> JobInfo {
    JobInfo {
        job_id: j.id.0,
        status: map_status(j.status) as i32,
        entrypoint: j.entrypoint,
        message: j.message.unwrap_or_default(),
        pid: j.pid.unwrap_or_default(),
        has_pid: j.pid.is_some(),
        exit_code: j.exit_code.unwrap_or_default(),
        has_exit_code: j.exit_code.is_some(),
        metadata: j.environment.metadata.into_iter().collect(),
        created_at_unix_ms: j.created_at_unix_ms,
        started_at_unix_ms: j.started_at_unix_ms.unwrap_or_default(),
        finished_at_unix_ms: j.finished_at_unix_ms.unwrap_or_default(),
    }
}

/// gRPC status for an error surfaced by the manager.
pub(crate) fn map_error(err: JobError) -> Status {
    if !err.is_caller_error() {
        return Status::internal(err.to_string());
    }
    match err {
        JobError::DuplicateJob(_) => Status::already_exists(err.to_string()),
        JobError::NotFound(_) => Status::not_found(err.to_string()),
        _ => Status::invalid_argument(err.to_string()),
    }
}

fn parse_job_id(raw: String) -> Result<JobId, Status> {
    if raw.trim().is_empty() {
        return Err(Status::invalid_argument("job_id is required"));
    }
    Ok(JobId(raw))
}

fn submit_options(req: &mut SubmitJobRequest) -> SubmitOptions {
    let job_id = (!req.job_id.is_empty()).then(|| JobId(std::mem::take(&mut req.job_id)));
    let environment = req.runtime_env.take().map(|env| EnvironmentSpec {
        working_dir: (!env.working_dir.is_empty()).then_some(env.working_dir),
        env_vars: env.env_vars.into_iter().collect(),
        metadata: BTreeMap::new(),
    });
    SubmitOptions {
        job_id,
        environment,
        metadata: std::mem::take(&mut req.metadata).into_iter().collect(),
        start_barrier: None,
    }
}

#[tonic::async_trait]
impl JobService for JobApi {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let mut req = request.into_inner();
        let options = submit_options(&mut req);
        let job_id = self
            .manager
            .submit(&req.entrypoint, options)
            .await
            .map_err(map_error)?;
        Ok(Response::new(SubmitJobResponse { job_id: job_id.0 }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let id = parse_job_id(request.into_inner().job_id)?;
        let status = self.manager.get_status(&id).await.map_err(map_error)?;
        Ok(Response::new(GetJobStatusResponse {
            status: map_status(status) as i32,
        }))
    }

    async fn get_job(
        &self,
        request: Request<GetJobRequest>,
    ) -> Result<Response<GetJobResponse>, Status> {
        let id = parse_job_id(request.into_inner().job_id)?;
        let job = self.manager.get_job(&id).await.map_err(map_error)?;
        Ok(Response::new(GetJobResponse {
            job: Some(map_job(job)),
        }))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let jobs = self
            .manager
            .list_jobs()
            .await
            .into_iter()
            .map(map_job)
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    async fn get_job_logs(
        &self,
        request: Request<GetJobLogsRequest>,
    ) -> Result<Response<GetJobLogsResponse>, Status> {
        let id = parse_job_id(request.into_inner().job_id)?;
        let logs = self.manager.get_logs(&id).await.map_err(map_error)?;
        Ok(Response::new(GetJobLogsResponse { logs }))
    }

    async fn tail_job_logs(
        &self,
        request: Request<TailJobLogsRequest>,
    ) -> Result<Response<TailJobLogsResponse>, Status> {
        let req = request.into_inner();
        let id = parse_job_id(req.job_id)?;
        let limit = if req.limit_bytes == 0 {
            DEFAULT_TAIL_LIMIT_BYTES
        } else {
            (req.limit_bytes as usize).min(MAX_TAIL_LIMIT_BYTES)
        };
        let cursor: u64 = req.cursor.parse().unwrap_or(0);
        let chunk = self
            .manager
            .tail_logs(&id, cursor, limit)
            .await
            .map_err(map_error)?;

        Ok(Response::new(TailJobLogsResponse {
            data: chunk.data,
            next_cursor: chunk.next_offset.to_string(),
            finished: chunk.finished,
        }))
    }

    async fn stop_job(
        &self,
        request: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        let id = parse_job_id(request.into_inner().job_id)?;
        let stopped = self.manager.stop(&id).await;
        Ok(Response::new(StopJobResponse { stopped }))
    }
}

pub fn server(manager: JobManager) -> JobServiceServer<JobApi> {
    JobServiceServer::new(JobApi::new(manager))
}
