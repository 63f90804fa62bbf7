use jobhost_proto::agent_v1::agent_health_service_server::{
    AgentHealthService, AgentHealthServiceServer,
};
use jobhost_proto::agent_v1::{HealthCheckRequest, HealthCheckResponse};
use tonic::{Request, Response, Status};

use crate::manager::JobManager;

#[derive(Debug, Clone)]
pub struct HealthApi {
    manager: JobManager,
}

#[tonic::async_trait]
impl AgentHealthService for HealthApi {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let active = self.manager.active_jobs().await;
        let reply = HealthCheckResponse {
            status: "SERVING".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            active_jobs: u32::try_from(active).unwrap_or(u32::MAX),
        };
        Ok(Response::new(reply))
    }
}

pub fn server(manager: JobManager) -> AgentHealthServiceServer<HealthApi> {
    AgentHealthServiceServer::new(HealthApi { manager })
}
