//! gRPC service implementations for the dispatcher.
//!
//! `Deploy`/`Status` face CI clients; `Deployments`/`ReportStatus` face
//! cluster agents. Both are implemented on the same [`Dispatcher`] so the
//! router, fan-out, and store are shared.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use gangway_auth::Authenticator;
use gangway_proto::proto::deploy_server::{Deploy, DeployServer};
use gangway_proto::proto::dispatch_server::{Dispatch, DispatchServer};
use gangway_proto::time;
use gangway_proto::{AgentConnectOpts, DeploymentRequest, DeploymentStatus, ReportStatusAck};
use gangway_store::{Deployment, DeploymentResourceRow, DeploymentStatusRow, StateStore, StoreError};

use crate::fanout::StatusFanout;
use crate::metrics::Metrics;
use crate::router::{ClusterRouter, REQUEST_CHANNEL_CAPACITY, RouterError};
use crate::spans::SpanRegistry;

/// Applied when a client omits the request deadline.
fn default_deadline() -> Duration {
    Duration::minutes(10)
}

/// Client-facing response buffer; the fan-out side buffers generously.
const CLIENT_STREAM_BUFFER: usize = 16;

struct Inner {
    store: StateStore,
    router: ClusterRouter,
    fanout: StatusFanout,
    spans: SpanRegistry,
    metrics: Metrics,
    authenticator: Option<Arc<Authenticator>>,
    agent_keys: Vec<String>,
}

/// The central hub: admits requests, routes them to cluster agents, and
/// fans statuses back to waiting clients.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(store: StateStore) -> Self {
        Dispatcher {
            inner: Arc::new(Inner {
                store,
                router: ClusterRouter::new(),
                fanout: StatusFanout::new(),
                spans: SpanRegistry::new(),
                metrics: Metrics::new(),
                authenticator: None,
                agent_keys: Vec::new(),
            }),
        }
    }

    /// Require client credentials on `Deploy`/`Status`.
    pub fn with_authenticator(mut self, authenticator: Arc<Authenticator>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configure the dispatcher before sharing it")
            .authenticator = Some(authenticator);
        self
    }

    /// Require a pre-shared key on agent RPCs.
    pub fn with_agent_keys(mut self, keys: Vec<String>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configure the dispatcher before sharing it")
            .agent_keys = keys;
        self
    }

    pub fn deploy_service(&self) -> DeployServer<Dispatcher> {
        DeployServer::new(self.clone())
    }

    pub fn dispatch_service(&self) -> DispatchServer<Dispatcher> {
        DispatchServer::new(self.clone())
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn spans(&self) -> &SpanRegistry {
        &self.inner.spans
    }

    /// Persist a status row, then copy it to every subscribed client.
    ///
    /// Terminal statuses close the deployment's trace span.
    pub async fn handle_status(&self, status: &DeploymentStatus) -> Result<(), Status> {
        let state = status.state();
        let row = DeploymentStatusRow {
            id: Uuid::new_v4().to_string(),
            deployment_id: status.request_id().to_string(),
            state: state.to_string(),
            message: status.message.clone(),
            created: status
                .time
                .as_ref()
                .and_then(time::to_datetime)
                .unwrap_or_else(Utc::now),
        };
        self.inner.store.write_status(&row).map_err(|e| {
            if e.is_foreign_key_violation() {
                Status::failed_precondition(e.to_string())
            } else {
                Status::unavailable(format!("write deployment status to database: {e}"))
            }
        })?;

        self.inner.metrics.observe_status(state);
        self.inner.fanout.broadcast(status).await;

        if state.is_finished() {
            info!(id = %status.request_id(), %state, "deployment finished");
            self.inner.spans.close(status.request_id());
        }
        Ok(())
    }

    async fn authenticate_client(&self, metadata: &tonic::metadata::MetadataMap) -> Result<(), Status> {
        if let Some(authenticator) = &self.inner.authenticator {
            authenticator.authenticate(metadata).await?;
        }
        Ok(())
    }

    fn authenticate_agent(&self, metadata: &tonic::metadata::MetadataMap) -> Result<(), Status> {
        if self.inner.agent_keys.is_empty() {
            return Ok(());
        }
        let presented = metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if self.inner.agent_keys.iter().any(|key| key == presented) {
            Ok(())
        } else {
            Err(Status::unauthenticated("agent pre-shared key missing or invalid"))
        }
    }

    /// Declare deployments lost that were still open before the agent
    /// (re)started; clients react by resubmitting.
    async fn invalidate_historic(
        &self,
        cluster: &str,
        startup_time: DateTime<Utc>,
    ) -> Result<(), Status> {
        let lost = self
            .inner
            .store
            .historic_deployments(cluster, startup_time)
            .map_err(|e| Status::unavailable(e.to_string()))?;

        for deployment in lost {
            let request = DeploymentRequest {
                id: deployment.id.clone(),
                cluster: deployment.cluster.clone(),
                team: deployment.team.clone(),
                ..Default::default()
            };
            warn!(id = %deployment.id, %cluster, "invalidating deployment lost in agent restart");
            self.handle_status(&DeploymentStatus::inactive(&request)).await?;
        }
        Ok(())
    }
}

fn store_status(err: StoreError) -> Status {
    if err.is_foreign_key_violation() {
        Status::failed_precondition(err.to_string())
    } else {
        Status::unavailable(err.to_string())
    }
}

#[tonic::async_trait]
impl Deploy for Dispatcher {
    async fn deploy(
        &self,
        request: Request<DeploymentRequest>,
    ) -> Result<Response<DeploymentStatus>, Status> {
        self.authenticate_client(request.metadata()).await?;
        let mut req = request.into_inner();

        if req.cluster.is_empty() {
            return Err(Status::invalid_argument("no cluster specified"));
        }
        let resource_ids = req
            .resource_ids()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        // Refuse before persisting anything: an offline cluster must
        // leave no trace in the store.
        if !self.inner.router.is_online(&req.cluster).await {
            return Err(Status::unavailable(format!(
                "cluster '{}' is offline",
                req.cluster
            )));
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        req.id = id.clone();
        req.time = Some(time::from_datetime(now));
        if req.deadline.is_none() {
            req.deadline = Some(time::from_datetime(now + default_deadline()));
        }
        let deadline = req
            .deadline
            .as_ref()
            .and_then(time::to_datetime)
            .unwrap_or_else(|| now + default_deadline());

        let span = info_span!("deployment", %id, cluster = %req.cluster, team = %req.team);
        self.inner.spans.open(&id, span, deadline);

        self.inner
            .store
            .write_deployment(&Deployment {
                id: id.clone(),
                team: req.team.clone(),
                cluster: req.cluster.clone(),
                created: now,
                state: None,
            })
            .map_err(store_status)?;

        for (index, rid) in resource_ids.iter().enumerate() {
            self.inner
                .store
                .write_resource(&DeploymentResourceRow {
                    id: Uuid::new_v4().to_string(),
                    deployment_id: id.clone(),
                    index: index as u32,
                    group: rid.group.clone(),
                    version: rid.version.clone(),
                    kind: rid.kind.clone(),
                    name: rid.name.clone(),
                    namespace: rid.namespace.clone(),
                })
                .map_err(store_status)?;
        }

        self.inner
            .router
            .send(req.clone())
            .await
            .map_err(|e| match e {
                RouterError::Offline(_) | RouterError::Saturated(_) => {
                    Status::unavailable(e.to_string())
                }
                RouterError::AlreadyConnected(_) => Status::internal(e.to_string()),
            })?;
        debug!(%id, cluster = %req.cluster, "deployment request sent to agent");

        let status = DeploymentStatus::queued(&req);
        self.handle_status(&status).await?;
        Ok(Response::new(status))
    }

    type StatusStream = ReceiverStream<Result<DeploymentStatus, Status>>;

    async fn status(
        &self,
        request: Request<DeploymentRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        self.authenticate_client(request.metadata()).await?;
        let req = request.into_inner();
        if req.id.is_empty() {
            return Err(Status::invalid_argument("no deployment id in request"));
        }

        let (subscription, mut fanout_rx) = self.inner.fanout.subscribe().await;
        let (tx, client_rx) = mpsc::channel(CLIENT_STREAM_BUFFER);
        let inner = self.inner.clone();
        let id = req.id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = fanout_rx.recv() => match next {
                        Some(status) if status.request_id() == id => {
                            let finished = status.state().is_finished();
                            if tx.send(Ok(status)).await.is_err() {
                                break;
                            }
                            if finished {
                                break;
                            }
                        }
                        Some(_) => continue,
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            inner.fanout.unsubscribe(subscription).await;
        });

        Ok(Response::new(ReceiverStream::new(client_rx)))
    }
}

#[tonic::async_trait]
impl Dispatch for Dispatcher {
    type DeploymentsStream = ReceiverStream<Result<DeploymentRequest, Status>>;

    async fn deployments(
        &self,
        request: Request<AgentConnectOpts>,
    ) -> Result<Response<Self::DeploymentsStream>, Status> {
        self.authenticate_agent(request.metadata())?;
        let opts = request.into_inner();
        if opts.cluster.is_empty() {
            return Err(Status::invalid_argument("no cluster specified"));
        }

        let mut agent_rx = self
            .inner
            .router
            .register(&opts.cluster)
            .await
            .map_err(|e| Status::already_exists(e.to_string()))?;
        self.inner.metrics.cluster_connected(&opts.cluster);

        let startup_time = opts
            .startup_time
            .as_ref()
            .and_then(time::to_datetime)
            .unwrap_or_else(Utc::now);
        if let Err(e) = self.invalidate_historic(&opts.cluster, startup_time).await {
            self.inner.router.unregister(&opts.cluster).await;
            self.inner.metrics.cluster_disconnected(&opts.cluster);
            return Err(e);
        }

        let (tx, stream_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let inner = self.inner.clone();
        let cluster = opts.cluster;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = agent_rx.recv() => match next {
                        Some(deployment) => {
                            if tx.send(Ok(deployment)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            inner.router.unregister(&cluster).await;
            inner.metrics.cluster_disconnected(&cluster);
        });

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    async fn report_status(
        &self,
        request: Request<DeploymentStatus>,
    ) -> Result<Response<ReportStatusAck>, Status> {
        self.authenticate_agent(request.metadata())?;
        let status = request.into_inner();
        if status.request.is_none() {
            return Err(Status::invalid_argument("status carries no request"));
        }
        self.handle_status(&status).await?;
        Ok(Response::new(ReportStatusAck {}))
    }
}
