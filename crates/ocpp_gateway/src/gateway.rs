use crate::auth::AuthorizationResolver;
use crate::health::serve_health;
use crate::listener::{GatewayListener, ListenerContext, ListenerSettings};
use crate::mqtt::MessageBridge;
use crate::registry::{DuplicatePolicy, SessionRegistry};
use crate::session::{SessionContext, SessionSettings};
use crate::supervisor::{Supervisor, SupervisorSettings};
use common::auth::PasswordService;
use common::domain::ChargePointRepository;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A long-running gateway task, in the shape the process runner expects.
pub type GatewayProcess = Box<dyn FnOnce(CancellationToken) -> ProcessFuture + Send>;

fn process<F, Fut>(run: F) -> GatewayProcess
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |ctx: CancellationToken| -> ProcessFuture { Box::pin(run(ctx)) })
}

#[derive(Debug, Clone)]
pub struct OcppGatewayConfig {
    pub listen_addr: SocketAddr,
    /// `/health` and `/stats` are not served when `None`.
    pub health_addr: Option<SocketAddr>,
    pub listener: ListenerSettings,
    pub session: SessionSettings,
    pub supervisor: SupervisorSettings,
    pub duplicate_policy: DuplicatePolicy,
    pub auth_timeout: Duration,
}

/// The gateway minus the broker connection: listener, sessions, supervisor
/// and health endpoint.
pub struct OcppGateway {
    listener: GatewayListener,
    supervisor: Arc<Supervisor>,
    registry: Arc<SessionRegistry>,
    listener_shutdown: CancellationToken,
    health_addr: Option<SocketAddr>,
}

impl OcppGateway {
    pub async fn new(
        config: OcppGatewayConfig,
        bridge: Arc<dyn MessageBridge>,
        charge_points: Arc<dyn ChargePointRepository>,
        passwords: Arc<dyn PasswordService>,
    ) -> anyhow::Result<Self> {
        debug!("initializing OCPP gateway");

        let registry = Arc::new(SessionRegistry::new(config.duplicate_policy));
        let resolver = Arc::new(AuthorizationResolver::new(
            charge_points,
            passwords,
            config.auth_timeout,
        ));
        let accepting = Arc::new(AtomicBool::new(false));
        let tracker = TaskTracker::new();
        let listener_shutdown = CancellationToken::new();

        let listener_settings = ListenerSettings {
            max_frame_size: config.session.max_frame_size,
            ..config.listener
        };
        let ctx = ListenerContext {
            session: SessionContext {
                registry: registry.clone(),
                bridge: bridge.clone(),
                settings: config.session,
            },
            resolver,
            settings: listener_settings,
            tracker: tracker.clone(),
            accepting: accepting.clone(),
        };
        let listener = GatewayListener::bind(config.listen_addr, ctx).await?;

        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            bridge,
            accepting,
            tracker,
            listener_shutdown.clone(),
            config.supervisor,
        ));

        Ok(Self {
            listener,
            supervisor,
            registry,
            listener_shutdown,
            health_addr: config.health_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Named processes for the runner. Sessions are drained separately with
    /// [`Supervisor::shutdown`] once these have stopped.
    pub fn into_runner_processes(self) -> Vec<(&'static str, GatewayProcess)> {
        let mut processes: Vec<(&'static str, GatewayProcess)> = Vec::new();

        let listener = self.listener;
        let stop = self.listener_shutdown;
        processes.push((
            "ocpp_listener",
            process(move |ctx| async move {
                let run = listener.run(stop.clone());
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = ctx.cancelled() => {
                        stop.cancel();
                        run.await
                    }
                }
            }),
        ));

        let supervisor = self.supervisor.clone();
        processes.push((
            "ocpp_supervisor",
            process(move |ctx| async move { supervisor.run(ctx).await }),
        ));

        if let Some(addr) = self.health_addr {
            let supervisor = self.supervisor;
            processes.push((
                "health_server",
                process(move |ctx| serve_health(addr, supervisor, ctx)),
            ));
        }

        processes
    }
}
