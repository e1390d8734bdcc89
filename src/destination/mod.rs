use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::cache::ClusterCache;
use crate::error::Error;
use self::path::Authority;
use self::profiles::ProfileWatcher;
use self::watch::{default_owner_lookup, EndpointsWatcher, ListenerStream, OwnerLookup};

pub mod path;
pub mod profiles;
pub mod watch;

pub mod proto {
    tonic::include_proto!("destination");
}

/// Streaming resolver for in-cluster proxies: `Get` streams the endpoint
/// set behind a `host:port`, `GetProfile` streams its routing profile. Both
/// share the controller's informer caches.
pub struct DestinationService {
    endpoints: Arc<EndpointsWatcher>,
    profiles: Arc<ProfileWatcher>,
    cluster_domain: String,
}

impl DestinationService {
    #[must_use]
    pub fn new(cache: ClusterCache, cluster_domain: String) -> Self {
        Self::with_owner_lookup(cache, cluster_domain, default_owner_lookup())
    }

    #[must_use]
    pub fn with_owner_lookup(
        cache: ClusterCache,
        cluster_domain: String,
        owner_lookup: OwnerLookup,
    ) -> Self {
        let endpoints = EndpointsWatcher::new(cache.clone(), owner_lookup);
        endpoints.attach();
        let profiles = ProfileWatcher::new(cache);
        profiles.attach();
        Self {
            endpoints,
            profiles,
            cluster_domain,
        }
    }

    fn authority(&self, dest: &proto::GetDestination) -> Result<Authority, Status> {
        if dest.scheme != "k8s" {
            return Err(Status::invalid_argument(format!(
                "unsupported destination scheme: {:?}",
                dest.scheme
            )));
        }
        path::parse_authority(&dest.path, &self.cluster_domain).map_err(|error| match error {
            Error::HostNotFound(host) => {
                Status::not_found(format!("{host} is not a cluster-local host"))
            }
            other => Status::invalid_argument(other.to_string()),
        })
    }
}

#[tonic::async_trait]
impl proto::destination_server::Destination for DestinationService {
    type GetStream = ListenerStream<proto::Update>;

    async fn get(
        &self,
        request: Request<proto::GetDestination>,
    ) -> Result<Response<Self::GetStream>, Status> {
        let dest = request.into_inner();
        let authority = self.authority(&dest)?;
        tracing::debug!(
            service = %authority.name,
            namespace = %authority.namespace,
            port = authority.port,
            "Resolving destination",
        );
        let stream =
            self.endpoints
                .subscribe(&authority.namespace, &authority.name, authority.port)?;
        Ok(Response::new(stream))
    }

    type GetProfileStream = ListenerStream<proto::DestinationProfile>;

    async fn get_profile(
        &self,
        request: Request<proto::GetDestination>,
    ) -> Result<Response<Self::GetProfileStream>, Status> {
        let dest = request.into_inner();
        let authority = self.authority(&dest)?;
        let fqdn = authority.fqdn(&self.cluster_domain);
        let stream = self.profiles.subscribe(&authority.namespace, &fqdn)?;
        Ok(Response::new(stream))
    }
}

pub async fn serve(
    addr: std::net::SocketAddr,
    service: DestinationService,
    shutdown: drain::Watch,
) -> crate::error::Result<()> {
    let endpoints = service.endpoints.clone();
    let profiles = service.profiles.clone();
    tracing::info!(%addr, "Destination gRPC server listening");
    tonic::transport::Server::builder()
        .add_service(proto::destination_server::DestinationServer::new(service))
        .serve_with_shutdown(addr, async move {
            shutdown.signaled().await;
            // Active streams end with Unavailable rather than hanging on
            // the graceful-shutdown drain.
            endpoints.shutdown();
            profiles.shutdown();
        })
        .await?;
    Ok(())
}
