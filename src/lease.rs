use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use tokio::sync::watch;

use crate::consts;
use crate::error::Result;

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Who holds the lease, as far as one observation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Ours,
    Free,
    Taken,
}

fn evaluate(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> Claim {
    let Some(spec) = spec else {
        return Claim::Free;
    };
    match spec.holder_identity.as_deref() {
        None | Some("") => Claim::Free,
        Some(holder) if holder == identity => Claim::Ours,
        Some(_) => {
            let duration = spec
                .lease_duration_seconds
                .map_or(LEASE_DURATION, |secs| Duration::from_secs(secs.max(0) as u64));
            let expired = spec.renew_time.as_ref().is_none_or(|renewed| {
                now.signed_duration_since(renewed.0).to_std().unwrap_or_default() > duration
            });
            if expired {
                Claim::Free
            } else {
                Claim::Taken
            }
        }
    }
}

/// Single-writer election on a coordination.k8s.io Lease. Exactly one
/// replica at a time reconciles slices; the rest stand by and watch the
/// leadership channel.
pub struct LeaseElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaseElector {
    #[must_use]
    pub fn new(client: kube::Client, namespace: &str, identity: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Drives the election until shutdown. Leadership transitions are
    /// published on the channel; on shutdown the lease is released so a
    /// standby can take over without waiting out the lease duration.
    pub async fn run(self, leadership: watch::Sender<bool>, shutdown: drain::Watch) {
        let mut ticker = tokio::time::interval(RETRY_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let signaled = shutdown.signaled();
        tokio::pin!(signaled);

        let mut leading = false;
        let mut last_renew = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = &mut signaled => {
                    if leading {
                        if let Err(error) = self.release().await {
                            tracing::warn!(%error, "Failed to release lease on shutdown");
                        }
                        let _ = leadership.send(false);
                    }
                    return;
                }
                _ = ticker.tick() => {
                    match self.try_acquire_or_renew().await {
                        Ok(true) => {
                            last_renew = tokio::time::Instant::now();
                            if !leading {
                                leading = true;
                                tracing::info!(identity = %self.identity, "Acquired write lease");
                                let _ = leadership.send(true);
                            }
                        }
                        Ok(false) => {
                            if leading {
                                leading = false;
                                tracing::warn!("Lost write lease to another replica");
                                let _ = leadership.send(false);
                            }
                        }
                        Err(error) => {
                            if leading && last_renew.elapsed() > RENEW_DEADLINE {
                                leading = false;
                                tracing::warn!(%error, "Lease renewal deadline exceeded");
                                let _ = leadership.send(false);
                            } else {
                                tracing::debug!(%error, "Lease attempt failed; retrying");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        match self.api.get_opt(consts::LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(consts::LEASE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(self.claimed_spec(None, now)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Another replica created it first.
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(error) => Err(error.into()),
                }
            }
            Some(mut lease) => match evaluate(lease.spec.as_ref(), &self.identity, now) {
                Claim::Taken => Ok(false),
                claim => {
                    let previous = lease.spec.take();
                    lease.spec = Some(match claim {
                        Claim::Ours => self.renewed_spec(previous, now),
                        _ => self.claimed_spec(previous, now),
                    });
                    // replace() carries the resource version we read, so a
                    // concurrent claim surfaces as a conflict.
                    match self
                        .api
                        .replace(consts::LEASE_NAME, &PostParams::default(), &lease)
                        .await
                    {
                        Ok(_) => Ok(true),
                        Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                        Err(error) => Err(error.into()),
                    }
                }
            },
        }
    }

    fn claimed_spec(&self, previous: Option<LeaseSpec>, now: DateTime<Utc>) -> LeaseSpec {
        let transitions = previous
            .as_ref()
            .and_then(|spec| spec.lease_transitions)
            .unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions + 1),
            preferred_holder: None,
            strategy: None,
        }
    }

    fn renewed_spec(&self, previous: Option<LeaseSpec>, now: DateTime<Utc>) -> LeaseSpec {
        let mut spec = previous.unwrap_or_default();
        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(LEASE_DURATION.as_secs() as i32);
        spec.renew_time = Some(MicroTime(now));
        spec
    }

    async fn release(&self) -> Result<()> {
        let Some(mut lease) = self.api.get_opt(consts::LEASE_NAME).await? else {
            return Ok(());
        };
        if evaluate(lease.spec.as_ref(), &self.identity, Utc::now()) != Claim::Ours {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
            spec.acquire_time = None;
        }
        self.api
            .replace(consts::LEASE_NAME, &PostParams::default(), &lease)
            .await?;
        tracing::info!("Released write lease");
        Ok(())
    }
}
