//! Leader election over a `coordination.k8s.io/v1` Lease.

use std::time::{Duration, Instant};

use derivative::Derivative;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{DateTime, TimeZone, Utc};
use kube::api::{Api, PostParams};
use kube::Client;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::store::kubernetes::map_error;
use crate::store::StoreError;

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub namespace: String,
    pub name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub api_timeout: Duration,
}

/// Whether `identity` may take or keep the lease as of `now`.
pub fn should_acquire(
    holder: Option<&str>,
    renew_time: Option<OffsetDateTime>,
    lease_duration: Duration,
    identity: &str,
    now: OffsetDateTime,
) -> bool {
    match holder {
        None | Some("") => true,
        Some(holder) if holder == identity => true,
        Some(_) => match renew_time {
            Some(renewed) => renewed + lease_duration < now,
            None => true,
        },
    }
}

fn to_micro_time(t: OffsetDateTime) -> Option<MicroTime> {
    Utc.timestamp_opt(t.unix_timestamp(), t.nanosecond())
        .single()
        .map(MicroTime)
}

fn from_micro_time(t: &MicroTime) -> Option<OffsetDateTime> {
    let dt: &DateTime<Utc> = &t.0;
    OffsetDateTime::from_unix_timestamp_nanos(dt.timestamp_nanos_opt()?.into()).ok()
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct LeaderElector {
    #[derivative(Debug = "ignore")]
    client: Client,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        Self { client, config }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.api_timeout, fut).await {
            Ok(result) => result.map_err(|e| map_error("Lease", &self.config.name, e)),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Take the lease if it is free or expired, or renew it if we hold it.
    #[tracing::instrument(level = "debug", skip(self), fields(lease = %self.config.name))]
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.api();
        let now = OffsetDateTime::now_utc();
        let lease_duration_seconds = self.config.lease_duration.as_secs() as i32;

        let Some(mut lease) = self.call(api.get_opt(&self.config.name)).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.name.clone()),
                    namespace: Some(self.config.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: Some(lease_duration_seconds),
                    acquire_time: to_micro_time(now),
                    renew_time: to_micro_time(now),
                    lease_transitions: Some(0),
                }),
            };
            return match self.call(api.create(&PostParams::default(), &lease)).await {
                Ok(_) => Ok(true),
                Err(StoreError::AlreadyExists { .. }) | Err(StoreError::Conflict(_)) => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.as_deref();
        let duration = spec
            .lease_duration_seconds
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(self.config.lease_duration);
        let renewed = spec.renew_time.as_ref().and_then(from_micro_time);
        if !should_acquire(holder, renewed, duration, &self.config.identity, now) {
            debug!(holder, "Lease held by another candidate");
            return Ok(false);
        }

        let transition = holder != Some(self.config.identity.as_str());
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(lease_duration_seconds),
            acquire_time: if transition {
                to_micro_time(now)
            } else {
                spec.acquire_time.clone()
            },
            renew_time: to_micro_time(now),
            lease_transitions: Some(
                spec.lease_transitions.unwrap_or_default() + i32::from(transition),
            ),
        });
        match self
            .call(api.replace(&self.config.name, &PostParams::default(), &lease))
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the lease is held.
    pub async fn acquire(&self) {
        info!(identity = %self.config.identity, lease = %self.config.name, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Acquired leadership");
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to acquire lease"),
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }

    /// Keep renewing the lease, returning once it could not be renewed within the renew deadline.
    pub async fn hold(&self) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::time::sleep(self.config.retry_period).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    warn!("Lease taken by another candidate");
                    return;
                }
                Err(e) => warn!(error = %e, "Failed to renew lease"),
            }
            if last_renewal.elapsed() > self.config.renew_deadline {
                warn!(deadline = ?self.config.renew_deadline, "Failed to renew lease before deadline");
                return;
            }
        }
    }

    /// Give up the lease so another candidate can take over without waiting for expiry.
    pub async fn release(&self) -> Result<(), Error> {
        let api = self.api();
        let Some(mut lease) = self.call(api.get_opt(&self.config.name)).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        self.call(api.replace(&self.config.name, &PostParams::default(), &lease))
            .await?;
        info!("Released leadership");
        Ok(())
    }
}
