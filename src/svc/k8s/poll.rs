//! # Poll module
//!
//! This module provide polling helpers to wait for kubernetes workloads to
//! reach a desired state

use std::time::Duration;

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    batch::v1::Job,
    core::v1::Pod,
};
use kube::{api::ListParams, Api, Client};
use tracing::{debug, info};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Request(kube::Error),
    #[error("timed out waiting for '{0}' after {1:?}")]
    Deadline(String, Duration),
}

// -----------------------------------------------------------------------------
// Poller structure

/// repeatedly evaluate a condition until it holds or the optional deadline
/// elapses
pub struct Poller {
    interval: Duration,
    deadline: Option<Duration>,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            deadline: None,
        }
    }
}

impl Poller {
    pub fn new(interval: Duration, deadline: Option<Duration>) -> Self {
        Self { interval, deadline }
    }

    /// poll the given asynchronous condition until it returns true, the
    /// subject is only used to qualify logs and the deadline error
    pub async fn poll_until<F, Fut>(&self, subject: &str, mut condition: F) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool, Error>>,
    {
        let started = tokio::time::Instant::now();

        loop {
            if condition().await? {
                return Ok(());
            }

            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    return Err(Error::Deadline(subject.to_string(), deadline));
                }
            }

            debug!(subject = subject, "condition does not hold yet, retry");
            tokio::time::sleep(self.interval).await;
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// wait until at least `expected` pods matching the given label selector are
/// running in the namespace
pub async fn wait_for_pods(
    client: &Client,
    namespace: &str,
    selector: &str,
    expected: usize,
    poller: &Poller,
) -> Result<(), Error> {
    let api: Api<Pod> = Api::namespaced(client.to_owned(), namespace);
    let params = ListParams::default().labels(selector);

    info!(
        namespace = namespace,
        selector = selector,
        expected = expected,
        "wait for pods to be running"
    );

    poller
        .poll_until(selector, || {
            let api = api.to_owned();
            let params = params.to_owned();

            async move {
                let pods = api.list(&params).await.map_err(Error::Request)?;
                let running = pods
                    .items
                    .iter()
                    .filter(|pod| {
                        pod.status
                            .as_ref()
                            .and_then(|status| status.phase.as_deref())
                            == Some("Running")
                    })
                    .count();

                debug!(
                    selector = params.label_selector,
                    running = running,
                    expected = expected,
                    "pods status"
                );

                Ok(running >= expected)
            }
        })
        .await
}

/// wait until the statefulset has all of its replicas ready and updated
pub async fn wait_for_statefulset(
    client: &Client,
    namespace: &str,
    name: &str,
    poller: &Poller,
) -> Result<(), Error> {
    let api: Api<StatefulSet> = Api::namespaced(client.to_owned(), namespace);

    info!(
        namespace = namespace,
        name = name,
        "wait for statefulset rollout to complete"
    );

    poller
        .poll_until(name, || {
            let api = api.to_owned();
            let name = name.to_string();

            async move {
                let obj = api.get(&name).await.map_err(Error::Request)?;
                let replicas = obj
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.replicas)
                    .unwrap_or(1);

                let status = match obj.status {
                    Some(status) => status,
                    None => return Ok(false),
                };

                let ready = status.ready_replicas.unwrap_or(0);
                let updated = status.updated_replicas.unwrap_or(0);

                debug!(
                    name = name,
                    replicas = replicas,
                    ready = ready,
                    updated = updated,
                    "statefulset status"
                );

                Ok(ready == replicas && updated == replicas)
            }
        })
        .await
}

/// wait until the job has at least one succeeded completion
pub async fn wait_for_job(
    client: &Client,
    namespace: &str,
    name: &str,
    poller: &Poller,
) -> Result<(), Error> {
    let api: Api<Job> = Api::namespaced(client.to_owned(), namespace);

    info!(namespace = namespace, name = name, "wait for job to succeed");

    poller
        .poll_until(name, || {
            let api = api.to_owned();
            let name = name.to_string();

            async move {
                let obj = api.get(&name).await.map_err(Error::Request)?;
                let succeeded = obj
                    .status
                    .as_ref()
                    .and_then(|status| status.succeeded)
                    .unwrap_or(0);

                Ok(succeeded >= 1)
            }
        })
        .await
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::Poller;

    #[tokio::test]
    async fn poll_until_returns_once_the_condition_holds() {
        let poller = Poller::new(Duration::from_millis(1), None);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.to_owned();
        poller
            .poll_until("condition", move || {
                let counter = counter.to_owned();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            })
            .await
            .expect("condition to hold eventually");

        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn poll_until_honors_the_deadline() {
        let poller = Poller::new(Duration::from_millis(1), Some(Duration::from_millis(5)));

        let result = poller
            .poll_until("never", || async move { Ok(false) })
            .await;

        assert!(matches!(result, Err(super::Error::Deadline(_, _))));
    }
}
