//! # Exec module
//!
//! This module provide an helper to run a command inside a pod and collect
//! its output, used by the live reconfiguration protocol

use kube::{api::AttachParams, Api, Client};
use tokio::io::AsyncReadExt;
use tracing::debug;

use k8s_openapi::api::core::v1::Pod;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to attach to pod '{0}', {1}")]
    Attach(String, kube::Error),
    #[error("failed to read stream of pod '{0}', {1}")]
    Read(String, std::io::Error),
    #[error("failed to join attached process of pod '{0}', {1}")]
    Join(String, Box<dyn std::error::Error + Send + Sync>),
}

// -----------------------------------------------------------------------------
// Helpers functions

/// run the given command in the first container of the pod and return the
/// combined standard output and standard error once the process exits
pub async fn pod_exec(
    client: &Client,
    namespace: &str,
    pod: &str,
    command: Vec<String>,
) -> Result<String, Error> {
    let api: Api<Pod> = Api::namespaced(client.to_owned(), namespace);
    let params = AttachParams::default()
        .stdin(false)
        .stdout(true)
        .stderr(true)
        .tty(false);

    debug!(
        namespace = namespace,
        pod = pod,
        command = command.join(" "),
        "execute command in pod"
    );

    let mut attached = api
        .exec(pod, command, &params)
        .await
        .map_err(|err| Error::Attach(pod.to_string(), err))?;

    let mut output = String::new();

    if let Some(mut stdout) = attached.stdout() {
        let mut buf = Vec::new();

        stdout
            .read_to_end(&mut buf)
            .await
            .map_err(|err| Error::Read(pod.to_string(), err))?;

        output.push_str(&String::from_utf8_lossy(&buf));
    }

    if let Some(mut stderr) = attached.stderr() {
        let mut buf = Vec::new();

        stderr
            .read_to_end(&mut buf)
            .await
            .map_err(|err| Error::Read(pod.to_string(), err))?;

        output.push_str(&String::from_utf8_lossy(&buf));
    }

    attached
        .join()
        .await
        .map_err(|err| Error::Join(pod.to_string(), Box::new(err)))?;

    Ok(output)
}
