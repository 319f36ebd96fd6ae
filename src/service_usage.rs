//! Batched service enablement and listing for cloud projects.
//!
//! Enabling APIs on a project is slow and rate limited, and many resources tend to enable their
//! dependencies at the same time. Requests for the same project are combined so that one call
//! enables every service asked for during the batching window.

use std::{
    fmt::{Debug, Display},
    future::Future,
    sync::Arc,
    time::Duration,
};

use tracing::debug;

use crate::{error::BatchResult, BatchRequest, Batcher};

/// The service usage API refuses to enable more than this many services in one call.
pub const MAX_SERVICE_USAGE_BATCH_SIZE: usize = 20;

/// A batcher for service usage requests. Bodies and outputs are lists of service names.
pub type ServiceUsageBatcher<E> = Batcher<Vec<String>, Vec<String>, E>;

/// The downstream service usage API.
pub trait ServiceUsageClient: 'static + Send + Sync {
    /// The error returned by the API.
    type Error: Clone + Display + Debug + Send + Sync + 'static;

    /// Enable `services` on `project`. Never called with more than
    /// [`MAX_SERVICE_USAGE_BATCH_SIZE`] services.
    fn enable_services(
        &self,
        project: &str,
        services: &[String],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// List the services enabled on `project`.
    fn list_enabled_services(
        &self,
        project: &str,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;
}

/// The batch key for enabling services on `project`.
pub fn enable_services_key(project: &str) -> String {
    format!("project-services-{project}")
}

/// The batch key for listing services on `project`.
pub fn list_services_key(project: &str) -> String {
    format!("list-project-services-{project}")
}

/// Build a request to enable `services` on `project`.
///
/// Bodies are combined as an order-preserving union. The send enables the combined services in
/// chunks of [`MAX_SERVICE_USAGE_BATCH_SIZE`], stopping at the first failure, and returns the
/// combined list.
pub fn enable_services_request<C: ServiceUsageClient>(
    client: Arc<C>,
    project: &str,
    services: Vec<String>,
) -> BatchRequest<Vec<String>, Vec<String>, C::Error> {
    let debug_id = format!("Enable Project Services {project}: {services:?}");

    let request: BatchRequest<_, _, C::Error> = BatchRequest::new(project, services);
    request
        .with_combine(combine_services)
        .with_send(move |project, services| {
            let client = Arc::clone(&client);
            async move {
                for chunk in services.chunks(MAX_SERVICE_USAGE_BATCH_SIZE) {
                    client.enable_services(&project, chunk).await?;
                    debug!(
                        "Finished enabling next batch of {} project services: {:?}",
                        chunk.len(),
                        chunk
                    );
                }
                Ok(services)
            }
        })
        .with_debug_id(debug_id)
}

/// Build a request to list the services enabled on `project`.
///
/// Every caller in the batch shares the result of a single list call.
pub fn list_services_request<C: ServiceUsageClient>(
    client: Arc<C>,
    project: &str,
) -> BatchRequest<Vec<String>, Vec<String>, C::Error> {
    let request: BatchRequest<_, _, C::Error> = BatchRequest::new(project, Vec::new());
    request
        .with_combine(|current: &Vec<String>, _| Ok(current.clone()))
        .with_send(move |project, _| {
            let client = Arc::clone(&client);
            async move { client.list_enabled_services(&project).await }
        })
        .with_debug_id(format!("List Project Services {project}"))
}

/// Enable `services` on `project`, batched with any other enable requests for the same project.
pub async fn batch_enable_services<C: ServiceUsageClient>(
    batcher: &ServiceUsageBatcher<C::Error>,
    client: Arc<C>,
    project: &str,
    services: Vec<String>,
    timeout: Duration,
) -> BatchResult<(), C::Error> {
    if services.is_empty() {
        return Ok(());
    }

    let request = enable_services_request(client, project, services);
    batcher
        .submit(enable_services_key(project), request, timeout)
        .await
        .map(|_| ())
}

/// List the services enabled on `project`, sharing the call with concurrent callers.
pub async fn batch_list_services<C: ServiceUsageClient>(
    batcher: &ServiceUsageBatcher<C::Error>,
    client: Arc<C>,
    project: &str,
    timeout: Duration,
) -> BatchResult<Vec<String>, C::Error> {
    let request = list_services_request(client, project);
    batcher
        .submit(list_services_key(project), request, timeout)
        .await
}

/// Union of two service lists, keeping first-seen order.
#[allow(clippy::ptr_arg)]
fn combine_services<E>(current: &Vec<String>, new: Vec<String>) -> Result<Vec<String>, E> {
    let mut combined = current.clone();
    for service in new {
        if !combined.contains(&service) {
            combined.push(service);
        }
    }
    Ok(combined)
}
