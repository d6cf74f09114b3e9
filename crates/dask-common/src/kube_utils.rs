//! Kubernetes helpers shared by the cluster and job controllers

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::naming::verify_existing;
use crate::Error;

/// Kubernetes condition status value for "True"
pub const STATUS_TRUE: &str = "True";

/// Fetch a namespaced object, mapping 404 to `None`.
pub async fn get_namespaced<K>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.get_opt(name).await
}

/// Create a namespaced object, treating 409 AlreadyExists as success when the
/// existing object is controlled by the same parent.
///
/// A pass that failed partway leaves earlier children in place; the next
/// pass may race its own observation and hit the conflict. A same-named
/// object controlled by anyone else is an ownership mismatch.
pub async fn create_namespaced<K>(client: &Client, namespace: &str, obj: &K) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let name = obj.name_any();
            debug!(name = %name, "object already exists, checking its controller");
            let existing = api.get(&name).await?;
            verify_existing(&existing, obj)
        }
        Err(e) => Err(e.into()),
    }
}

/// Patch the status sub-resource of a namespaced resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl Serialize,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Find the first condition of one of `types` whose status is "True"
pub fn first_true_condition<'a, T>(conditions: Option<&'a [T]>, types: &[&str]) -> Option<&'a T>
where
    T: HasConditionFields,
{
    conditions.and_then(|conds| {
        conds
            .iter()
            .find(|c| types.contains(&c.type_field()) && c.status_field() == STATUS_TRUE)
    })
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::batch::v1::JobCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}
