use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use derivative::Derivative;
use futures::StreamExt;
use kube::api::{
    Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, Preconditions,
};
use kube::core::{ApiResource, GroupVersionKind as KubeGvk};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ObjectStore, StoreError, WatchEvent, WatchStream};
use crate::resources::{GroupVersionKind, Machine, MachineSet, Node};

/// An object store backed by the Kubernetes api server.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct KubeStore {
    #[derivative(Debug = "ignore")]
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = api_resource(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    async fn call<T, F>(&self, kind: &'static str, name: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| map_error(kind, name, e)),
            Err(_) => {
                debug!(kind, name, timeout = ?self.timeout, "Store call timed out");
                Err(StoreError::Timeout)
            }
        }
    }
}

pub(crate) fn api_resource(gvk: &GroupVersionKind) -> ApiResource {
    ApiResource::from_gvk_with_plural(&KubeGvk::gvk(gvk.group, gvk.version, gvk.kind), gvk.plural)
}

pub(crate) fn map_error(kind: &'static str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => StoreError::not_found(kind, name),
            409 if response.reason == "AlreadyExists" => StoreError::AlreadyExists {
                kind,
                name: name.to_owned(),
            },
            409 => StoreError::Conflict(response.message),
            401 | 403 => StoreError::Forbidden(response.message),
            400 | 422 => StoreError::Invalid(response.message),
            408 | 504 => StoreError::Timeout,
            _ => StoreError::Transient(response.message),
        },
        kube::Error::SerdeError(e) => StoreError::Serialization(e.to_string()),
        other => StoreError::Transient(other.to_string()),
    }
}

fn convert<S: Serialize, T: DeserializeOwned>(value: &S) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(value)?)?)
}

fn to_dynamic<S: Serialize>(value: &S, gvk: &GroupVersionKind) -> Result<DynamicObject, StoreError> {
    let mut value = serde_json::to_value(value)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("apiVersion".to_owned(), Value::String(gvk.api_version()));
        object.insert("kind".to_owned(), Value::String(gvk.kind.to_owned()));
    }
    Ok(serde_json::from_value(value)?)
}

/// Merge patches only add keys, absent optional fields have to be nulled explicitly.
fn null_missing(value: &mut Value, keys: &[&str]) {
    if let Some(object) = value.as_object_mut() {
        for key in keys {
            object.entry(*key).or_insert(Value::Null);
        }
    }
}

fn watch<T, K>(api: Api<K>) -> WatchStream<T>
where
    T: DeserializeOwned + Send + 'static,
    K: kube::Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug + Send + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .map(|event| -> Result<WatchEvent<T>, StoreError> {
            match event {
                Ok(watcher::Event::Applied(o)) => Ok(WatchEvent::Modified(convert(&o)?)),
                Ok(watcher::Event::Deleted(o)) => Ok(WatchEvent::Deleted(convert(&o)?)),
                Ok(watcher::Event::Restarted(objects)) => Ok(WatchEvent::Restarted(
                    objects.iter().map(convert).collect::<Result<_, _>>()?,
                )),
                Err(e) => Err(StoreError::Transient(e.to_string())),
            }
        })
        .boxed()
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_machineset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineSet>, StoreError> {
        let api = self.api(&MachineSet::GVK, Some(namespace));
        let object = self.call("MachineSet", name, api.get_opt(name)).await?;
        object.as_ref().map(convert).transpose()
    }

    async fn update_machineset_status(
        &self,
        machineset: &MachineSet,
    ) -> Result<MachineSet, StoreError> {
        let name = &machineset.metadata.name;
        let api = self.api(&MachineSet::GVK, Some(&machineset.metadata.namespace));
        let mut status = serde_json::to_value(&machineset.status)?;
        null_missing(
            &mut status,
            &["errorReason", "errorMessage", "conditions", "authoritativeAPI"],
        );
        let patch = json!({
            "metadata": { "resourceVersion": machineset.metadata.resource_version },
            "status": status,
        });
        let object = self
            .call(
                "MachineSet",
                name,
                api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await?;
        convert(&object)
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let api = self.api(&Machine::GVK, Some(&machine.metadata.namespace));
        let object = to_dynamic(machine, &Machine::GVK)?;
        let name = if machine.metadata.name.is_empty() {
            &machine.metadata.generate_name
        } else {
            &machine.metadata.name
        };
        let created = self
            .call(
                "Machine",
                name,
                api.create(&PostParams::default(), &object),
            )
            .await?;
        convert(&created)
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let name = &machine.metadata.name;
        let api = self.api(&Machine::GVK, Some(&machine.metadata.namespace));
        let patch = json!({
            "metadata": {
                "resourceVersion": machine.metadata.resource_version,
                "labels": machine.metadata.labels,
                "annotations": machine.metadata.annotations,
                "ownerReferences": machine.metadata.owner_references,
            }
        });
        let object = self
            .call(
                "Machine",
                name,
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await?;
        convert(&object)
    }

    async fn delete_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        let name = &machine.metadata.name;
        let api = self.api(&Machine::GVK, Some(&machine.metadata.namespace));
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(machine.metadata.uid.clone()),
                resource_version: None,
            }),
            ..Default::default()
        };
        self.call("Machine", name, api.delete(name, &params)).await?;
        Ok(())
    }

    fn watch_machinesets(&self, namespace: Option<&str>) -> WatchStream<MachineSet> {
        watch(self.api(&MachineSet::GVK, namespace))
    }

    fn watch_machines(&self, namespace: Option<&str>) -> WatchStream<Machine> {
        watch(self.api(&Machine::GVK, namespace))
    }

    fn watch_nodes(&self) -> WatchStream<Node> {
        let api: Api<k8s_openapi::api::core::v1::Node> = Api::all(self.client.clone());
        watch(api)
    }
}
