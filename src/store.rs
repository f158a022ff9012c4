//! Object store abstraction
//!
//! The operator observes and updates typed objects through the `ObjectStore`
//! trait; `KubeObjectStore` is the kube-backed implementation. Workers
//! dispatch cached objects through the `StoreObject` handle so a single
//! operator implementation can serve any resource kind.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, PostParams, WatchParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::Function;
use crate::error::{OperatorError, Result};

/// Identity of a watched object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Uniform handle for objects flowing through the operator.
///
/// Handlers receive `Arc<dyn StoreObject>` and downcast to their concrete
/// kind; a failed downcast is a poison event, not a crash.
pub trait StoreObject: Any + Send + Sync + fmt::Debug {
    fn object_key(&self) -> ObjectKey;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl StoreObject for Function {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::new(
            self.namespace().unwrap_or_else(|| "default".to_string()),
            self.name_any(),
        )
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// A single event observed on a watch stream
#[derive(Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying the latest resource version
    Bookmark(String),
    /// Stream-level error; the informer re-lists to recover
    Error(OperatorError),
}

/// Result of listing a namespace
#[derive(Debug)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

pub type EventStream<K> = BoxStream<'static, WatchEvent<K>>;

/// List/Watch/Update access to a typed object family in a namespace.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn list(&self, namespace: &str) -> Result<ObjectList<K>>;

    async fn watch(&self, namespace: &str, resource_version: &str) -> Result<EventStream<K>>;

    /// Update the object in the store. Optimistic-concurrency conflicts
    /// surface as errors; the operator resolves them by requeueing against
    /// the then-latest cached object.
    async fn update(&self, object: &K) -> Result<K>;
}

/// Kube-backed `ObjectStore` over `kube::Api`.
pub struct KubeObjectStore<K> {
    client: Client,
    _marker: PhantomData<fn() -> K>,
}

impl<K> KubeObjectStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeObjectStore<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn list(&self, namespace: &str) -> Result<ObjectList<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        Ok(ObjectList {
            resource_version: list.metadata.resource_version.clone().unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, namespace: &str, resource_version: &str) -> Result<EventStream<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let stream = api.watch(&WatchParams::default(), resource_version).await?;

        Ok(stream
            .map(|event| match event {
                Ok(kube::core::WatchEvent::Added(obj)) => WatchEvent::Added(obj),
                Ok(kube::core::WatchEvent::Modified(obj)) => WatchEvent::Modified(obj),
                Ok(kube::core::WatchEvent::Deleted(obj)) => WatchEvent::Deleted(obj),
                Ok(kube::core::WatchEvent::Bookmark(bookmark)) => {
                    WatchEvent::Bookmark(bookmark.metadata.resource_version)
                }
                Ok(kube::core::WatchEvent::Error(err)) => {
                    WatchEvent::Error(OperatorError::KubeApi(err.to_string()))
                }
                Err(err) => WatchEvent::Error(err.into()),
            })
            .boxed())
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or_else(|| OperatorError::Configuration("object has no name".to_string()))?;
        let namespace = object
            .meta()
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace(&name, &PostParams::default(), object).await?)
    }
}
