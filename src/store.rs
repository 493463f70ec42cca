//! Document persistence: the four named documents (`services`,
//! `servicespecs`, `subscriptions`, `nodestatuses`) the rest of the
//! controller treats as its durable state.
//!
//! Each document is a single named custom resource holding a `data` blob —
//! there is exactly one named instance per document kind, not one object
//! per service/subscription. [`DocumentStore`] abstracts the read/replace
//! pair so the coordinator and placement engine never talk to `kube`
//! directly; [`KubeDocumentStore`] is the production implementation and
//! [`InMemoryDocumentStore`] backs the test suite.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

use crate::error::{Error, Result};

pub const DOC_SERVICES: DocumentKind = DocumentKind {
    plural: "services",
    name: "service-info",
};
pub const DOC_SERVICESPECS: DocumentKind = DocumentKind {
    plural: "servicespecs",
    name: "servicespec-info",
};
pub const DOC_SUBSCRIPTIONS: DocumentKind = DocumentKind {
    plural: "subscriptions",
    name: "subscription-info",
};
pub const DOC_NODESTATUSES: DocumentKind = DocumentKind {
    plural: "nodestatuses",
    name: "nodestatus-info",
};

/// A document's resource plural and the single name it is always stored
/// under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentKind {
    pub plural: &'static str,
    pub name: &'static str,
}

/// Read/replace access to the four named documents, independent of the
/// backing store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the `data` payload of `kind`, or `None` if it has never been
    /// written.
    async fn read(&self, kind: DocumentKind) -> Result<Option<Value>>;

    /// Upsert `data` as the `data` payload of `kind`.
    async fn write(&self, kind: DocumentKind, data: Value) -> Result<()>;
}

/// Typed convenience wrappers mirroring the reference `load_*`/`save_*`
/// helpers: callers work in `Vec<Service>` etc., not raw JSON.
pub struct Documents<'a> {
    store: &'a dyn DocumentStore,
}

impl<'a> Documents<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store }
    }

    async fn load<T: DeserializeOwned + Default>(&self, kind: DocumentKind) -> Result<T> {
        match self.store.read(kind).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::StoreUnavailable(format!("malformed {}: {e}", kind.plural))),
            None => Ok(T::default()),
        }
    }

    async fn save<T: Serialize>(&self, kind: DocumentKind, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)
            .map_err(|e| Error::Internal(format!("failed to serialize {}: {e}", kind.plural)))?;
        self.store.write(kind, value).await
    }

    pub async fn load_services(&self) -> Result<Vec<crate::domain::Service>> {
        self.load(DOC_SERVICES).await
    }

    pub async fn save_services(&self, services: &[crate::domain::Service]) -> Result<()> {
        self.save(DOC_SERVICES, &services).await
    }

    pub async fn load_service_specs(&self) -> Result<Vec<crate::domain::ServiceSpec>> {
        self.load(DOC_SERVICESPECS).await
    }

    pub async fn save_service_specs(&self, specs: &[crate::domain::ServiceSpec]) -> Result<()> {
        self.save(DOC_SERVICESPECS, &specs).await
    }

    pub async fn load_subscriptions(&self) -> Result<Vec<crate::domain::Subscription>> {
        self.load(DOC_SUBSCRIPTIONS).await
    }

    pub async fn save_subscriptions(&self, subs: &[crate::domain::Subscription]) -> Result<()> {
        self.save(DOC_SUBSCRIPTIONS, &subs).await
    }

    pub async fn load_node_status(&self) -> Result<crate::domain::NodeStatus> {
        self.load(DOC_NODESTATUSES).await
    }

    pub async fn save_node_status(&self, status: &crate::domain::NodeStatus) -> Result<()> {
        self.save(DOC_NODESTATUSES, &status).await
    }
}

/// `DocumentStore` backed by a single custom-resource `Data` kind per
/// document, addressed by `(group, version, plural)` and a fixed name.
pub struct KubeDocumentStore {
    client: Client,
    namespace: String,
    group: String,
    version: String,
}

impl KubeDocumentStore {
    pub fn new(client: Client, namespace: impl Into<String>, group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            group: group.into(),
            version: version.into(),
        }
    }

    fn api(&self, kind: DocumentKind) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, "Data");
        let ar = ApiResource::from_gvk_with_plural(&gvk, kind.plural);
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }
}

#[async_trait]
impl DocumentStore for KubeDocumentStore {
    #[instrument(skip(self), fields(plural = kind.plural))]
    async fn read(&self, kind: DocumentKind) -> Result<Option<Value>> {
        match self.api(kind).get(kind.name).await {
            Ok(obj) => Ok(obj.data.get("data").cloned()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => {
                warn!(error = %e, "document read failed");
                Err(Error::Cluster(e))
            }
        }
    }

    #[instrument(skip(self, data), fields(plural = kind.plural))]
    async fn write(&self, kind: DocumentKind, data: Value) -> Result<()> {
        let body = json!({
            "apiVersion": format!("{}/{}", self.group, self.version),
            "kind": "Data",
            "metadata": { "name": kind.name },
            "data": data,
        });
        self.api(kind)
            .patch(kind.name, &PatchParams::apply("arha-controller").force(), &Patch::Apply(body))
            .await
            .map_err(Error::Cluster)?;
        Ok(())
    }
}

/// In-process `DocumentStore` used by tests and by any tooling that wants
/// to exercise the coordinator without a cluster.
#[derive(Default, Clone)]
pub struct InMemoryDocumentStore {
    documents: Arc<RwLock<HashMap<&'static str, Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self, kind: DocumentKind) -> Result<Option<Value>> {
        Ok(self.documents.read().await.get(kind.plural).cloned())
    }

    async fn write(&self, kind: DocumentKind, data: Value) -> Result<()> {
        self.documents.write().await.insert(kind.plural, data);
        Ok(())
    }
}
