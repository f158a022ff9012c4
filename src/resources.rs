//! Child runtime resources for functions
//!
//! The reconciler drives function workloads through the [`ResourceClient`]
//! trait; [`KubeResourceClient`] is the kube-backed implementation that
//! materializes a Deployment, a NodePort Service, a configuration ConfigMap
//! and an optional Ingress per function.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec,
    Probe, Service, ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::crd::Function;
use crate::error::Result;

/// Name of the service port that carries function HTTP traffic
pub const CONTAINER_HTTP_PORT_NAME: &str = "http";

/// Port the function container listens on
pub const CONTAINER_HTTP_PORT: i32 = 8080;

/// Readiness wait bound applied when the spec leaves it at 0
pub const DEFAULT_READINESS_TIMEOUT_SECONDS: i64 = 120;

const FIELD_MANAGER: &str = "funcwave-operator";

const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle over the child resources materialized for a function.
#[derive(Debug, Default, Clone)]
pub struct FunctionResources {
    pub deployment: Option<Deployment>,
    pub service: Option<Service>,
    pub config_map: Option<ConfigMap>,
    pub ingress: Option<Ingress>,
}

impl FunctionResources {
    /// The function's network service, if one was materialized.
    pub fn service(&self) -> Option<&Service> {
        self.service.as_ref()
    }
}

/// Create/update/wait/delete of the child resources derived from a function.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Materialize (or converge) the function's child resources. Idempotent.
    async fn create_or_update(
        &self,
        function: &Function,
        image_pull_secrets: &str,
    ) -> Result<FunctionResources>;

    /// Block until the function's workload reports available. Callers bound
    /// the wait with a deadline; dropping the future cancels the wait.
    async fn wait_available(&self, namespace: &str, name: &str) -> Result<()>;

    /// Tear the child resources down. Deleting resources that are already
    /// gone is success.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Kube-backed [`ResourceClient`].
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply<K>(&self, namespace: &str, name: &str, resource: K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + fmt::Debug
            + DeserializeOwned
            + Serialize,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        match api.get(name).await {
            Ok(_existing) => Ok(api
                .patch(
                    name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Apply(&resource),
                )
                .await?),
            Err(_) => Ok(api.create(&PostParams::default(), &resource).await?),
        }
    }

    async fn delete_resource<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + fmt::Debug
            + DeserializeOwned
            + Serialize,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        match api.delete(name, &Default::default()).await {
            Ok(_) => {
                debug!(
                    "Deleted {} {}/{}",
                    K::kind(&Default::default()),
                    namespace,
                    name
                );
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn create_or_update(
        &self,
        function: &Function,
        image_pull_secrets: &str,
    ) -> Result<FunctionResources> {
        let name = function.name_any();
        let namespace = function
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        debug!(function = %name, namespace = %namespace, "Ensuring function resources");

        let config_map = self
            .apply(
                &namespace,
                &format!("{}-config", name),
                build_config_map(function)?,
            )
            .await?;

        let deployment = self
            .apply(
                &namespace,
                &name,
                build_deployment(function, image_pull_secrets),
            )
            .await?;

        let service = self.apply(&namespace, &name, build_service(function)).await?;

        let ingress = match build_ingress(function) {
            Some(ingress) => Some(self.apply(&namespace, &name, ingress).await?),
            None => {
                self.delete_resource::<Ingress>(&namespace, &name).await?;
                None
            }
        };

        Ok(FunctionResources {
            deployment: Some(deployment),
            service: Some(service),
            config_map: Some(config_map),
            ingress,
        })
    }

    async fn wait_available(&self, namespace: &str, name: &str) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);

        loop {
            match deployments.get(name).await {
                Ok(deployment) => {
                    if deployment_available(&deployment) {
                        return Ok(());
                    }
                }
                // resources may still be propagating
                Err(kube::Error::Api(err)) if err.code == 404 => {}
                Err(err) => return Err(err.into()),
            }

            tokio::time::sleep(AVAILABILITY_POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        info!(function = %name, namespace = %namespace, "Deleting function resources");

        self.delete_resource::<Ingress>(namespace, name).await?;
        self.delete_resource::<Service>(namespace, name).await?;
        self.delete_resource::<Deployment>(namespace, name).await?;
        self.delete_resource::<ConfigMap>(namespace, &format!("{}-config", name))
            .await?;

        Ok(())
    }
}

/// Whether a deployment reports itself available.
fn deployment_available(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    if status
        .conditions
        .as_ref()
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
    {
        return true;
    }

    status.available_replicas.unwrap_or(0) >= desired
}

fn function_labels(function: &Function) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "funcwave.io/function-name".to_string(),
        function.name_any(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels
}

fn pod_selector(function: &Function) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "funcwave.io/function-name".to_string(),
        function.name_any(),
    );
    labels
}

fn owner_reference(function: &Function) -> OwnerReference {
    OwnerReference {
        api_version: Function::api_version(&()).to_string(),
        kind: Function::kind(&()).to_string(),
        name: function.name_any(),
        uid: function.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn build_deployment(function: &Function, image_pull_secrets: &str) -> Deployment {
    let name = function.name_any();
    let labels = function_labels(function);
    let selector = pod_selector(function);

    let mut env_vars: Vec<EnvVar> = function
        .spec
        .env
        .iter()
        .map(|env| EnvVar {
            name: env.name.clone(),
            value: env.value.clone(),
            ..Default::default()
        })
        .collect();

    if let Some(handler) = &function.spec.handler {
        env_vars.push(EnvVar {
            name: "FUNCWAVE_HANDLER".to_string(),
            value: Some(handler.clone()),
            ..Default::default()
        });
    }

    let image_pull_secrets: Vec<LocalObjectReference> = image_pull_secrets
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|secret| LocalObjectReference {
            name: secret.trim().to_string(),
        })
        .collect();

    let container = Container {
        name: "function".to_string(),
        image: Some(function.spec.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some(CONTAINER_HTTP_PORT_NAME.to_string()),
            container_port: CONTAINER_HTTP_PORT,
            ..Default::default()
        }]),
        env: Some(env_vars),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(CONTAINER_HTTP_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(1),
            period_seconds: Some(3),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: function.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(function)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(function.spec.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    image_pull_secrets: if image_pull_secrets.is_empty() {
                        None
                    } else {
                        Some(image_pull_secrets)
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(function: &Function) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(function.name_any()),
            namespace: function.namespace(),
            labels: Some(function_labels(function)),
            owner_references: Some(vec![owner_reference(function)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(pod_selector(function)),
            ports: Some(vec![ServicePort {
                name: Some(CONTAINER_HTTP_PORT_NAME.to_string()),
                port: CONTAINER_HTTP_PORT,
                target_port: Some(IntOrString::Int(CONTAINER_HTTP_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_config_map(function: &Function) -> Result<ConfigMap> {
    let mut data = BTreeMap::new();
    data.insert(
        "function.json".to_string(),
        serde_json::to_string_pretty(&function.spec)?,
    );

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("{}-config", function.name_any())),
            namespace: function.namespace(),
            labels: Some(function_labels(function)),
            owner_references: Some(vec![owner_reference(function)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

fn build_ingress(function: &Function) -> Option<Ingress> {
    let route = function.spec.ingress.as_ref()?;

    Some(Ingress {
        metadata: ObjectMeta {
            name: Some(function.name_any()),
            namespace: function.namespace(),
            labels: Some(function_labels(function)),
            owner_references: Some(vec![owner_reference(function)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(route.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(route.path.clone()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: function.name_any(),
                                port: Some(ServiceBackendPort {
                                    name: Some(CONTAINER_HTTP_PORT_NAME.to_string()),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{FunctionIngress, FunctionSpec};
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

    fn test_function(name: &str) -> Function {
        Function {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: FunctionSpec {
                image: "example/fn:latest".to_string(),
                replicas: Some(2),
                ..serde_json::from_str("{}").unwrap()
            },
            status: None,
        }
    }

    #[test]
    fn test_build_deployment_basics() {
        let deployment = build_deployment(&test_function("fn1"), "pull-secret");

        assert_eq!(deployment.metadata.name.as_deref(), Some("fn1"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));

        let pod_spec = spec.template.spec.unwrap();
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("example/fn:latest"));
        assert_eq!(
            pod_spec.image_pull_secrets.unwrap()[0].name,
            "pull-secret"
        );

        let owner = &deployment.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Function");
        assert_eq!(owner.name, "fn1");
    }

    #[test]
    fn test_build_deployment_without_pull_secrets() {
        let deployment = build_deployment(&test_function("fn1"), "");
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod_spec.image_pull_secrets.is_none());
    }

    #[test]
    fn test_build_service_exposes_named_http_port() {
        let service = build_service(&test_function("fn1"));
        let spec = service.spec.unwrap();

        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some(CONTAINER_HTTP_PORT_NAME));
        assert_eq!(ports[0].port, CONTAINER_HTTP_PORT);
    }

    #[test]
    fn test_build_config_map_carries_spec_blob() {
        let config_map = build_config_map(&test_function("fn1")).unwrap();

        assert_eq!(config_map.metadata.name.as_deref(), Some("fn1-config"));
        let blob = &config_map.data.unwrap()["function.json"];
        assert!(blob.contains("example/fn:latest"));
    }

    #[test]
    fn test_build_ingress_only_when_requested() {
        assert!(build_ingress(&test_function("fn1")).is_none());

        let mut function = test_function("fn1");
        function.spec.ingress = Some(FunctionIngress {
            host: "fn1.example.com".to_string(),
            path: "/".to_string(),
        });

        let ingress = build_ingress(&function).unwrap();
        let rules = ingress.spec.unwrap().rules.unwrap();
        assert_eq!(rules[0].host.as_deref(), Some("fn1.example.com"));
    }

    #[test]
    fn test_deployment_available_via_condition() {
        let mut deployment = build_deployment(&test_function("fn1"), "");
        assert!(!deployment_available(&deployment));

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(deployment_available(&deployment));
    }

    #[test]
    fn test_deployment_available_via_replica_count() {
        let mut deployment = build_deployment(&test_function("fn1"), "");
        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            ..Default::default()
        });
        assert!(deployment_available(&deployment));

        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(1),
            ..Default::default()
        });
        assert!(!deployment_available(&deployment));
    }

    #[test]
    fn test_function_resources_service_accessor() {
        let resources = FunctionResources::default();
        assert!(resources.service().is_none());

        let resources = FunctionResources {
            service: Some(build_service(&test_function("fn1"))),
            ..Default::default()
        };
        assert!(resources.service().is_some());
    }
}
