//! Desired-state builders for preview environment child resources
//!
//! Each builder is a pure function from the PreviewEnvironment record (plus
//! its derived identity) to the complete target object for one child
//! resource: namespace, deployment, service or ingress. Builders are
//! idempotent - identical inputs produce identical objects - so the
//! controller can diff a build against observed cluster state.
//!
//! Builder contract: after a child resource has been created, only the
//! deployment's container image is kept in sync with the spec. Labels on
//! the namespace and the service/ingress specs are not reverted if mutated
//! externally; the image is the one field that legitimately changes across
//! the record's life (one per pushed commit).
//!
//! Every object carries an owner reference back to its PreviewEnvironment
//! so store-level garbage collection cascades when the record is deleted.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, Namespace, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::PreviewEnvironment;

/// Name shared by the deployment, service and ingress inside an
/// environment's namespace.
pub const APP_NAME: &str = "preview-app";

/// Port the deployed application listens on.
pub const APP_PORT: i32 = 3000;

/// Ingress controller class handling preview hostnames.
const INGRESS_CLASS: &str = "nginx";

/// Build the owner reference linking a child resource to its
/// PreviewEnvironment for cascade deletion.
pub fn owner_reference(preview: &PreviewEnvironment) -> OwnerReference {
    OwnerReference {
        api_version: "preview.ephemeral.dev/v1alpha1".to_string(),
        kind: "PreviewEnvironment".to_string(),
        name: preview.metadata.name.clone().unwrap_or_default(),
        uid: preview.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn app_labels(preview: &PreviewEnvironment) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), APP_NAME.to_string());
    labels.insert(
        "preview.ephemeral.dev/repo".to_string(),
        preview.spec.repo_name.clone(),
    );
    labels.insert(
        "preview.ephemeral.dev/pr".to_string(),
        preview.spec.pr_number.to_string(),
    );
    labels
}

/// Build the dedicated namespace for a preview environment.
///
/// Labels identify the managing controller and the originating repo/PR/user
/// for observability and selection.
pub fn build_namespace(preview: &PreviewEnvironment, ns_name: &str) -> Namespace {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        APP_NAME.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        format!("pr-{}", preview.spec.pr_number),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "preview-operator".to_string(),
    );
    labels.insert(
        "preview.ephemeral.dev/repo".to_string(),
        preview.spec.repo_name.clone(),
    );
    labels.insert(
        "preview.ephemeral.dev/pr".to_string(),
        preview.spec.pr_number.to_string(),
    );
    labels.insert(
        "preview.ephemeral.dev/user".to_string(),
        preview.spec.github_username.clone(),
    );

    Namespace {
        metadata: ObjectMeta {
            name: Some(ns_name.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(preview)]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build the application deployment for a preview environment.
///
/// One replica of the PR's image with fixed small resource bounds and
/// HTTP probes against the application port. The image is the only field
/// re-synced after creation.
pub fn build_deployment(preview: &PreviewEnvironment, ns_name: &str) -> Deployment {
    let labels = app_labels(preview);

    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), APP_NAME.to_string());

    let mut requests = BTreeMap::new();
    requests.insert("memory".to_string(), Quantity("32Mi".to_string()));
    requests.insert("cpu".to_string(), Quantity("50m".to_string()));

    let mut limits = BTreeMap::new();
    limits.insert("memory".to_string(), Quantity("64Mi".to_string()));
    limits.insert("cpu".to_string(), Quantity("100m".to_string()));

    let container = Container {
        name: APP_NAME.to_string(),
        image: Some(preview.spec.image_tag.clone()),
        ports: Some(vec![ContainerPort {
            container_port: APP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(APP_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(30),
            period_seconds: Some(10),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(APP_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(APP_NAME.to_string()),
            namespace: Some(ns_name.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(preview)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the cluster-internal service routing port 80 to the application.
pub fn build_service(preview: &PreviewEnvironment, ns_name: &str) -> Service {
    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), APP_NAME.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(APP_NAME.to_string()),
            namespace: Some(ns_name.to_string()),
            labels: Some(app_labels(preview)),
            owner_references: Some(vec![owner_reference(preview)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(APP_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ingress exposing the environment on its derived hostname.
///
/// The hostname must be the persisted one from status, not a fresh
/// derivation, so the published URL stays valid across commit updates.
pub fn build_ingress(preview: &PreviewEnvironment, ns_name: &str, hostname: &str) -> Ingress {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "nginx.ingress.kubernetes.io/rewrite-target".to_string(),
        "/".to_string(),
    );

    Ingress {
        metadata: ObjectMeta {
            name: Some(APP_NAME.to_string()),
            namespace: Some(ns_name.to_string()),
            labels: Some(app_labels(preview)),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(preview)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            rules: Some(vec![IngressRule {
                host: Some(hostname.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: APP_NAME.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(80),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PreviewEnvironmentSpec;

    fn sample_preview() -> PreviewEnvironment {
        PreviewEnvironment {
            metadata: ObjectMeta {
                name: Some("webshop-pr-42".to_string()),
                uid: Some("uid-1234".to_string()),
                ..Default::default()
            },
            spec: PreviewEnvironmentSpec {
                repo_name: "webshop".to_string(),
                pr_number: 42,
                branch: "feature/checkout".to_string(),
                commit_sha: "a1b2c3d4e5f6a7b8c9d0a1b2c3d4e5f6a7b8c9d0".to_string(),
                github_username: "alice".to_string(),
                image_tag: "ghcr.io/acme/webshop:pr-42-a1b2c3d".to_string(),
                ttl: None,
            },
            status: None,
        }
    }

    const NS: &str = "previewalice-pr42";
    const HOST: &str = "alice42a1b2c3d.apps.ephemeral.dev";

    #[test]
    fn namespace_carries_identifying_labels() {
        let ns = build_namespace(&sample_preview(), NS);
        assert_eq!(ns.metadata.name.as_deref(), Some(NS));

        let labels = ns.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by").map(String::as_str),
            Some("preview-operator")
        );
        assert_eq!(
            labels.get("preview.ephemeral.dev/repo").map(String::as_str),
            Some("webshop")
        );
        assert_eq!(
            labels.get("preview.ephemeral.dev/pr").map(String::as_str),
            Some("42")
        );
        assert_eq!(
            labels.get("preview.ephemeral.dev/user").map(String::as_str),
            Some("alice")
        );
    }

    #[test]
    fn all_children_carry_controller_owner_reference() {
        let preview = sample_preview();
        let metas = [
            build_namespace(&preview, NS).metadata,
            build_deployment(&preview, NS).metadata,
            build_service(&preview, NS).metadata,
            build_ingress(&preview, NS, HOST).metadata,
        ];

        for meta in metas {
            let refs = meta.owner_references.as_ref().unwrap();
            assert_eq!(refs.len(), 1);
            assert_eq!(refs[0].kind, "PreviewEnvironment");
            assert_eq!(refs[0].name, "webshop-pr-42");
            assert_eq!(refs[0].uid, "uid-1234");
            assert_eq!(refs[0].controller, Some(true));
        }
    }

    #[test]
    fn deployment_runs_the_spec_image_with_one_replica() {
        let deployment = build_deployment(&sample_preview(), NS);
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));

        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/acme/webshop:pr-42-a1b2c3d")
        );
        assert_eq!(
            container.ports.as_ref().unwrap()[0].container_port,
            APP_PORT
        );
    }

    #[test]
    fn deployment_probes_target_the_app_port() {
        let deployment = build_deployment(&sample_preview(), NS);
        let container = &deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0];

        let liveness = container.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.initial_delay_seconds, Some(30));
        assert_eq!(liveness.period_seconds, Some(10));
        assert_eq!(
            liveness.http_get.as_ref().unwrap().port,
            IntOrString::Int(APP_PORT)
        );

        // Readiness reacts faster than liveness
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(5));
        assert_eq!(readiness.period_seconds, Some(5));
    }

    #[test]
    fn deployment_has_fixed_resource_bounds() {
        let deployment = build_deployment(&sample_preview(), NS);
        let container = &deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0];
        let resources = container.resources.as_ref().unwrap();

        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests.get("memory"), Some(&Quantity("32Mi".to_string())));
        assert_eq!(requests.get("cpu"), Some(&Quantity("50m".to_string())));

        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(limits.get("memory"), Some(&Quantity("64Mi".to_string())));
        assert_eq!(limits.get("cpu"), Some(&Quantity("100m".to_string())));
    }

    #[test]
    fn service_routes_port_80_to_app_port() {
        let service = build_service(&sample_preview(), NS);
        let spec = service.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector.as_ref().unwrap().get("app").map(String::as_str),
            Some(APP_NAME)
        );

        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(APP_PORT)));
    }

    #[test]
    fn ingress_exposes_the_given_hostname() {
        let ingress = build_ingress(&sample_preview(), NS, HOST);
        let spec = ingress.spec.as_ref().unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));

        let rule = &spec.rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some(HOST));

        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.path_type, "Prefix");

        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, APP_NAME);
        assert_eq!(backend.port.as_ref().unwrap().number, Some(80));
    }

    /// Builders must be idempotent: the controller diffs fresh builds
    /// against observed state, so repeated builds have to be identical.
    #[test]
    fn repeated_builds_are_identical() {
        let preview = sample_preview();
        assert_eq!(build_namespace(&preview, NS), build_namespace(&preview, NS));
        assert_eq!(
            build_deployment(&preview, NS),
            build_deployment(&preview, NS)
        );
        assert_eq!(build_service(&preview, NS), build_service(&preview, NS));
        assert_eq!(
            build_ingress(&preview, NS, HOST),
            build_ingress(&preview, NS, HOST)
        );
    }
}
