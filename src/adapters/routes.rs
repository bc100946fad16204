//! External route rendering
//!
//! Routes are modeled as networking.k8s.io/v1 Ingress objects pointing at
//! the registry service. The generated default route is derived from the
//! platform ingress domain; user routes are taken from the spec verbatim.

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::adapters::deployment::{app_labels, REGISTRY_APP_NAME, REGISTRY_PORT};
use crate::crd::ImageRegistrySpec;

/// Name of the generated default route
pub const DEFAULT_ROUTE_NAME: &str = "default-route";

/// One desired external route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub name: String,
    pub hostname: String,
    pub secret_name: Option<String>,
}

/// Routes the registry should expose.
///
/// The default route needs a platform ingress domain to derive a hostname
/// from; without one it is skipped.
pub fn desired_routes(
    spec: &ImageRegistrySpec,
    namespace: &str,
    ingress_domain: Option<&str>,
) -> Vec<RoutePlan> {
    let mut routes = Vec::new();
    if spec.default_route {
        if let Some(domain) = ingress_domain {
            routes.push(RoutePlan {
                name: DEFAULT_ROUTE_NAME.to_string(),
                hostname: format!("{}-{}.{}", REGISTRY_APP_NAME, namespace, domain),
                secret_name: None,
            });
        }
    }
    for route in &spec.routes {
        routes.push(RoutePlan {
            name: route.name.clone(),
            hostname: route.hostname.clone(),
            secret_name: route.secret_name.clone(),
        });
    }
    routes
}

impl RoutePlan {
    /// Render the Ingress object for this route
    pub fn to_ingress(&self, namespace: &str) -> Ingress {
        let backend = IngressBackend {
            service: Some(IngressServiceBackend {
                name: REGISTRY_APP_NAME.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(REGISTRY_PORT),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };
        let tls = self.secret_name.as_ref().map(|secret| {
            vec![IngressTLS {
                hosts: Some(vec![self.hostname.clone()]),
                secret_name: Some(secret.clone()),
            }]
        });

        Ingress {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(app_labels()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(self.hostname.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend,
                        }],
                    }),
                }]),
                tls,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
