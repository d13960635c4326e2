use super::workload::CONTAINER_PORT_NAME;
use super::{child_metadata, selector_labels, validate_port, BuildError, BuildSettings};
use crate::application::{Application, ApplicationSpec};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Builds the cluster-internal Service in front of the workload's pods
pub fn build(
    app: &Application,
    spec: &ApplicationSpec,
    settings: &BuildSettings,
) -> Result<Service, BuildError> {
    let port = validate_port(spec.port())?;
    Ok(Service {
        metadata: child_metadata(app, app.name().to_owned(), settings),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_owned()),
            selector: Some(selector_labels(app.name())),
            ports: Some(vec![ServicePort {
                name: Some(CONTAINER_PORT_NAME.to_owned()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_owned()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::application::defaults::defaults;
    use crate::builders::test::app_with_spec;

    #[test]
    fn service_exposes_application_port() {
        let mut spec = ApplicationSpec::new("nginx");
        spec.port = Some(3000);
        let spec = defaults(&spec);
        let app = app_with_spec(spec.clone());

        let service = build(&app, &spec, &BuildSettings::default()).expect("build failed");
        assert_eq!(Some("web"), service.metadata.name.as_deref());
        let service_spec = service.spec.expect("spec");
        assert_eq!(Some("ClusterIP"), service_spec.type_.as_deref());
        assert_eq!(Some(selector_labels("web")), service_spec.selector);
        assert!(service_spec.cluster_ip.is_none());

        let port = &service_spec.ports.expect("ports")[0];
        assert_eq!(3000, port.port);
        assert_eq!(Some(IntOrString::Int(3000)), port.target_port);
        assert_eq!(Some("TCP"), port.protocol.as_deref());
    }
}
