use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::client::Error;

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::Url;

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";
const JSON: &str = "application/json";

pub fn get_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()), false)?;
    Ok(make_req(url, Method::GET, client_config).body(Body::empty())?)
}

pub fn create_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let namespace = resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str);
    let url = make_url(client_config, k8s_type, namespace, None, false)?;
    let body = serde_json::to_vec(resource)?;
    Ok(make_req(url, Method::POST, client_config)
        .header(header::CONTENT_TYPE, JSON)
        .body(Body::from(body))?)
}

pub fn replace_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()), false)?;
    let body = serde_json::to_vec(resource)?;
    Ok(make_req(url, Method::PUT, client_config)
        .header(header::CONTENT_TYPE, JSON)
        .body(Body::from(body))?)
}

/// A PUT to the status subresource. The api server ignores everything but the status in the body.
pub fn replace_status_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()), true)?;
    let body = serde_json::to_vec(resource)?;
    Ok(make_req(url, Method::PUT, client_config)
        .header(header::CONTENT_TYPE, JSON)
        .body(Body::from(body))?)
}

pub fn watch_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource_version: Option<&str>,
    label_selector: Option<&str>,
    timeout_seconds: Option<u32>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None, false)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        if let Some(vers) = resource_version {
            query.append_pair("resourceVersion", vers);
        }
        if let Some(selector) = label_selector {
            query.append_pair("labelSelector", selector);
        }
        if let Some(timeout) = timeout_seconds {
            query.append_pair("timeoutSeconds", &timeout.to_string());
        }
    }
    Ok(make_req(url, Method::GET, client_config).body(Body::empty())?)
}

pub fn list_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    label_selector: Option<&str>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None, false)?;
    if let Some(selector) = label_selector {
        url.query_pairs_mut().append_pair("labelSelector", selector);
    }
    Ok(make_req(url, Method::GET, client_config).body(Body::empty())?)
}

fn make_req(url: Url, method: Method, client_config: &ClientConfig) -> http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(header::USER_AGENT, client_config.user_agent.as_str());
    if let Some(auth) = client_config.credentials.header_value() {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    if let Some(user) = client_config.impersonate.as_ref() {
        builder = builder.header(IMPERSONATE_USER, user.as_str());
        for group in client_config.impersonate_groups.iter() {
            builder = builder.header(IMPERSONATE_GROUP, group.as_str());
        }
    }
    builder
}

fn make_url(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
    status: bool,
) -> Result<Url, Error> {
    let invalid = || Error::InvalidUrl(client_config.api_server_endpoint.clone());
    let mut url = Url::parse(client_config.api_server_endpoint.as_str()).map_err(|_| invalid())?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| invalid())?;
        segments.pop_if_empty();

        let group = k8s_type.group();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(k8s_type.version());
        if let Some(ns) = namespace {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
            if status {
                segments.push("status");
            }
        }
    }
    Ok(url)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Credentials;
    use crate::k8s_types;

    fn config() -> ClientConfig {
        ClientConfig {
            api_server_endpoint: "https://10.0.0.1:6443".to_owned(),
            credentials: Credentials::bearer_token("abc"),
            ca_data: None,
            user_agent: "siab-operator".to_owned(),
            impersonate: Some("admin".to_owned()),
            impersonate_groups: vec!["system:masters".to_owned()],
            verify_ssl_certs: true,
        }
    }

    #[test]
    fn urls_are_built_for_core_and_grouped_types() {
        let config = config();
        let id = ObjectIdRef::new("apps", "web");

        let req = get_request(&config, k8s_types::core::v1::Service, &id).expect("request");
        assert_eq!(
            "https://10.0.0.1:6443/api/v1/namespaces/apps/services/web",
            req.uri().to_string()
        );

        let req = replace_status_request(
            &config,
            k8s_types::siab_io::v1alpha1::SIABApplication,
            &id,
            &Value::Null,
        )
        .expect("request");
        assert_eq!(Method::PUT, *req.method());
        assert_eq!(
            "https://10.0.0.1:6443/apis/siab.io/v1alpha1/namespaces/apps/siabapplications/web/status",
            req.uri().to_string()
        );

        let req = watch_request(
            &config,
            k8s_types::apps::v1::Deployment,
            Some("42"),
            Some("siab.io/application"),
            None,
            None,
        )
        .expect("request");
        assert_eq!(
            "https://10.0.0.1:6443/apis/apps/v1/deployments?watch=true&resourceVersion=42&labelSelector=siab.io%2Fapplication",
            req.uri().to_string()
        );
    }

    #[test]
    fn requests_carry_auth_and_impersonation_headers() {
        let config = config();
        let req = list_request(&config, k8s_types::core::v1::PersistentVolumeClaim, None, Some("apps"))
            .expect("request");
        let headers = req.headers();
        assert_eq!(Some("Bearer abc"), headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()));
        assert_eq!(Some("siab-operator"), headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()));
        assert_eq!(Some("admin"), headers.get(IMPERSONATE_USER).and_then(|v| v.to_str().ok()));
        assert_eq!(1, headers.get_all(IMPERSONATE_GROUP).iter().count());
    }

    #[test]
    fn invalid_endpoint_is_an_error() {
        let mut config = config();
        config.api_server_endpoint = "not a url".to_owned();
        let id = ObjectIdRef::new("apps", "web");
        assert!(get_request(&config, k8s_types::core::v1::Service, &id).is_err());
    }
}
