//! Platform defaults for unset spec fields. `defaults` only ever fills in fields that are `None`,
//! so applying it twice gives the same result as applying it once.
use super::quantity;
use super::{
    ApplicationSpec, HealthCheckSpec, NetworkingSpec, ResourceList, ResourcesSpec, SecuritySpec,
    StorageSpec,
};

pub const DEFAULT_REPLICAS: i32 = 1;
pub const DEFAULT_PORT: i32 = 8080;

pub const DEFAULT_CPU_REQUEST: &str = "100m";
pub const DEFAULT_MEMORY_REQUEST: &str = "128Mi";
pub const DEFAULT_CPU_LIMIT: &str = "500m";
pub const DEFAULT_MEMORY_LIMIT: &str = "512Mi";

pub const DEFAULT_SECCOMP_PROFILE: &str = "RuntimeDefault";

pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/health";
pub const DEFAULT_INITIAL_DELAY_SECONDS: i32 = 30;
pub const DEFAULT_PERIOD_SECONDS: i32 = 10;
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 5;
pub const DEFAULT_FAILURE_THRESHOLD: i32 = 3;

pub const DEFAULT_MOUNT_PATH: &str = "/data";
pub const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// Returns a copy of `spec` with every unset optional field filled in
pub fn defaults(spec: &ApplicationSpec) -> ApplicationSpec {
    let mut spec = spec.clone();

    let port = *spec.port.get_or_insert(DEFAULT_PORT);
    spec.replicas.get_or_insert(DEFAULT_REPLICAS);

    let resources = spec.resources.get_or_insert_with(ResourcesSpec::default);
    default_resources(resources);

    let security = spec.security.get_or_insert_with(SecuritySpec::default);
    default_security(security);

    let health_check = spec.health_check.get_or_insert_with(HealthCheckSpec::default);
    default_health_check(health_check, port);

    if let Some(storage) = spec.storage.as_mut() {
        default_storage(storage);
    }
    if let Some(networking) = spec.networking.as_mut() {
        default_networking(networking);
    }
    if let Some(ingress) = spec.ingress.as_mut() {
        ingress.enabled.get_or_insert(false);
    }
    spec
}

fn default_resources(resources: &mut ResourcesSpec) {
    let explicit_requests = resources.requests.clone().unwrap_or_default();
    let limits = resources.limits.get_or_insert_with(ResourceList::default);
    let cpu_limit = limits
        .cpu
        .get_or_insert_with(|| default_limit(DEFAULT_CPU_LIMIT, explicit_requests.cpu.as_deref()))
        .clone();
    let memory_limit = limits
        .memory
        .get_or_insert_with(|| {
            default_limit(DEFAULT_MEMORY_LIMIT, explicit_requests.memory.as_deref())
        })
        .clone();

    let requests = resources.requests.get_or_insert_with(ResourceList::default);
    requests
        .cpu
        .get_or_insert_with(|| default_request(DEFAULT_CPU_REQUEST, &cpu_limit));
    requests
        .memory
        .get_or_insert_with(|| default_request(DEFAULT_MEMORY_REQUEST, &memory_limit));
}

/// The default limit, raised to the request if the user set a request above it
fn default_limit(default: &str, request: Option<&str>) -> String {
    match request.map(|r| (r, quantity::parse(r))) {
        Some((request, Ok(request_value))) => match quantity::parse(default) {
            Ok(default_value) if request_value > default_value => request.to_owned(),
            _ => default.to_owned(),
        },
        _ => default.to_owned(),
    }
}

/// The default request, lowered to the limit if the user set a limit below it
fn default_request(default: &str, limit: &str) -> String {
    match (quantity::parse(default), quantity::parse(limit)) {
        (Ok(default_value), Ok(limit_value)) if limit_value < default_value => limit.to_owned(),
        _ => default.to_owned(),
    }
}

fn default_security(security: &mut SecuritySpec) {
    security.scan_on_deploy.get_or_insert(true);
    security.block_critical_vulns.get_or_insert(true);
    security.run_as_non_root.get_or_insert(true);
    security.read_only_root_filesystem.get_or_insert(true);
    security.allow_privilege_escalation.get_or_insert(false);
    security
        .seccomp_profile
        .get_or_insert_with(|| DEFAULT_SECCOMP_PROFILE.to_owned());
}

fn default_health_check(health_check: &mut HealthCheckSpec, port: i32) {
    health_check.enabled.get_or_insert(true);
    health_check
        .path
        .get_or_insert_with(|| DEFAULT_HEALTH_CHECK_PATH.to_owned());
    health_check.port.get_or_insert(port);
    health_check
        .initial_delay_seconds
        .get_or_insert(DEFAULT_INITIAL_DELAY_SECONDS);
    health_check.period_seconds.get_or_insert(DEFAULT_PERIOD_SECONDS);
    health_check
        .timeout_seconds
        .get_or_insert(DEFAULT_TIMEOUT_SECONDS);
    health_check
        .failure_threshold
        .get_or_insert(DEFAULT_FAILURE_THRESHOLD);
}

fn default_storage(storage: &mut StorageSpec) {
    storage.enabled.get_or_insert(false);
    storage
        .mount_path
        .get_or_insert_with(|| DEFAULT_MOUNT_PATH.to_owned());
    storage
        .access_mode
        .get_or_insert_with(|| DEFAULT_ACCESS_MODE.to_owned());
}

fn default_networking(networking: &mut NetworkingSpec) {
    let mut seen = std::collections::HashSet::with_capacity(networking.allow_ingress_from.len());
    networking
        .allow_ingress_from
        .retain(|namespace| seen.insert(namespace.clone()));
    networking.allow_internet_egress.get_or_insert(false);
}
