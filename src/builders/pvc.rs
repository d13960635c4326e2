use super::{child_metadata, validate_quantity, BuildError, BuildSettings};
use crate::application::defaults::DEFAULT_ACCESS_MODE;
use crate::application::{Application, ApplicationSpec};

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use std::collections::BTreeMap;

pub const ACCESS_MODES: [&str; 3] = ["ReadWriteOnce", "ReadWriteMany", "ReadOnlyMany"];

pub fn claim_name(app_name: &str) -> String {
    format!("{}-pvc", app_name)
}

/// Builds the claim backing the application's data volume. Only called when storage is enabled.
pub fn build(
    app: &Application,
    spec: &ApplicationSpec,
    settings: &BuildSettings,
) -> Result<PersistentVolumeClaim, BuildError> {
    let storage = spec.storage.clone().unwrap_or_default();

    let access_mode = storage
        .access_mode
        .unwrap_or_else(|| DEFAULT_ACCESS_MODE.to_owned());
    if !ACCESS_MODES.contains(&access_mode.as_str()) {
        return Err(BuildError::InvalidAccessMode(access_mode));
    }

    let size = storage
        .size
        .filter(|s| !s.trim().is_empty())
        .ok_or(BuildError::MissingStorageSize)?;
    validate_quantity(&size)?;

    let storage_class = storage
        .storage_class
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| settings.default_storage_class.clone());

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_owned(), Quantity(size));

    Ok(PersistentVolumeClaim {
        metadata: child_metadata(app, claim_name(app.name()), settings),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode]),
            storage_class_name: Some(storage_class),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: None,
            }),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::application::defaults::defaults;
    use crate::application::StorageSpec;
    use crate::builders::test::app_with_spec;

    fn build_for(storage: StorageSpec) -> Result<PersistentVolumeClaimSpec, BuildError> {
        let mut spec = ApplicationSpec::new("postgres:15");
        spec.storage = Some(storage);
        let spec = defaults(&spec);
        let app = app_with_spec(spec.clone());
        let claim = build(&app, &spec, &BuildSettings::default())?;
        assert_eq!(Some("web-pvc"), claim.metadata.name.as_deref());
        Ok(claim.spec.expect("missing spec"))
    }

    #[test]
    fn claim_uses_size_and_default_class() {
        let spec = build_for(StorageSpec {
            enabled: Some(true),
            size: Some("10Gi".to_owned()),
            ..Default::default()
        })
        .expect("build failed");

        assert_eq!(Some(vec!["ReadWriteOnce".to_owned()]), spec.access_modes);
        assert_eq!(Some("local-path"), spec.storage_class_name.as_deref());
        let requests = spec.resources.and_then(|r| r.requests).expect("requests");
        assert_eq!(Some(&Quantity("10Gi".to_owned())), requests.get("storage"));
    }

    #[test]
    fn explicit_class_and_access_mode_are_used() {
        let spec = build_for(StorageSpec {
            enabled: Some(true),
            size: Some("1Gi".to_owned()),
            storage_class: Some("fast-ssd".to_owned()),
            access_mode: Some("ReadWriteMany".to_owned()),
            ..Default::default()
        })
        .expect("build failed");
        assert_eq!(Some(vec!["ReadWriteMany".to_owned()]), spec.access_modes);
        assert_eq!(Some("fast-ssd"), spec.storage_class_name.as_deref());
    }

    #[test]
    fn invalid_storage_is_rejected() {
        let result = build_for(StorageSpec {
            enabled: Some(true),
            size: Some("1Gi".to_owned()),
            access_mode: Some("ReadWriteSometimes".to_owned()),
            ..Default::default()
        });
        assert!(matches!(result, Err(BuildError::InvalidAccessMode(_))));

        let result = build_for(StorageSpec {
            enabled: Some(true),
            ..Default::default()
        });
        assert!(matches!(result, Err(BuildError::MissingStorageSize)));

        let result = build_for(StorageSpec {
            enabled: Some(true),
            size: Some("big".to_owned()),
            ..Default::default()
        });
        assert!(matches!(result, Err(BuildError::InvalidQuantity(_))));
    }
}
