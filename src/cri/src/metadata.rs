//! Kubernetes identity stored in rkt annotations.
//!
//! rkt has no notion of pods, namespaces or restart attempts, so the
//! kubelet-owned identity travels as user annotations under a small fixed
//! set of reserved keys. Everything else is passed through untouched.

use std::collections::{BTreeMap, HashMap};

use rktlet_core::{Result, RktletError};

use crate::cri_api::PodSandboxMetadata;

/// Prefix shared by every reserved annotation key.
pub const RESERVED_PREFIX: &str = "k8s.io/reserved/";

/// Image name the kubelet asked for, stored per app.
pub const ANN_IMAGE_NAME: &str = "k8s.io/reserved/image-name";
/// Pod UID; its presence marks a pod as kubelet-owned.
pub const ANN_POD_UID: &str = "k8s.io/reserved/pod-uid";
pub const ANN_POD_NAME: &str = "k8s.io/reserved/pod-name";
pub const ANN_POD_NAMESPACE: &str = "k8s.io/reserved/pod-namespace";
pub const ANN_POD_ATTEMPT: &str = "k8s.io/reserved/pod-attempt";

/// Pod annotation overriding the configured stage1 image.
pub const ANN_STAGE1_NAME_OVERRIDE: &str = "rkt.alpha.kubernetes.io/stage1-name-override";

const RESERVED_KEYS: [&str; 5] = [
    ANN_IMAGE_NAME,
    ANN_POD_UID,
    ANN_POD_NAME,
    ANN_POD_NAMESPACE,
    ANN_POD_ATTEMPT,
];

/// Encode pod identity as `key=value` annotations.
pub fn encode_pod_metadata(metadata: &PodSandboxMetadata) -> Vec<String> {
    vec![
        format!("{}={}", ANN_POD_UID, metadata.uid),
        format!("{}={}", ANN_POD_NAME, metadata.name),
        format!("{}={}", ANN_POD_NAMESPACE, metadata.namespace),
        format!("{}={}", ANN_POD_ATTEMPT, metadata.attempt),
    ]
}

/// Encode the per-app image name as a `key=value` annotation.
pub fn encode_image_name(image: &str) -> String {
    format!("{}={}", ANN_IMAGE_NAME, image)
}

/// Pass free-form labels or annotations through as `key=value`, ordered by key.
pub fn encode_pairs(pairs: &HashMap<String, String>) -> Vec<String> {
    pairs
        .iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

/// Whether the annotations carry kubelet ownership metadata.
pub fn is_kubernetes_owned(annotations: &HashMap<String, String>) -> bool {
    annotations.contains_key(ANN_POD_UID)
}

/// Decode pod identity from engine annotations.
pub fn decode_pod_metadata(annotations: &HashMap<String, String>) -> Result<PodSandboxMetadata> {
    let get = |key: &str| annotations.get(key).cloned().unwrap_or_default();
    let attempt = get(ANN_POD_ATTEMPT);
    let attempt = attempt.parse::<u32>().map_err(|e| {
        RktletError::ParseError(format!("invalid pod attempt {:?}: {}", attempt, e))
    })?;

    Ok(PodSandboxMetadata {
        name: get(ANN_POD_NAME),
        uid: get(ANN_POD_UID),
        namespace: get(ANN_POD_NAMESPACE),
        attempt,
    })
}

/// The image name recorded for an app, empty when absent.
pub fn decode_image_name(annotations: &HashMap<String, String>) -> String {
    annotations.get(ANN_IMAGE_NAME).cloned().unwrap_or_default()
}

/// Annotations with every reserved key removed.
pub fn visible_annotations(annotations: &HashMap<String, String>) -> HashMap<String, String> {
    annotations
        .iter()
        .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()) && !k.starts_with(RESERVED_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ── Container identifiers ──────────────────────────────────────────

/// Engine app name for a container: `<attempt>-<lowercased name>`.
pub fn build_app_name(attempt: u32, name: &str) -> String {
    format!("{}-{}", attempt, name.to_lowercase())
}

/// Split an engine app name into attempt and name.
pub fn parse_app_name(app_name: &str) -> Result<(u32, String)> {
    let (attempt, name) = app_name
        .split_once('-')
        .ok_or_else(|| RktletError::ParseError(format!("invalid app name {:?}", app_name)))?;
    let attempt = attempt.parse::<u32>().map_err(|e| {
        RktletError::ParseError(format!("invalid attempt in app name {:?}: {}", app_name, e))
    })?;
    Ok((attempt, name.to_string()))
}

/// Composite container ID: `<sandbox id>:<app name>`.
pub fn build_container_id(sandbox_id: &str, app_name: &str) -> String {
    format!("{}:{}", sandbox_id, app_name)
}

/// Split a composite container ID into sandbox ID and app name.
pub fn parse_container_id(container_id: &str) -> Result<(String, String)> {
    match container_id.split_once(':') {
        Some((sandbox_id, app_name)) if !sandbox_id.is_empty() && !app_name.is_empty() => {
            Ok((sandbox_id.to_string(), app_name.to_string()))
        }
        _ => Err(RktletError::InvalidArgument(format!(
            "invalid container id {:?}",
            container_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> PodSandboxMetadata {
        PodSandboxMetadata {
            name: "nginx".to_string(),
            uid: "5c5979ec-9871-11e7".to_string(),
            namespace: "default".to_string(),
            attempt: 3,
        }
    }

    fn as_map(pairs: &[String]) -> HashMap<String, String> {
        pairs
            .iter()
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_pod_metadata_roundtrip() {
        let annotations = as_map(&encode_pod_metadata(&metadata()));
        assert!(is_kubernetes_owned(&annotations));
        assert_eq!(decode_pod_metadata(&annotations).unwrap(), metadata());
    }

    #[test]
    fn test_decode_rejects_bad_attempt() {
        let mut annotations = as_map(&encode_pod_metadata(&metadata()));
        annotations.insert(ANN_POD_ATTEMPT.to_string(), "-1".to_string());
        assert!(matches!(
            decode_pod_metadata(&annotations),
            Err(RktletError::ParseError(_))
        ));
    }

    #[test]
    fn test_empty_annotations_not_owned() {
        assert!(!is_kubernetes_owned(&HashMap::new()));
        assert!(decode_pod_metadata(&HashMap::new()).is_err());
    }

    #[test]
    fn test_visible_annotations_strip_reserved() {
        let mut annotations = as_map(&encode_pod_metadata(&metadata()));
        annotations.insert(ANN_IMAGE_NAME.to_string(), "busybox".to_string());
        annotations.insert("team".to_string(), "web".to_string());

        let visible = visible_annotations(&annotations);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible.get("team").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_image_name_roundtrip() {
        let annotations = as_map(&[encode_image_name("docker.io/library/busybox:latest")]);
        assert_eq!(
            decode_image_name(&annotations),
            "docker.io/library/busybox:latest"
        );
    }

    #[test]
    fn test_encode_pairs_sorted() {
        let mut labels = HashMap::new();
        labels.insert("zeta".to_string(), "1".to_string());
        labels.insert("alpha".to_string(), "a=b".to_string());
        assert_eq!(encode_pairs(&labels), vec!["alpha=a=b", "zeta=1"]);
    }

    #[test]
    fn test_container_id_roundtrip() {
        let names = ["nginx", "Sidecar", "MiXeD-Case-name", "a"];
        for attempt in [0u32, 1, 7, u32::MAX] {
            for name in names {
                let id = build_container_id("4a1f3b2c", &build_app_name(attempt, name));
                let (sandbox_id, app_name) = parse_container_id(&id).unwrap();
                assert_eq!(sandbox_id, "4a1f3b2c");
                let (parsed_attempt, parsed_name) = parse_app_name(&app_name).unwrap();
                assert_eq!(parsed_attempt, attempt);
                assert_eq!(parsed_name, name.to_lowercase());
            }
        }
    }

    #[test]
    fn test_parse_container_id_requires_separator() {
        assert!(matches!(
            parse_container_id("no-separator"),
            Err(RktletError::InvalidArgument(_))
        ));
        assert!(parse_container_id(":0-app").is_err());
        assert!(parse_container_id("pod:").is_err());
    }

    #[test]
    fn test_parse_app_name_errors() {
        assert!(parse_app_name("nginx").is_err());
        assert!(parse_app_name("x-nginx").is_err());
        assert_eq!(parse_app_name("2-my-app").unwrap(), (2, "my-app".to_string()));
    }
}
