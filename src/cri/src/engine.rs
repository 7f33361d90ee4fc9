//! JSON shapes printed by `rkt ... --format=json` and `rkt image cat-manifest`.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use rktlet_core::{Cli, Result, RktletError};

/// Treat an explicit JSON `null` like an absent field.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A pod as reported by `rkt status` and `rkt list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RktPod {
    /// Pod UUID
    #[serde(rename = "name")]
    pub uuid: String,
    pub state: String,
    #[serde(default, deserialize_with = "nullable")]
    pub networks: Vec<NetInfo>,
    #[serde(default, deserialize_with = "nullable")]
    pub app_names: Vec<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub user_annotations: HashMap<String, String>,
    #[serde(default, deserialize_with = "nullable")]
    pub user_labels: HashMap<String, String>,
}

/// One network attachment of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetInfo {
    #[serde(rename = "netName", default)]
    pub net_name: String,
    #[serde(rename = "ifName", default)]
    pub if_name: String,
    #[serde(default)]
    pub ip: String,
}

/// An app inside a pod as reported by `rkt app status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RktApp {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub image_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub mounts: Vec<RktMount>,
    #[serde(default, deserialize_with = "nullable")]
    pub user_annotations: HashMap<String, String>,
    #[serde(default, deserialize_with = "nullable")]
    pub user_labels: HashMap<String, String>,
}

/// A volume mounted into an app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RktMount {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub container_path: String,
    #[serde(default)]
    pub host_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// An entry of `rkt image list --format=json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageListEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub import_time: i64,
    #[serde(default)]
    pub last_used_time: i64,
    #[serde(default)]
    pub size: u64,
}

/// The parts of an appc image manifest rktlet reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub app: Option<ManifestApp>,
    #[serde(default, deserialize_with = "nullable")]
    pub annotations: Vec<ManifestAnnotation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestApp {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestAnnotation {
    pub name: String,
    pub value: String,
}

impl ImageManifest {
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }
}

/// Parse output expected to be exactly one JSON line.
pub fn parse_single_json<T: for<'de> Deserialize<'de>>(lines: &[String]) -> Result<T> {
    match lines {
        [line] => Ok(serde_json::from_str(line)?),
        _ => Err(RktletError::ParseError(format!(
            "expected 1 line of JSON output, got {}: {:?}",
            lines.len(),
            lines
        ))),
    }
}

/// Parse output holding one JSON document, possibly spread over several lines.
pub fn parse_json<T: for<'de> Deserialize<'de>>(lines: &[String]) -> Result<T> {
    Ok(serde_json::from_str(&lines.join("\n"))?)
}

// ── Queries ────────────────────────────────────────────────────────

/// `rkt status <uuid> --format=json`
pub async fn pod_status(cli: &dyn Cli, uuid: &str) -> Result<RktPod> {
    let output = cli
        .run_command("status", &[uuid.to_string(), "--format=json".to_string()])
        .await
        .map_err(|e| not_found_if_missing(e, "pod", uuid))?;
    parse_single_json(&output)
}

/// `rkt list --format=json`
pub async fn list_pods(cli: &dyn Cli) -> Result<Vec<RktPod>> {
    let output = cli.run_command("list", &["--format=json".to_string()]).await?;
    if output.is_empty() {
        return Ok(Vec::new());
    }
    let pods: Option<Vec<RktPod>> = parse_json(&output)?;
    Ok(pods.unwrap_or_default())
}

/// `rkt app status <uuid> --app=<name> --format=json`
pub async fn app_status(cli: &dyn Cli, uuid: &str, app_name: &str) -> Result<RktApp> {
    let args = vec![
        "status".to_string(),
        uuid.to_string(),
        format!("--app={}", app_name),
        "--format=json".to_string(),
    ];
    let output = cli
        .run_command("app", &args)
        .await
        .map_err(|e| not_found_if_missing(e, "pod", uuid))?;
    parse_single_json(&output)
}

fn not_found_if_missing(err: RktletError, kind: &str, id: &str) -> RktletError {
    if err.is_no_such_pod() {
        RktletError::NotFound(format!("{} {}", kind, id))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_status_json() {
        let line = r#"{"name":"4a1f3b2c","state":"running","networks":[{"netName":"default","netConf":"net/99-default.conf","pluginPath":"stage1/rootfs/usr/lib/rkt/plugins/net/ptp","ifName":"eth0","ip":"172.16.28.2","args":"","mask":"255.255.255.0"}],"app_names":["0-nginx"],"started_at":1500000000,"user_annotations":{"k8s.io/reserved/pod-uid":"u"},"user_labels":null}"#;
        let pod: RktPod = parse_single_json(&[line.to_string()]).unwrap();
        assert_eq!(pod.uuid, "4a1f3b2c");
        assert_eq!(pod.state, "running");
        assert_eq!(pod.networks[0].net_name, "default");
        assert_eq!(pod.networks[0].ip, "172.16.28.2");
        assert_eq!(pod.app_names, vec!["0-nginx"]);
        assert_eq!(pod.started_at, Some(1500000000));
        assert!(pod.created_at.is_none());
        assert!(pod.user_labels.is_empty());
    }

    #[test]
    fn test_minimal_pod_json() {
        let pod: RktPod = parse_single_json(&[r#"{"name":"x","state":"exited"}"#.to_string()]).unwrap();
        assert!(pod.networks.is_empty());
        assert!(pod.app_names.is_empty());
    }

    #[test]
    fn test_app_status_json() {
        let line = r#"{"name":"1-nginx","state":"exited","created_at":10,"started_at":20,"finished_at":30,"exit_code":42,"image_id":"sha512-abc","mounts":[{"name":"v","container_path":"/data","host_path":"/srv","read_only":true}]}"#;
        let app: RktApp = parse_single_json(&[line.to_string()]).unwrap();
        assert_eq!(app.exit_code, Some(42));
        assert_eq!(app.mounts[0].container_path, "/data");
        assert!(app.mounts[0].read_only);
    }

    #[test]
    fn test_single_json_rejects_line_count() {
        let err = parse_single_json::<RktPod>(&[]).unwrap_err();
        assert!(matches!(err, RktletError::ParseError(_)));
        let lines = vec!["{}".to_string(), "{}".to_string()];
        assert!(parse_single_json::<RktPod>(&lines).is_err());
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = parse_single_json::<RktPod>(&["not json".to_string()]).unwrap_err();
        assert!(matches!(err, RktletError::ParseError(_)));
    }

    #[test]
    fn test_image_list_json() {
        let lines = vec![
            r#"[{"id":"sha512-aaa","name":"registry-1.docker.io/library/busybox:latest","import_time":1,"last_used_time":2,"size":1024},"#.to_string(),
            r#"{"id":"sha512-bbb","name":"quay.io/coreos/etcd:v3.2","size":2048}]"#.to_string(),
        ];
        let images: Vec<ImageListEntry> = parse_json(&lines).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].size, 2048);
    }

    #[test]
    fn test_manifest_annotation_lookup() {
        let manifest: ImageManifest = serde_json::from_str(
            r#"{"acKind":"ImageManifest","name":"registry-1.docker.io/library/busybox","app":{"exec":["sh"],"user":"0","group":"0"},"annotations":[{"name":"appc.io/docker/originalname","value":"busybox"}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.annotation("appc.io/docker/originalname"), Some("busybox"));
        assert_eq!(manifest.app.unwrap().user, "0");
    }
}
