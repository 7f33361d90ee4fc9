//! Translate rkt pod and app status into CRI status objects.

use std::net::IpAddr;

use rktlet_core::Result;

use crate::cri_api::{
    Container, ContainerMetadata, ContainerState, ContainerStatus, ImageSpec, Mount,
    PodSandbox, PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus,
};
use crate::engine::{NetInfo, RktApp, RktPod};
use crate::metadata::{
    build_container_id, decode_image_name, decode_pod_metadata, parse_app_name,
    visible_annotations,
};

/// Network name reserved for pods started by rktlet.
pub const DEFAULT_NETWORK_NAME: &str = "rkt.kubernetes.io";

/// rkt pod state to CRI sandbox state; only `running` is ready.
pub fn sandbox_state(state: &str) -> PodSandboxState {
    if state == "running" {
        PodSandboxState::SandboxReady
    } else {
        PodSandboxState::SandboxNotready
    }
}

/// rkt app state to CRI container state.
pub fn container_state(state: &str) -> ContainerState {
    match state {
        "created" => ContainerState::ContainerCreated,
        "running" => ContainerState::ContainerRunning,
        "exited" => ContainerState::ContainerExited,
        _ => ContainerState::ContainerUnknown,
    }
}

/// Pick the pod IP: the rktlet network, then `default`, then the first one seen.
pub fn select_ip(networks: &[NetInfo]) -> String {
    let mut chosen: Option<&NetInfo> = None;
    for net in networks {
        if net.net_name == DEFAULT_NETWORK_NAME {
            chosen = Some(net);
            break;
        }
        match chosen {
            None => chosen = Some(net),
            Some(current) if net.net_name == "default" && current.net_name != "default" => {
                chosen = Some(net)
            }
            _ => {}
        }
    }
    chosen.map(|net| format_ip(&net.ip)).unwrap_or_default()
}

/// Render IPv4-mapped addresses in dotted form.
fn format_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) => ip.to_string(),
    }
}

fn pod_created_at(pod: &RktPod) -> i64 {
    pod.created_at.or(pod.started_at).unwrap_or(0)
}

/// CRI status of a kubelet-owned pod.
pub fn to_pod_sandbox_status(pod: &RktPod) -> Result<PodSandboxStatus> {
    let metadata = decode_pod_metadata(&pod.user_annotations)?;
    Ok(PodSandboxStatus {
        id: pod.uuid.clone(),
        metadata: Some(metadata),
        state: sandbox_state(&pod.state) as i32,
        created_at: pod_created_at(pod),
        network: Some(PodSandboxNetworkStatus {
            ip: select_ip(&pod.networks),
            additional_ips: Vec::new(),
        }),
        linux: None,
        labels: pod.user_labels.clone(),
        annotations: visible_annotations(&pod.user_annotations),
        runtime_handler: String::new(),
    })
}

/// CRI list entry of a kubelet-owned pod.
pub fn to_pod_sandbox(pod: &RktPod) -> Result<PodSandbox> {
    let metadata = decode_pod_metadata(&pod.user_annotations)?;
    Ok(PodSandbox {
        id: pod.uuid.clone(),
        metadata: Some(metadata),
        state: sandbox_state(&pod.state) as i32,
        created_at: pod_created_at(pod),
        labels: pod.user_labels.clone(),
        annotations: visible_annotations(&pod.user_annotations),
        runtime_handler: String::new(),
    })
}

/// CRI status of an app inside `sandbox_id`.
pub fn to_container_status(sandbox_id: &str, app: &RktApp) -> Result<ContainerStatus> {
    let (attempt, name) = parse_app_name(&app.name)?;
    let state = container_state(&app.state);
    let exit_code = app.exit_code.unwrap_or(0);
    let reason = if state == ContainerState::ContainerExited {
        if exit_code == 0 {
            "Completed"
        } else {
            "Error"
        }
    } else {
        ""
    };

    Ok(ContainerStatus {
        id: build_container_id(sandbox_id, &app.name),
        metadata: Some(ContainerMetadata { name, attempt }),
        state: state as i32,
        created_at: app.created_at.unwrap_or(0),
        started_at: app.started_at.unwrap_or(0),
        finished_at: app.finished_at.unwrap_or(0),
        exit_code,
        image: Some(ImageSpec {
            image: decode_image_name(&app.user_annotations),
            ..Default::default()
        }),
        image_ref: app.image_id.clone(),
        reason: reason.to_string(),
        message: String::new(),
        labels: app.user_labels.clone(),
        annotations: visible_annotations(&app.user_annotations),
        mounts: app
            .mounts
            .iter()
            .map(|m| Mount {
                container_path: m.container_path.clone(),
                host_path: m.host_path.clone(),
                readonly: m.read_only,
                ..Default::default()
            })
            .collect(),
        log_path: String::new(),
    })
}

/// CRI list entry built from a container status.
pub fn to_container(sandbox_id: &str, status: ContainerStatus) -> Container {
    Container {
        id: status.id,
        pod_sandbox_id: sandbox_id.to_string(),
        metadata: status.metadata,
        image: status.image,
        image_ref: status.image_ref,
        state: status.state,
        created_at: status.created_at,
        labels: status.labels,
        annotations: status.annotations,
    }
}
