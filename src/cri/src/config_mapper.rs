//! Map Kubernetes CRI configs to `rkt app` command lines.
//!
//! Every function here is pure: it takes a CRI request and returns the
//! arguments that follow the `app` subcommand. rkt has no native notion of
//! most CRI settings, so each one is spelled out as an explicit flag.

use std::collections::HashMap;
use std::path::Path;

use rktlet_core::{Result, RktletError};

use crate::caps::{tweak_capabilities, ALL_CAPABILITIES, DEFAULT_CAPABILITIES};
use crate::cri_api::{
    ContainerConfig, LinuxContainerResources, LinuxContainerSecurityContext, NamespaceMode,
    PodSandboxConfig, PortMapping, Protocol,
};
use crate::metadata::{
    build_app_name, encode_image_name, encode_pairs, encode_pod_metadata,
    ANN_STAGE1_NAME_OVERRIDE,
};

/// Pod-level seccomp annotation.
const ANN_SECCOMP_POD: &str = "seccomp.security.alpha.kubernetes.io/pod";
/// Per-container seccomp annotation prefix; the container name follows.
const ANN_SECCOMP_CONTAINER_PREFIX: &str = "container.seccomp.security.alpha.kubernetes.io/";

/// Seccomp flag that disables filtering.
pub const SECCOMP_RETAIN_ALL: &str = "--seccomp=mode=retain,@appc.io/all";

/// Name prefix of apps rktlet adds for its own bookkeeping.
pub const INTERNAL_APP_PREFIX: &str = "rktletinternal-";

/// Name of the journal-to-CRI log helper app.
pub const LOGGING_APP_NAME: &str = "rktletinternal-journal2cri";

// ── Pod Sandbox ────────────────────────────────────────────────────

/// Arguments for `rkt app sandbox` creating the pod described by `config`.
///
/// rkt writes the new pod UUID to `uuid_file`. A stage1 named by the pod
/// annotation wins over `default_stage1`.
pub fn generate_sandbox_command(
    config: &PodSandboxConfig,
    uuid_file: &Path,
    default_stage1: &str,
) -> Result<Vec<String>> {
    let mut cmd = vec![
        "sandbox".to_string(),
        format!("--uuid-file-save={}", uuid_file.display()),
    ];

    let stage1 = config
        .annotations
        .get(ANN_STAGE1_NAME_OVERRIDE)
        .map(String::as_str)
        .unwrap_or(default_stage1);
    if !stage1.is_empty() {
        cmd.push(format!("--stage1-name={}", stage1));
    }

    if !config.hostname.is_empty() {
        cmd.push(format!("--hostname={}", config.hostname));
    }

    if let Some(dns) = &config.dns_config {
        cmd.extend(dns.servers.iter().map(|s| format!("--dns={}", s)));
        cmd.extend(dns.searches.iter().map(|s| format!("--dns-search={}", s)));
        cmd.extend(dns.options.iter().map(|s| format!("--dns-opt={}", s)));
    }

    let security = config
        .linux
        .as_ref()
        .and_then(|linux| linux.security_context.as_ref());
    if security.map(|s| s.privileged).unwrap_or(false) {
        cmd.push("--insecure-options=all-run".to_string());
    }

    let host_network = security
        .and_then(|s| s.namespace_options.as_ref())
        .map(|ns| ns.network == NamespaceMode::Node as i32)
        .unwrap_or(false);
    if host_network {
        cmd.push("--net=host".to_string());
        cmd.push("--hosts-entry=host".to_string());
        if let Some(hostname) = host_hostname() {
            cmd.push(format!("--hostname={}", hostname));
        }
    } else {
        for port in &config.port_mappings {
            if let Some(flag) = port_flag(port)? {
                cmd.push(flag);
            }
        }
    }

    cmd.extend(
        encode_pairs(&config.annotations)
            .into_iter()
            .map(|a| format!("--user-annotation={}", a)),
    );
    if let Some(metadata) = &config.metadata {
        cmd.extend(
            encode_pod_metadata(metadata)
                .into_iter()
                .map(|a| format!("--user-annotation={}", a)),
        );
    }
    cmd.extend(
        encode_pairs(&config.labels)
            .into_iter()
            .map(|l| format!("--user-label={}", l)),
    );

    Ok(cmd)
}

/// Port forward flag for one mapping; `None` when either port is unset.
pub fn port_flag(port: &PortMapping) -> Result<Option<String>> {
    if port.container_port == 0 || port.host_port == 0 {
        return Ok(None);
    }
    let protocol = match Protocol::try_from(port.protocol) {
        Ok(Protocol::Tcp) => "tcp",
        Ok(Protocol::Udp) => "udp",
        Ok(Protocol::Sctp) => "sctp",
        Err(_) => {
            return Err(RktletError::InvalidArgument(format!(
                "unknown port protocol {}",
                port.protocol
            )))
        }
    };
    let host_ip = if port.host_ip.is_empty() {
        "0.0.0.0"
    } else {
        port.host_ip.as_str()
    };
    Ok(Some(format!(
        "--port={proto}-{cport}-{hport}:{proto}:{cport}:{ip}:{hport}",
        proto = protocol,
        cport = port.container_port,
        hport = port.host_port,
        ip = host_ip,
    )))
}

fn host_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(name) => Some(name.to_string_lossy().into_owned()),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot read host hostname");
            None
        }
    }
}

// ── Container ──────────────────────────────────────────────────────

/// Arguments for `rkt app add` creating the container described by `config`
/// from `image_id` inside `sandbox_id`.
pub fn generate_app_add_command(
    config: &ContainerConfig,
    sandbox_config: Option<&PodSandboxConfig>,
    sandbox_id: &str,
    image_id: &str,
) -> Result<Vec<String>> {
    let metadata = config
        .metadata
        .as_ref()
        .ok_or_else(|| RktletError::InvalidArgument("container metadata required".to_string()))?;
    let image_name = config
        .image
        .as_ref()
        .map(|i| i.image.as_str())
        .unwrap_or_default();

    let mut cmd = vec![
        "add".to_string(),
        sandbox_id.to_string(),
        image_id.to_string(),
        format!("--name={}", build_app_name(metadata.attempt, &metadata.name)),
    ];

    cmd.extend(
        encode_pairs(&config.annotations)
            .into_iter()
            .map(|a| format!("--user-annotation={}", a)),
    );
    cmd.push(format!("--user-annotation={}", encode_image_name(image_name)));
    cmd.extend(
        encode_pairs(&config.labels)
            .into_iter()
            .map(|l| format!("--user-label={}", l)),
    );

    cmd.extend(
        config
            .envs
            .iter()
            .map(|kv| format!("--environment={}={}", kv.key, quote(&kv.value))),
    );

    let linux = config.linux.as_ref();
    if let Some(resources) = linux.and_then(|l| l.resources.as_ref()) {
        cmd.extend(resource_flags(resources));
    }

    let default_security = LinuxContainerSecurityContext::default();
    let security = linux
        .and_then(|l| l.security_context.as_ref())
        .unwrap_or(&default_security);
    let pod_annotations = sandbox_config.map(|s| &s.annotations);
    cmd.extend(security_flags(
        security,
        &metadata.name,
        &config.annotations,
        pod_annotations,
    )?);

    if !security.supplemental_groups.is_empty() {
        let gids: Vec<String> = security
            .supplemental_groups
            .iter()
            .map(|g| g.to_string())
            .collect();
        cmd.push(format!("--supplementary-gids={}", gids.join(",")));
    }
    if security.readonly_rootfs {
        cmd.push("--readonly-rootfs=true".to_string());
    }

    if !config.working_dir.is_empty() {
        cmd.push(format!("--working-dir={}", config.working_dir));
    }

    // SELinux relabeling is left to the host; `selinux_relabel` is ignored.
    for mount in &config.mounts {
        cmd.push(format!(
            "--mnt-volume=name={},kind=host,source={},target={},readOnly={}",
            volume_name(),
            mount.host_path,
            mount.container_path,
            mount.readonly
        ));
    }

    let mut args: Vec<String> = Vec::new();
    if let Some((exec, rest)) = config.command.split_first() {
        cmd.push(format!("--exec={}", exec));
        args.extend(rest.iter().cloned());
    }
    args.extend(config.args.iter().cloned());
    if !args.is_empty() {
        cmd.push("--".to_string());
        cmd.extend(args);
        cmd.push("---".to_string());
    }

    Ok(cmd)
}

/// Arguments for `rkt app add` creating the log helper app in `sandbox_id`.
pub fn generate_logging_app_command(
    sandbox_id: &str,
    image_id: &str,
    log_directory: &str,
) -> Vec<String> {
    let journal_dir = format!("/var/log/journal/{}", sandbox_id.replace('-', ""));
    vec![
        "add".to_string(),
        sandbox_id.to_string(),
        image_id.to_string(),
        format!("--name={}", LOGGING_APP_NAME),
        format!(
            "--mnt-volume=name=journal,kind=host,source={},target=/journal,readOnly=true",
            journal_dir
        ),
        format!(
            "--mnt-volume=name=cri,kind=host,source={},target=/cri,readOnly=false",
            log_directory
        ),
    ]
}

/// Shell-quote an environment value, escaping embedded single quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "\\'"))
}

/// CPU limit in millicores; quota/period wins over shares.
pub fn milli_cpu(resources: &LinuxContainerResources) -> Option<i64> {
    if resources.cpu_quota > 0 && resources.cpu_period > 0 {
        Some(resources.cpu_quota * 1000 / resources.cpu_period)
    } else if resources.cpu_shares > 0 {
        Some(resources.cpu_shares * 1000 / 1024)
    } else {
        None
    }
}

fn resource_flags(resources: &LinuxContainerResources) -> Vec<String> {
    let mut flags = Vec::new();
    if resources.cpu_shares > 0 {
        flags.push(format!("--cpu-shares={}", resources.cpu_shares));
    }
    if let Some(millis) = milli_cpu(resources) {
        flags.push(format!("--cpu={}m", millis));
    }
    if resources.memory_limit_in_bytes > 0 {
        flags.push(format!("--memory={}", resources.memory_limit_in_bytes));
    }
    if resources.oom_score_adj != 0 {
        flags.push(format!("--oom-score-adj={}", resources.oom_score_adj));
    }
    flags
}

fn security_flags(
    security: &LinuxContainerSecurityContext,
    container_name: &str,
    container_annotations: &HashMap<String, String>,
    pod_annotations: Option<&HashMap<String, String>>,
) -> Result<Vec<String>> {
    let mut flags = Vec::new();

    let caps = if security.privileged {
        flags.push(SECCOMP_RETAIN_ALL.to_string());
        ALL_CAPABILITIES.iter().map(|c| c.to_string()).collect()
    } else {
        let profile = seccomp_profile(
            security,
            container_name,
            container_annotations,
            pod_annotations,
        );
        if let Some(flag) = seccomp_flag(&profile)? {
            flags.push(flag);
        }
        let none: &[String] = &[];
        let (add, drop) = security
            .capabilities
            .as_ref()
            .map(|c| (c.add_capabilities.as_slice(), c.drop_capabilities.as_slice()))
            .unwrap_or((none, none));
        tweak_capabilities(DEFAULT_CAPABILITIES, add, drop)?
    };
    if !caps.is_empty() {
        flags.push(format!("--caps-retain={}", caps.join(",")));
    }

    let uid = security.run_as_user.as_ref().map(|u| u.value);
    match (uid, security.run_as_username.is_empty()) {
        (Some(_), false) => {
            return Err(RktletError::InvalidArgument(
                "both username and user fields of SecurityContext set".to_string(),
            ))
        }
        (Some(uid), true) => flags.push(format!("--user={}", uid)),
        (None, false) => flags.push(format!("--user={}", security.run_as_username)),
        (None, true) => {}
    }
    if let Some(gid) = &security.run_as_group {
        flags.push(format!("--group={}", gid.value));
    }

    Ok(flags)
}

/// Seccomp profile name from the security context or the seccomp annotations.
fn seccomp_profile(
    security: &LinuxContainerSecurityContext,
    container_name: &str,
    container_annotations: &HashMap<String, String>,
    pod_annotations: Option<&HashMap<String, String>>,
) -> String {
    if !security.seccomp_profile_path.is_empty() {
        return security.seccomp_profile_path.clone();
    }
    let container_key = format!("{}{}", ANN_SECCOMP_CONTAINER_PREFIX, container_name);
    let lookup = |key: &str| {
        container_annotations
            .get(key)
            .or_else(|| pod_annotations.and_then(|a| a.get(key)))
            .cloned()
    };
    lookup(&container_key)
        .or_else(|| lookup(ANN_SECCOMP_POD))
        .unwrap_or_default()
}

fn seccomp_flag(profile: &str) -> Result<Option<String>> {
    match profile {
        "" | "unconfined" => Ok(Some(SECCOMP_RETAIN_ALL.to_string())),
        "docker/default" | "runtime/default" => Ok(None),
        other => Err(RktletError::InvalidArgument(format!(
            "unsupported seccomp profile {:?}",
            other
        ))),
    }
}

fn volume_name() -> String {
    uuid::Uuid::new_v4().to_string()
}
