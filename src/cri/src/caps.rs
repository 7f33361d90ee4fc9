//! Linux capability sets for non-privileged containers.

use rktlet_core::{Result, RktletError};

/// Capabilities retained when a container asks for no changes.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Every capability known to the kernel headers rkt is built against.
pub const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
];

const ALL: &str = "ALL";

/// Normalize `net_admin`, `NET_ADMIN` or `cap_net_admin` to `CAP_NET_ADMIN`.
fn normalize(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    if upper == ALL || upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    }
}

fn validate(names: &[String]) -> Result<()> {
    for name in names {
        if name != ALL && !ALL_CAPABILITIES.contains(&name.as_str()) {
            return Err(RktletError::InvalidArgument(format!(
                "unknown capability {:?}",
                name
            )));
        }
    }
    Ok(())
}

/// Apply `add` and `drop` to `base`.
///
/// `ALL` in `drop` empties the base set and `ALL` in `add` selects every
/// capability. Drops win over adds of the same capability.
pub fn tweak_capabilities(base: &[&str], add: &[String], drop: &[String]) -> Result<Vec<String>> {
    let add: Vec<String> = add.iter().map(|c| normalize(c)).collect();
    let drop: Vec<String> = drop.iter().map(|c| normalize(c)).collect();
    validate(&add)?;
    validate(&drop)?;

    let mut caps: Vec<String> = if drop.iter().any(|c| c == ALL) {
        Vec::new()
    } else {
        base.iter()
            .map(|c| c.to_string())
            .filter(|c| !drop.contains(c))
            .collect()
    };

    let added: Vec<&str> = if add.iter().any(|c| c == ALL) {
        ALL_CAPABILITIES.to_vec()
    } else {
        add.iter().map(String::as_str).collect()
    };
    for cap in added {
        if !caps.iter().any(|c| c == cap) && !drop.iter().any(|c| c == cap) {
            caps.push(cap.to_string());
        }
    }

    Ok(caps)
}
