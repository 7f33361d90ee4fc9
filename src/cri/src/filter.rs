//! Client-side list filters.
//!
//! rkt can only list everything, so CRI filters are applied after translation.

use std::collections::HashMap;

use crate::cri_api::{Container, ContainerFilter, PodSandbox, PodSandboxFilter};

/// True when every selector label is present with the same value.
pub fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Whether `sandbox` passes `filter`; no filter passes everything.
pub fn pod_sandbox_passes(sandbox: &PodSandbox, filter: Option<&PodSandboxFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if !filter.id.is_empty() && filter.id != sandbox.id {
        return false;
    }
    if let Some(state) = &filter.state {
        if state.state != sandbox.state {
            return false;
        }
    }
    labels_match(&sandbox.labels, &filter.label_selector)
}

/// Whether `container` passes `filter`; no filter passes everything.
pub fn container_passes(container: &Container, filter: Option<&ContainerFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if !filter.id.is_empty() && filter.id != container.id {
        return false;
    }
    if !filter.pod_sandbox_id.is_empty() && filter.pod_sandbox_id != container.pod_sandbox_id {
        return false;
    }
    if let Some(state) = &filter.state {
        if state.state != container.state {
            return false;
        }
    }
    labels_match(&container.labels, &filter.label_selector)
}
