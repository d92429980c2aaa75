//! §4.5 "Create container": `constrain_grpc_spec` strips host-specific OCI
//! fields that have no meaning in-guest before the spec is sent to the
//! agent.
use crate::container::ContainerResources;

/// A deliberately small slice of an OCI-like container spec; only the
/// fields `constrain_grpc_spec` inspects or preserves.
#[derive(Debug, Clone, Default)]
pub struct GuestSpec {
    pub namespaces: Vec<String>,
    pub cgroup_devices_rules: Vec<String>,
    pub block_io_weight: Option<u32>,
    pub hugepage_limits_bytes: Vec<(String, u64)>,
    pub pids_limit: Option<i64>,
    pub network_resources: Option<String>,
    pub selinux_label: Option<String>,
    pub selinux_enabled: bool,
    pub mount_namespace_path: Option<String>,
    pub cgroups_path: String,
    pub resources: ContainerResources,
}

/// Namespaces that keep meaning inside the guest VM; everything else names
/// a host-side isolation boundary the VM boundary already provides.
const NAMESPACES_KEPT_IN_GUEST: &[&str] = &["mount"];

/// Strips host-specific fields with no meaning once the container runs
/// inside its own VM: most namespaces, the cgroup devices allow/deny list,
/// block-io weight, hugepage limits, pids limit, network resources, and
/// the selinux label when selinux is disabled. CPU and Memory resources,
/// a shared mount namespace path, and the cgroups path token survive.
pub fn constrain_grpc_spec(mut spec: GuestSpec) -> GuestSpec {
    spec.namespaces
        .retain(|ns| NAMESPACES_KEPT_IN_GUEST.contains(&ns.as_str()));
    spec.cgroup_devices_rules.clear();
    spec.block_io_weight = None;
    spec.hugepage_limits_bytes.clear();
    spec.pids_limit = None;
    spec.network_resources = None;
    if !spec.selinux_enabled {
        spec.selinux_label = None;
    }
    spec.resources.hugepage_limits_bytes.clear();
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_everything_but_the_preserved_fields() {
        let spec = GuestSpec {
            namespaces: vec!["mount".to_string(), "pid".to_string(), "uts".to_string()],
            cgroup_devices_rules: vec!["b 7:* rwm".to_string()],
            block_io_weight: Some(500),
            hugepage_limits_bytes: vec![("2MB".to_string(), 1024)],
            pids_limit: Some(64),
            network_resources: Some("eth0 10mbit".to_string()),
            selinux_label: Some("container_t".to_string()),
            selinux_enabled: false,
            mount_namespace_path: Some("/proc/1/ns/mnt".to_string()),
            cgroups_path: "/kata/sb1/c1".to_string(),
            resources: ContainerResources {
                cpu_shares: Some(1024),
                memory_limit_bytes: Some(256 * 1024 * 1024),
                hugepage_limits_bytes: vec![("1GB".to_string(), 1)],
                ..Default::default()
            },
        };
        let constrained = constrain_grpc_spec(spec);
        assert_eq!(constrained.namespaces, vec!["mount".to_string()]);
        assert!(constrained.cgroup_devices_rules.is_empty());
        assert_eq!(constrained.block_io_weight, None);
        assert!(constrained.hugepage_limits_bytes.is_empty());
        assert_eq!(constrained.pids_limit, None);
        assert_eq!(constrained.network_resources, None);
        assert_eq!(constrained.selinux_label, None);
        assert_eq!(constrained.mount_namespace_path, Some("/proc/1/ns/mnt".to_string()));
        assert_eq!(constrained.cgroups_path, "/kata/sb1/c1");
        assert_eq!(constrained.resources.cpu_shares, Some(1024));
        assert_eq!(constrained.resources.memory_limit_bytes, Some(256 * 1024 * 1024));
        assert!(constrained.resources.hugepage_limits_bytes.is_empty());
    }

    #[test]
    fn selinux_label_survives_when_enabled() {
        let spec = GuestSpec {
            selinux_enabled: true,
            selinux_label: Some("container_t".to_string()),
            ..Default::default()
        };
        assert_eq!(
            constrain_grpc_spec(spec).selinux_label,
            Some("container_t".to_string())
        );
    }
}
