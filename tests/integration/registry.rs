//! Black-box coverage of the service registry as an external consumer sees
//! it: build descriptors, load them into a registry, query by phase/name.

use std::collections::HashSet;

use gpu_arbiter::registry::{ServiceDescriptor, ServiceKind, ServiceRegistry};

fn descriptor(name: &str, priority: i64, phases: &[u32]) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        kind: ServiceKind::Native,
        vram_mb: 2048,
        priority,
        health_url: "http://localhost/health".to_string(),
        health_timeout_s: 30,
        warmup_s: 1,
        phases: phases.iter().copied().collect::<HashSet<u32>>(),
        container_id: None,
        start_cmd: Some("true".to_string()),
        stop_cmd: Some("true".to_string()),
        force_stop_cmd: None,
        pid_file: None,
        graceful_evict_url: None,
    }
}

#[test]
fn equal_priority_services_keep_declaration_order_within_a_phase() {
    let registry = ServiceRegistry::new(vec![
        descriptor("b", 50, &[3]),
        descriptor("a", 50, &[3]),
    ]);
    let names: Vec<&str> = registry.for_phase(3).iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
}

#[test]
fn a_service_with_no_phases_never_surfaces_for_any_phase() {
    let registry = ServiceRegistry::new(vec![descriptor("d", 10, &[])]);
    for phase in 1..=5 {
        assert!(registry.for_phase(phase).is_empty());
    }
    assert!(registry.get("d").is_some());
}

#[test]
fn unknown_name_lookup_is_none_not_a_panic() {
    let registry = ServiceRegistry::new(vec![descriptor("a", 1, &[1])]);
    assert!(registry.get("does-not-exist").is_none());
}
