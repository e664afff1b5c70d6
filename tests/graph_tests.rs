use ash_warden::{HealthCheck, Registry, ServiceSpec};

fn svc(name: &str) -> ServiceSpec {
    ServiceSpec::new(name, HealthCheck::tcp("127.0.0.1", 9))
}

fn stack() -> Registry {
    // api -> (db, cache), worker -> (db), frontend -> api
    Registry::load([
        svc("frontend").depends_on("api"),
        svc("api").depends_on("db").depends_on("cache"),
        svc("worker").depends_on("db"),
        svc("cache"),
        svc("db"),
    ])
    .unwrap()
}

#[test]
fn test_topological_order_respects_dependencies() {
    let registry = stack();
    let order = registry.graph().topological_order();

    let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
    for spec in registry.iter() {
        for dep in &spec.depends_on {
            assert!(pos(dep) < pos(&spec.name), "{dep} must precede {}", spec.name);
        }
    }
}

#[test]
fn test_ties_broken_by_declaration_order() {
    let registry = stack();
    assert_eq!(
        registry.graph().topological_order(),
        ["cache", "db", "api", "worker", "frontend"]
    );
    assert_eq!(
        registry.graph().levels(),
        vec![vec!["cache", "db"], vec!["api", "worker"], vec!["frontend"]]
    );
}

#[test]
fn test_order_is_deterministic() {
    let first = stack();
    let second = stack();
    assert_eq!(
        first.graph().topological_order(),
        second.graph().topological_order()
    );
}

#[test]
fn test_independent_services_keep_declaration_order() {
    let registry = Registry::load([svc("c"), svc("a"), svc("b")]).unwrap();
    assert_eq!(registry.graph().topological_order(), ["c", "a", "b"]);
    assert_eq!(registry.graph().levels().len(), 1);
}

#[test]
fn test_dependents_and_dependencies() {
    let registry = stack();
    let graph = registry.graph();

    assert_eq!(graph.dependents_of("db"), ["api", "worker"]);
    assert_eq!(graph.dependencies_of("api"), ["db", "cache"]);
    assert!(graph.dependents_of("frontend").is_empty());
    assert!(graph.dependents_of("missing").is_empty());
}

#[test]
fn test_transitive_dependents_in_startup_order() {
    let registry = stack();
    assert_eq!(
        registry.graph().transitive_dependents_of("db"),
        ["api", "worker", "frontend"]
    );
    assert_eq!(registry.graph().transitive_dependents_of("cache"), ["api", "frontend"]);
}
