//! Property tests for dependency ordering and cycle detection

use std::collections::HashMap;
use proptest::collection::vec;
use proptest::prelude::*;

use plugin_runtime::dependency::DependencyResolver;
use plugin_runtime::PluginError;

/// Node count, adjacency bits, and a registration order
fn graph() -> impl Strategy<Value = (usize, Vec<bool>, Vec<usize>)> {
    (2usize..12).prop_flat_map(|n| {
        (
            Just(n),
            vec(any::<bool>(), n * n),
            Just((0..n).collect::<Vec<usize>>()).prop_shuffle(),
        )
    })
}

fn name(i: usize) -> String {
    format!("node{}", i)
}

/// Node `i` may only depend on lower-numbered nodes, so the graph is acyclic
fn acyclic_deps(n: usize, bits: &[bool]) -> Vec<Vec<String>> {
    (0..n)
        .map(|i| (0..i).filter(|&j| bits[i * n + j]).map(name).collect())
        .collect()
}

fn register_all(resolver: &DependencyResolver, deps: &[Vec<String>], order: &[usize]) {
    for &i in order {
        let label = name(i);
        resolver.register(&name(i), deps[i].clone(), move |_| Ok(label.clone()));
    }
}

proptest! {
    #[test]
    fn initialization_order_respects_every_dependency((n, bits, order) in graph()) {
        let resolver = DependencyResolver::new();
        let deps = acyclic_deps(n, &bits);
        register_all(&resolver, &deps, &order);

        let ordered = resolver.initialization_order().unwrap();
        prop_assert_eq!(ordered.len(), n);

        let position: HashMap<&str, usize> = ordered.iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        for (i, node_deps) in deps.iter().enumerate() {
            for dep in node_deps {
                prop_assert!(position[dep.as_str()] < position[name(i).as_str()]);
            }
        }
    }

    #[test]
    fn initialization_order_is_deterministic((n, bits, order) in graph()) {
        let deps = acyclic_deps(n, &bits);
        let first = DependencyResolver::new();
        let second = DependencyResolver::new();
        register_all(&first, &deps, &order);
        register_all(&second, &deps, &order);

        prop_assert_eq!(first.initialization_order().unwrap(), second.initialization_order().unwrap());
    }

    #[test]
    fn injected_cycle_always_errors_and_leaks_nothing((n, bits, order) in graph()) {
        let resolver = DependencyResolver::new();
        let mut deps = acyclic_deps(n, &bits);
        // Chain every node to its predecessor, then close the loop
        for i in 1..n {
            if !deps[i].contains(&name(i - 1)) {
                deps[i].push(name(i - 1));
            }
        }
        deps[0].push(name(n - 1));
        register_all(&resolver, &deps, &order);
        resolver.register("island", Vec::<String>::new(), |_| Ok(42u32));

        for i in 0..n {
            let result = resolver.resolve(&name(i));
            prop_assert!(matches!(result, Err(PluginError::CircularDependency { .. })), "expected CircularDependency for {}", name(i));
        }
        prop_assert!(resolver.initialization_order().is_err());
        prop_assert!(resolver.resolve_all().is_err());
        for i in 0..n {
            prop_assert!(!resolver.is_resolved(&name(i)));
        }

        let island = resolver.resolve_as::<u32>("island").unwrap();
        prop_assert_eq!(*island, 42);
        prop_assert!(resolver.is_resolved("island"));
    }
}
