//! Dependency Resolver
//!
//! Registers named factories with declared dependencies, constructs them in dependency
//! order and memoizes the results. Resolution is transactional: instances built during a
//! resolution that ends in an error are discarded, so a cycle or a failing factory never
//! leaves partial state behind.

use std::any::{type_name, Any};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use log::{debug, warn};
use parking_lot::Mutex;
use crate::plugin::error::{PluginError, PluginResult};

/// A constructed, shareable instance
pub type Instance = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn(&ResolvedDependencies) -> PluginResult<Instance> + Send + Sync>;

/// Already-constructed dependencies handed to a factory
pub struct ResolvedDependencies {
    instances: HashMap<String, Instance>,
}

impl ResolvedDependencies {
    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    /// Typed access to a declared dependency
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> PluginResult<Arc<T>> {
        let instance = self.instances.get(name)
            .ok_or_else(|| PluginError::unknown_dependency(name))?;
        downcast_instance(name, instance.clone())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

struct DependencyNode {
    factory: Factory,
    deps: Vec<String>,
}

#[derive(Default)]
struct ResolverState {
    nodes: HashMap<String, DependencyNode>,
    /// Registration order, used to break ties deterministically
    order: Vec<String>,
    instances: HashMap<String, Instance>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Grey,
    Black,
}

/// Dependency-ordered, memoizing constructor of named instances
#[derive(Default)]
pub struct DependencyResolver {
    state: Mutex<ResolverState>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `name`.
    ///
    /// The factory runs while the resolver is locked and must not call back into it;
    /// everything it needs arrives through [`ResolvedDependencies`].
    pub fn register<T, I, S, F>(&self, name: &str, deps: I, factory: F)
    where
        T: Any + Send + Sync,
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ResolvedDependencies) -> PluginResult<T> + Send + Sync + 'static,
    {
        let mut seen = HashSet::new();
        let deps: Vec<String> = deps.into_iter()
            .map(Into::into)
            .filter(|d| seen.insert(d.clone()))
            .collect();

        let factory: Factory = Arc::new(move |resolved| {
            factory(resolved).map(|value| Arc::new(value) as Instance)
        });

        let mut state = self.state.lock();
        if state.nodes.contains_key(name) {
            debug!("Replacing factory for '{}'", name);
            state.instances.remove(name);
        } else {
            state.order.push(name.to_string());
        }
        state.nodes.insert(name.to_string(), DependencyNode { factory, deps });
    }

    /// Resolve `name`, constructing it and its transitive dependencies if needed
    pub fn resolve(&self, name: &str) -> PluginResult<Instance> {
        let mut state = self.state.lock();
        let mut staged = HashMap::new();
        let mut grey = Vec::new();

        match Self::construct(&state, name, &mut grey, &mut staged) {
            Ok(instance) => {
                state.instances.extend(staged);
                Ok(instance)
            }
            Err(e) => {
                warn!("Resolution of '{}' failed: {}", name, e);
                Err(e)
            }
        }
    }

    /// Resolve `name` and downcast it to `T`
    pub fn resolve_as<T: Any + Send + Sync>(&self, name: &str) -> PluginResult<Arc<T>> {
        let instance = self.resolve(name)?;
        downcast_instance(name, instance)
    }

    /// Resolve every registered name. All-or-nothing like [`resolve`](Self::resolve).
    pub fn resolve_all(&self) -> PluginResult<HashMap<String, Instance>> {
        let order = self.initialization_order()?;

        let mut state = self.state.lock();
        let mut staged = HashMap::new();
        let mut resolved = HashMap::new();
        for name in order {
            let mut grey = Vec::new();
            let instance = Self::construct(&state, &name, &mut grey, &mut staged)?;
            resolved.insert(name, instance);
        }
        state.instances.extend(staged);
        Ok(resolved)
    }

    /// Depth-first topological order; independent names keep registration order
    pub fn initialization_order(&self) -> PluginResult<Vec<String>> {
        let state = self.state.lock();
        let rank: HashMap<&str, usize> = state.order.iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut stack = Vec::new();
        let mut ordered = Vec::with_capacity(state.order.len());
        for name in &state.order {
            Self::visit(&state, &rank, name, &mut marks, &mut stack, &mut ordered)?;
        }
        Ok(ordered)
    }

    pub fn is_resolved(&self, name: &str) -> bool {
        self.state.lock().instances.contains_key(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state.lock().nodes.contains_key(name)
    }

    /// Registered names in registration order
    pub fn registered_names(&self) -> Vec<String> {
        self.state.lock().order.clone()
    }

    pub fn dependencies_of(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().nodes.get(name).map(|n| n.deps.clone())
    }

    /// Drop bookkeeping and any memoized instance for `name`
    pub fn remove(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        state.instances.remove(name);
        state.order.retain(|n| n != name);
        state.nodes.remove(name).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.order.clear();
        state.instances.clear();
    }

    fn construct(
        state: &ResolverState,
        name: &str,
        grey: &mut Vec<String>,
        staged: &mut HashMap<String, Instance>,
    ) -> PluginResult<Instance> {
        if let Some(instance) = state.instances.get(name).or_else(|| staged.get(name)) {
            return Ok(instance.clone());
        }

        if let Some(pos) = grey.iter().position(|n| n == name) {
            let mut path = grey[pos..].to_vec();
            path.push(name.to_string());
            return Err(PluginError::circular_dependency(&path));
        }

        let node = state.nodes.get(name)
            .ok_or_else(|| PluginError::unknown_dependency(name))?;

        grey.push(name.to_string());
        let mut instances = HashMap::with_capacity(node.deps.len());
        for dep in &node.deps {
            let instance = Self::construct(state, dep, grey, staged)?;
            instances.insert(dep.clone(), instance);
        }

        let resolved = ResolvedDependencies { instances };
        let instance = (node.factory)(&resolved).map_err(|e| match e {
            PluginError::FactoryFailed { .. } => e,
            other => PluginError::factory_failed(name, other.to_string()),
        })?;
        grey.pop();

        debug!("Constructed '{}' ({} dependencies)", name, resolved.len());
        staged.insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    fn visit(
        state: &ResolverState,
        rank: &HashMap<&str, usize>,
        name: &str,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
        ordered: &mut Vec<String>,
    ) -> PluginResult<()> {
        match marks.get(name) {
            Some(Mark::Black) => return Ok(()),
            Some(Mark::Grey) => {
                let pos = stack.iter().position(|n| n == name).unwrap_or(0);
                let mut path = stack[pos..].to_vec();
                path.push(name.to_string());
                return Err(PluginError::circular_dependency(&path));
            }
            None => {}
        }

        let node = state.nodes.get(name)
            .ok_or_else(|| PluginError::unknown_dependency(name))?;

        let mut deps = node.deps.clone();
        deps.sort_by_key(|d| rank.get(d.as_str()).copied().unwrap_or(usize::MAX));

        marks.insert(name.to_string(), Mark::Grey);
        stack.push(name.to_string());
        for dep in &deps {
            Self::visit(state, rank, dep, marks, stack, ordered)?;
        }
        stack.pop();
        marks.insert(name.to_string(), Mark::Black);
        ordered.push(name.to_string());
        Ok(())
    }
}

fn downcast_instance<T: Any + Send + Sync>(name: &str, instance: Instance) -> PluginResult<Arc<T>> {
    instance.downcast::<T>().map_err(|_| {
        PluginError::factory_failed(name, format!("instance is not a {}", type_name::<T>()))
    })
}
