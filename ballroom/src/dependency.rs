use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::{algo::kosaraju_scc, graph::DiGraph, graph::NodeIndex};
use serde_json::Value;
use tracing::{debug, info};

use crate::command_system::{CommandDef, CommandSpec};
use crate::event_system::RoomHandlers;
use crate::room::{Room, RoomHandle};
use crate::{Error, Result};

/// A unit of room behavior, constructed once per room by the resolver.
///
/// Dependencies are declared statically and injected through the
/// [`ModuleContext`] handed to `create`; event handlers come from the
/// [`RoomHandlers`] supertrait.
pub trait RoomModule: RoomHandlers + Any + Send + Sync + Sized {
    /// Unique module name.
    const NAME: &'static str;

    /// Ordered constructor dependencies.
    fn dependencies() -> Vec<Dependency> {
        Vec::new()
    }

    /// Commands this module contributes to the room.
    fn commands() -> Vec<CommandSpec<Self>> {
        Vec::new()
    }

    /// State entries merged into the shared room state (existing keys win).
    fn default_state() -> Value {
        Value::Null
    }

    fn create(ctx: &ModuleContext) -> Result<Self>;
}

/// A declared constructor dependency.
#[derive(Clone)]
pub enum Dependency {
    /// The room itself.
    Room,
    /// Another module class, referenced by type.
    Module(ModuleClass),
    /// Another module class, referenced by name and resolved against the
    /// registry of classes known to the room.
    Named(&'static str),
}

impl Dependency {
    /// Typed dependency on module `M`.
    pub fn on<M: RoomModule>() -> Self {
        Dependency::Module(ModuleClass::of::<M>())
    }

    /// Named dependency; fails at resolve time if no class with that name
    /// is known to the room.
    pub fn named(name: &'static str) -> Self {
        Dependency::Named(name)
    }
}

/// Object-safe view of a constructed module.
pub trait ModuleInstance: Send + Sync {
    fn name(&self) -> &'static str;
    fn handle(&self, room: &Room, event: &crate::event_system::RoomEvent)
        -> Result<crate::event_system::Flow>;
    fn as_any(&self) -> &dyn Any;
}

impl<M: RoomModule> ModuleInstance for M {
    fn name(&self) -> &'static str {
        M::NAME
    }

    fn handle(
        &self,
        room: &Room,
        event: &crate::event_system::RoomEvent,
    ) -> Result<crate::event_system::Flow> {
        RoomHandlers::handle(self, room, event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) struct BuiltModule {
    pub instance: Arc<dyn ModuleInstance>,
    pub any: Arc<dyn Any + Send + Sync>,
    pub commands: Vec<CommandDef>,
    pub default_state: Value,
}

/// Static descriptor of a module class: identity, dependency metadata and a
/// monomorphized constructor.
#[derive(Clone, Copy)]
pub struct ModuleClass {
    name: &'static str,
    type_id: fn() -> TypeId,
    dependencies: fn() -> Vec<Dependency>,
    construct: fn(&ModuleContext) -> Result<BuiltModule>,
}

impl ModuleClass {
    pub fn of<M: RoomModule>() -> Self {
        Self {
            name: M::NAME,
            type_id: type_id_of::<M>,
            dependencies: M::dependencies,
            construct: construct_of::<M>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> TypeId {
        (self.type_id)()
    }

    pub(crate) fn dependencies(&self) -> Vec<Dependency> {
        (self.dependencies)()
    }
}

impl fmt::Debug for ModuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleClass").field(&self.name).finish()
    }
}

impl PartialEq for ModuleClass {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

fn type_id_of<M: RoomModule>() -> TypeId {
    TypeId::of::<M>()
}

fn construct_of<M: RoomModule>(ctx: &ModuleContext) -> Result<BuiltModule> {
    let module = Arc::new(M::create(ctx)?);

    let mut commands = Vec::new();
    for spec in M::commands() {
        let bound = Arc::clone(&module);
        let handler = spec.handler;
        commands.push(CommandDef {
            names: spec.names.iter().map(|s| s.to_string()).collect(),
            access: spec.access.map(String::from),
            description: spec.description.map(String::from),
            owner: Some(M::NAME),
            handler: Box::new(move |room, player, args| handler(&bound, room, player, args)),
        });
    }

    Ok(BuiltModule {
        any: Arc::clone(&module) as Arc<dyn Any + Send + Sync>,
        instance: module,
        commands,
        default_state: M::default_state(),
    })
}

enum DepValue {
    Room,
    Module(Arc<dyn Any + Send + Sync>),
}

struct ResolvedDep {
    type_id: Option<TypeId>,
    value: DepValue,
}

/// Injection view a module constructor pulls its dependencies from.
pub struct ModuleContext {
    module: &'static str,
    room: RoomHandle,
    deps: Vec<ResolvedDep>,
}

impl ModuleContext {
    /// The room handle; requires `Dependency::Room` to be declared.
    pub fn room(&self) -> Result<RoomHandle> {
        if self
            .deps
            .iter()
            .any(|d| matches!(d.value, DepValue::Room))
        {
            Ok(self.room.clone())
        } else {
            Err(Error::InvalidDependency {
                module: self.module.to_string(),
                dependency: "Room".to_string(),
            })
        }
    }

    /// A constructed dependency module; requires `M` to be declared.
    pub fn module<M: RoomModule>(&self) -> Result<Arc<M>> {
        let id = TypeId::of::<M>();
        for dep in &self.deps {
            if dep.type_id == Some(id) {
                if let DepValue::Module(any) = &dep.value {
                    return Arc::clone(any).downcast::<M>().map_err(|_| {
                        Error::InvalidDependency {
                            module: self.module.to_string(),
                            dependency: M::NAME.to_string(),
                        }
                    });
                }
            }
        }
        Err(Error::InvalidDependency {
            module: self.module.to_string(),
            dependency: M::NAME.to_string(),
        })
    }
}

/// Directed graph over module names, for the cycle pre-check.
struct DependencyGraph {
    graph: DiGraph<&'static str, ()>,
    nodes: HashMap<&'static str, NodeIndex>,
}

impl DependencyGraph {
    fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        }
    }

    fn node(&mut self, name: &'static str) -> NodeIndex {
        if let Some(index) = self.nodes.get(name) {
            return *index;
        }
        let index = self.graph.add_node(name);
        self.nodes.insert(name, index);
        index
    }

    fn add_edge(&mut self, dependency: &'static str, dependent: &'static str) {
        let dep = self.node(dependency);
        let module = self.node(dependent);
        self.graph.add_edge(dep, module, ());
    }

    /// Reject strongly connected components with more than one member.
    fn check_circular(&self) -> Result<()> {
        let cycles: Vec<Vec<&'static str>> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                component
                    .into_iter()
                    .map(|node| self.graph[node])
                    .collect()
            })
            .collect();

        if cycles.is_empty() {
            return Ok(());
        }
        let description = cycles
            .iter()
            .map(|cycle| cycle.join(" -> "))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::CyclicDependency(description))
    }
}

/// Resolves module classes into constructed instances, depth-first, exactly
/// once per class.
pub(crate) struct ModuleResolver {
    registry: HashMap<&'static str, ModuleClass>,
    built: HashMap<TypeId, BuiltHandle>,
    in_progress: Vec<(TypeId, &'static str)>,
    order: Vec<Arc<dyn ModuleInstance>>,
}

#[derive(Clone)]
struct BuiltHandle {
    instance: Arc<dyn ModuleInstance>,
    any: Arc<dyn Any + Send + Sync>,
}

impl ModuleResolver {
    pub fn new() -> Self {
        Self {
            registry: HashMap::new(),
            built: HashMap::new(),
            in_progress: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Construct every requested class (and its transitive dependencies),
    /// registering commands and default state on the room as each module
    /// lands. Any failure is fatal to room construction.
    pub fn resolve_all(
        mut self,
        room: &Room,
        classes: &[ModuleClass],
    ) -> Result<Vec<Arc<dyn ModuleInstance>>> {
        for class in classes {
            self.register_class(*class)?;
        }
        // Walk typed dependencies first so named references can point at any
        // class in the closure, not just the configured list.
        let mut queue: Vec<ModuleClass> = classes.to_vec();
        let mut walked: Vec<TypeId> = Vec::new();
        while let Some(class) = queue.pop() {
            if walked.contains(&class.id()) {
                continue;
            }
            walked.push(class.id());
            for dep in class.dependencies() {
                if let Dependency::Module(dep_class) = dep {
                    self.register_class(dep_class)?;
                    queue.push(dep_class);
                }
            }
        }

        self.check_graph()?;

        for class in classes {
            self.resolve(room, *class)?;
        }
        Ok(self.order)
    }

    fn register_class(&mut self, class: ModuleClass) -> Result<()> {
        if let Some(existing) = self.registry.get(class.name()) {
            if existing.id() != class.id() {
                return Err(Error::Config(format!(
                    "two different module classes share the name `{}`",
                    class.name()
                )));
            }
            return Ok(());
        }
        self.registry.insert(class.name(), class);
        Ok(())
    }

    /// Build the name graph over the full class closure and reject cycles
    /// before any constructor runs, so a failed resolution leaves nothing
    /// partially constructed.
    fn check_graph(&self) -> Result<()> {
        let mut graph = DependencyGraph::new();
        for class in self.registry.values() {
            graph.node(class.name());
            for dep in class.dependencies() {
                match dep {
                    Dependency::Room => {}
                    Dependency::Module(dep_class) => {
                        if dep_class.id() == class.id() {
                            return Err(Error::SelfDependency(class.name().to_string()));
                        }
                        graph.add_edge(dep_class.name(), class.name());
                    }
                    Dependency::Named(name) => {
                        if name == class.name() {
                            return Err(Error::SelfDependency(class.name().to_string()));
                        }
                        if !self.registry.contains_key(name) {
                            return Err(Error::MissingDependencyMetadata(name.to_string()));
                        }
                        graph.add_edge(name, class.name());
                    }
                }
            }
        }
        graph.check_circular()
    }

    fn resolve(&mut self, room: &Room, class: ModuleClass) -> Result<Arc<dyn ModuleInstance>> {
        if let Some(built) = self.built.get(&class.id()) {
            return Ok(Arc::clone(&built.instance));
        }
        if self.in_progress.iter().any(|(id, _)| *id == class.id()) {
            // Backstop; the graph pre-check normally reports cycles first.
            let chain = self
                .in_progress
                .iter()
                .map(|(_, name)| *name)
                .chain([class.name()])
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::CyclicDependency(chain));
        }

        self.in_progress.push((class.id(), class.name()));
        let result = self.construct(room, class);
        self.in_progress.pop();
        result
    }

    fn construct(&mut self, room: &Room, class: ModuleClass) -> Result<Arc<dyn ModuleInstance>> {
        let mut deps = Vec::new();
        for dep in class.dependencies() {
            match dep {
                Dependency::Room => deps.push(ResolvedDep {
                    type_id: None,
                    value: DepValue::Room,
                }),
                Dependency::Module(dep_class) => {
                    deps.push(self.resolve_dep(room, class, dep_class)?)
                }
                Dependency::Named(name) => {
                    let dep_class = *self
                        .registry
                        .get(name)
                        .ok_or_else(|| Error::MissingDependencyMetadata(name.to_string()))?;
                    deps.push(self.resolve_dep(room, class, dep_class)?)
                }
            }
        }

        let ctx = ModuleContext {
            module: class.name(),
            room: room.handle(),
            deps,
        };
        debug!(module = class.name(), "constructing module");
        let built = (class.construct)(&ctx)?;

        self.built.insert(
            class.id(),
            BuiltHandle {
                instance: Arc::clone(&built.instance),
                any: Arc::clone(&built.any),
            },
        );
        self.order.push(Arc::clone(&built.instance));

        room.merge_default_state(built.default_state);
        for def in built.commands {
            room.commands().register(def, room.role_table())?;
        }
        info!(module = class.name(), "module registered");
        Ok(built.instance)
    }

    fn resolve_dep(
        &mut self,
        room: &Room,
        class: ModuleClass,
        dep_class: ModuleClass,
    ) -> Result<ResolvedDep> {
        if dep_class.id() == class.id() {
            return Err(Error::SelfDependency(class.name().to_string()));
        }
        self.resolve(room, dep_class)?;
        let built = &self.built[&dep_class.id()];
        Ok(ResolvedDep {
            type_id: Some(dep_class.id()),
            value: DepValue::Module(Arc::clone(&built.any)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::test_support::stub_room;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracker;
    impl RoomHandlers for Tracker {}
    impl RoomModule for Tracker {
        const NAME: &'static str = "tracker";
        fn create(_ctx: &ModuleContext) -> Result<Self> {
            Ok(Self)
        }
    }

    struct NeedsTracker {
        tracker: Arc<Tracker>,
    }
    impl RoomHandlers for NeedsTracker {}
    impl RoomModule for NeedsTracker {
        const NAME: &'static str = "needs_tracker";
        fn dependencies() -> Vec<Dependency> {
            vec![Dependency::on::<Tracker>()]
        }
        fn create(ctx: &ModuleContext) -> Result<Self> {
            Ok(Self {
                tracker: ctx.module::<Tracker>()?,
            })
        }
    }

    struct AlsoNeedsTracker;
    impl RoomHandlers for AlsoNeedsTracker {}
    impl RoomModule for AlsoNeedsTracker {
        const NAME: &'static str = "also_needs_tracker";
        fn dependencies() -> Vec<Dependency> {
            vec![Dependency::named("tracker")]
        }
        fn create(ctx: &ModuleContext) -> Result<Self> {
            ctx.module::<Tracker>()?;
            Ok(Self)
        }
    }

    struct Selfish;
    impl RoomHandlers for Selfish {}
    impl RoomModule for Selfish {
        const NAME: &'static str = "selfish";
        fn dependencies() -> Vec<Dependency> {
            vec![Dependency::on::<Selfish>()]
        }
        fn create(_ctx: &ModuleContext) -> Result<Self> {
            Ok(Self)
        }
    }

    struct CycleA;
    impl RoomHandlers for CycleA {}
    impl RoomModule for CycleA {
        const NAME: &'static str = "cycle_a";
        fn dependencies() -> Vec<Dependency> {
            vec![Dependency::on::<CycleB>()]
        }
        fn create(_ctx: &ModuleContext) -> Result<Self> {
            Ok(Self)
        }
    }

    struct CycleB;
    impl RoomHandlers for CycleB {}
    impl RoomModule for CycleB {
        const NAME: &'static str = "cycle_b";
        fn dependencies() -> Vec<Dependency> {
            vec![Dependency::on::<CycleA>()]
        }
        fn create(_ctx: &ModuleContext) -> Result<Self> {
            Ok(Self)
        }
    }

    struct Greedy;
    impl RoomHandlers for Greedy {}
    impl RoomModule for Greedy {
        const NAME: &'static str = "greedy";
        fn create(ctx: &ModuleContext) -> Result<Self> {
            // Asks for a module it never declared.
            ctx.module::<Tracker>()?;
            Ok(Self)
        }
    }

    #[test]
    fn dependencies_are_constructed_first_and_memoized() {
        static CONSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl RoomHandlers for Counted {}
        impl RoomModule for Counted {
            const NAME: &'static str = "counted";
            fn create(_ctx: &ModuleContext) -> Result<Self> {
                CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);
                Ok(Self)
            }
        }

        struct WantsCounted;
        impl RoomHandlers for WantsCounted {}
        impl RoomModule for WantsCounted {
            const NAME: &'static str = "wants_counted";
            fn dependencies() -> Vec<Dependency> {
                vec![Dependency::on::<Counted>()]
            }
            fn create(ctx: &ModuleContext) -> Result<Self> {
                ctx.module::<Counted>()?;
                Ok(Self)
            }
        }

        let room = stub_room();
        let modules = ModuleResolver::new()
            .resolve_all(
                &room,
                &[
                    ModuleClass::of::<WantsCounted>(),
                    ModuleClass::of::<Counted>(),
                    ModuleClass::of::<AlsoNeedsTracker>(),
                    ModuleClass::of::<Tracker>(),
                ],
            )
            .unwrap();

        let names: Vec<_> = modules.iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec!["counted", "wants_counted", "tracker", "also_needs_tracker"]
        );
        assert_eq!(CONSTRUCTIONS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn injected_dependency_is_the_memoized_instance() {
        let room = stub_room();
        let modules = ModuleResolver::new()
            .resolve_all(
                &room,
                &[ModuleClass::of::<Tracker>(), ModuleClass::of::<NeedsTracker>()],
            )
            .unwrap();

        let tracker = Arc::clone(&modules[0]);
        let consumer = modules[1]
            .as_ref()
            .as_any()
            .downcast_ref::<NeedsTracker>()
            .unwrap();
        assert!(std::ptr::eq(
            tracker.as_any().downcast_ref::<Tracker>().unwrap(),
            consumer.tracker.as_ref()
        ));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let room = stub_room();
        let result =
            ModuleResolver::new().resolve_all(&room, &[ModuleClass::of::<Selfish>()]);
        assert!(matches!(result, Err(Error::SelfDependency(name)) if name == "selfish"));
    }

    #[test]
    fn cycles_are_rejected_before_any_construction() {
        let room = stub_room();
        let result = ModuleResolver::new().resolve_all(&room, &[ModuleClass::of::<CycleA>()]);
        assert!(matches!(result, Err(Error::CyclicDependency(_))));
        assert_eq!(room.stats().modules, 0);
    }

    #[test]
    fn unknown_named_dependency_is_rejected() {
        struct Lost;
        impl RoomHandlers for Lost {}
        impl RoomModule for Lost {
            const NAME: &'static str = "lost";
            fn dependencies() -> Vec<Dependency> {
                vec![Dependency::named("phantom")]
            }
            fn create(_ctx: &ModuleContext) -> Result<Self> {
                Ok(Self)
            }
        }

        let room = stub_room();
        let result = ModuleResolver::new().resolve_all(&room, &[ModuleClass::of::<Lost>()]);
        assert!(
            matches!(result, Err(Error::MissingDependencyMetadata(name)) if name == "phantom")
        );
    }

    #[test]
    fn undeclared_injection_request_is_rejected() {
        let room = stub_room();
        let result = ModuleResolver::new().resolve_all(&room, &[ModuleClass::of::<Greedy>()]);
        assert!(matches!(
            result,
            Err(Error::InvalidDependency { module, dependency })
                if module == "greedy" && dependency == "tracker"
        ));
    }
}
