//! Dependency resolution: load every reachable program, reject cycles, and
//! plan the order children run in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::core::graph::{DependencyGraph, NodeId, waves};
use crate::core::template;
use crate::core::types::ExecutionContext;
use crate::error::{ErrorCode, ErrorPayload, RunError, RunResult};
use crate::io::program::{Binding, DependencySpec, ProgramCache, ProgramDefinition};

/// Every program reachable from a root, with its execution plan.
#[derive(Debug)]
pub struct ResolvedGraph {
    pub graph: DependencyGraph,
    /// Indexed by `NodeId`.
    programs: Vec<Arc<ProgramDefinition>>,
    /// Per node: waves of indices into that program's `uses` list.
    schedules: Vec<Vec<Vec<usize>>>,
    pub root: NodeId,
    /// Children first; the root is last.
    pub order: Vec<NodeId>,
}

impl ResolvedGraph {
    pub fn program(&self, id: NodeId) -> &Arc<ProgramDefinition> {
        &self.programs[id]
    }

    pub fn root_program(&self) -> &Arc<ProgramDefinition> {
        self.program(self.root)
    }

    pub fn schedule(&self, id: NodeId) -> &[Vec<usize>] {
        &self.schedules[id]
    }

    /// Node the `index`-th `uses` entry of `parent` points at.
    pub fn dependency(&self, parent: NodeId, index: usize) -> NodeId {
        self.graph.node(parent).edges[index].target
    }

    pub fn order_paths(&self) -> Vec<PathBuf> {
        self.order
            .iter()
            .map(|&id| self.graph.node(id).path.clone())
            .collect()
    }
}

/// Load `root` and everything it transitively uses.
///
/// Fails with `dependency-cycle` when any program can reach itself, and with
/// `dependency-resolution` when a child file is missing. Runs before any
/// input validation or model call.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn resolve(cache: &ProgramCache, root: &Path) -> RunResult<ResolvedGraph> {
    let root_program = cache.load(root)?;
    let mut graph = DependencyGraph::new();
    let mut programs = Vec::new();

    let (root_id, _) = graph.insert(&root_program.path);
    programs.push(root_program);

    let mut pending = vec![root_id];
    while let Some(parent_id) = pending.pop() {
        let parent = Arc::clone(&programs[parent_id]);
        for spec in &parent.uses {
            let child = load_child(cache, &parent, spec)?;
            let (child_id, inserted) = graph.insert(&child.path);
            if inserted {
                programs.push(child);
                pending.push(child_id);
            }
            graph.add_edge(parent_id, &spec.name, child_id);
        }
    }

    let order = graph.topological_order(root_id).map_err(|cycle| {
        let chain: Vec<String> = cycle
            .path
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        RunError::from(
            ErrorPayload::new(
                ErrorCode::DependencyCycle,
                format!("dependency cycle: {}", chain.join(" -> ")),
            )
            .with_detail("cycle", chain),
        )
    })?;

    let mut schedules = Vec::with_capacity(programs.len());
    for program in &programs {
        schedules.push(schedule_dependencies(program)?);
    }

    debug!(programs = programs.len(), "dependency graph resolved");
    Ok(ResolvedGraph {
        graph,
        programs,
        schedules,
        root: root_id,
        order,
    })
}

fn load_child(
    cache: &ProgramCache,
    parent: &ProgramDefinition,
    spec: &DependencySpec,
) -> RunResult<Arc<ProgramDefinition>> {
    if !spec.path.is_file() {
        return Err(ErrorPayload::new(
            ErrorCode::DependencyResolution,
            format!("dependency '{}' not found", spec.name),
        )
        .with_detail("dependency", spec.name.as_str())
        .with_detail("path", spec.path.display().to_string())
        .with_detail("parent", parent.path.display().to_string())
        .into());
    }
    cache
        .load(&spec.path)
        .map_err(|err| within_dependency(err, &spec.name))
}

/// Waves of `uses` indices. A dependency whose bindings read `uses.<sibling>`
/// runs in a later wave than that sibling.
pub fn schedule_dependencies(program: &ProgramDefinition) -> RunResult<Vec<Vec<usize>>> {
    let siblings: Vec<(String, Vec<String>)> = program
        .uses
        .iter()
        .map(|spec| (spec.name.clone(), binding_reads(spec)))
        .collect();
    waves(&siblings).map_err(|cycle| {
        ErrorPayload::new(
            ErrorCode::DependencyCycle,
            format!(
                "dependencies of '{}' read each other: {}",
                program.name,
                cycle.names.join(", ")
            ),
        )
        .with_detail("cycle", cycle.names)
        .with_detail("program", program.path.display().to_string())
        .into()
    })
}

fn binding_reads(spec: &DependencySpec) -> Vec<String> {
    let mut names = Vec::new();
    for binding in spec.with.values() {
        if let Binding::Template(text) = binding {
            for name in template::referenced_dependencies(text) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

/// Child input for one dependency.
///
/// Literals keep their declared type; templates always render to strings
/// against the parent's input and the outputs completed so far.
pub fn render_bindings(
    spec: &DependencySpec,
    input: &Value,
    completed: &BTreeMap<String, Value>,
) -> Value {
    let ctx = ExecutionContext {
        input: input.clone(),
        uses: completed.clone(),
        ..ExecutionContext::default()
    };
    let mut out = Map::new();
    for (key, binding) in &spec.with {
        let value = match binding {
            Binding::Literal(value) => value.clone(),
            Binding::Template(text) => Value::String(template::render(text, &ctx)),
        };
        out.insert(key.clone(), value);
    }
    Value::Object(out)
}

/// Prefix `name` onto the error's `dependency_chain` detail.
pub fn within_dependency(err: RunError, name: &str) -> RunError {
    let mut chain = vec![Value::String(name.to_string())];
    if let Some(Value::Array(inner)) = err.payload().details.get("dependency_chain") {
        chain.extend(inner.iter().cloned());
    }
    err.with_detail("dependency_chain", chain)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{ProgramFixture, fixture_source, with_uses};

    #[test]
    fn order_puts_children_first() {
        let fixture = ProgramFixture::new();
        fixture.write("leaf.rllm", &fixture_source("leaf", "Leaf {{input.text}}"));
        fixture.write(
            "mid.rllm",
            &with_uses(
                &fixture_source("mid", "Mid {{uses.leaf.summary}}"),
                &[("leaf", "leaf.rllm", "{ text: \"{{input.text}}\" }")],
            ),
        );
        let root = fixture.write(
            "root.rllm",
            &with_uses(
                &fixture_source("root", "Root"),
                &[
                    ("mid", "mid.rllm", "{ text: \"{{input.text}}\" }"),
                    ("leaf", "leaf.rllm", "{ text: x }"),
                ],
            ),
        );

        let cache = ProgramCache::default();
        let resolved = resolve(&cache, &root).expect("resolve");
        let names: Vec<&str> = resolved
            .order
            .iter()
            .map(|&id| resolved.program(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["leaf", "mid", "root"]);
        assert_eq!(resolved.graph.len(), 3);
        assert_eq!(resolved.root_program().name, "root");
    }

    #[test]
    fn cycle_is_reported_from_any_start() {
        let fixture = ProgramFixture::new();
        let a = fixture.write(
            "a.rllm",
            &with_uses(&fixture_source("a", "A"), &[("b", "b.rllm", "{}")]),
        );
        let b = fixture.write(
            "b.rllm",
            &with_uses(&fixture_source("b", "B"), &[("a", "a.rllm", "{}")]),
        );
        let cache = ProgramCache::default();
        for start in [&a, &b] {
            let err = resolve(&cache, start).expect_err("cycle");
            assert_eq!(err.code(), ErrorCode::DependencyCycle);
            let cycle = err.payload().details["cycle"]
                .as_array()
                .expect("cycle list")
                .len();
            assert_eq!(cycle, 3);
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let fixture = ProgramFixture::new();
        let root = fixture.write(
            "self.rllm",
            &with_uses(&fixture_source("self", "S"), &[("me", "self.rllm", "{}")]),
        );
        let err = resolve(&ProgramCache::default(), &root).expect_err("cycle");
        assert_eq!(err.code(), ErrorCode::DependencyCycle);
    }

    #[test]
    fn missing_child_is_resolution_error() {
        let fixture = ProgramFixture::new();
        let root = fixture.write(
            "root.rllm",
            &with_uses(&fixture_source("root", "R"), &[("gone", "gone.rllm", "{}")]),
        );
        let err = resolve(&ProgramCache::default(), &root).expect_err("missing");
        assert_eq!(err.code(), ErrorCode::DependencyResolution);
        assert_eq!(err.payload().details["dependency"], "gone");
    }

    #[test]
    fn sibling_reads_create_later_waves() {
        let fixture = ProgramFixture::new();
        fixture.write("leaf.rllm", &fixture_source("leaf", "Leaf"));
        let root = fixture.write(
            "root.rllm",
            &with_uses(
                &fixture_source("root", "R"),
                &[
                    ("second", "leaf.rllm", "{ text: \"{{uses.first.summary}}\" }"),
                    ("first", "leaf.rllm", "{ text: a }"),
                    ("other", "leaf.rllm", "{ text: b }"),
                ],
            ),
        );
        let resolved = resolve(&ProgramCache::default(), &root).expect("resolve");
        assert_eq!(resolved.schedule(resolved.root), &[vec![1, 2], vec![0]]);
    }

    #[test]
    fn bindings_keep_literal_types_and_render_templates() {
        let spec = DependencySpec {
            name: "child".to_string(),
            path: PathBuf::from("child.rllm"),
            with: BTreeMap::from([
                ("limit".to_string(), Binding::Literal(json!(3))),
                (
                    "text".to_string(),
                    Binding::Template("{{input.text}} / {{uses.prev.summary}}".to_string()),
                ),
                ("count".to_string(), Binding::Template("{{input.n}}".to_string())),
            ]),
        };
        let completed = BTreeMap::from([("prev".to_string(), json!({"summary": "s"}))]);
        let rendered = render_bindings(&spec, &json!({"text": "abc", "n": 2}), &completed);
        assert_eq!(rendered, json!({"limit": 3, "text": "abc / s", "count": "2"}));
    }

    #[test]
    fn dependency_chain_accumulates_outward() {
        let err = RunError::new(ErrorCode::InputSchemaViolation, "bad");
        let err = within_dependency(within_dependency(err, "inner"), "outer");
        assert_eq!(err.payload().details["dependency_chain"], json!(["outer", "inner"]));
    }
}
