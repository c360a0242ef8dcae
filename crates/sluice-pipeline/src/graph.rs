//! Dependency-graph validation and traversal.
//!
//! The graph is implicit in the tasks' `upstream_task_ids` sets; traversal
//! needs the inverse, so a downstream adjacency map is built first.

use std::collections::{BTreeSet, HashMap};

use crate::error::PipelineError;
use crate::task::Task;

/// Invert `upstream_task_ids` into a downstream adjacency map covering every
/// task, including ones with no edges.
pub fn downstream_map(tasks: &[Task]) -> HashMap<String, BTreeSet<String>> {
  let mut map: HashMap<String, BTreeSet<String>> = tasks
    .iter()
    .map(|task| (task.id.clone(), BTreeSet::new()))
    .collect();

  for task in tasks {
    for upstream_id in &task.upstream_task_ids {
      if let Some(downstream) = map.get_mut(upstream_id) {
        downstream.insert(task.id.clone());
      }
    }
  }

  map
}

/// Every upstream reference must name a task in the list.
pub(crate) fn ensure_dependencies_resolve(
  pipeline_id: &str,
  tasks: &[Task],
) -> Result<(), PipelineError> {
  let known: BTreeSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();

  for task in tasks {
    for upstream_id in &task.upstream_task_ids {
      if !known.contains(upstream_id.as_str()) {
        return Err(PipelineError::UnknownDependency {
          pipeline_id: pipeline_id.to_string(),
          task_id: task.id.clone(),
          upstream_id: upstream_id.clone(),
        });
      }
    }
  }

  Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
  Unvisited,
  Visiting,
  Visited,
}

fn visit(
  node: &str,
  adjacency: &HashMap<String, BTreeSet<String>>,
  marks: &mut HashMap<String, Mark>,
) -> bool {
  match marks.get(node).copied() {
    Some(Mark::Visiting) => return false,
    Some(Mark::Visited) => return true,
    _ => {}
  }

  marks.insert(node.to_string(), Mark::Visiting);

  if let Some(downstream) = adjacency.get(node) {
    for next in downstream {
      if !visit(next, adjacency, marks) {
        return false;
      }
    }
  }

  marks.insert(node.to_string(), Mark::Visited);
  true
}

/// Three-color depth-first search over the downstream map. Hitting a node
/// already on the current path means a cycle. Starts from every unvisited
/// node so disconnected components are covered too.
pub(crate) fn ensure_acyclic(pipeline_id: &str, tasks: &[Task]) -> Result<(), PipelineError> {
  let adjacency = downstream_map(tasks);
  let mut marks: HashMap<String, Mark> = tasks
    .iter()
    .map(|task| (task.id.clone(), Mark::Unvisited))
    .collect();

  for task in tasks {
    if marks.get(task.id.as_str()).copied() == Some(Mark::Unvisited)
      && !visit(&task.id, &adjacency, &mut marks)
    {
      return Err(PipelineError::CycleDetected {
        pipeline_id: pipeline_id.to_string(),
      });
    }
  }

  Ok(())
}

/// All task ids reachable downstream of `task_id`, the task itself excluded.
pub fn transitive_downstream(tasks: &[Task], task_id: &str) -> BTreeSet<String> {
  let adjacency = downstream_map(tasks);
  let mut reached = BTreeSet::new();
  let mut stack: Vec<String> = adjacency
    .get(task_id)
    .map(|downstream| downstream.iter().cloned().collect())
    .unwrap_or_default();

  while let Some(node) = stack.pop() {
    if reached.insert(node.clone()) {
      if let Some(downstream) = adjacency.get(&node) {
        stack.extend(downstream.iter().cloned());
      }
    }
  }

  reached
}
