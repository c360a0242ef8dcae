use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::PipelineError;
use crate::graph::{self, transitive_downstream};
use crate::task::Task;
use crate::trigger::Trigger;
use crate::util::prettify_name;

/// A named, validated DAG of tasks.
///
/// Constructed once through [`PipelineBuilder`] and immutable afterwards;
/// construction fails if any dependency dangles or the graph has a cycle, and
/// a pipeline that fails validation is never registered.
#[derive(Debug, Clone)]
pub struct Pipeline {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  /// Declaration order only; execution order comes from the graph.
  pub tasks: Vec<Task>,
  /// JSON schema the input parameters are validated against, if any.
  pub params_schema: Option<Value>,
  pub triggers: Vec<Trigger>,
}

impl Pipeline {
  pub fn builder(id: impl Into<String>) -> PipelineBuilder {
    PipelineBuilder::new(id)
  }

  pub fn get_task(&self, task_id: &str) -> Option<&Task> {
    self.tasks.iter().find(|task| task.id == task_id)
  }

  /// DAG entry points: tasks with no upstream dependencies.
  pub fn entry_tasks(&self) -> Vec<&Task> {
    self
      .tasks
      .iter()
      .filter(|task| task.upstream_task_ids.is_empty())
      .collect()
  }

  /// Tasks that declare `task_id` among their upstream dependencies.
  pub fn downstream_of(&self, task_id: &str) -> Vec<&Task> {
    self
      .tasks
      .iter()
      .filter(|task| task.upstream_task_ids.contains(task_id))
      .collect()
  }

  /// All task ids reachable downstream of `task_id` (exclusive).
  pub fn transitive_downstream(&self, task_id: &str) -> BTreeSet<String> {
    transitive_downstream(&self.tasks, task_id)
  }

  pub fn get_trigger(&self, trigger_id: &str) -> Option<&Trigger> {
    self
      .triggers
      .iter()
      .find(|trigger| trigger.id == trigger_id)
  }
}

/// Builds and validates a [`Pipeline`].
///
/// Dependencies are declared explicitly with [`add_dependency`]; it mutates
/// both tasks' id sets, so the graph lives in plain string ids rather than in
/// shared task objects.
///
/// [`add_dependency`]: PipelineBuilder::add_dependency
pub struct PipelineBuilder {
  id: String,
  name: Option<String>,
  description: Option<String>,
  tasks: Vec<Task>,
  edges: Vec<(String, String)>,
  params_schema: Option<Value>,
  triggers: Vec<Trigger>,
}

impl PipelineBuilder {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: None,
      description: None,
      tasks: Vec::new(),
      edges: Vec::new(),
      params_schema: None,
      triggers: Vec::new(),
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn add_task(mut self, task: Task) -> Self {
    self.tasks.push(task);
    self
  }

  /// Declare that `upstream` runs before `downstream`. Both tasks must have
  /// been (or later be) added; the edge is applied and checked at build time.
  pub fn add_dependency(mut self, upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
    self.edges.push((upstream.into(), downstream.into()));
    self
  }

  pub fn with_params_schema(mut self, schema: Value) -> Self {
    self.params_schema = Some(schema);
    self
  }

  pub fn with_trigger(mut self, trigger: Trigger) -> Self {
    self.triggers.push(trigger);
    self
  }

  /// Validate and produce the immutable pipeline.
  pub fn build(mut self) -> Result<Pipeline, PipelineError> {
    let mut seen = BTreeSet::new();
    for task in &self.tasks {
      if !seen.insert(task.id.clone()) {
        return Err(PipelineError::DuplicateTask {
          pipeline_id: self.id.clone(),
          task_id: task.id.clone(),
        });
      }
    }

    for (upstream, downstream) in std::mem::take(&mut self.edges) {
      for endpoint in [&upstream, &downstream] {
        if !seen.contains(endpoint.as_str()) {
          return Err(PipelineError::UnknownTask {
            pipeline_id: self.id.clone(),
            task_id: endpoint.clone(),
          });
        }
      }
      for task in &mut self.tasks {
        if task.id == upstream {
          task.downstream_task_ids.insert(downstream.clone());
        } else if task.id == downstream {
          task.upstream_task_ids.insert(upstream.clone());
        }
      }
    }

    graph::ensure_dependencies_resolve(&self.id, &self.tasks)?;

    for task in &self.tasks {
      if task.mapping_mode.is_some() {
        let map_upstream = task
          .map_upstream_id
          .as_ref()
          .ok_or_else(|| PipelineError::MappingWithoutSource {
            task_id: task.id.clone(),
          })?;
        if !task.upstream_task_ids.contains(map_upstream) {
          return Err(PipelineError::MapSourceNotUpstream {
            task_id: task.id.clone(),
            upstream_id: map_upstream.clone(),
          });
        }
      }

      for binding in &task.bindings {
        if !task.upstream_task_ids.contains(&binding.upstream_id) {
          return Err(PipelineError::BindingNotUpstream {
            task_id: task.id.clone(),
            name: binding.name.clone(),
            upstream_id: binding.upstream_id.clone(),
          });
        }
      }
    }

    graph::ensure_acyclic(&self.id, &self.tasks)?;

    let name = self.name.unwrap_or_else(|| prettify_name(&self.id));
    Ok(Pipeline {
      id: self.id,
      name,
      description: self.description,
      tasks: self.tasks,
      params_schema: self.params_schema,
      triggers: self.triggers,
    })
  }
}
