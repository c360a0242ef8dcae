/// Derive a display name from an identifier: underscores and hyphens become
/// spaces, each word is title-cased.
pub fn prettify_name(id: &str) -> String {
  id.split(|c| c == '_' || c == '-')
    .filter(|word| !word.is_empty())
    .map(|word| {
      let mut chars = word.chars();
      match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
      }
    })
    .collect::<Vec<_>>()
    .join(" ")
}

/// Build the scheduler job id for a (pipeline, trigger) pair. The job id is
/// used to find back the pipeline and trigger associated with a fired job.
pub fn job_id(pipeline_id: &str, trigger_id: &str) -> String {
  format!("{}: {}", pipeline_id, trigger_id)
}
