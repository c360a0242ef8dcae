//! Demo pipelines registered by the CLI: a diamond-shaped ETL and a
//! fan-out/chained sweep, exercising params, bindings and mapping.

use std::time::Duration;

use serde_json::json;
use sluice_orchestrator::Orchestrator;
use sluice_pipeline::{Binding, Pipeline, PipelineError, Schedule, Task, TaskFn, Trigger};

pub fn register_demo_pipelines(orchestrator: &Orchestrator) -> Result<(), PipelineError> {
  orchestrator.register_pipeline(sales_report()?);
  orchestrator.register_pipeline(certificate_sweep()?);
  Ok(())
}

/// extract_orders -> [total_amount, order_count] -> publish_report
fn sales_report() -> Result<Pipeline, PipelineError> {
  let extract = Task::new(
    "extract_orders",
    TaskFn::from_sync(|invocation| {
      let region = invocation
        .params()
        .and_then(|params| params.get("region"))
        .and_then(|region| region.as_str())
        .unwrap_or("emea")
        .to_string();
      invocation
        .context()
        .info(&format!("extracting orders for region '{region}'"));
      Ok(Some(json!([
        {"region": region, "amount": 120},
        {"region": region, "amount": 80},
        {"region": region, "amount": 42},
      ])))
    }),
  )
  .with_description("Pull raw order rows");

  let total = Task::new(
    "total_amount",
    TaskFn::from_sync(|invocation| {
      let orders = invocation.require_input("orders")?;
      let total: i64 = orders
        .as_array()
        .map(|rows| {
          rows
            .iter()
            .filter_map(|row| row.get("amount").and_then(|amount| amount.as_i64()))
            .sum()
        })
        .unwrap_or(0);
      Ok(Some(json!({"total": total})))
    }),
  )
  .with_binding(Binding::new("orders", "extract_orders").with_schema(json!({"type": "array"})));

  let count = Task::new(
    "order_count",
    TaskFn::from_sync(|invocation| {
      let orders = invocation.require_input("orders")?;
      let count = orders.as_array().map(|rows| rows.len()).unwrap_or(0);
      Ok(Some(json!({"count": count})))
    }),
  )
  .with_binding(Binding::new("orders", "extract_orders"));

  let report = Task::new(
    "publish_report",
    TaskFn::from_async(|invocation| async move {
      let total = invocation.context().get_output_data("total_amount").await?;
      let count = invocation.context().get_output_data("order_count").await?;
      invocation.context().info("report assembled");
      Ok(Some(json!({"total": total, "count": count})))
    }),
  );

  Pipeline::builder("sales_report")
    .with_description("Diamond-shaped ETL over a fake order feed")
    .add_task(extract)
    .add_task(total)
    .add_task(count)
    .add_task(report)
    .add_dependency("extract_orders", "total_amount")
    .add_dependency("extract_orders", "order_count")
    .add_dependency("total_amount", "publish_report")
    .add_dependency("order_count", "publish_report")
    .with_params_schema(json!({
      "type": "object",
      "properties": {"region": {"type": "string"}}
    }))
    .with_trigger(
      Trigger::new("hourly", Schedule::interval(Duration::from_secs(3600)))
        .with_params(json!({"region": "emea"})),
    )
    .build()
}

/// list_domains -> check_domain (fan-out) -> report_domain (chained)
fn certificate_sweep() -> Result<Pipeline, PipelineError> {
  let list = Task::new(
    "list_domains",
    TaskFn::from_sync(|_invocation| {
      Ok(Some(json!(["example.com", "example.org", "example.net"])))
    }),
  );

  let check = Task::new(
    "check_domain",
    TaskFn::from_async(|invocation| async move {
      let domain = invocation.context().get_output_data("list_domains").await?;
      let name = domain
        .and_then(|domain| domain.as_str().map(str::to_string))
        .unwrap_or_default();
      invocation.context().info(&format!("checking '{name}'"));
      // the demo fabricates an expiry instead of dialing out
      Ok(Some(json!({"domain": name, "days_left": 42})))
    }),
  )
  .fan_out("list_domains");

  let report = Task::new(
    "report_domain",
    TaskFn::from_async(|invocation| async move {
      let check = invocation.context().get_output_data("check_domain").await?;
      let summary = check
        .as_ref()
        .and_then(|check| check.get("domain"))
        .and_then(|domain| domain.as_str())
        .map(|domain| format!("{domain}: certificate ok"))
        .unwrap_or_else(|| "unknown domain".to_string());
      Ok(Some(json!(summary)))
    }),
  )
  .chained_fan_out("check_domain");

  Pipeline::builder("certificate_sweep")
    .with_description("Checks every domain's certificate, one instance per domain")
    .add_task(list)
    .add_task(check)
    .add_task(report)
    .add_dependency("list_domains", "check_domain")
    .add_dependency("check_domain", "report_domain")
    .with_trigger(Trigger::new("daily", Schedule::interval(Duration::from_secs(86_400))).paused())
    .build()
}
