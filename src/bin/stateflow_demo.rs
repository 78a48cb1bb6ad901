//! Run one of the city demo jobs and print running totals.
//!
//! `STATEFLOW_DEMO` picks the job (`reduce`, the default, or
//! `aggregate`). `STATEFLOW_DEMO_LIMIT` ends the input after that many
//! readings; without it readings arrive once a second forever. Engine
//! configuration comes from the other `STATEFLOW_*` variables.

use std::time::Duration;

use chrono::Utc;
use stateflow::config::EngineConfig;
use stateflow::demos::{aggregating_job, reducing_job};
use stateflow::errors::{EngineError, EngineResult};
use stateflow::execution::JobRunner;
use stateflow::inputs::CityInput;
use stateflow::metrics::{initialize_metrics, render_metrics};
use stateflow::outputs::StdOutput;
use stateflow::tracing::setup_tracing;

fn main() {
    if let Err(err) = run() {
        eprintln!("stateflow-demo failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> EngineResult<()> {
    setup_tracing(Some("info"))?;
    initialize_metrics()?;

    let config = EngineConfig::from_env()?;
    let mut input = CityInput::new(fastrand::u64(..), Utc::now()).paced(Duration::from_secs(1));
    if let Ok(limit) = std::env::var("STATEFLOW_DEMO_LIMIT") {
        let limit = limit.trim().parse().map_err(|err| {
            EngineError::Config(format!("invalid STATEFLOW_DEMO_LIMIT {limit:?}: {err}"))
        })?;
        input = input.limit(limit);
    }

    let demo = std::env::var("STATEFLOW_DEMO").unwrap_or_else(|_| "reduce".to_string());
    match demo.as_str() {
        "reduce" => {
            let runner = JobRunner::new(reducing_job()?, config, input, StdOutput)?;
            let report = runner.run_blocking()?;
            println!(
                "finished with {} accumulators after {} restart(s)",
                report.final_state.len(),
                report.restarts
            );
        }
        "aggregate" => {
            let runner = JobRunner::new(aggregating_job()?, config, input, StdOutput)?;
            let report = runner.run_blocking()?;
            println!(
                "finished with {} accumulators after {} restart(s)",
                report.final_state.len(),
                report.restarts
            );
        }
        other => {
            return Err(EngineError::Config(format!(
                "unknown demo {other:?}; use reduce or aggregate"
            )))
        }
    }

    print!("{}", render_metrics()?);
    Ok(())
}
