//! Pipeline execution: `lectern run`, `lectern claim` and `lectern finalize`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use lectern::config::LecternConfig;
use lectern::gate::GateOutcome;
use lectern::orchestrator::{DrainReport, Orchestrator};
use lectern::pipeline::{SegmentOutcome, SegmentPipeline};
use lectern::provider::http::{HttpContentAnalyzer, build_registry};

use super::open_db;

fn default_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

/// Wire the HTTP providers and the pipeline from configuration.
fn build_orchestrator(config: &LecternConfig, worker: Option<&str>) -> Result<Orchestrator> {
    for warning in config.validate() {
        tracing::warn!(warning = %warning, "Configuration warning");
    }

    let db = open_db(config)?;
    let providers = &config.toml.providers;
    let Some(analysis_url) = providers.analysis_url.as_deref() else {
        bail!(
            "No content-analysis provider configured. Set [providers] analysis_url in lectern.toml or LECTERN_ANALYSIS_URL."
        );
    };
    let timeout = Duration::from_secs(providers.request_timeout_secs);
    let analyzer = HttpContentAnalyzer::new(analysis_url, timeout)?;
    let registry = build_registry(&config.toml.generator_endpoints(), timeout)?;
    if registry.is_empty() {
        tracing::warn!("No generator endpoints configured; every plan will fail generation");
    }

    let pipeline = SegmentPipeline::new(
        db,
        Arc::new(analyzer),
        registry,
        config.toml.pipeline_settings(),
    )
    .with_propagator(config.toml.context_propagator());

    let worker_id = worker
        .map(str::to_string)
        .unwrap_or_else(default_worker_id);
    Ok(Orchestrator::new(Arc::new(pipeline), worker_id))
}

fn print_gate(outcome: &GateOutcome) {
    if outcome.published {
        let label = if outcome.newly_published {
            "Published"
        } else {
            "Already published"
        };
        println!(
            "{} course {}",
            console::style(label).green().bold(),
            outcome.course_id
        );
        return;
    }
    println!(
        "{} course {}",
        console::style("Not ready:").yellow().bold(),
        outcome.course_id
    );
    for reason in &outcome.blocking {
        println!("  - {}", reason);
    }
}

fn print_report(report: &DrainReport) {
    println!();
    println!(
        "Ran {} task(s): {} segment(s) completed, {} failed, {} deferred",
        report.steps, report.segments_completed, report.segments_failed, report.deferred
    );
    for course_id in &report.published {
        println!("{} course {}", console::style("Published").green().bold(), course_id);
    }
    for outcome in &report.blocked {
        print_gate(outcome);
    }
}

pub async fn cmd_run(
    config: &LecternConfig,
    course_id: &str,
    worker: Option<&str>,
    max_steps: usize,
) -> Result<()> {
    let orchestrator = build_orchestrator(config, worker)?;
    tracing::info!(course_id, worker_id = orchestrator.worker_id(), "Starting course");

    orchestrator.start_course(course_id).await?;
    let report = orchestrator.drain(max_steps).await?;
    print_report(&report);

    if report.segments_failed > 0 {
        println!();
        println!(
            "Reattempt a failed segment with `lectern claim <segment-id>`; see `lectern status {}`.",
            course_id
        );
    }
    Ok(())
}

pub async fn cmd_claim(config: &LecternConfig, segment_id: &str, worker: Option<&str>) -> Result<()> {
    let orchestrator = build_orchestrator(config, worker)?;

    let outcome = orchestrator.process_segment(segment_id).await?;
    match &outcome {
        SegmentOutcome::Completed(done) => {
            println!(
                "{} segment {} ({} question(s), {} failed plan(s))",
                console::style("Completed").green().bold(),
                done.segment_id,
                done.questions_count,
                done.failed_plans
            );
            if let Some(note) = &done.note {
                println!("  note: {}", note);
            }
        }
        SegmentOutcome::AlreadyDone { segment_id } => {
            println!("Segment {} is already completed", segment_id);
        }
        SegmentOutcome::Conflict { segment_id } => {
            println!(
                "{} segment {} is held by another worker",
                console::style("Busy:").yellow().bold(),
                segment_id
            );
        }
        SegmentOutcome::DependencyNotReady {
            segment_id,
            predecessor_status,
        } => {
            println!(
                "{} segment {} waits on its predecessor ({})",
                console::style("Not ready:").yellow().bold(),
                segment_id,
                predecessor_status
            );
        }
        SegmentOutcome::Failed { segment_id, error } => {
            println!(
                "{} segment {}: {}",
                console::style("Failed").red().bold(),
                segment_id,
                error
            );
            return Ok(());
        }
        SegmentOutcome::Superseded { segment_id } => {
            println!("Segment {} was taken over by another worker", segment_id);
        }
    }

    // Continue the chain the completed segment handed off to.
    let report = orchestrator.drain(lectern::orchestrator::DEFAULT_MAX_STEPS).await?;
    if report.steps > 0 {
        print_report(&report);
    }
    Ok(())
}

pub async fn cmd_finalize(config: &LecternConfig, course_id: &str) -> Result<()> {
    let db = open_db(config)?;
    let outcome = lectern::gate::evaluate(&db, course_id).await?;
    print_gate(&outcome);
    Ok(())
}
