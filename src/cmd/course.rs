//! Course ingestion and status commands.

use anyhow::{Context, Result};
use serde::Serialize;

use lectern::config::LecternConfig;
use lectern::store::models::{
    Course, DispatchTask, PlanStatus, ProgressRecord, QuestionPlan, Segment, SegmentStatus,
};

use super::open_db;

pub async fn cmd_ingest(
    config: &LecternConfig,
    title: &str,
    video_ref: &str,
    duration: f64,
    segment_length: Option<f64>,
) -> Result<()> {
    let db = open_db(config)?;
    let segment_length = segment_length.unwrap_or(config.toml.pipeline.segment_length_secs);
    let (course, segments) =
        lectern::course::ingest(&db, title, video_ref, duration, segment_length).await?;

    println!("Created course {}", console::style(&course.id).bold());
    println!("  title: {}", course.title);
    println!("  video: {}", course.video_ref);
    println!();
    for segment in &segments {
        println!(
            "  {:<4} {:<48} {:>9.1}s – {:>9.1}s",
            segment.segment_index, segment.id, segment.time_range.start, segment.time_range.end
        );
    }
    println!();
    println!("Run `lectern run {}` to process it.", course.id);
    Ok(())
}

#[derive(Serialize)]
struct CourseStatus {
    course: Course,
    segments: Vec<SegmentStatusLine>,
    progress: Vec<ProgressRecord>,
    tasks: Vec<DispatchTask>,
}

#[derive(Serialize)]
struct SegmentStatusLine {
    segment: Segment,
    plans: Vec<QuestionPlan>,
}

async fn load_status(db: &lectern::store::DbHandle, course_id: &str) -> Result<CourseStatus> {
    let id = course_id.to_string();
    db.call(move |db| {
        let course = db
            .get_course(&id)?
            .with_context(|| format!("Course {} not found", id))?;
        let mut segments = Vec::new();
        for segment in db.list_segments(&id)? {
            let plans = db.list_plans(&segment.id)?;
            segments.push(SegmentStatusLine { segment, plans });
        }
        Ok(CourseStatus {
            course,
            segments,
            progress: db.list_progress(&id)?,
            tasks: db.list_tasks(&id)?,
        })
    })
    .await
}

fn styled_status(status: SegmentStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        SegmentStatus::Completed => console::style(text).green(),
        SegmentStatus::Processing => console::style(text).cyan(),
        SegmentStatus::Failed => console::style(text).red().bold(),
        SegmentStatus::Pending => console::style(text).dim(),
    }
}

fn print_status(status: &CourseStatus) {
    let course = &status.course;
    println!();
    println!("{}", console::style(&course.title).bold().cyan());
    println!("  id:        {}", course.id);
    println!("  video:     {}", course.video_ref);
    let published = if course.published {
        console::style("yes".to_string()).green()
    } else {
        console::style("no".to_string()).yellow()
    };
    println!("  published: {}", published);
    println!();

    println!(
        "{:<6} {:<12} {:>9} {:>9} {:>7} {:>7}  Note",
        "Index", "Status", "Start", "End", "Plans", "Retry"
    );
    println!(
        "{:<6} {:<12} {:>9} {:>9} {:>7} {:>7}  ----",
        "-----", "------", "-----", "---", "-----", "-----"
    );
    for line in &status.segments {
        let s = &line.segment;
        let failed = line
            .plans
            .iter()
            .filter(|p| p.status == PlanStatus::Failed)
            .count();
        let note = s
            .error_message
            .as_deref()
            .or(s.note.as_deref())
            .unwrap_or("");
        println!(
            "{:<6} {:<12} {:>9.1} {:>9.1} {:>7} {:>7}  {}",
            s.segment_index,
            styled_status(s.status),
            s.time_range.start,
            s.time_range.end,
            format!("{}/{}", s.questions_count, line.plans.len()),
            s.retry_count,
            note
        );
        if failed > 0 {
            println!(
                "       {}",
                console::style(format!("{} plan(s) failed", failed)).yellow()
            );
        }
    }
    println!();

    for record in &status.progress {
        println!(
            "Progress [{}]: {:>5.1}%  {} ({})",
            record.session_id,
            record.overall_progress * 100.0,
            record.stage.as_str(),
            record.step
        );
    }
    let pending = status
        .tasks
        .iter()
        .filter(|t| t.status.as_str() == "pending")
        .count();
    if pending > 0 {
        println!("Dispatch: {} task(s) pending", pending);
    }
    println!();
}

pub async fn cmd_status(config: &LecternConfig, course_id: Option<&str>, json: bool) -> Result<()> {
    let db = open_db(config)?;

    let Some(course_id) = course_id else {
        let courses = db.call(|db| db.list_courses()).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&courses)?);
            return Ok(());
        }
        if courses.is_empty() {
            println!("No courses yet. Run `lectern ingest` to add one.");
            return Ok(());
        }
        println!("{:<38} {:<10} {:>8}  Title", "Course", "Published", "Segments");
        for course in courses {
            println!(
                "{:<38} {:<10} {:>8}  {}",
                course.id,
                if course.published { "yes" } else { "no" },
                course.total_segments,
                course.title
            );
        }
        return Ok(());
    };

    let status = load_status(&db, course_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}
