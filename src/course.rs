//! Course ingestion: split a video's duration into contiguous segments.

use anyhow::{Result, bail};

use crate::store::DbHandle;
use crate::store::models::{Course, Segment, TimeRange};

/// A trailing remainder shorter than this fraction of the segment length is
/// folded into the previous segment instead of becoming its own.
const MIN_TAIL_FRACTION: f64 = 0.25;

/// Upper bound on segments per course.
pub const MAX_SEGMENTS: usize = 10_000;

/// Contiguous, ordered time ranges covering `[0, duration]`.
pub fn decompose(duration: f64, segment_length: f64) -> Result<Vec<TimeRange>> {
    if !duration.is_finite() || duration <= 0.0 {
        bail!("Video duration must be positive, got {}", duration);
    }
    if !segment_length.is_finite() || segment_length <= 0.0 {
        bail!("Segment length must be positive, got {}", segment_length);
    }

    let count = (duration / segment_length).ceil();
    if count > MAX_SEGMENTS as f64 {
        bail!(
            "Duration {} split into {}s segments would create {} segments (max {})",
            duration,
            segment_length,
            count,
            MAX_SEGMENTS
        );
    }

    let full = (duration / segment_length).floor() as usize;
    let mut ranges: Vec<TimeRange> = (0..full)
        .map(|i| TimeRange::new(i as f64 * segment_length, (i + 1) as f64 * segment_length))
        .collect();

    let covered = full as f64 * segment_length;
    let remainder = duration - covered;
    if remainder > 0.0 {
        match ranges.last_mut() {
            Some(last) if remainder < segment_length * MIN_TAIL_FRACTION => last.end = duration,
            _ => ranges.push(TimeRange::new(covered, duration)),
        }
    }
    Ok(ranges)
}

/// Create a course and all of its segments.
pub async fn ingest(
    db: &DbHandle,
    title: &str,
    video_ref: &str,
    duration: f64,
    segment_length: f64,
) -> Result<(Course, Vec<Segment>)> {
    if title.trim().is_empty() {
        bail!("Course title must not be empty");
    }
    if video_ref.trim().is_empty() {
        bail!("Video reference must not be empty");
    }
    let ranges = decompose(duration, segment_length)?;
    let title = title.trim().to_string();
    let video_ref = video_ref.trim().to_string();

    let (course, segments) = db
        .call(move |db| {
            let course = db.create_course(&title, &video_ref, &ranges)?;
            let segments = db.list_segments(&course.id)?;
            Ok((course, segments))
        })
        .await?;

    tracing::info!(
        course_id = %course.id,
        segments = segments.len(),
        duration,
        "Course ingested"
    );
    Ok((course, segments))
}
