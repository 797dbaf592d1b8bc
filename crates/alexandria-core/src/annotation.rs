//! Annotations
//!
//! Highlights over a resource's archived text. Offsets are validated against
//! the archive at creation time, the highlighted slice is captured then, and
//! both are frozen: updates may change the note, tags, color, or sharing,
//! never the span. Rows cascade-delete with their parent resource.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kernel::bus::{topics, Event};
use crate::kernel::Kernel;
use crate::storage::{format_ts, parse_ts};

/// A stored annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    /// Annotation id
    pub id: String,
    /// Parent resource
    pub resource_id: String,
    /// Byte offset of the highlight start in the archive at creation
    pub start_offset: usize,
    /// Byte offset one past the highlight end
    pub end_offset: usize,
    /// The archived slice captured at creation
    pub highlighted_text: String,
    /// Optional freeform note
    pub note: Option<String>,
    /// Tags
    pub tags: Vec<String>,
    /// Display color
    pub color: Option<String>,
    /// Owning user
    pub owner: String,
    /// Visible to other users
    pub shared: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnnotationInput {
    /// Parent resource
    pub resource_id: String,
    /// Highlight start (byte offset into the archive)
    pub start_offset: usize,
    /// Highlight end (exclusive)
    pub end_offset: usize,
    /// Optional note
    pub note: Option<String>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Display color
    pub color: Option<String>,
    /// Owning user
    pub owner: String,
    /// Visible to other users
    #[serde(default)]
    pub shared: bool,
}

/// Mutable annotation fields; offsets are frozen by design.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnnotationUpdate {
    /// New note
    pub note: Option<String>,
    /// New tags
    pub tags: Option<Vec<String>>,
    /// New color
    pub color: Option<String>,
    /// New sharing flag
    pub shared: Option<bool>,
}

fn annotation_from_row(row: &Row<'_>) -> rusqlite::Result<Annotation> {
    let tags: String = row.get("tags")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(Annotation {
        id: row.get("id")?,
        resource_id: row.get("resource_id")?,
        start_offset: row.get::<_, i64>("start_offset")? as usize,
        end_offset: row.get::<_, i64>("end_offset")? as usize,
        highlighted_text: row.get("highlighted_text")?,
        note: row.get("note")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        color: row.get("color")?,
        owner: row.get("owner")?,
        shared: row.get::<_, i64>("shared")? != 0,
        created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_ts(&updated).unwrap_or_else(|_| Utc::now()),
    })
}

/// The annotation store service.
pub struct AnnotationStore {
    kernel: Arc<Kernel>,
}

impl AnnotationStore {
    /// Create the service over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Create an annotation. Offsets are checked against the archived text:
    /// `0 <= start < end <= len`, on character boundaries; the highlighted
    /// slice is captured here and never changes afterwards.
    pub fn create(&self, input: &AnnotationInput) -> Result<Annotation> {
        let now = self.kernel.now();
        let input = input.clone();

        self.kernel.commit(move |tx, fx| {
            let archive = crate::resource::read_archive(tx, &input.resource_id)?
                .map(|(content, _)| content)
                .ok_or_else(|| {
                    CoreError::NotFound(format!(
                        "resource {} has no archived content",
                        input.resource_id
                    ))
                })?;

            if input.start_offset >= input.end_offset {
                return Err(CoreError::Validation(
                    "start_offset must be strictly less than end_offset".to_string(),
                ));
            }
            if input.end_offset > archive.len() {
                return Err(CoreError::Validation(format!(
                    "end_offset {} exceeds archive length {}",
                    input.end_offset,
                    archive.len()
                )));
            }
            if !archive.is_char_boundary(input.start_offset)
                || !archive.is_char_boundary(input.end_offset)
            {
                return Err(CoreError::Validation(
                    "offsets must fall on character boundaries".to_string(),
                ));
            }

            let highlighted = archive[input.start_offset..input.end_offset].to_string();
            let annotation = Annotation {
                id: Uuid::new_v4().to_string(),
                resource_id: input.resource_id.clone(),
                start_offset: input.start_offset,
                end_offset: input.end_offset,
                highlighted_text: highlighted,
                note: input.note.clone(),
                tags: input.tags.clone(),
                color: input.color.clone(),
                owner: input.owner.clone(),
                shared: input.shared,
                created_at: now,
                updated_at: now,
            };

            tx.execute(
                "INSERT INTO annotations (id, resource_id, start_offset, end_offset,
                                          highlighted_text, note, tags, color, owner, shared,
                                          created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    annotation.id,
                    annotation.resource_id,
                    annotation.start_offset as i64,
                    annotation.end_offset as i64,
                    annotation.highlighted_text,
                    annotation.note,
                    serde_json::to_string(&annotation.tags)?,
                    annotation.color,
                    annotation.owner,
                    annotation.shared as i64,
                    format_ts(now),
                ],
            )?;

            fx.emit(Event::new(
                topics::ANNOTATION_CREATED,
                serde_json::json!({
                    "annotation_id": annotation.id,
                    "resource_id": annotation.resource_id,
                    "user_id": annotation.owner,
                }),
            ));
            Ok(annotation)
        })
    }

    /// Fetch an annotation or fail with NotFound.
    pub fn get(&self, id: &str) -> Result<Annotation> {
        self.kernel
            .store
            .with_read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT * FROM annotations WHERE id = ?1",
                        params![id],
                        annotation_from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| CoreError::NotFound(format!("annotation {id}")))
    }

    /// All annotations on a resource, oldest first.
    pub fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Annotation>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM annotations WHERE resource_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![resource_id], annotation_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Update mutable fields. Offsets and the highlighted slice are frozen.
    pub fn update(&self, id: &str, update: &AnnotationUpdate) -> Result<Annotation> {
        let now = self.kernel.now();
        let id_owned = id.to_string();
        let update = update.clone();

        self.kernel.commit(move |tx, _fx| {
            let mut annotation = tx
                .query_row(
                    "SELECT * FROM annotations WHERE id = ?1",
                    params![id_owned],
                    annotation_from_row,
                )
                .optional()?
                .ok_or_else(|| CoreError::NotFound(format!("annotation {id_owned}")))?;

            if let Some(note) = update.note {
                annotation.note = Some(note);
            }
            if let Some(tags) = update.tags {
                annotation.tags = tags;
            }
            if let Some(color) = update.color {
                annotation.color = Some(color);
            }
            if let Some(shared) = update.shared {
                annotation.shared = shared;
            }
            annotation.updated_at = now;

            tx.execute(
                "UPDATE annotations SET note = ?2, tags = ?3, color = ?4, shared = ?5,
                        updated_at = ?6
                 WHERE id = ?1",
                params![
                    annotation.id,
                    annotation.note,
                    serde_json::to_string(&annotation.tags)?,
                    annotation.color,
                    annotation.shared as i64,
                    format_ts(now),
                ],
            )?;
            Ok(annotation)
        })
    }

    /// Delete an annotation.
    pub fn delete(&self, id: &str) -> Result<()> {
        let id_owned = id.to_string();
        self.kernel.commit(move |tx, _fx| {
            let affected = tx.execute("DELETE FROM annotations WHERE id = ?1", params![id_owned])?;
            if affected == 0 {
                return Err(CoreError::NotFound(format!("annotation {id_owned}")));
            }
            Ok(())
        })
    }
}
