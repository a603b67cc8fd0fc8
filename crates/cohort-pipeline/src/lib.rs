//! Reconciliation pipeline: classify spreadsheet paths, look up matching
//! course rows and apply the derived cohort attributes to database state.
//! Also hosts the join builder that merges base tables with their `_taas`
//! override tables into `_join` read views.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cohort_core::{classify, Classification, CustomerType, SchoolRegistry};
use cohort_store::{SqlValue, TableStore};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cohort-pipeline";

/// Running totals are logged every this many processed paths.
pub const PROGRESS_EVERY: usize = 100;

/// Fixed table bindings for the migration.
pub mod tables {
    pub const COURSE_OLD: &str = "course_old";
    pub const COURSE_TAAS: &str = "course_taas";
    pub const COURSE_NEW: &str = "new_course";
    pub const CLASS_OLD: &str = "class_old";
    pub const CLASS_TAAS: &str = "class_taas";
    pub const STUDENT_OLD: &str = "student_data_old";
    pub const STUDENT_TAAS: &str = "student_taas";
    pub const STUDENT_NEW: &str = "student_data";

    pub const SPREADSHEET_NAME: &str = "spreadsheet_name";
    pub const COURSE_FK: &str = "course_id";
}

/// Which side of the migration a run targets. Both modes share one flow;
/// only the matched-row action differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Enrich `new_course` rows (and related students) in place.
    Update,
    /// Copy `course_old` rows and their children into the `_taas` clones.
    Copy,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Update => "update",
            Mode::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: std::path::PathBuf,
    pub dry_run: bool,
}

/// Counters returned to the caller; everything else a run produces is log
/// output.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: Mode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub unaccent_available: bool,
    pub paths_processed: usize,
    pub unparsable_skipped: usize,
    pub unmatched_paths: usize,
    pub rows_matched: usize,
    pub rows_updated: usize,
    pub skipped_no_type: usize,
    pub courses_copied: usize,
    pub classes_copied: usize,
    pub students_copied: usize,
}

/// Column lists resolved once at run start (Init state).
#[derive(Debug)]
enum ModeContext {
    Update {
        has_course_language: bool,
        has_taas_school: bool,
    },
    Copy {
        course_columns: Vec<String>,
        class_columns: Vec<String>,
        student_columns: Vec<String>,
    },
}

pub struct ReconcilePipeline<'a> {
    store: &'a dyn TableStore,
    registry: SchoolRegistry,
}

impl<'a> ReconcilePipeline<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self {
            store,
            registry: SchoolRegistry::default(),
        }
    }

    pub fn with_registry(mut self, registry: SchoolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub async fn run(&self, mode: Mode, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let unaccent_available = self
            .store
            .unaccent_available()
            .await
            .context("probing unaccent availability")?;
        if !unaccent_available {
            debug!("unaccent extension unavailable; accented spreadsheet names must match byte-for-byte");
        }

        let ctx = self.resolve_context(mode).await?;

        info!(
            mode = mode.as_str(),
            input = %options.input.display(),
            dry_run = options.dry_run,
            "reading input paths"
        );
        let lines = read_input_lines(&options.input);

        let mut summary = RunSummary {
            run_id,
            mode,
            dry_run: options.dry_run,
            started_at,
            finished_at: started_at,
            unaccent_available,
            paths_processed: 0,
            unparsable_skipped: 0,
            unmatched_paths: 0,
            rows_matched: 0,
            rows_updated: 0,
            skipped_no_type: 0,
            courses_copied: 0,
            classes_copied: 0,
            students_copied: 0,
        };

        for line in &lines {
            let path = line.trim();
            if path.is_empty() {
                continue;
            }
            summary.paths_processed += 1;

            let classification = classify(path, &self.registry);
            if classification.filename.is_empty() {
                debug!(path, "unparsable path; skipped");
                summary.unparsable_skipped += 1;
                continue;
            }

            match &ctx {
                ModeContext::Update {
                    has_course_language,
                    has_taas_school,
                } => {
                    self.apply_update(
                        &classification,
                        *has_course_language,
                        *has_taas_school,
                        options.dry_run,
                        &mut summary,
                    )
                    .await?;
                }
                ModeContext::Copy {
                    course_columns,
                    class_columns,
                    student_columns,
                } => {
                    self.apply_copy(
                        &classification,
                        course_columns,
                        class_columns,
                        student_columns,
                        options.dry_run,
                        &mut summary,
                    )
                    .await?;
                    if !options.dry_run {
                        self.store.commit().await.context("committing path")?;
                    }
                }
            }

            if summary.paths_processed % PROGRESS_EVERY == 0 {
                info!(
                    paths = summary.paths_processed,
                    matched_rows = summary.rows_matched,
                    updated = summary.rows_updated,
                    courses_copied = summary.courses_copied,
                    "progress"
                );
            }
        }

        if mode == Mode::Update && !options.dry_run {
            self.store.commit().await.context("committing run")?;
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn resolve_context(&self, mode: Mode) -> Result<ModeContext> {
        match mode {
            Mode::Update => {
                let columns = self
                    .store
                    .columns_of(tables::COURSE_NEW)
                    .await
                    .context("introspecting new_course")?;
                Ok(ModeContext::Update {
                    has_course_language: columns.iter().any(|c| c == "course_language"),
                    has_taas_school: columns.iter().any(|c| c == "taas_school"),
                })
            }
            Mode::Copy => Ok(ModeContext::Copy {
                course_columns: self
                    .store
                    .columns_of(tables::COURSE_OLD)
                    .await
                    .context("introspecting course_old")?,
                class_columns: self
                    .store
                    .columns_of(tables::CLASS_OLD)
                    .await
                    .context("introspecting class_old")?,
                student_columns: self
                    .store
                    .columns_of(tables::STUDENT_OLD)
                    .await
                    .context("introspecting student_data_old")?,
            }),
        }
    }

    /// Update mode: set cohort attributes on every matched `new_course` row.
    /// Paths with no inferred type fall back to b2c here; copy mode skips
    /// them instead (the two modes intentionally disagree on this default).
    async fn apply_update(
        &self,
        classification: &Classification,
        has_course_language: bool,
        has_taas_school: bool,
        dry_run: bool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let rows = self
            .store
            .select_by_text_key(
                tables::COURSE_NEW,
                tables::SPREADSHEET_NAME,
                &classification.filename,
            )
            .await?;
        if rows.is_empty() {
            debug!(filename = %classification.filename, "no match in new_course");
            summary.unmatched_paths += 1;
            return Ok(());
        }
        summary.rows_matched += rows.len();

        let type_value = classification
            .customer_type
            .unwrap_or(CustomerType::B2c);

        for row in rows {
            let mut assignments = vec![
                (
                    "type".to_string(),
                    SqlValue::Text(type_value.as_str().to_string()),
                ),
                (
                    "company_name".to_string(),
                    SqlValue::Text(classification.company.clone()),
                ),
            ];
            if has_course_language {
                assignments.push((
                    "course_language".to_string(),
                    SqlValue::NullableText(
                        classification.course_language.map(|l| l.code().to_string()),
                    ),
                ));
            }
            if has_taas_school {
                let school = if type_value == CustomerType::Taas {
                    classification.taas_school.clone()
                } else {
                    None
                };
                assignments.push(("taas_school".to_string(), SqlValue::NullableText(school)));
            }

            if dry_run {
                info!(
                    id = row.id,
                    customer_type = type_value.as_str(),
                    company = %classification.company,
                    "[dry-run] would update new_course"
                );
            } else {
                self.store
                    .update_by_id(tables::COURSE_NEW, row.id, &assignments)
                    .await?;
                info!(
                    id = row.id,
                    customer_type = type_value.as_str(),
                    company = %classification.company,
                    "updated new_course"
                );
            }
            summary.rows_updated += 1;

            if let Some(student_id) = row.student_id {
                if dry_run {
                    info!(
                        student_id,
                        is_2on1 = classification.is_2on1,
                        "[dry-run] would update student_data"
                    );
                } else {
                    self.store
                        .update_by_id(
                            tables::STUDENT_NEW,
                            student_id,
                            &[("is_2on1".to_string(), SqlValue::Bool(classification.is_2on1))],
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Copy mode: migrate matched legacy courses and their children into the
    /// `_taas` clones, copy-once by id. A path with no inferred type leaves
    /// the whole course un-migrated.
    async fn apply_copy(
        &self,
        classification: &Classification,
        course_columns: &[String],
        class_columns: &[String],
        student_columns: &[String],
        dry_run: bool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let rows = self
            .store
            .select_by_text_key(
                tables::COURSE_OLD,
                tables::SPREADSHEET_NAME,
                &classification.filename,
            )
            .await?;
        if rows.is_empty() {
            debug!(filename = %classification.filename, "no match in course_old");
            summary.unmatched_paths += 1;
            return Ok(());
        }
        summary.rows_matched += rows.len();

        let Some(customer_type) = classification.customer_type else {
            debug!(
                filename = %classification.filename,
                "no customer type inferred; copy skipped"
            );
            summary.skipped_no_type += 1;
            return Ok(());
        };

        for row in rows {
            self.ensure_clone(tables::COURSE_OLD, tables::COURSE_TAAS, dry_run)
                .await?;
            self.ensure_clone(tables::CLASS_OLD, tables::CLASS_TAAS, dry_run)
                .await?;

            if !self
                .exists_in_clone(tables::COURSE_TAAS, row.id, dry_run)
                .await?
            {
                if dry_run {
                    info!(id = row.id, "[dry-run] would copy course_old -> course_taas");
                } else {
                    self.store
                        .insert_by_id_selecting_columns(
                            tables::COURSE_OLD,
                            tables::COURSE_TAAS,
                            course_columns,
                            row.id,
                        )
                        .await?;
                    info!(id = row.id, "copied course_old -> course_taas");
                }
                summary.courses_copied += 1;
            }

            // Re-applied on every run so a re-classified path wins.
            if !dry_run {
                self.store
                    .update_by_id(
                        tables::COURSE_TAAS,
                        row.id,
                        &[(
                            "customer_type".to_string(),
                            SqlValue::Text(customer_type.as_str().to_string()),
                        )],
                    )
                    .await?;
            }

            let class_ids = self
                .store
                .select_ids_by_int_key(tables::CLASS_OLD, tables::COURSE_FK, row.id)
                .await?;
            for class_id in class_ids {
                if self
                    .exists_in_clone(tables::CLASS_TAAS, class_id, dry_run)
                    .await?
                {
                    continue;
                }
                if dry_run {
                    info!(id = class_id, "[dry-run] would copy class_old -> class_taas");
                } else {
                    self.store
                        .insert_by_id_selecting_columns(
                            tables::CLASS_OLD,
                            tables::CLASS_TAAS,
                            class_columns,
                            class_id,
                        )
                        .await?;
                    info!(id = class_id, "copied class_old -> class_taas");
                }
                summary.classes_copied += 1;
            }

            if let Some(student_id) = row.student_id {
                self.ensure_clone(tables::STUDENT_OLD, tables::STUDENT_TAAS, dry_run)
                    .await?;
                if !self
                    .exists_in_clone(tables::STUDENT_TAAS, student_id, dry_run)
                    .await?
                {
                    if dry_run {
                        info!(
                            id = student_id,
                            "[dry-run] would copy student_data_old -> student_taas"
                        );
                    } else {
                        self.store
                            .insert_by_id_selecting_columns(
                                tables::STUDENT_OLD,
                                tables::STUDENT_TAAS,
                                student_columns,
                                student_id,
                            )
                            .await?;
                        info!(id = student_id, "copied student_data_old -> student_taas");
                    }
                    summary.students_copied += 1;
                }
            }
        }
        Ok(())
    }

    async fn ensure_clone(&self, source: &str, dest: &str, dry_run: bool) -> Result<()> {
        if dry_run {
            if !self.store.table_exists(dest).await? {
                info!(source, dest, "[dry-run] would clone table structure");
            }
            return Ok(());
        }
        self.store
            .ensure_clone_table(source, dest)
            .await
            .with_context(|| format!("cloning {source} -> {dest}"))?;
        Ok(())
    }

    /// Existence check that stays truthful in dry-run: a clone table that
    /// would not exist yet treats every id as absent.
    async fn exists_in_clone(&self, table: &str, id: i64, dry_run: bool) -> Result<bool> {
        if dry_run && !self.store.table_exists(table).await? {
            return Ok(false);
        }
        Ok(self.store.exists_by_id(table, id).await?)
    }
}

/// Read the input path list, one path per line. Decoding is attempted as
/// UTF-8 (with or without BOM) and falls back to windows-1252 — the WHATWG
/// single-byte decoder is total, so it also covers the latin-1 rung — with
/// a warning. A missing file warns and yields zero paths; the run proceeds.
pub fn read_input_lines(path: &Path) -> Vec<String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(input = %path.display(), %err, "input file not readable; proceeding with zero paths");
            return Vec::new();
        }
    };
    decode_lines(&bytes)
}

fn decode_lines(bytes: &[u8]) -> Vec<String> {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.lines().map(str::to_string).collect(),
        Err(_) => {
            warn!("input is not valid UTF-8; decoded as windows-1252, some matches may fail");
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.lines().map(str::to_string).collect()
        }
    }
}

/// One (base, override, destination) merge target.
#[derive(Debug, Clone, Copy)]
pub struct JoinTriple {
    pub base: &'static str,
    pub override_table: &'static str,
    pub dest: &'static str,
}

/// Order: course, class, student_data.
pub const JOIN_TRIPLES: [JoinTriple; 3] = [
    JoinTriple {
        base: "course",
        override_table: "course_taas",
        dest: "course_join",
    },
    JoinTriple {
        base: "class",
        override_table: "class_taas",
        dest: "class_join",
    },
    JoinTriple {
        base: "student_data",
        override_table: "student_taas",
        dest: "student_data_join",
    },
];

pub const UPDATED_AT_COLUMN: &str = "updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct JoinTableSummary {
    pub dest: String,
    pub inserted_from_base: u64,
    pub inserted_from_override: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinSummary {
    pub tables: Vec<JoinTableSummary>,
}

/// Set-merge by primary key: base wins on id collision, override rows only
/// fill gaps. No classification logic here.
pub struct JoinBuilder<'a> {
    store: &'a dyn TableStore,
    recreate: bool,
}

impl<'a> JoinBuilder<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self {
            store,
            recreate: true,
        }
    }

    /// Keep existing `_join` tables instead of dropping and re-cloning them.
    pub fn no_recreate(mut self) -> Self {
        self.recreate = false;
        self
    }

    pub async fn run(&self) -> Result<JoinSummary> {
        let mut tables = Vec::with_capacity(JOIN_TRIPLES.len());
        for triple in &JOIN_TRIPLES {
            tables.push(self.build(triple).await?);
            self.store
                .commit()
                .await
                .with_context(|| format!("committing {}", triple.dest))?;
        }
        Ok(JoinSummary { tables })
    }

    async fn build(&self, triple: &JoinTriple) -> Result<JoinTableSummary> {
        info!(
            base = triple.base,
            override_table = triple.override_table,
            dest = triple.dest,
            "building join table"
        );

        if self.recreate && self.store.table_exists(triple.dest).await? {
            debug!(dest = triple.dest, "dropping existing join table");
            self.store.drop_table(triple.dest).await?;
        }
        self.store
            .ensure_clone_table(triple.base, triple.dest)
            .await?;

        let inserted_from_base = self
            .store
            .insert_all_rows(triple.base, triple.dest)
            .await
            .with_context(|| format!("copying {} -> {}", triple.base, triple.dest))?;
        info!(
            rows = inserted_from_base,
            base = triple.base,
            "inserted base rows"
        );

        let inserted_from_override = self.merge_missing(triple).await?;
        info!(
            rows = inserted_from_override,
            override_table = triple.override_table,
            "inserted override rows"
        );

        Ok(JoinTableSummary {
            dest: triple.dest.to_string(),
            inserted_from_base,
            inserted_from_override,
        })
    }

    /// Rows present in the override table but absent from base, restricted
    /// to the base-ordered column intersection (plus `updated_at`, forced to
    /// now for inserted rows).
    async fn merge_missing(&self, triple: &JoinTriple) -> Result<u64> {
        let base_columns = self.store.columns_of(triple.base).await?;
        let override_columns = self.store.columns_of(triple.override_table).await?;
        if base_columns.is_empty() || override_columns.is_empty() {
            warn!(
                override_table = triple.override_table,
                dest = triple.dest,
                "skipping merge (missing columns info)"
            );
            return Ok(0);
        }
        if !base_columns.iter().any(|c| c == "id")
            || !override_columns.iter().any(|c| c == "id")
        {
            warn!(
                override_table = triple.override_table,
                dest = triple.dest,
                "skipping merge because 'id' column missing"
            );
            return Ok(0);
        }

        let insertable: Vec<String> = base_columns
            .iter()
            .filter(|c| override_columns.contains(*c) || c.as_str() == UPDATED_AT_COLUMN)
            .cloned()
            .collect();
        if insertable.is_empty() {
            warn!(
                base = triple.base,
                override_table = triple.override_table,
                "no overlapping columns; nothing to insert"
            );
            return Ok(0);
        }

        Ok(self
            .store
            .insert_missing_rows(
                triple.override_table,
                triple.base,
                triple.dest,
                &insertable,
                UPDATED_AT_COLUMN,
            )
            .await?)
    }
}
