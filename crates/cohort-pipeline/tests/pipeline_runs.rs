//! End-to-end pipeline and join-builder tests over an in-memory table
//! store. The store mirrors the adapter contract closely enough to verify
//! idempotence, dry-run and merge semantics without a database.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use cohort_pipeline::{tables, JoinBuilder, Mode, ReconcilePipeline, RunOptions, RunSummary};
use cohort_store::{MatchedRow, Result as StoreResult, SqlValue, TableStore};

#[derive(Debug, Clone, Default)]
struct Row {
    spreadsheet_name: Option<String>,
    student_id: Option<i64>,
    course_id: Option<i64>,
    values: BTreeMap<String, SqlValue>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: BTreeMap<i64, Row>,
}

#[derive(Default)]
struct MemStore {
    tables: Mutex<BTreeMap<String, Table>>,
    commits: Mutex<usize>,
}

impl MemStore {
    fn with_table(self, name: &str, columns: &[&str]) -> Self {
        self.tables.lock().unwrap().insert(
            name.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
            },
        );
        self
    }

    fn put_row(&self, table: &str, id: i64, row: Row) {
        self.tables
            .lock()
            .unwrap()
            .get_mut(table)
            .expect("table registered")
            .rows
            .insert(id, row);
    }

    fn row_ids(&self, table: &str) -> Vec<i64> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.keys().copied().collect())
            .unwrap_or_default()
    }

    fn value(&self, table: &str, id: i64, column: &str) -> Option<SqlValue> {
        self.tables
            .lock()
            .unwrap()
            .get(table)?
            .rows
            .get(&id)?
            .values
            .get(column)
            .cloned()
    }

    fn has_table(&self, table: &str) -> bool {
        self.tables.lock().unwrap().contains_key(table)
    }

    fn commit_count(&self) -> usize {
        *self.commits.lock().unwrap()
    }
}

#[async_trait]
impl TableStore for MemStore {
    async fn columns_of(&self, table: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        Ok(self.has_table(table))
    }

    async fn exists_by_id(&self, table: &str, id: i64) -> StoreResult<bool> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .is_some_and(|t| t.rows.contains_key(&id)))
    }

    async fn select_by_text_key(
        &self,
        table: &str,
        key_column: &str,
        value: &str,
    ) -> StoreResult<Vec<MatchedRow>> {
        assert_eq!(key_column, tables::SPREADSHEET_NAME);
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|(_, row)| row.spreadsheet_name.as_deref() == Some(value))
                    .map(|(id, row)| MatchedRow {
                        id: *id,
                        student_id: row.student_id,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn select_ids_by_int_key(
        &self,
        table: &str,
        key_column: &str,
        value: i64,
    ) -> StoreResult<Vec<i64>> {
        assert_eq!(key_column, tables::COURSE_FK);
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|(_, row)| row.course_id == Some(value))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_by_id_selecting_columns(
        &self,
        source: &str,
        dest: &str,
        _columns: &[String],
        id: i64,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .get(source)
            .and_then(|t| t.rows.get(&id))
            .cloned()
            .expect("source row present");
        tables
            .get_mut(dest)
            .expect("dest table present")
            .rows
            .insert(id, row);
        Ok(())
    }

    async fn ensure_clone_table(&self, source: &str, dest: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.contains_key(dest) {
            let columns = tables
                .get(source)
                .map(|t| t.columns.clone())
                .unwrap_or_default();
            tables.insert(
                dest.to_string(),
                Table {
                    columns,
                    rows: BTreeMap::new(),
                },
            );
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.tables.lock().unwrap().remove(table);
        Ok(())
    }

    async fn insert_all_rows(&self, source: &str, dest: &str) -> StoreResult<u64> {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables
            .get(source)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        let count = rows.len() as u64;
        let dest_table = tables.get_mut(dest).expect("dest table present");
        for (id, row) in rows {
            dest_table.rows.insert(id, row);
        }
        Ok(count)
    }

    async fn insert_missing_rows(
        &self,
        override_table: &str,
        base: &str,
        dest: &str,
        _columns: &[String],
        _updated_at_column: &str,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.lock().unwrap();
        let base_ids: Vec<i64> = tables
            .get(base)
            .map(|t| t.rows.keys().copied().collect())
            .unwrap_or_default();
        let missing: Vec<(i64, Row)> = tables
            .get(override_table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|(id, _)| !base_ids.contains(id))
                    .map(|(id, row)| (*id, row.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let count = missing.len() as u64;
        let dest_table = tables.get_mut(dest).expect("dest table present");
        for (id, row) in missing {
            dest_table.rows.insert(id, row);
        }
        Ok(count)
    }

    async fn update_by_id(
        &self,
        table: &str,
        id: i64,
        assignments: &[(String, SqlValue)],
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .get_mut(table)
            .expect("table present")
            .rows
            .get_mut(&id)
            .expect("row present");
        for (column, value) in assignments {
            row.values.insert(column.clone(), value.clone());
        }
        Ok(())
    }

    async fn unaccent_available(&self) -> StoreResult<bool> {
        Ok(false)
    }

    async fn commit(&self) -> StoreResult<()> {
        *self.commits.lock().unwrap() += 1;
        Ok(())
    }
}

fn write_input(lines: &[&str]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("paths.txt");
    let mut file = std::fs::File::create(&path).expect("create input");
    for line in lines {
        writeln!(file, "{line}").expect("write input");
    }
    (dir, path)
}

fn new_course_store() -> MemStore {
    MemStore::default()
        .with_table(
            tables::COURSE_NEW,
            &[
                "id",
                "spreadsheet_name",
                "type",
                "company_name",
                "course_language",
                "taas_school",
                "student_id",
            ],
        )
        .with_table(tables::STUDENT_NEW, &["id", "is_2on1"])
}

fn legacy_store() -> MemStore {
    let store = MemStore::default()
        .with_table(
            tables::COURSE_OLD,
            &["id", "spreadsheet_name", "student_id"],
        )
        .with_table(tables::CLASS_OLD, &["id", "course_id"])
        .with_table(tables::STUDENT_OLD, &["id"]);
    store.put_row(
        tables::COURSE_OLD,
        1,
        Row {
            spreadsheet_name: Some("sheet".to_string()),
            student_id: Some(5),
            ..Row::default()
        },
    );
    store.put_row(
        tables::CLASS_OLD,
        10,
        Row {
            course_id: Some(1),
            ..Row::default()
        },
    );
    store.put_row(
        tables::CLASS_OLD,
        11,
        Row {
            course_id: Some(1),
            ..Row::default()
        },
    );
    store.put_row(tables::STUDENT_OLD, 5, Row::default());
    store
}

fn copy_counters(summary: &RunSummary) -> (usize, usize, usize, usize, usize) {
    (
        summary.paths_processed,
        summary.rows_matched,
        summary.courses_copied,
        summary.classes_copied,
        summary.students_copied,
    )
}

#[tokio::test]
async fn update_mode_sets_type_company_and_student_flag() {
    let store = new_course_store();
    store.put_row(
        tables::COURSE_NEW,
        7,
        Row {
            spreadsheet_name: Some("sheet".to_string()),
            student_id: Some(3),
            ..Row::default()
        },
    );
    store.put_row(tables::STUDENT_NEW, 3, Row::default());

    let (_dir, input) = write_input(&[
        "gs://b/2-1/Companies___Travis - Korott___sheet.tsv",
        "gs://b/nothing-matches-this.tsv",
        "",
    ]);
    let pipeline = ReconcilePipeline::new(&store);
    let summary = pipeline
        .run(
            Mode::Update,
            &RunOptions {
                input,
                dry_run: false,
            },
        )
        .await
        .expect("run");

    assert_eq!(summary.paths_processed, 2);
    assert_eq!(summary.rows_matched, 1);
    assert_eq!(summary.rows_updated, 1);
    assert_eq!(summary.unmatched_paths, 1);
    assert!(!summary.unaccent_available);

    assert_eq!(
        store.value(tables::COURSE_NEW, 7, "type"),
        Some(SqlValue::Text("b2b".to_string()))
    );
    assert_eq!(
        store.value(tables::COURSE_NEW, 7, "company_name"),
        Some(SqlValue::Text("KOROTT".to_string()))
    );
    assert_eq!(
        store.value(tables::COURSE_NEW, 7, "course_language"),
        Some(SqlValue::NullableText(None))
    );
    assert_eq!(
        store.value(tables::COURSE_NEW, 7, "taas_school"),
        Some(SqlValue::NullableText(None))
    );
    assert_eq!(
        store.value(tables::STUDENT_NEW, 3, "is_2on1"),
        Some(SqlValue::Bool(true))
    );
    // Update mode commits once at end of run.
    assert_eq!(store.commit_count(), 1);
}

#[tokio::test]
async fn update_mode_records_taas_school_and_language() {
    let store = new_course_store();
    store.put_row(
        tables::COURSE_NEW,
        2,
        Row {
            spreadsheet_name: Some("lessons".to_string()),
            ..Row::default()
        },
    );

    let (_dir, input) = write_input(&["gs://b/Babbel [DE-Babbel]/lessons.tsv.done"]);
    let summary = ReconcilePipeline::new(&store)
        .run(
            Mode::Update,
            &RunOptions {
                input,
                dry_run: false,
            },
        )
        .await
        .expect("run");

    assert_eq!(summary.rows_updated, 1);
    assert_eq!(
        store.value(tables::COURSE_NEW, 2, "type"),
        Some(SqlValue::Text("taas".to_string()))
    );
    assert_eq!(
        store.value(tables::COURSE_NEW, 2, "taas_school"),
        Some(SqlValue::NullableText(Some("BABBEL".to_string())))
    );
    assert_eq!(
        store.value(tables::COURSE_NEW, 2, "course_language"),
        Some(SqlValue::NullableText(Some("DE".to_string())))
    );
}

#[tokio::test]
async fn update_mode_defaults_unclassified_paths_to_b2c() {
    let store = new_course_store();
    store.put_row(
        tables::COURSE_NEW,
        4,
        Row {
            spreadsheet_name: Some("plain".to_string()),
            ..Row::default()
        },
    );

    let (_dir, input) = write_input(&["gs://b/ordinary/plain.tsv"]);
    ReconcilePipeline::new(&store)
        .run(
            Mode::Update,
            &RunOptions {
                input,
                dry_run: false,
            },
        )
        .await
        .expect("run");

    assert_eq!(
        store.value(tables::COURSE_NEW, 4, "type"),
        Some(SqlValue::Text("b2c".to_string()))
    );
}

#[tokio::test]
async fn update_mode_skips_optional_columns_the_table_lacks() {
    let store = MemStore::default()
        .with_table(
            tables::COURSE_NEW,
            &["id", "spreadsheet_name", "type", "company_name"],
        )
        .with_table(tables::STUDENT_NEW, &["id", "is_2on1"]);
    store.put_row(
        tables::COURSE_NEW,
        9,
        Row {
            spreadsheet_name: Some("sheet".to_string()),
            ..Row::default()
        },
    );

    let (_dir, input) = write_input(&["gs://b/taas/Babbel___sheet.tsv"]);
    let summary = ReconcilePipeline::new(&store)
        .run(
            Mode::Update,
            &RunOptions {
                input,
                dry_run: false,
            },
        )
        .await
        .expect("run");

    assert_eq!(summary.rows_updated, 1);
    assert_eq!(
        store.value(tables::COURSE_NEW, 9, "type"),
        Some(SqlValue::Text("taas".to_string()))
    );
    assert_eq!(store.value(tables::COURSE_NEW, 9, "course_language"), None);
    assert_eq!(store.value(tables::COURSE_NEW, 9, "taas_school"), None);
}

#[tokio::test]
async fn copy_mode_copies_course_and_children_once() {
    let store = legacy_store();
    let (_dir, input) = write_input(&["gs://b/taas/Babbel___sheet.tsv"]);
    let options = RunOptions {
        input,
        dry_run: false,
    };

    let first = ReconcilePipeline::new(&store)
        .run(Mode::Copy, &options)
        .await
        .expect("first run");
    assert_eq!(copy_counters(&first), (1, 1, 1, 2, 1));
    assert_eq!(store.row_ids(tables::COURSE_TAAS), vec![1]);
    assert_eq!(store.row_ids(tables::CLASS_TAAS), vec![10, 11]);
    assert_eq!(store.row_ids(tables::STUDENT_TAAS), vec![5]);
    assert_eq!(
        store.value(tables::COURSE_TAAS, 1, "customer_type"),
        Some(SqlValue::Text("taas".to_string()))
    );

    let second = ReconcilePipeline::new(&store)
        .run(Mode::Copy, &options)
        .await
        .expect("second run");
    assert_eq!(copy_counters(&second), (1, 1, 0, 0, 0));
    assert_eq!(store.row_ids(tables::COURSE_TAAS), vec![1]);
    assert_eq!(store.row_ids(tables::CLASS_TAAS), vec![10, 11]);
    assert_eq!(store.row_ids(tables::STUDENT_TAAS), vec![5]);
}

#[tokio::test]
async fn copy_mode_skips_paths_without_customer_type() {
    let store = legacy_store();
    let (_dir, input) = write_input(&["gs://b/ordinary/sheet.tsv"]);

    let summary = ReconcilePipeline::new(&store)
        .run(
            Mode::Copy,
            &RunOptions {
                input,
                dry_run: false,
            },
        )
        .await
        .expect("run");

    assert_eq!(summary.rows_matched, 1);
    assert_eq!(summary.skipped_no_type, 1);
    assert_eq!(summary.courses_copied, 0);
    assert!(!store.has_table(tables::COURSE_TAAS));
}

#[tokio::test]
async fn dry_run_counts_like_a_real_run_but_writes_nothing() {
    let (_dir, input) = write_input(&["gs://b/taas/Babbel___sheet.tsv"]);

    let dry_store = legacy_store();
    let dry = ReconcilePipeline::new(&dry_store)
        .run(
            Mode::Copy,
            &RunOptions {
                input: input.clone(),
                dry_run: true,
            },
        )
        .await
        .expect("dry run");

    let real_store = legacy_store();
    let real = ReconcilePipeline::new(&real_store)
        .run(
            Mode::Copy,
            &RunOptions {
                input,
                dry_run: false,
            },
        )
        .await
        .expect("real run");

    assert_eq!(copy_counters(&dry), copy_counters(&real));
    assert!(!dry_store.has_table(tables::COURSE_TAAS));
    assert!(!dry_store.has_table(tables::CLASS_TAAS));
    assert!(!dry_store.has_table(tables::STUDENT_TAAS));
    assert_eq!(dry_store.commit_count(), 0);
    assert!(real_store.has_table(tables::COURSE_TAAS));
    assert!(real_store.commit_count() > 0);
}

#[tokio::test]
async fn unparsable_lines_are_counted_and_skipped() {
    let store = legacy_store();
    let (_dir, input) = write_input(&["   ", "///"]);

    let summary = ReconcilePipeline::new(&store)
        .run(
            Mode::Copy,
            &RunOptions {
                input,
                dry_run: false,
            },
        )
        .await
        .expect("run");

    assert_eq!(summary.paths_processed, 1);
    assert_eq!(summary.unparsable_skipped, 1);
    assert_eq!(summary.rows_matched, 0);
}

fn join_store() -> MemStore {
    let store = MemStore::default()
        .with_table("course", &["id", "name", "updated_at"])
        .with_table("course_taas", &["id", "name"])
        .with_table("class", &["id"])
        .with_table("class_taas", &["id"])
        .with_table("student_data", &["id"])
        .with_table("student_taas", &["id"]);
    store.put_row(
        "course",
        1,
        Row {
            values: BTreeMap::from([(
                "name".to_string(),
                SqlValue::Text("base-one".to_string()),
            )]),
            ..Row::default()
        },
    );
    store.put_row(
        "course",
        2,
        Row {
            values: BTreeMap::from([(
                "name".to_string(),
                SqlValue::Text("base-two".to_string()),
            )]),
            ..Row::default()
        },
    );
    store.put_row(
        "course_taas",
        2,
        Row {
            values: BTreeMap::from([(
                "name".to_string(),
                SqlValue::Text("taas-two".to_string()),
            )]),
            ..Row::default()
        },
    );
    store.put_row("course_taas", 3, Row::default());
    store
}

#[tokio::test]
async fn join_builder_unions_base_with_missing_override_rows() {
    let store = join_store();
    let summary = JoinBuilder::new(&store).run().await.expect("join run");

    assert_eq!(summary.tables.len(), 3);
    assert_eq!(summary.tables[0].dest, "course_join");
    assert_eq!(summary.tables[0].inserted_from_base, 2);
    assert_eq!(summary.tables[0].inserted_from_override, 1);

    assert_eq!(store.row_ids("course_join"), vec![1, 2, 3]);
    // Base wins on id collision: the override value for id 2 is ignored.
    assert_eq!(
        store.value("course_join", 2, "name"),
        Some(SqlValue::Text("base-two".to_string()))
    );
    // One commit per triple.
    assert_eq!(store.commit_count(), 3);
}

#[tokio::test]
async fn join_builder_recreates_destination_by_default() {
    let store = join_store();
    JoinBuilder::new(&store).run().await.expect("first run");
    store.put_row("course", 4, Row::default());
    JoinBuilder::new(&store).run().await.expect("second run");
    assert_eq!(store.row_ids("course_join"), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn join_builder_skips_merge_when_id_is_missing() {
    let store = MemStore::default()
        .with_table("course", &["id", "name"])
        .with_table("course_taas", &["name"])
        .with_table("class", &["id"])
        .with_table("class_taas", &["id"])
        .with_table("student_data", &["id"])
        .with_table("student_taas", &["id"]);
    store.put_row("course", 1, Row::default());
    store.put_row("class_taas", 8, Row::default());

    let summary = JoinBuilder::new(&store).run().await.expect("join run");

    assert_eq!(summary.tables[0].inserted_from_base, 1);
    assert_eq!(summary.tables[0].inserted_from_override, 0);
    // Later triples still run.
    assert_eq!(summary.tables[1].inserted_from_override, 1);
    assert_eq!(store.row_ids("class_join"), vec![8]);
}
