use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arrow::array::{Array, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::store::ProjectStore;
use crate::store::admin::{RawConfigRow, RawRow};

/// Default commit cadence of the background snapshot loop.
pub const COMMIT_INTERVAL: Duration = Duration::from_secs(300);

const INF: &str = "Infinity";
const NEG_INF: &str = "-Infinity";
const NAN: &str = "NaN";

// ---------------------------------------------------------------------------
// Snapshotter
// ---------------------------------------------------------------------------

/// Remote repository for snapshot files.
pub struct Mirror {
    pub operator: opendal::Operator,
    pub prefix: String,
}

/// Periodic exporter of every project database to immutable parquet files,
/// optionally mirrored to a remote object repository.
///
/// Read-only against the live store: a snapshot may trail the database
/// slightly, which is fine while the database remains authoritative.
pub struct Snapshotter {
    store: Arc<ProjectStore>,
    mirror: Option<Mirror>,
}

impl Snapshotter {
    /// Mirror configured from the environment; none when no bucket is set.
    pub fn new(store: Arc<ProjectStore>) -> Self {
        let cfg = Config::load();
        let mirror = mirror_from_config(&cfg);
        Self { store, mirror }
    }

    pub fn with_mirror(store: Arc<ProjectStore>, mirror: Option<Mirror>) -> Self {
        Self { store, mirror }
    }

    /// Export every project whose database changed since its last snapshot,
    /// then push snapshot files and media to the mirror.
    #[tracing::instrument(skip(self), err)]
    pub async fn commit(&self) -> Result<()> {
        for project in self.store.get_projects() {
            self.export_project(&project).await?;
        }
        if self.mirror.is_some() {
            self.upload().await?;
        }
        Ok(())
    }

    /// Pull snapshot files absent locally and rebuild their databases.
    #[tracing::instrument(skip(self), err)]
    pub async fn load(&self) -> Result<()> {
        if self.mirror.is_some() {
            self.download().await?;
        }
        self.import_all().await
    }

    /// Re-export one project when its database file is newer than the
    /// snapshot (or the snapshot is missing). Empty tables produce no file.
    pub async fn export_project(&self, project: &str) -> Result<()> {
        let db_path = self.store.db_path(project);
        let dir = self.store.dir().to_path_buf();

        let targets = [
            (dir.join(format!("{project}.parquet")), Table::Metrics),
            (dir.join(format!("{project}_system.parquet")), Table::System),
            (dir.join(format!("{project}_configs.parquet")), Table::Configs),
        ];
        for (parquet_path, table) in targets {
            if !needs_export(&db_path, &parquet_path) {
                continue;
            }
            let batch = match table {
                Table::Metrics => {
                    let rows = self.store.dump_metrics(project).await?;
                    build_rows_batch(&rows, true)?
                }
                Table::System => {
                    let rows = self.store.dump_system_metrics(project).await?;
                    build_rows_batch(&rows, false)?
                }
                Table::Configs => {
                    let rows = self.store.dump_configs(project).await?;
                    build_configs_batch(&rows)?
                }
            };
            let Some(batch) = batch else { continue };
            write_parquet_file(&parquet_path, &batch)?;
            tracing::info!(project, path = %parquet_path.display(), "snapshot exported");
        }
        Ok(())
    }

    /// Rebuild databases from any snapshot that is newer than (or has no)
    /// local database.
    ///
    /// The decision is per project, taken before any file is imported: the
    /// metrics import recreates the database file, which would otherwise make
    /// the sibling `_system` / `_configs` files look stale.
    pub async fn import_all(&self) -> Result<()> {
        let dir = self.store.dir().to_path_buf();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(());
        };

        let mut by_project: BTreeMap<String, Vec<(PathBuf, Table)>> = BTreeMap::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".parquet") {
                continue;
            }
            let (project, table) = if let Some(stem) = name.strip_suffix("_system.parquet") {
                (stem.to_string(), Table::System)
            } else if let Some(stem) = name.strip_suffix("_configs.parquet") {
                (stem.to_string(), Table::Configs)
            } else {
                (name.trim_end_matches(".parquet").to_string(), Table::Metrics)
            };
            by_project.entry(project).or_default().push((path, table));
        }

        for (project, files) in by_project {
            let db_path = self.store.db_path(&project);
            if !files.iter().any(|(path, _)| needs_import(&db_path, path)) {
                continue;
            }
            if !db_path.exists() {
                // Stale journal sidecars for a vanished database corrupt the
                // rebuilt one
                for suffix in ["-wal", "-shm"] {
                    let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
                }
            }
            for (path, table) in files {
                self.import_file(&project, &path, table).await?;
                tracing::info!(project, path = %path.display(), "snapshot imported");
            }
        }
        Ok(())
    }

    async fn import_file(&self, project: &str, path: &Path, table: Table) -> Result<()> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch.map_err(arrow::error::ArrowError::from)?);
        }
        match table {
            Table::Metrics => {
                let rows = rows_from_batches(&batches, true)?;
                self.store.restore_metrics(project, &rows).await?;
            }
            Table::System => {
                let rows = rows_from_batches(&batches, false)?;
                self.store.restore_system_metrics(project, &rows).await?;
            }
            Table::Configs => {
                let rows = configs_from_batches(&batches)?;
                self.store.restore_configs(project, &rows).await?;
            }
        }
        Ok(())
    }

    /// Push every snapshot file and media asset to the mirror.
    pub async fn upload(&self) -> Result<()> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let dir = self.store.dir().to_path_buf();
        for file in snapshot_files(&dir) {
            let relative = file
                .strip_prefix(&dir)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            let bytes = std::fs::read(&file)?;
            mirror
                .operator
                .write(&format!("{}/{relative}", mirror.prefix), bytes)
                .await?;
        }
        Ok(())
    }

    /// Fetch snapshot files and media assets missing locally.
    pub async fn download(&self) -> Result<()> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let dir = self.store.dir().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let prefix = format!("{}/", mirror.prefix);
        let entries = mirror
            .operator
            .list_with(&prefix)
            .recursive(true)
            .await?;
        for entry in entries {
            let path = entry.path();
            if path.ends_with('/') {
                continue;
            }
            let Some(relative) = path.strip_prefix(&prefix) else {
                continue;
            };
            if !(relative.ends_with(".parquet") || relative.starts_with("media/")) {
                continue;
            }
            let local = dir.join(relative);
            if local.exists() {
                continue;
            }
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let bytes = mirror.operator.read(path).await?;
            std::fs::write(&local, bytes.to_vec())?;
        }
        Ok(())
    }

    /// Background loop: load once, then commit on a timer until stopped.
    pub async fn run_loop(self, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        tracing::info!("snapshotter started");
        if let Err(e) = self.load().await {
            tracing::warn!(error = %e, "snapshot load failed");
        }
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = self.commit().await {
                        tracing::error!(error = %e, "snapshot commit failed");
                    }
                }
            }
        }
        tracing::info!("snapshotter stopped");
    }
}

/// Start the process-wide snapshotter once, on first `init`.
pub fn ensure_started(store: Arc<ProjectStore>) {
    static STARTED: OnceLock<watch::Sender<bool>> = OnceLock::new();
    STARTED.get_or_init(|| {
        let (stop_tx, stop_rx) = watch::channel(false);
        let snapshotter = Snapshotter::new(store);
        tokio::spawn(snapshotter.run_loop(COMMIT_INTERVAL, stop_rx));
        stop_tx
    });
}

fn mirror_from_config(cfg: &Config) -> Option<Mirror> {
    let bucket = cfg.s3_bucket.as_deref()?;
    let prefix = cfg
        .dataset_id
        .clone()
        .unwrap_or_else(|| "trackio".to_string())
        .replace('/', "_");
    let mut builder = opendal::services::S3::default()
        .bucket(bucket)
        .region(&cfg.s3_region);
    if let Some(endpoint) = &cfg.s3_endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(key) = &cfg.s3_access_key {
        builder = builder.access_key_id(key);
    }
    if let Some(secret) = &cfg.s3_secret_key {
        builder = builder.secret_access_key(secret);
    }
    match opendal::Operator::new(builder) {
        Ok(op) => Some(Mirror {
            operator: op.finish(),
            prefix,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "snapshot mirror misconfigured, staying local");
            None
        }
    }
}

fn needs_export(db_path: &Path, parquet_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }
    match (db_path.metadata(), parquet_path.metadata()) {
        (Ok(db), Ok(pq)) => match (db.modified(), pq.modified()) {
            (Ok(db_mtime), Ok(pq_mtime)) => db_mtime > pq_mtime,
            _ => true,
        },
        (Ok(_), Err(_)) => true,
        _ => false,
    }
}

fn needs_import(db_path: &Path, parquet_path: &Path) -> bool {
    if !db_path.exists() {
        return true;
    }
    match (db_path.metadata(), parquet_path.metadata()) {
        (Ok(db), Ok(pq)) => match (db.modified(), pq.modified()) {
            (Ok(db_mtime), Ok(pq_mtime)) => pq_mtime > db_mtime,
            _ => false,
        },
        _ => false,
    }
}

fn snapshot_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
                files.push(path);
            }
        }
    }
    collect_files(&dir.join("media"), &mut files);
    files
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

// ---------------------------------------------------------------------------
// Column expansion
// ---------------------------------------------------------------------------

enum Table {
    Metrics,
    System,
    Configs,
}

/// One expanded cell. The stored JSON's non-finite markers surface as real
/// floats so numeric columns stay numeric in parquet.
#[derive(Debug, Clone)]
enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Cell {
    fn from_encoded(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            JsonValue::String(s) => match s.as_str() {
                INF => Self::Float(f64::INFINITY),
                NEG_INF => Self::Float(f64::NEG_INFINITY),
                NAN => Self::Float(f64::NAN),
                other => Self::Text(other.to_string()),
            },
            complex => Self::Text(complex.to_string()),
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Text(t) => Some(t.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnType {
    Unset,
    Int,
    Float,
    Bool,
    Text,
}

impl ColumnType {
    fn merge(self, cell: &Cell) -> Self {
        let observed = match cell {
            Cell::Null => return self,
            Cell::Int(_) => Self::Int,
            Cell::Float(_) => Self::Float,
            Cell::Bool(_) => Self::Bool,
            Cell::Text(_) => Self::Text,
        };
        match (self, observed) {
            (Self::Unset, o) => o,
            (s, o) if s == o => s,
            (Self::Int, Self::Float) | (Self::Float, Self::Int) => Self::Float,
            _ => Self::Text,
        }
    }
}

/// Expand each row's encoded JSON object into one cell per key.
fn expand_columns(encoded_rows: &[&str]) -> Result<(Vec<String>, Vec<Vec<Cell>>)> {
    let mut keys: Vec<String> = Vec::new();
    let mut parsed: Vec<BTreeMap<String, Cell>> = Vec::with_capacity(encoded_rows.len());
    for encoded in encoded_rows {
        let value: JsonValue = serde_json::from_str(encoded)?;
        let mut cells = BTreeMap::new();
        if let JsonValue::Object(map) = value {
            for (key, value) in &map {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
                cells.insert(key.clone(), Cell::from_encoded(value));
            }
        }
        parsed.push(cells);
    }
    keys.sort();
    let columns = keys
        .iter()
        .map(|key| {
            parsed
                .iter()
                .map(|row| row.get(key).cloned().unwrap_or(Cell::Null))
                .collect()
        })
        .collect();
    Ok((keys, columns))
}

fn build_column(cells: &[Cell]) -> (DataType, Arc<dyn Array>) {
    let ty = cells
        .iter()
        .fold(ColumnType::Unset, |acc, cell| acc.merge(cell));
    match ty {
        ColumnType::Int => {
            let values: Vec<Option<i64>> = cells
                .iter()
                .map(|c| match c {
                    Cell::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            (DataType::Int64, Arc::new(Int64Array::from(values)))
        }
        ColumnType::Float => {
            let values: Vec<Option<f64>> = cells
                .iter()
                .map(|c| match c {
                    Cell::Float(f) => Some(*f),
                    Cell::Int(i) => Some(*i as f64),
                    _ => None,
                })
                .collect();
            (DataType::Float64, Arc::new(Float64Array::from(values)))
        }
        ColumnType::Bool => {
            let values: Vec<Option<bool>> = cells
                .iter()
                .map(|c| match c {
                    Cell::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect();
            (DataType::Boolean, Arc::new(BooleanArray::from(values)))
        }
        _ => {
            let values: Vec<Option<String>> = cells.iter().map(Cell::as_text).collect();
            (DataType::Utf8, Arc::new(StringArray::from(values)))
        }
    }
}

fn build_rows_batch(rows: &[RawRow], with_step: bool) -> Result<Option<RecordBatch>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let encoded: Vec<&str> = rows.iter().map(|r| r.metrics.as_str()).collect();
    let (keys, cell_columns) = expand_columns(&encoded)?;

    let mut fields = vec![
        Field::new("id", DataType::Int64, false),
        Field::new("timestamp", DataType::Utf8, false),
        Field::new("run_name", DataType::Utf8, false),
    ];
    let mut columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(Int64Array::from(rows.iter().map(|r| r.id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.timestamp.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.run_name.clone()).collect::<Vec<_>>(),
        )),
    ];
    if with_step {
        fields.push(Field::new("step", DataType::Int64, true));
        columns.push(Arc::new(Int64Array::from(
            rows.iter().map(|r| r.step).collect::<Vec<_>>(),
        )));
    }
    fields.push(Field::new("log_id", DataType::Utf8, true));
    columns.push(Arc::new(StringArray::from(
        rows.iter().map(|r| r.log_id.clone()).collect::<Vec<_>>(),
    )));
    fields.push(Field::new("space_id", DataType::Utf8, true));
    columns.push(Arc::new(StringArray::from(
        rows.iter().map(|r| r.space_id.clone()).collect::<Vec<_>>(),
    )));

    for (key, cells) in keys.iter().zip(&cell_columns) {
        let (data_type, array) = build_column(cells);
        fields.push(Field::new(key, data_type, true));
        columns.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    Ok(Some(RecordBatch::try_new(schema, columns)?))
}

fn build_configs_batch(rows: &[RawConfigRow]) -> Result<Option<RecordBatch>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let encoded: Vec<&str> = rows.iter().map(|r| r.config.as_str()).collect();
    let (keys, cell_columns) = expand_columns(&encoded)?;

    let mut fields = vec![
        Field::new("run_name", DataType::Utf8, false),
        Field::new("created_at", DataType::Utf8, false),
    ];
    let mut columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.run_name.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.created_at.clone()).collect::<Vec<_>>(),
        )),
    ];
    for (key, cells) in keys.iter().zip(&cell_columns) {
        let (data_type, array) = build_column(cells);
        fields.push(Field::new(key, data_type, true));
        columns.push(array);
    }
    let schema = Arc::new(Schema::new(fields));
    Ok(Some(RecordBatch::try_new(schema, columns)?))
}

fn write_parquet_file(path: &Path, batch: &RecordBatch) -> Result<()> {
    let props = parquet::file::properties::WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Re-folding flattened columns into JSON rows
// ---------------------------------------------------------------------------

const METRIC_STRUCTURAL: [&str; 6] = ["id", "timestamp", "run_name", "step", "log_id", "space_id"];
const CONFIG_STRUCTURAL: [&str; 3] = ["id", "run_name", "created_at"];

fn cell_to_encoded(batch: &RecordBatch, column: usize, row: usize) -> Option<JsonValue> {
    let array = batch.column(column);
    if array.is_null(row) {
        return None;
    }
    match array.data_type() {
        DataType::Int64 => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .map(|a| JsonValue::from(a.value(row))),
        DataType::Float64 => array.as_any().downcast_ref::<Float64Array>().map(|a| {
            let f = a.value(row);
            if f.is_nan() {
                JsonValue::from(NAN)
            } else if f.is_infinite() {
                JsonValue::from(if f > 0.0 { INF } else { NEG_INF })
            } else {
                JsonValue::from(f)
            }
        }),
        DataType::Boolean => array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .map(|a| JsonValue::Bool(a.value(row))),
        DataType::Utf8 => array.as_any().downcast_ref::<StringArray>().map(|a| {
            let text = a.value(row);
            match serde_json::from_str::<JsonValue>(text) {
                Ok(parsed @ (JsonValue::Object(_) | JsonValue::Array(_))) => parsed,
                _ => JsonValue::from(text),
            }
        }),
        _ => None,
    }
}

fn string_cell(batch: &RecordBatch, name: &str, row: usize) -> Option<String> {
    let index = batch.schema().index_of(name).ok()?;
    let array = batch.column(index);
    if array.is_null(row) {
        return None;
    }
    array
        .as_any()
        .downcast_ref::<StringArray>()
        .map(|a| a.value(row).to_string())
}

fn int_cell(batch: &RecordBatch, name: &str, row: usize) -> Option<i64> {
    let index = batch.schema().index_of(name).ok()?;
    let array = batch.column(index);
    if array.is_null(row) {
        return None;
    }
    array
        .as_any()
        .downcast_ref::<Int64Array>()
        .map(|a| a.value(row))
}

fn rows_from_batches(batches: &[RecordBatch], with_step: bool) -> Result<Vec<RawRow>> {
    let mut rows = Vec::new();
    for batch in batches {
        let schema = batch.schema();
        let metric_columns: Vec<(usize, String)> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| !METRIC_STRUCTURAL.contains(&f.name().as_str()))
            .map(|(i, f)| (i, f.name().clone()))
            .collect();
        for row in 0..batch.num_rows() {
            let mut metrics = serde_json::Map::new();
            for (column, name) in &metric_columns {
                if let Some(value) = cell_to_encoded(batch, *column, row) {
                    metrics.insert(name.clone(), value);
                }
            }
            rows.push(RawRow {
                id: int_cell(batch, "id", row).unwrap_or(0),
                timestamp: string_cell(batch, "timestamp", row).unwrap_or_default(),
                run_name: string_cell(batch, "run_name", row).unwrap_or_default(),
                step: if with_step {
                    int_cell(batch, "step", row)
                } else {
                    None
                },
                metrics: JsonValue::Object(metrics).to_string(),
                log_id: string_cell(batch, "log_id", row),
                space_id: string_cell(batch, "space_id", row),
            });
        }
    }
    Ok(rows)
}

fn configs_from_batches(batches: &[RecordBatch]) -> Result<Vec<RawConfigRow>> {
    let mut rows = Vec::new();
    for batch in batches {
        let schema = batch.schema();
        let config_columns: Vec<(usize, String)> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| !CONFIG_STRUCTURAL.contains(&f.name().as_str()))
            .map(|(i, f)| (i, f.name().clone()))
            .collect();
        for row in 0..batch.num_rows() {
            let mut config = serde_json::Map::new();
            for (column, name) in &config_columns {
                if let Some(value) = cell_to_encoded(batch, *column, row) {
                    config.insert(name.clone(), value);
                }
            }
            rows.push(RawConfigRow {
                run_name: string_cell(batch, "run_name", row).unwrap_or_default(),
                config: JsonValue::Object(config).to_string(),
                created_at: string_cell(batch, "created_at", row).unwrap_or_default(),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_typing_prefers_widest_numeric() {
        let cells = [Cell::Int(1), Cell::Float(0.5), Cell::Null];
        let (data_type, array) = build_column(&cells);
        assert_eq!(data_type, DataType::Float64);
        assert_eq!(array.len(), 3);
        assert!(array.is_null(2));
    }

    #[test]
    fn mixed_types_fall_back_to_text() {
        let cells = [Cell::Int(1), Cell::Text("x".into())];
        let (data_type, _) = build_column(&cells);
        assert_eq!(data_type, DataType::Utf8);
    }

    #[test]
    fn markers_become_floats_in_cells() {
        assert!(matches!(
            Cell::from_encoded(&JsonValue::from("Infinity")),
            Cell::Float(f) if f.is_infinite() && f > 0.0
        ));
        assert!(matches!(
            Cell::from_encoded(&JsonValue::from("NaN")),
            Cell::Float(f) if f.is_nan()
        ));
    }

    #[test]
    fn expand_and_refold_round_trips() {
        let rows = vec![
            RawRow {
                id: 1,
                timestamp: "2026-01-01T00:00:00.000000Z".into(),
                run_name: "r".into(),
                step: Some(0),
                metrics: r#"{"loss":"Infinity","acc":0.5}"#.into(),
                log_id: None,
                space_id: None,
            },
            RawRow {
                id: 2,
                timestamp: "2026-01-01T00:00:01.000000Z".into(),
                run_name: "r".into(),
                step: Some(1),
                metrics: r#"{"loss":0.25,"note":"ok"}"#.into(),
                log_id: Some("abc".into()),
                space_id: None,
            },
        ];
        let batch = build_rows_batch(&rows, true).unwrap().unwrap();
        let restored = rows_from_batches(&[batch], true).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].step, Some(0));
        let first: JsonValue = serde_json::from_str(&restored[0].metrics).unwrap();
        assert_eq!(first["loss"], "Infinity");
        assert_eq!(first["acc"], 0.5);
        let second: JsonValue = serde_json::from_str(&restored[1].metrics).unwrap();
        assert_eq!(second["loss"], 0.25);
        assert_eq!(second["note"], "ok");
        assert_eq!(restored[1].log_id.as_deref(), Some("abc"));
    }
}
