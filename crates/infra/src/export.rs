//! Incremental export of results to one file per job.
//!
//! An export first plans (how many results match the window, how many are
//! already on disk), then streams keyset pages of results and writes every
//! result whose `<job_id>.<ext>` file is missing. Re-running an export is safe:
//! finished files are skipped, and files are renamed into place only once
//! fully written.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use dprompts_core::JobId;

use crate::error::StoreError;
use crate::store::ResultQuery;
use crate::view::ResultView;

pub const DEFAULT_PAGE_SIZE: usize = 500;
const PROGRESS_EVERY: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("--full-export cannot be combined with --from-date")]
    ConflictingWindow,

    #[error("invalid date {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("export stopped after {exported} files: {source}")]
    Interrupted {
        exported: u64,
        #[source]
        source: Box<ExportError>,
    },
}

impl ExportError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Files written before the failure, if any.
    pub fn exported(&self) -> u64 {
        match self {
            Self::Interrupted { exported, .. } => *exported,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Text,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "txt" => Ok(Self::Text),
            other => Err(format!("unknown export format {other:?} (expected json or text)")),
        }
    }
}

/// Which results an export covers, by result creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportWindow {
    Full,
    /// From midnight UTC of the date.
    Since(NaiveDate),
    #[default]
    Trailing24h,
}

impl ExportWindow {
    /// Window selected by the `--full-export` / `--from-date` flags.
    pub fn from_flags(full: bool, from_date: Option<&str>) -> Result<Self, ExportError> {
        match (full, from_date) {
            (true, Some(_)) => Err(ExportError::ConflictingWindow),
            (true, None) => Ok(Self::Full),
            (false, Some(date)) => NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
                .map(Self::Since)
                .map_err(|_| ExportError::InvalidDate(date.to_string())),
            (false, None) => Ok(Self::Trailing24h),
        }
    }

    pub fn since(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Full => None,
            Self::Since(date) => Some(date.and_time(NaiveTime::MIN).and_utc()),
            Self::Trailing24h => Some(now - ChronoDuration::hours(24)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub window: ExportWindow,
    pub out_dir: PathBuf,
    pub format: ExportFormat,
    /// Count and log without writing anything.
    pub dry_run: bool,
    /// Clear `out_dir` and export everything in the window again.
    pub overwrite: bool,
}

impl ExportOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            window: ExportWindow::default(),
            out_dir: out_dir.into(),
            format: ExportFormat::default(),
            dry_run: false,
            overwrite: false,
        }
    }

    pub fn with_window(mut self, window: ExportWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_format(mut self, format: ExportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExportPlan {
    /// Results in the window.
    pub matched: u64,
    /// Results in the window that already have a file.
    pub already_exported: u64,
    pub to_export: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExportSummary {
    pub matched: u64,
    pub already_exported: u64,
    /// Files written (or that would be written, on a dry run).
    pub exported: u64,
    /// Results skipped because their file already existed.
    pub skipped: u64,
}

pub struct Exporter<Q> {
    store: Q,
    page_size: usize,
}

impl<Q: ResultQuery> Exporter<Q> {
    pub fn new(store: Q) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[instrument(
        skip(self, options),
        fields(out_dir = %options.out_dir.display(), format = options.format.extension(), dry_run = options.dry_run),
        err
    )]
    pub async fn export(&self, options: &ExportOptions) -> Result<ExportSummary, ExportError> {
        let started = Instant::now();
        let since = options.window.since(Utc::now());
        info!(window = ?options.window, since = ?since, "starting export");

        let on_disk = if options.overwrite {
            if !options.dry_run {
                clear_directory(&options.out_dir).await?;
            }
            HashSet::new()
        } else {
            scan_existing(&options.out_dir, options.format).await
        };

        if !options.dry_run {
            tokio::fs::create_dir_all(&options.out_dir)
                .await
                .map_err(|e| ExportError::io(&options.out_dir, e))?;
        }

        let plan = self.plan(since, &on_disk).await?;
        info!(
            matched = plan.matched,
            already_exported = plan.already_exported,
            to_export = plan.to_export,
            "export plan"
        );

        let mut summary = ExportSummary {
            matched: plan.matched,
            already_exported: plan.already_exported,
            ..Default::default()
        };

        self.write_all(since, &on_disk, plan, options, &mut summary)
            .await
            .map_err(|source| ExportError::Interrupted {
                exported: summary.exported,
                source: Box::new(source),
            })?;

        info!(
            exported = summary.exported,
            skipped = summary.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "export finished"
        );
        Ok(summary)
    }

    async fn plan(
        &self,
        since: Option<DateTime<Utc>>,
        on_disk: &HashSet<JobId>,
    ) -> Result<ExportPlan, StoreError> {
        let matched = self.store.count_results(since).await?;

        let mut candidates: Vec<JobId> = on_disk.iter().copied().collect();
        candidates.sort_unstable();
        let already_exported = if candidates.is_empty() {
            0
        } else {
            self.store.existing_result_ids(since, &candidates).await?.len() as u64
        };

        Ok(ExportPlan {
            matched,
            already_exported,
            to_export: matched.saturating_sub(already_exported),
        })
    }

    async fn write_all(
        &self,
        since: Option<DateTime<Utc>>,
        on_disk: &HashSet<JobId>,
        plan: ExportPlan,
        options: &ExportOptions,
        summary: &mut ExportSummary,
    ) -> Result<(), ExportError> {
        let mut after = None;
        loop {
            let page = self.store.results_page(since, after, self.page_size).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.job_id);
            let full_page = page.len() == self.page_size;

            for record in page {
                if on_disk.contains(&record.job_id) {
                    summary.skipped += 1;
                    continue;
                }

                let job_id = record.job_id;
                if !options.dry_run {
                    write_artifact(&options.out_dir, options.format, &ResultView::from(record))
                        .await?;
                }
                summary.exported += 1;

                if summary.exported == 1
                    || summary.exported % PROGRESS_EVERY == 0
                    || summary.exported == plan.to_export
                {
                    info!(
                        exported = summary.exported,
                        to_export = plan.to_export,
                        job_id = %job_id,
                        "export progress"
                    );
                }
            }

            if !full_page {
                break;
            }
        }
        Ok(())
    }
}

/// Ids of `<job_id>.<ext>` files in `dir`. An unreadable directory counts as
/// empty.
async fn scan_existing(dir: &Path, format: ExportFormat) -> HashSet<JobId> {
    let mut found = HashSet::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "output directory does not exist yet");
            return found;
        }
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "cannot scan output directory; treating it as empty");
            return found;
        }
    };

    let suffix = format!(".{}", format.extension());
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name();
                let Some(id) = name
                    .to_str()
                    .and_then(|n| n.strip_suffix(&suffix))
                    .and_then(|stem| stem.parse::<i64>().ok())
                else {
                    continue;
                };
                if entry.file_type().await.is_ok_and(|t| t.is_file()) {
                    found.insert(JobId::new(id));
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "output directory scan stopped early");
                break;
            }
        }
    }
    found
}

async fn clear_directory(dir: &Path) -> Result<(), ExportError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ExportError::io(dir, err)),
    };

    let mut removed = 0u64;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ExportError::io(dir, e))?
    {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| ExportError::io(&path, e))?
            .is_dir();
        let removal = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removal.map_err(|e| ExportError::io(&path, e))?;
        removed += 1;
    }
    info!(dir = %dir.display(), removed, "cleared output directory");
    Ok(())
}

async fn write_artifact(
    dir: &Path,
    format: ExportFormat,
    view: &ResultView,
) -> Result<(), ExportError> {
    let contents = match format {
        ExportFormat::Json => serde_json::to_vec_pretty(&view.artifact())
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ExportFormat::Text => view.to_string().into_bytes(),
    };

    let file_name = format!("{}.{}", view.job_id, format.extension());
    let target = dir.join(&file_name);
    let partial = dir.join(format!(".{file_name}.partial"));

    tokio::fs::write(&partial, &contents)
        .await
        .map_err(|e| ExportError::io(&partial, e))?;
    tokio::fs::rename(&partial, &target)
        .await
        .map_err(|e| ExportError::io(&target, e))
}
