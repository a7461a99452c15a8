// ABOUTME: Merges each period's compressed members into one canonical NDJSON stream
// ABOUTME: Tags records with the effective date and survives malformed entries per line

pub mod record;

pub use record::{Modification, VehicleRecord, CSV_FIELDS};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::period::Period;

const MEMBER_SUFFIX: &str = ".json.gz";

/// Outcome of a normalization pass.
///
/// `errors` carries per-entry failures that were skipped and logged; the
/// pass itself still succeeds (partial success per file, not aborted).
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    /// Canonical per-period NDJSON outputs, oldest period first.
    pub files: Vec<PathBuf>,
    pub records: u64,
    pub errors: Vec<String>,
}

impl NormalizeOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

enum PeriodInput {
    Directory(PathBuf),
    LooseFile(PathBuf),
}

/// Turns downloaded period inputs into one canonical NDJSON file per
/// period, consuming the inputs on success.
pub struct Normalizer {
    data_dir: PathBuf,
}

impl Normalizer {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Discover and normalize every outstanding period, oldest first.
    ///
    /// A period is outstanding when a period directory or a loose
    /// `.json.gz` member is present in the data directory. Consumed
    /// inputs are deleted after their output is written, so a rerun with
    /// no new inputs does no work.
    pub fn run(&self) -> Result<NormalizeOutcome> {
        let mut outcome = NormalizeOutcome::default();

        let mut inputs = self.discover()?;
        inputs.sort_by_key(|(period, _)| (period.date, period.label.clone()));
        tracing::info!("found {} periods to normalize", inputs.len());

        for (period, input) in inputs {
            let output = match &input {
                PeriodInput::Directory(dir) => {
                    self.normalize_directory(dir, &period, &mut outcome)?
                }
                PeriodInput::LooseFile(file) => {
                    Some(self.normalize_loose_file(file, &period, &mut outcome)?)
                }
            };
            if let Some(output) = output {
                outcome.files.push(output);
            }
        }

        tracing::info!(
            "normalized {} records into {} period files ({} entries skipped)",
            outcome.records,
            outcome.files.len(),
            outcome.errors.len()
        );
        Ok(outcome)
    }

    /// Normalize one period directory of `.json.gz` members.
    ///
    /// Members are processed in name-sorted order. When no members remain
    /// and the output already exists, the period counts as already
    /// normalized and the existing output is returned untouched.
    pub fn normalize_directory(
        &self,
        dir: &Path,
        period: &Period,
        outcome: &mut NormalizeOutcome,
    ) -> Result<Option<PathBuf>> {
        let mut members: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read period directory {:?}", dir))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with(MEMBER_SUFFIX))
                    .unwrap_or(false)
            })
            .collect();
        members.sort();

        let output = self.data_dir.join(period.output_filename());

        if members.is_empty() {
            if output.exists() {
                tracing::info!("{} already normalized", period.label);
                return Ok(Some(output));
            }
            tracing::warn!("no {} members found in {:?}", MEMBER_SUFFIX, dir);
            return Ok(None);
        }

        self.write_period(&members, period, &output, outcome)?;

        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove consumed period directory {:?}", dir))?;
        tracing::debug!("removed consumed period directory {:?}", dir);

        Ok(Some(output))
    }

    /// Normalize a loose `.json.gz` file as a one-member period.
    pub fn normalize_loose_file(
        &self,
        file: &Path,
        period: &Period,
        outcome: &mut NormalizeOutcome,
    ) -> Result<PathBuf> {
        let output = self.data_dir.join(period.output_filename());
        self.write_period(std::slice::from_ref(&file.to_path_buf()), period, &output, outcome)?;

        fs::remove_file(file)
            .with_context(|| format!("Failed to remove consumed member {:?}", file))?;

        Ok(output)
    }

    /// Project one normalized NDJSON file into the fixed CSV column set.
    ///
    /// Lossy projection; the merge path never reads this output.
    pub fn project_csv(&self, input: &Path, output: &Path) -> Result<u64> {
        let reader = BufReader::new(
            fs::File::open(input).with_context(|| format!("Failed to open {:?}", input))?,
        );
        let mut writer = csv::Writer::from_path(output)
            .with_context(|| format!("Failed to create {:?}", output))?;
        writer
            .write_record(CSV_FIELDS)
            .context("Failed to write CSV header")?;

        let mut rows = 0u64;
        for line in reader.lines() {
            let line = line.with_context(|| format!("Failed to read {:?}", input))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: VehicleRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("skipping unparseable record in {:?}: {}", input, e);
                    continue;
                }
            };
            writer
                .write_record(record.csv_row())
                .context("Failed to write CSV row")?;
            rows += 1;
        }
        writer.flush().context("Failed to flush CSV output")?;

        tracing::info!("projected {} rows into {:?}", rows, output);
        Ok(rows)
    }

    fn discover(&self) -> Result<Vec<(Period, PeriodInput)>> {
        let mut inputs = Vec::new();
        if !self.data_dir.exists() {
            return Ok(inputs);
        }

        let entries = fs::read_dir(&self.data_dir)
            .with_context(|| format!("Failed to read data directory {:?}", self.data_dir))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if path.is_dir() {
                if let Some(period) = Period::parse(&name) {
                    inputs.push((period, PeriodInput::Directory(path)));
                }
            } else if name.ends_with(MEMBER_SUFFIX) {
                if let Some(period) = Period::parse(&name) {
                    inputs.push((period, PeriodInput::LooseFile(path)));
                }
            }
        }
        Ok(inputs)
    }

    /// Concatenate the members into `output`, injecting the effective
    /// date into every record. Malformed entries and unreadable members
    /// are recorded and skipped; the period still completes.
    fn write_period(
        &self,
        members: &[PathBuf],
        period: &Period,
        output: &Path,
        outcome: &mut NormalizeOutcome,
    ) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", self.data_dir))?;

        let effective_date = period.effective_date_string();
        let total_bytes: u64 = members
            .iter()
            .filter_map(|m| fs::metadata(m).ok())
            .map(|m| m.len())
            .sum();
        let bar = crate::feed::client::byte_progress_bar(total_bytes, &period.label);

        let mut writer = BufWriter::new(
            fs::File::create(output).with_context(|| format!("Failed to create {:?}", output))?,
        );

        let mut records = 0u64;
        for member in members {
            let member_name = member
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let member_bytes = fs::metadata(member).map(|m| m.len()).unwrap_or(0);

            let file = match fs::File::open(member) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!("skipping unreadable member {:?}: {}", member, e);
                    outcome.errors.push(format!("{}: {}", member_name, e));
                    bar.inc(member_bytes);
                    continue;
                }
            };

            let reader = BufReader::new(GzDecoder::new(file));
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        // Truncated or corrupt gzip stream; keep what we got
                        tracing::warn!("read error in {:?}: {}", member, e);
                        outcome.errors.push(format!("{}: {}", member_name, e));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let mut record: VehicleRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!("skipping malformed entry in {:?}: {}", member, e);
                        outcome.errors.push(format!("{}: {}", member_name, e));
                        continue;
                    }
                };
                record.date = Some(effective_date.clone());

                let rendered = serde_json::to_string(&record)
                    .context("Failed to serialize normalized record")?;
                writer
                    .write_all(rendered.as_bytes())
                    .and_then(|_| writer.write_all(b"\n"))
                    .with_context(|| format!("Failed to write {:?}", output))?;
                records += 1;
            }
            bar.inc(member_bytes);
        }

        writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", output))?;
        bar.finish_and_clear();

        tracing::info!(
            "{}: {} records -> {:?}",
            period.label,
            records,
            output.file_name().unwrap_or_default()
        );
        outcome.records += records;
        Ok(())
    }
}
