//! HPC job mapper.
//!
//! Watches a directory where each regular file named after a decimal GPU
//! index lists the job ids currently pinned to that GPU, one per line. Every
//! metric for a mapped GPU is fanned out into one copy per job.

use super::Transform;
use crate::error::{ExporterError, Result};
use crate::inventory::DeviceInfo;
use crate::metrics::MetricsByCounter;
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

pub struct HpcJobMapper {
    dir: PathBuf,
}

impl HpcJobMapper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Reads the mapping directory: `<dir>/<gpu-index>` -> job ids.
    fn read_mapping(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut mapping = HashMap::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| ExporterError::Enrichment(format!("cannot read {}: {e}", self.dir.display())))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| ExporterError::Enrichment(format!("cannot read dir entry: {e}")))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.parse::<u32>().is_err() {
                debug!("skipping non-numeric file {name} in HPC mapping dir");
                continue;
            }
            let content = std::fs::read_to_string(entry.path()).map_err(|e| {
                ExporterError::Enrichment(format!("cannot read {}: {e}", entry.path().display()))
            })?;
            let jobs: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            mapping.insert(name, jobs);
        }
        Ok(mapping)
    }
}

#[async_trait]
impl Transform for HpcJobMapper {
    fn name(&self) -> &str {
        "hpcMapper"
    }

    async fn process(&self, metrics: &mut MetricsByCounter, _device_info: &DeviceInfo) -> Result<()> {
        if !self.dir.is_dir() {
            info!("HPC job mapping dir {} does not exist; skipping", self.dir.display());
            return Ok(());
        }
        let mapping = self.read_mapping()?;
        if mapping.is_empty() {
            return Ok(());
        }
        for list in metrics.values_mut() {
            let mut expanded = Vec::with_capacity(list.len());
            for metric in list.drain(..) {
                match mapping.get(&metric.gpu) {
                    Some(jobs) if !jobs.is_empty() => {
                        for job in jobs {
                            let mut copy = metric.clone();
                            copy.attributes.insert("hpc_job".to_string(), job.clone());
                            expanded.push(copy);
                        }
                    }
                    _ => expanded.push(metric),
                }
            }
            *list = expanded;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{Counter, PromType};
    use crate::dcgm::EntityGroup;
    use crate::inventory::DeviceOptions;
    use crate::metrics::Metric;
    use std::io::Write;

    fn empty_inventory() -> DeviceInfo {
        DeviceInfo {
            kind: EntityGroup::Gpu,
            gpu_count: 0,
            gpus: Vec::new(),
            switches: Vec::new(),
            cpus: Vec::new(),
            g_opts: DeviceOptions::default(),
            s_opts: DeviceOptions::default(),
            c_opts: DeviceOptions::default(),
        }
    }

    fn gpu_metric(counter: &Counter, gpu: &str, value: &str) -> Metric {
        let mut metric = Metric::new(counter.clone(), value);
        metric.gpu = gpu.to_string();
        metric
    }

    #[tokio::test]
    async fn fans_out_one_copy_per_job() {
        let dir = tempfile::tempdir().unwrap();
        write!(std::fs::File::create(dir.path().join("0")).unwrap(), "job-A\n").unwrap();
        write!(std::fs::File::create(dir.path().join("1")).unwrap(), "job-B\njob-C\n").unwrap();

        let counter = Counter::new(155, "DCGM_FI_DEV_POWER_USAGE", PromType::Gauge, "");
        let mut metrics = MetricsByCounter::default();
        metrics.insert(
            counter.clone(),
            vec![
                gpu_metric(&counter, "0", "42"),
                gpu_metric(&counter, "1", "451"),
                gpu_metric(&counter, "2", "1984"),
            ],
        );

        let mapper = HpcJobMapper::new(dir.path());
        mapper.process(&mut metrics, &empty_inventory()).await.unwrap();

        let list = &metrics[&counter];
        assert_eq!(list.len(), 4);
        let tagged: Vec<(&str, Option<&str>, &str)> = list
            .iter()
            .map(|m| {
                (
                    m.gpu.as_str(),
                    m.attributes.get("hpc_job").map(String::as_str),
                    m.value.as_str(),
                )
            })
            .collect();
        assert_eq!(
            tagged,
            vec![
                ("0", Some("job-A"), "42"),
                ("1", Some("job-B"), "451"),
                ("1", Some("job-C"), "451"),
                ("2", None, "1984"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_directory_is_a_noop() {
        let counter = Counter::new(155, "DCGM_FI_DEV_POWER_USAGE", PromType::Gauge, "");
        let mut metrics = MetricsByCounter::default();
        metrics.insert(counter.clone(), vec![gpu_metric(&counter, "0", "1")]);

        let mapper = HpcJobMapper::new("/nonexistent/hpc/jobs");
        mapper.process(&mut metrics, &empty_inventory()).await.unwrap();
        assert_eq!(metrics[&counter].len(), 1);
        assert!(metrics[&counter][0].attributes.is_empty());
    }

    #[tokio::test]
    async fn non_numeric_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write!(std::fs::File::create(dir.path().join("README")).unwrap(), "job-X\n").unwrap();

        let counter = Counter::new(155, "DCGM_FI_DEV_POWER_USAGE", PromType::Gauge, "");
        let mut metrics = MetricsByCounter::default();
        metrics.insert(counter.clone(), vec![gpu_metric(&counter, "0", "1")]);

        let mapper = HpcJobMapper::new(dir.path());
        mapper.process(&mut metrics, &empty_inventory()).await.unwrap();
        assert!(metrics[&counter][0].attributes.is_empty());
    }
}
