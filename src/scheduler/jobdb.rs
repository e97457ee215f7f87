//! Durable collection of [`Job`] records keyed by job number.
//!
//! Two interchangeable on-disk forms:
//!
//! - plain: `<workdir>/jobs/job_<n>.json`, one file per job, so a single job
//!   can be committed atomically without touching the others
//! - archived: `<workdir>/jobs.json.gz`, a gzip-compressed JSON array of
//!   `[job_number, job]` pairs, for large finished tasks
//!
//! Every write goes to a temporary file first and is renamed into place.
//!
//! The archive is authoritative whenever it exists. `compact` writes it before
//! removing `jobs/`, and `expand` builds `jobs/` under a temporary name and
//! removes the archive last, so an interrupted conversion leaves either a
//! complete archive or a complete `jobs/` directory to load from.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{GridError, Result};
use crate::scheduler::job::{Job, JobState};

const JOBS_DIR: &str = "jobs";
const ARCHIVE_NAME: &str = "jobs.json.gz";
const EXPAND_DIR: &str = "jobs.expand";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Plain,
    Archived,
}

#[derive(Debug)]
pub struct JobDb {
    workdir: PathBuf,
    storage: Storage,
    jobs: BTreeMap<u32, Job>,
}

impl JobDb {
    /// Open the database of a task with `job_count` jobs, creating records for
    /// job numbers not stored yet.
    pub fn open(workdir: &Path, job_count: u32) -> Result<Self> {
        std::fs::create_dir_all(workdir).map_err(|e| GridError::persistence(workdir, e))?;
        let mut db = match Self::load(workdir)? {
            Some(db) => db,
            None => {
                let dir = workdir.join(JOBS_DIR);
                std::fs::create_dir_all(&dir).map_err(|e| GridError::persistence(&dir, e))?;
                Self {
                    workdir: workdir.to_path_buf(),
                    storage: Storage::Plain,
                    jobs: BTreeMap::new(),
                }
            }
        };

        if let Some((&job_num, _)) = db.jobs.range(job_count..).next() {
            return Err(GridError::UnknownJob(job_num));
        }

        let missing: Vec<u32> = (0..job_count)
            .filter(|n| !db.jobs.contains_key(n))
            .collect();
        if !missing.is_empty() {
            tracing::info!(count = missing.len(), "Creating job records");
            for &job_num in &missing {
                db.jobs.insert(job_num, Job::new());
            }
            match db.storage {
                Storage::Plain => {
                    for job_num in missing {
                        db.commit(job_num)?;
                    }
                }
                Storage::Archived => db.save_all()?,
            }
        }
        Ok(db)
    }

    /// Open an existing database without knowing the task size.
    pub fn open_existing(workdir: &Path) -> Result<Self> {
        Self::load(workdir)?.ok_or_else(|| {
            GridError::persistence(
                workdir.join(JOBS_DIR),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no job database"),
            )
        })
    }

    fn load(workdir: &Path) -> Result<Option<Self>> {
        let dir = workdir.join(JOBS_DIR);
        let archive = workdir.join(ARCHIVE_NAME);
        let (storage, jobs) = if archive.is_file() {
            if dir.exists() {
                tracing::warn!(
                    dir = %dir.display(),
                    "Ignoring job records left by an interrupted conversion"
                );
            }
            (Storage::Archived, read_archive(&archive)?)
        } else if dir.is_dir() {
            (Storage::Plain, read_plain(&dir)?)
        } else {
            return Ok(None);
        };
        tracing::debug!(jobs = jobs.len(), ?storage, "Loaded job database");
        Ok(Some(Self {
            workdir: workdir.to_path_buf(),
            storage,
            jobs,
        }))
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, job_num: u32) -> Option<&Job> {
        self.jobs.get(&job_num)
    }

    /// Mutable access. Changes are not durable until [`JobDb::commit`].
    pub fn get_mut(&mut self, job_num: u32) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_num)
            .ok_or(GridError::UnknownJob(job_num))
    }

    /// Jobs in ascending job number order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Job)> {
        self.jobs.iter().map(|(n, job)| (*n, job))
    }

    /// Job numbers whose record satisfies `pred`, ascending.
    pub fn select(&self, pred: impl Fn(&Job) -> bool) -> Vec<u32> {
        self.iter()
            .filter(|(_, job)| pred(job))
            .map(|(n, _)| n)
            .collect()
    }

    pub fn state_counts(&self) -> BTreeMap<JobState, usize> {
        let mut counts = BTreeMap::new();
        for job in self.jobs.values() {
            *counts.entry(job.state()).or_insert(0) += 1;
        }
        counts
    }

    /// Persist one job.
    pub fn commit(&self, job_num: u32) -> Result<()> {
        let job = self.jobs.get(&job_num).ok_or(GridError::UnknownJob(job_num))?;
        match self.storage {
            Storage::Plain => write_record(&plain_path(&self.workdir, job_num), job),
            Storage::Archived => self.save_all(),
        }
    }

    /// Persist the given jobs; the archived form is rewritten once.
    pub fn commit_many(&self, job_nums: &[u32]) -> Result<()> {
        if job_nums.is_empty() {
            return Ok(());
        }
        match self.storage {
            Storage::Plain => job_nums.iter().try_for_each(|&n| self.commit(n)),
            Storage::Archived => self.save_all(),
        }
    }

    /// Persist every job in the current storage form.
    pub fn save_all(&self) -> Result<()> {
        match self.storage {
            Storage::Plain => {
                for &job_num in self.jobs.keys() {
                    self.commit(job_num)?;
                }
                Ok(())
            }
            Storage::Archived => write_archive(&self.workdir.join(ARCHIVE_NAME), &self.jobs),
        }
    }

    /// Convert the plain form into the archived form.
    pub fn compact(&mut self) -> Result<()> {
        if self.storage == Storage::Archived {
            return Ok(());
        }
        write_archive(&self.workdir.join(ARCHIVE_NAME), &self.jobs)?;
        self.storage = Storage::Archived;
        let dir = self.workdir.join(JOBS_DIR);
        std::fs::remove_dir_all(&dir).map_err(|e| GridError::persistence(&dir, e))?;
        tracing::info!(jobs = self.jobs.len(), "Compacted job database");
        Ok(())
    }

    /// Convert the archived form back into the plain form.
    pub fn expand(&mut self) -> Result<()> {
        if self.storage == Storage::Plain {
            return Ok(());
        }
        let dir = self.workdir.join(JOBS_DIR);
        let staging = self.workdir.join(EXPAND_DIR);
        for stale in [&dir, &staging] {
            if stale.exists() {
                std::fs::remove_dir_all(stale).map_err(|e| GridError::persistence(stale, e))?;
            }
        }
        std::fs::create_dir_all(&staging).map_err(|e| GridError::persistence(&staging, e))?;
        for (&job_num, job) in &self.jobs {
            write_record(&staging.join(plain_name(job_num)), job)?;
        }
        std::fs::rename(&staging, &dir).map_err(|e| GridError::persistence(&dir, e))?;
        self.storage = Storage::Plain;
        let archive = self.workdir.join(ARCHIVE_NAME);
        std::fs::remove_file(&archive).map_err(|e| GridError::persistence(&archive, e))?;
        tracing::info!(jobs = self.jobs.len(), "Expanded job database");
        Ok(())
    }
}

fn plain_name(job_num: u32) -> String {
    format!("job_{}.json", job_num)
}

fn plain_path(workdir: &Path, job_num: u32) -> PathBuf {
    workdir.join(JOBS_DIR).join(plain_name(job_num))
}

fn write_record(path: &Path, job: &Job) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(job).map_err(|e| GridError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    write_atomic(path, &bytes)
}

fn parse_plain_name(name: &str) -> Option<u32> {
    name.strip_prefix("job_")?.strip_suffix(".json")?.parse().ok()
}

fn read_plain(dir: &Path) -> Result<BTreeMap<u32, Job>> {
    let mut jobs = BTreeMap::new();
    let entries = std::fs::read_dir(dir).map_err(|e| GridError::persistence(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| GridError::persistence(dir, e))?;
        let name = entry.file_name();
        // leftover temporary files are skipped here
        let Some(job_num) = name.to_str().and_then(parse_plain_name) else {
            continue;
        };
        let path = entry.path();
        let text = std::fs::read_to_string(&path).map_err(|e| GridError::persistence(&path, e))?;
        let job: Job =
            serde_json::from_str(&text).map_err(|e| GridError::Corrupt { path, source: e })?;
        jobs.insert(job_num, job);
    }
    Ok(jobs)
}

fn read_archive(path: &Path) -> Result<BTreeMap<u32, Job>> {
    let file = File::open(path).map_err(|e| GridError::persistence(path, e))?;
    let records: Vec<(u32, Job)> =
        serde_json::from_reader(BufReader::new(GzDecoder::new(file))).map_err(|e| {
            GridError::Corrupt {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
    Ok(records.into_iter().collect())
}

fn write_archive(path: &Path, jobs: &BTreeMap<u32, Job>) -> Result<()> {
    let records: Vec<(&u32, &Job)> = jobs.iter().collect();
    let json = serde_json::to_vec(&records).map_err(|e| GridError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| GridError::persistence(path, e))?;
    let compressed = encoder.finish().map_err(|e| GridError::persistence(path, e))?;
    write_atomic(path, &compressed)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| GridError::persistence(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| GridError::persistence(path, e))
}
