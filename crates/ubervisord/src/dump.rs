use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;

use ubervisor_proto::wire::GroupSpec;
use ubervisor_proto::GroupStatus;

use crate::catalog::{Catalog, Group};
use crate::supervisor::Supervisor;

/// Dump files start with this; load-newest scans for it.
pub const DUMP_PREFIX: &str = "uberdump";

#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "read failed: {}", e),
            LoadError::Parse(e) => write!(f, "parse failed: {}", e),
            LoadError::Invalid(msg) => write!(f, "invalid dump: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        LoadError::Io(e)
    }
}

/// Writes catalog snapshots. The counter makes every file name of one
/// server lifetime unique.
pub struct Dumper {
    dir: PathBuf,
    counter: AtomicU64,
}

impl Dumper {
    pub fn new(dir: PathBuf) -> Dumper {
        Dumper {
            dir,
            counter: AtomicU64::new(0),
        }
    }

    /// Serialize the catalog and write it atomically: the content goes to
    /// a temp file first, which is then hard-linked to the final name and
    /// unlinked, so a reader either sees the complete file or none.
    pub fn dump(&self, catalog: &Catalog) -> io::Result<PathBuf> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let ts = Utc::now().format("%b_%d_%H_%M_%S");
        let uid = nix::unistd::geteuid().as_raw();
        let final_path = self.dir.join(format!("{}.{}.{}.{}", DUMP_PREFIX, n, uid, ts));
        let tmp_path = self.dir.join(format!("tmp.{}.{}.{}.{}", DUMP_PREFIX, n, uid, ts));

        let content = render(catalog)?;
        fs::write(&tmp_path, content)?;
        fs::hard_link(&tmp_path, &final_path)?;
        fs::remove_file(&tmp_path)?;
        Ok(final_path)
    }
}

/// One group object per line inside a JSON array.
fn render(catalog: &Catalog) -> io::Result<String> {
    let mut out = String::from("[\n");
    for (i, group) in catalog.iter().enumerate() {
        if i > 0 {
            out.push_str(",\n");
        }
        let line = serde_json::to_string(&group.to_spec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.push_str(&line);
    }
    out.push_str("\n]\n");
    Ok(out)
}

/// Read a dump and restore its groups, starting the children of every
/// running group. Any malformed entry aborts the load.
pub async fn load(sup: &Arc<Supervisor>, path: &Path) -> Result<usize, LoadError> {
    let buf = fs::read_to_string(path)?;
    if buf.trim().is_empty() {
        return Ok(0);
    }
    let specs: Vec<GroupSpec> = serde_json::from_str(&buf).map_err(LoadError::Parse)?;

    let mut state = sup.lock_state().await;
    let mut loaded = 0;
    for mut spec in specs {
        spec.normalize();
        spec.apply_defaults();
        let group =
            Group::from_spec(spec).map_err(|e| LoadError::Invalid(e.to_string()))?;
        sup.bus().log(&format!("load: {}", group.name));
        let name = group.name.clone();
        let instances = group.instances;
        let running = group.status == GroupStatus::Running;
        state
            .catalog
            .insert(group)
            .map_err(|g| LoadError::Invalid(format!("duplicate group: {}", g.name)))?;
        if running {
            for i in 0..instances {
                sup.spawn_instance(&mut state, &name, i);
            }
        }
        loaded += 1;
    }
    Ok(loaded)
}

/// Newest dump file in a directory, by mtime.
pub fn find_newest(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(DUMP_PREFIX) {
            continue;
        }
        let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if best.as_ref().map_or(true, |(t, _)| mtime > *t) {
            best = Some((mtime, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}
