// The host identity is the only state that survives a restart. The routing
// table is rebuilt from the bootstrap nodes every time.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::id20::Id20;
use crate::utils::serialize_id20;

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    #[serde(serialize_with = "serialize_id20")]
    host_identity: Id20,
}

pub fn default_identity_path() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "masala", "masala")
        .context("cannot determine project directory for com.masala.masala")?;
    Ok(dirs.cache_dir().join("identity.json"))
}

/// The node id for a host identity within a realm.
pub fn node_id_for(realm: Option<&str>, host_identity: &Id20) -> Id20 {
    Id20::digest([realm.unwrap_or_default().as_bytes(), &host_identity.0[..]])
}

fn read_identity(path: &Path) -> anyhow::Result<Option<Id20>> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("error reading {path:?}")),
    };
    match serde_json::from_reader::<_, IdentityFile>(file) {
        Ok(f) => Ok(Some(f.host_identity)),
        Err(e) => {
            warn!(?path, "cannot deserialize identity, generating a new one: {e:#}");
            Ok(None)
        }
    }
}

fn write_identity(path: &Path, host_identity: Id20) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("error creating dir {parent:?}"))?;
    }
    let tempfile_name = {
        let mut tmp = path.to_owned();
        tmp.set_file_name(format!("identity.json.tmp.{}", std::process::id()));
        tmp
    };
    let mut file = OpenOptions::new()
        .truncate(true)
        .create(true)
        .write(true)
        .open(&tempfile_name)
        .with_context(|| format!("error opening {tempfile_name:?}"))?;
    serde_json::to_writer_pretty(&mut file, &IdentityFile { host_identity })
        .with_context(|| format!("error serializing identity to {tempfile_name:?}"))?;
    file.flush()
        .with_context(|| format!("error flushing {tempfile_name:?}"))?;
    drop(file);
    std::fs::rename(&tempfile_name, path)
        .with_context(|| format!("error renaming {tempfile_name:?} to {path:?}"))
}

/// Loads the host identity from `path`, creating it if it doesn't exist or
/// can't be parsed.
pub fn load_or_create_host_identity(path: &Path) -> anyhow::Result<Id20> {
    if let Some(id) = read_identity(path)? {
        debug!(?path, "loaded host identity");
        return Ok(id);
    }
    let id = Id20::random();
    write_identity(path, id)?;
    info!(?path, "generated new host identity");
    Ok(id)
}
